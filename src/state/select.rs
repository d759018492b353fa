use std::sync::Arc;

use futures::Stream;
use tokio::sync::broadcast;

use super::model::GlobalState;

/// Projection of the state tree that emits the current value first and then
/// only values that differ from the last one emitted.
///
/// Field selectors compare by `Arc` identity, derived selectors by value.
pub struct Selector<T> {
    rx: broadcast::Receiver<Arc<GlobalState>>,
    project: fn(&Arc<GlobalState>) -> T,
    same: fn(&T, &T) -> bool,
    initial: Option<T>,
    last: T,
}

impl<T: Clone> Selector<T> {
    pub(crate) fn new(
        current: &Arc<GlobalState>,
        rx: broadcast::Receiver<Arc<GlobalState>>,
        project: fn(&Arc<GlobalState>) -> T,
        same: fn(&T, &T) -> bool,
    ) -> Self {
        let last = project(current);
        Self {
            rx,
            project,
            same,
            initial: Some(last.clone()),
            last,
        }
    }

    fn accept(&mut self, state: &Arc<GlobalState>) -> Option<T> {
        let value = (self.project)(state);
        if (self.same)(&self.last, &value) {
            return None;
        }
        self.last = value.clone();
        Some(value)
    }

    /// Wait for the next distinct value. Returns `None` once the store is
    /// gone.
    pub async fn next(&mut self) -> Option<T> {
        if let Some(value) = self.initial.take() {
            return Some(value);
        }
        loop {
            match self.rx.recv().await {
                Ok(state) => {
                    if let Some(value) = self.accept(&state) {
                        return Some(value);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "selector lagged behind state transitions");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next distinct value among transitions already published, if any.
    pub fn try_next(&mut self) -> Option<T> {
        if let Some(value) = self.initial.take() {
            return Some(value);
        }
        loop {
            match self.rx.try_recv() {
                Ok(state) => {
                    if let Some(value) = self.accept(&state) {
                        return Some(value);
                    }
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "selector lagged behind state transitions");
                }
                Err(_) => return None,
            }
        }
    }

    /// Most recent value emitted.
    pub fn last(&self) -> &T {
        &self.last
    }

    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static
    where
        T: Send + 'static,
    {
        futures::stream::unfold(self, |mut selector| async move {
            let item = selector.next().await?;
            Some((item, selector))
        })
    }
}
