//! Replicated global state.
//!
//! Every mutation goes through [`GlobalStateStore::dispatch`], which reduces
//! locally and publishes `{origin, action}` on the bridge's `"state"`
//! channel. Stores attached to the same bridge, or to bridges relaying
//! between contexts, apply actions from other origins without publishing
//! them again.

pub mod action;
pub mod model;
pub mod persist;
pub mod select;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use action::{GlobalAction, NotificationPolicy, Reducer};
pub use model::{GlobalState, ModalContext, Notification, NotificationKind, Theme, ThemeMode, User};
pub use persist::{PersistedSnapshot, Persister, DEFAULT_PERSIST_KEY, SCHEMA_VERSION};
pub use select::Selector;

use crate::bridge::{Bridge, ChannelReceiver};
use crate::storage::KeyValueStore;

pub const STATE_CHANNEL: &str = "state";

const TRANSITION_BUFFER: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub key: String,
    pub schema_version: u32,
    /// Quiet period before a transition is written
    pub debounce_ms: u64,
    pub max_notifications: usize,
    pub notification_ttl_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_PERSIST_KEY.to_string(),
            schema_version: SCHEMA_VERSION,
            debounce_ms: 16,
            max_notifications: 100,
            notification_ttl_ms: 60_000,
        }
    }
}

impl StoreConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn policy(&self) -> NotificationPolicy {
        NotificationPolicy {
            max_notifications: self.max_notifications,
            default_ttl: Duration::from_millis(self.notification_ttl_ms),
        }
    }
}

/// Payload of the `"state"` channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateMessage {
    pub origin: String,
    pub action: GlobalAction,
}

struct Persistence {
    persister: Persister,
    dirty: AtomicBool,
    latest: watch::Sender<Arc<GlobalState>>,
}

impl Persistence {
    fn write(&self, state: &GlobalState) {
        if let Err(err) = self.persister.save(state) {
            tracing::warn!(
                key = %self.persister.key(),
                error = %err,
                category = ?err.category(),
                "failed to persist global state"
            );
        }
    }

    fn flush(&self) {
        if self.dirty.swap(false, Ordering::AcqRel) {
            let state = Arc::clone(&*self.latest.borrow());
            self.write(&state);
        }
    }
}

struct StoreInner {
    origin: String,
    bridge: Bridge,
    reducer: Reducer,
    state: RwLock<Arc<GlobalState>>,
    transitions: broadcast::Sender<Arc<GlobalState>>,
    persistence: Option<Arc<Persistence>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreInner {
    /// Reduce `action` and, when `outbound` is set, publish it on the
    /// bridge. Both happen under the write lock so peers receive actions in
    /// the order this store applied them.
    fn apply(&self, action: GlobalAction, outbound: Option<Value>) {
        let mut state = self.state.write();
        let next = Arc::new(self.reducer.reduce(&state, action, Utc::now()));
        *state = Arc::clone(&next);

        if let Some(payload) = outbound {
            self.bridge.publish(STATE_CHANNEL, payload);
        }
        let _ = self.transitions.send(Arc::clone(&next));
        if let Some(persistence) = &self.persistence {
            persistence.latest.send_replace(next);
            persistence.dirty.store(true, Ordering::Release);
        }
    }

    fn apply_remote(&self, message: StateMessage) {
        if message.origin == self.origin {
            return;
        }
        tracing::debug!(
            origin = %message.origin,
            action = message.action.name(),
            "applying replicated action"
        );
        self.apply(message.action, None);
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
        if let Some(persistence) = &self.persistence {
            persistence.flush();
        }
    }
}

/// Process-wide state container. Clones share the same state.
#[derive(Clone)]
pub struct GlobalStateStore {
    inner: Arc<StoreInner>,
}

impl GlobalStateStore {
    /// Create a store without persistence.
    pub fn new(bridge: Bridge, config: StoreConfig) -> Self {
        Self::build(bridge, config, None)
    }

    /// Create a store that restores `{user, theme}` from `store` and writes
    /// them back after each transition.
    pub fn with_storage(bridge: Bridge, config: StoreConfig, store: Arc<dyn KeyValueStore>) -> Self {
        Self::build(bridge, config, Some(store))
    }

    fn build(bridge: Bridge, config: StoreConfig, store: Option<Arc<dyn KeyValueStore>>) -> Self {
        let reducer = Reducer::new(GlobalState::default(), config.policy());
        let persister = store.map(|store| Persister::new(store, config.key.clone(), config.schema_version));

        let initial = match persister.as_ref().map(Persister::load) {
            Some(Ok(Some(snapshot))) => snapshot.merge_into(reducer.defaults()),
            Some(Err(err)) => {
                tracing::warn!(key = %config.key, error = %err, "failed to read persisted state, using defaults");
                reducer.defaults().clone()
            }
            _ => reducer.defaults().clone(),
        };
        let initial = Arc::new(initial);

        let persistence = persister.map(|persister| {
            Arc::new(Persistence {
                persister,
                dirty: AtomicBool::new(false),
                latest: watch::channel(Arc::clone(&initial)).0,
            })
        });

        let origin = Uuid::new_v4().to_string();
        let inbound = bridge.listen(STATE_CHANNEL);
        let inner = Arc::new(StoreInner {
            origin,
            bridge,
            reducer,
            state: RwLock::new(initial),
            transitions: broadcast::channel(TRANSITION_BUFFER).0,
            persistence,
            tasks: Mutex::new(Vec::new()),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let mut tasks = inner.tasks.lock();
                tasks.push(runtime.spawn(replicate(Arc::downgrade(&inner), inbound)));
                if let Some(persistence) = &inner.persistence {
                    let changes = persistence.latest.subscribe();
                    tasks.push(runtime.spawn(persist(Arc::clone(persistence), changes, config.debounce())));
                }
            }
            Err(_) => {
                tracing::warn!("no async runtime, state replication and background persistence are disabled");
            }
        }

        tracing::debug!(origin = %inner.origin, persisted = inner.persistence.is_some(), "state store created");
        Self { inner }
    }

    /// Reduce `action` locally, then publish it for other stores.
    pub fn dispatch(&self, action: GlobalAction) {
        let message = StateMessage {
            origin: self.inner.origin.clone(),
            action,
        };
        let payload = match serde_json::to_value(&message) {
            Ok(payload) => Some(payload),
            Err(err) => {
                tracing::debug!(error = %err, "failed to encode state action");
                None
            }
        };
        self.inner.apply(message.action, payload);
    }

    pub fn get_snapshot(&self) -> Arc<GlobalState> {
        Arc::clone(&self.inner.state.read())
    }

    /// Id stamped on every action this store publishes.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    pub fn bridge(&self) -> &Bridge {
        &self.inner.bridge
    }

    /// Write any pending transition now instead of after the quiet period.
    pub fn flush(&self) {
        if let Some(persistence) = &self.inner.persistence {
            persistence.flush();
        }
    }

    pub fn set_user(&self, user: User) {
        self.dispatch(GlobalAction::SetUser(Some(user)));
    }

    pub fn clear_user(&self) {
        self.dispatch(GlobalAction::ClearUser);
    }

    /// Queue a notification and return its id.
    pub fn add_notification(&self, message: impl Into<String>, kind: NotificationKind, ttl: Option<Duration>) -> String {
        let mut entry = Notification::new(message, kind);
        if let Some(ttl) = ttl {
            entry = entry.with_ttl(ttl);
        }
        let id = entry.id.clone();
        self.dispatch(GlobalAction::AddNotification(entry));
        id
    }

    pub fn remove_notification(&self, id: impl Into<String>) {
        self.dispatch(GlobalAction::RemoveNotification { id: id.into() });
    }

    pub fn set_modal_context(&self, context: ModalContext) {
        self.dispatch(GlobalAction::SetModal(Some(context)));
    }

    pub fn clear_modal_context(&self) {
        self.dispatch(GlobalAction::ClearModal);
    }

    pub fn set_theme(&self, theme: Theme) {
        self.dispatch(GlobalAction::SetTheme(theme));
    }

    pub fn toggle_theme_mode(&self) {
        self.dispatch(GlobalAction::ToggleTheme);
    }

    pub fn reset_state(&self) {
        self.dispatch(GlobalAction::ResetState);
    }

    fn selector<T: Clone>(&self, project: fn(&Arc<GlobalState>) -> T, same: fn(&T, &T) -> bool) -> Selector<T> {
        // Subscribing under the read lock leaves no gap between the initial
        // value and the first transition.
        let state = self.inner.state.read();
        let rx = self.inner.transitions.subscribe();
        Selector::new(&state, rx, project, same)
    }

    /// Every state value, starting with the current one.
    pub fn state(&self) -> Selector<Arc<GlobalState>> {
        self.selector(Arc::clone, |_, _| false)
    }

    pub fn select_user(&self) -> Selector<Option<Arc<User>>> {
        self.selector(|s| s.user.clone(), model::same_ref)
    }

    pub fn select_theme(&self) -> Selector<Arc<Theme>> {
        self.selector(|s| Arc::clone(&s.theme), Arc::ptr_eq)
    }

    pub fn select_notifications(&self) -> Selector<Arc<Vec<Notification>>> {
        self.selector(|s| Arc::clone(&s.notifications), Arc::ptr_eq)
    }

    pub fn select_modal_context(&self) -> Selector<Option<Arc<ModalContext>>> {
        self.selector(|s| s.modal_context.clone(), model::same_ref)
    }

    pub fn select_notification_count(&self) -> Selector<usize> {
        self.selector(|s| s.notifications.len(), |a, b| a == b)
    }

    pub fn select_user_permissions(&self) -> Selector<Vec<String>> {
        self.selector(
            |s| s.user.as_ref().map(|u| u.permissions.clone()).unwrap_or_default(),
            |a, b| a == b,
        )
    }
}

async fn replicate(store: Weak<StoreInner>, mut inbound: ChannelReceiver) {
    while let Some(payload) = inbound.recv().await {
        let message: StateMessage = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed state message");
                continue;
            }
        };
        let Some(store) = store.upgrade() else {
            break;
        };
        store.apply_remote(message);
    }
}

async fn persist(persistence: Arc<Persistence>, mut changes: watch::Receiver<Arc<GlobalState>>, debounce: Duration) {
    while changes.changed().await.is_ok() {
        tokio::time::sleep(debounce).await;
        changes.borrow_and_update();
        persistence.flush();
    }
}
