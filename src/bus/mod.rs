//! Addressable messaging between applications.
//!
//! Every bus rides on the bridge's `"bus"` channel. Inbound messages pass an
//! acceptance filter before any subscriber sees them:
//!
//! 1. own traffic is dropped unless `allow_self_loop` is set;
//! 2. the target must be `"*"` or this application;
//! 3. the type must be in `allowed_types`, when configured;
//! 4. the target must be `"*"` or this application, when `allowed_targets`
//!    is configured.
//!
//! Requests made with [`MessageBus::send_with_response`] listen on a fresh
//! response channel that exists only for the lifetime of the call.

pub mod message;

use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use futures::Stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub use message::{AppMessage, BROADCAST_TARGET};

use crate::bridge::{Bridge, ChannelReceiver};
use crate::error::BusError;

/// Bridge channel reserved for bus traffic.
pub const BUS_CHANNEL: &str = "bus";

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub app_id: String,
    pub default_timeout_ms: u64,
    pub allow_self_loop: bool,
    pub allowed_targets: Option<HashSet<String>>,
    pub allowed_types: Option<HashSet<String>>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            app_id: "app".to_string(),
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            allow_self_loop: false,
            allowed_targets: None,
            allowed_types: None,
        }
    }
}

impl BusConfig {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn allow_self_loop(mut self, allow: bool) -> Self {
        self.allow_self_loop = allow;
        self
    }

    pub fn allowed_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn allowed_targets<I, S>(mut self, targets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_targets = Some(targets.into_iter().map(Into::into).collect());
        self
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

struct Acceptance {
    config: Arc<BusConfig>,
    pending: Arc<DashSet<String>>,
}

impl Acceptance {
    fn accepts(&self, msg: &AppMessage) -> bool {
        let config = &self.config;
        let addressed_here = msg.is_broadcast() || msg.target == config.app_id;

        if !config.allow_self_loop && msg.source == config.app_id {
            return false;
        }
        if !addressed_here {
            return false;
        }
        if let Some(types) = &config.allowed_types {
            // Replies arrive under a generated type no allow-list can name.
            if !types.contains(&msg.message_type) && !self.pending.contains(&msg.message_type) {
                return false;
            }
        }
        if config.allowed_targets.is_some() && !addressed_here {
            return false;
        }
        true
    }
}

type MessageFilter = Box<dyn Fn(&AppMessage) -> bool + Send + Sync>;

/// Accepted inbound messages matching a subscription's filter.
pub struct MessageStream {
    rx: ChannelReceiver,
    acceptance: Acceptance,
    filter: MessageFilter,
}

impl MessageStream {
    pub async fn recv(&mut self) -> Option<AppMessage> {
        loop {
            let value = self.rx.recv().await?;
            if let Some(msg) = self.admit(value) {
                return Some(msg);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<AppMessage> {
        while let Some(value) = self.rx.try_recv() {
            if let Some(msg) = self.admit(value) {
                return Some(msg);
            }
        }
        None
    }

    fn admit(&self, value: Value) -> Option<AppMessage> {
        let msg: AppMessage = match serde_json::from_value(value) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed bus message");
                return None;
            }
        };
        if !self.acceptance.accepts(&msg) {
            tracing::trace!(id = %msg.id, source = %msg.source, to = %msg.target, "filtered bus message");
            return None;
        }
        (self.filter)(&msg).then_some(msg)
    }

    pub fn into_stream(self) -> impl Stream<Item = AppMessage> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let msg = stream.recv().await?;
            Some((msg, stream))
        })
    }
}

/// Payloads of accepted messages of one type, decoded as `T`.
pub struct PayloadStream<T> {
    messages: MessageStream,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> PayloadStream<T> {
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let msg = self.messages.recv().await?;
            if let Some(payload) = decode_payload(msg) {
                return Some(payload);
            }
        }
    }

    pub fn try_recv(&mut self) -> Option<T> {
        while let Some(msg) = self.messages.try_recv() {
            if let Some(payload) = decode_payload(msg) {
                return Some(payload);
            }
        }
        None
    }
}

impl<T: DeserializeOwned + Send + 'static> PayloadStream<T> {
    pub fn into_stream(self) -> impl Stream<Item = T> + Send + 'static {
        futures::stream::unfold(self, |mut stream| async move {
            let payload = stream.recv().await?;
            Some((payload, stream))
        })
    }
}

fn decode_payload<T: DeserializeOwned>(msg: AppMessage) -> Option<T> {
    match serde_json::from_value(msg.payload) {
        Ok(payload) => Some(payload),
        Err(err) => {
            tracing::debug!(id = %msg.id, message_type = %msg.message_type, error = %err, "payload type mismatch");
            None
        }
    }
}

/// Removes a response channel from the pending set when the request settles.
struct PendingReply<'a> {
    pending: &'a DashSet<String>,
    channel: String,
}

impl Drop for PendingReply<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.channel);
    }
}

/// Message bus for one application. Clones share configuration.
#[derive(Clone)]
pub struct MessageBus {
    bridge: Bridge,
    config: Arc<BusConfig>,
    pending: Arc<DashSet<String>>,
}

impl MessageBus {
    pub fn new(bridge: Bridge, config: BusConfig) -> Self {
        tracing::debug!(app_id = %config.app_id, "message bus attached");
        Self {
            bridge,
            config: Arc::new(config),
            pending: Arc::new(DashSet::new()),
        }
    }

    pub fn app_id(&self) -> &str {
        &self.config.app_id
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// Send `payload` to `target`. Returns the new message id.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        target: &str,
        message_type: &str,
        payload: &T,
    ) -> Result<String, BusError> {
        let payload = serde_json::to_value(payload).map_err(BusError::Encode)?;
        self.publish(AppMessage::new(
            self.config.app_id.as_str(),
            target,
            message_type,
            payload,
        ))
    }

    pub fn broadcast<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
    ) -> Result<String, BusError> {
        self.send(BROADCAST_TARGET, message_type, payload)
    }

    fn publish(&self, msg: AppMessage) -> Result<String, BusError> {
        let value = serde_json::to_value(&msg).map_err(BusError::Encode)?;
        tracing::debug!(
            id = %msg.id,
            to = %msg.target,
            message_type = %msg.message_type,
            "bus send"
        );
        self.bridge.publish(BUS_CHANNEL, value);
        Ok(msg.id)
    }

    fn subscribe(&self, filter: MessageFilter) -> MessageStream {
        MessageStream {
            rx: self.bridge.listen(BUS_CHANNEL),
            acceptance: Acceptance {
                config: Arc::clone(&self.config),
                pending: Arc::clone(&self.pending),
            },
            filter,
        }
    }

    /// Every accepted message.
    pub fn messages(&self) -> MessageStream {
        self.subscribe(Box::new(|_| true))
    }

    /// Accepted messages of `message_type`, optionally only from `from`.
    pub fn on(&self, message_type: &str, from: Option<&str>) -> MessageStream {
        let message_type = message_type.to_string();
        let from = from.map(str::to_string);
        self.subscribe(Box::new(move |msg| {
            msg.message_type == message_type && from.as_ref().map_or(true, |f| &msg.source == f)
        }))
    }

    /// Payloads of accepted messages of `message_type`. Payloads that do not
    /// decode as `T` are skipped.
    pub fn on_message<T: DeserializeOwned>(&self, message_type: &str) -> PayloadStream<T> {
        PayloadStream {
            messages: self.on(message_type, None),
            _marker: PhantomData,
        }
    }

    /// Send a request and wait for the first reply, or fail after `timeout`
    /// (the configured default when `None`).
    pub async fn send_with_response<Req, Res>(
        &self,
        target: &str,
        message_type: &str,
        payload: &Req,
        timeout: Option<Duration>,
    ) -> Result<Res, BusError>
    where
        Req: Serialize + ?Sized,
        Res: DeserializeOwned,
    {
        let payload = serde_json::to_value(payload).map_err(BusError::Encode)?;
        let response_channel = format!("rsp_{}", Uuid::new_v4().simple());
        let after = timeout.unwrap_or_else(|| self.config.default_timeout());

        self.pending.insert(response_channel.clone());
        let _pending = PendingReply {
            pending: &self.pending,
            channel: response_channel.clone(),
        };
        let mut replies = self.on(&response_channel, None);

        // Let the subscription settle before a fast responder can answer.
        tokio::task::yield_now().await;

        let request = AppMessage::new(self.config.app_id.as_str(), target, message_type, payload)
            .expecting_response(response_channel);
        self.publish(request)?;

        match tokio::time::timeout(after, replies.recv()).await {
            Ok(Some(reply)) => reply.payload_as(),
            Ok(None) => Err(BusError::Closed),
            Err(_) => {
                tracing::debug!(to = target, message_type, ?after, "request timed out");
                Err(BusError::Timeout {
                    message_type: message_type.to_string(),
                    target: target.to_string(),
                    after,
                })
            }
        }
    }

    /// Answer `original` if it asked for a reply; otherwise do nothing.
    /// Returns the id of the reply message when one was sent.
    pub fn respond<T: Serialize + ?Sized>(
        &self,
        original: &AppMessage,
        response: &T,
    ) -> Result<Option<String>, BusError> {
        match original.reply_channel() {
            Some(channel) => self.send(&original.source, channel, response).map(Some),
            None => Ok(None),
        }
    }
}
