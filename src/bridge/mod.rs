//! Channel multiplexer with optional cross-context relay.
//!
//! A [`Bridge`] owns a registry of named channels. Publishing delivers to the
//! channel's local subscribers before returning, then relays an [`Envelope`]
//! through the configured transport so bridges in other contexts can
//! redeliver it. Frames carrying this bridge's own instance id, or a
//! different protocol version, are dropped on receipt.

pub mod envelope;
pub mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

pub use envelope::Envelope;
pub use transport::{
    BroadcastPort, BroadcastPrimitive, InboundFrames, LocalBroadcastHub, LocalStorageArea,
    StorageArea, StorageEvent, WatchId,
};

use crate::error::TransportError;

/// Which primitive, if any, carries messages to other contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Local delivery only
    #[default]
    None,
    /// Named broadcast port scoped to the channel prefix
    Broadcast,
    /// Write-then-remove on a shared storage area
    Storage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub transport: TransportKind,
    pub namespace: String,
    pub protocol_version: u32,
    /// Overrides `"{namespace}:v{protocol_version}"` when set
    pub channel_prefix: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            transport: TransportKind::None,
            namespace: "mfe".to_string(),
            protocol_version: 1,
            channel_prefix: None,
        }
    }
}

impl BridgeConfig {
    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn effective_prefix(&self) -> String {
        match &self.channel_prefix {
            Some(prefix) => prefix.clone(),
            None => format!("{}:v{}", self.namespace, self.protocol_version),
        }
    }
}

/// Host primitives available to remote transports.
#[derive(Clone, Default)]
pub struct HostPrimitives {
    pub broadcast: Option<Arc<dyn BroadcastPrimitive>>,
    pub storage: Option<Arc<dyn StorageArea>>,
}

impl HostPrimitives {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn with_broadcast(mut self, primitive: Arc<dyn BroadcastPrimitive>) -> Self {
        self.broadcast = Some(primitive);
        self
    }

    pub fn with_storage(mut self, area: Arc<dyn StorageArea>) -> Self {
        self.storage = Some(area);
        self
    }
}

enum Relay {
    Broadcast(Box<dyn BroadcastPort>),
    Storage {
        area: Arc<dyn StorageArea>,
        watch: WatchId,
    },
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<Value>,
}

struct BridgeInner {
    instance_id: String,
    config: BridgeConfig,
    prefix: String,
    channels: DashMap<String, Vec<Subscriber>>,
    next_subscriber: AtomicU64,
    relay: Mutex<Option<Relay>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// Publish/subscribe bridge. Clones share the same registry and transport.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Create a bridge with local delivery only. Use
    /// [`Bridge::with_primitives`] to enable relaying.
    pub fn new(config: BridgeConfig) -> Self {
        if config.transport != TransportKind::None {
            tracing::warn!(
                transport = ?config.transport,
                "bridge created without host primitives, delivering locally only"
            );
        }
        Self::build(config)
    }

    /// Create a bridge relaying through the primitive matching
    /// `config.transport`.
    ///
    /// A remote transport needs a Tokio runtime for its receive loop. When
    /// the primitive is missing or no runtime is running, the bridge logs a
    /// warning and stays local-only.
    pub fn with_primitives(config: BridgeConfig, host: &HostPrimitives) -> Self {
        let bridge = Self::build(config);
        if let Err(reason) = bridge.attach(host) {
            tracing::warn!(
                transport = ?bridge.inner.config.transport,
                %reason,
                "cross-context relay unavailable, delivering locally only"
            );
        }
        bridge
    }

    fn build(config: BridgeConfig) -> Self {
        let prefix = config.effective_prefix();
        let instance_id = Uuid::new_v4().to_string();
        tracing::debug!(%instance_id, %prefix, transport = ?config.transport, "bridge created");

        Self {
            inner: Arc::new(BridgeInner {
                instance_id,
                config,
                prefix,
                channels: DashMap::new(),
                next_subscriber: AtomicU64::new(0),
                relay: Mutex::new(None),
                pump: Mutex::new(None),
            }),
        }
    }

    fn attach(&self, host: &HostPrimitives) -> Result<(), TransportError> {
        let inner = &self.inner;
        let runtime = match inner.config.transport {
            TransportKind::None => return Ok(()),
            _ => tokio::runtime::Handle::try_current()
                .map_err(|e| TransportError::Unavailable(e.to_string()))?,
        };
        let weak = Arc::downgrade(inner);

        let (relay, pump) = match inner.config.transport {
            TransportKind::None => return Ok(()),
            TransportKind::Broadcast => {
                let primitive = host
                    .broadcast
                    .as_ref()
                    .ok_or_else(|| TransportError::Unavailable("no broadcast primitive provided".into()))?;
                let (port, frames) = primitive.open(&inner.prefix)?;
                let pump = runtime.spawn(pump_frames(weak, frames, Some));
                (Relay::Broadcast(port), pump)
            }
            TransportKind::Storage => {
                let area = host
                    .storage
                    .clone()
                    .ok_or_else(|| TransportError::Unavailable("no storage area provided".into()))?;
                let (watch, events) = area.watch();
                let key_prefix = format!("{}:", inner.prefix);
                let pump = runtime.spawn(pump_frames(weak, events, move |event: StorageEvent| {
                    if event.key.starts_with(&key_prefix) {
                        event.new_value
                    } else {
                        None
                    }
                }));
                (Relay::Storage { area, watch }, pump)
            }
        };

        *inner.relay.lock() = Some(relay);
        *inner.pump.lock() = Some(pump);
        tracing::info!(
            instance_id = %inner.instance_id,
            prefix = %inner.prefix,
            transport = ?inner.config.transport,
            "bridge relay attached"
        );
        Ok(())
    }

    /// Deliver `payload` to local subscribers of `channel`, then relay it.
    /// Relay failures are logged and otherwise ignored.
    pub fn publish(&self, channel: &str, payload: Value) {
        if self.inner.relay.lock().is_none() {
            self.inner.deliver_local(channel, payload);
            return;
        }

        self.inner.deliver_local(channel, payload.clone());
        if let Err(err) = self.inner.relay(channel, &payload) {
            tracing::debug!(channel, error = %err, category = ?err.category(), "relay failed");
        }
    }

    /// Subscribe to future deliveries on `channel`. Nothing published before
    /// this call is replayed.
    pub fn listen(&self, channel: &str) -> ChannelReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, tx });
        ChannelReceiver {
            channel: channel.to_string(),
            rx,
        }
    }

    /// Release transport resources. Local delivery keeps working.
    pub fn destroy(&self) {
        self.inner.shutdown();
    }

    pub fn instance_id(&self) -> &str {
        &self.inner.instance_id
    }

    pub fn prefix(&self) -> &str {
        &self.inner.prefix
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Whether a remote relay is currently attached.
    pub fn is_relaying(&self) -> bool {
        self.inner.relay.lock().is_some()
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .get(channel)
            .map(|subscribers| subscribers.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl BridgeInner {
    fn deliver_local(&self, channel: &str, payload: Value) {
        // The entry guard serialises concurrent publishes on one channel, so
        // every subscriber sees the same order.
        let mut subscribers = self.channels.entry(channel.to_string()).or_default();
        let before = subscribers.len();
        subscribers.retain(|s| s.tx.send(payload.clone()).is_ok());
        let pruned = before - subscribers.len();
        if pruned > 0 {
            tracing::trace!(channel, pruned, "dropped closed subscribers");
        }
    }

    fn relay(&self, channel: &str, payload: &Value) -> Result<(), TransportError> {
        let relay = self.relay.lock();
        let Some(relay) = relay.as_ref() else {
            return Ok(());
        };
        let frame = envelope::encode(
            self.config.protocol_version,
            channel,
            &self.instance_id,
            payload,
        )?;

        match relay {
            Relay::Broadcast(port) => port.post(&frame),
            Relay::Storage { area, .. } => {
                let key = format!("{}:{}", self.prefix, channel);
                area.set_item(&key, &frame)?;
                area.remove_item(&key)?;
                Ok(())
            }
        }
    }

    fn accept_remote(&self, frame: &str) {
        let envelope = match envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "dropping malformed envelope");
                return;
            }
        };
        if envelope.origin == self.instance_id {
            return;
        }
        if envelope.v != self.config.protocol_version {
            tracing::debug!(
                expected = self.config.protocol_version,
                got = envelope.v,
                channel = %envelope.ch,
                "dropping envelope with foreign protocol version"
            );
            return;
        }
        self.deliver_local(&envelope.ch, envelope.payload);
    }

    fn shutdown(&self) {
        let relay = self.relay.lock().take();
        match relay {
            Some(Relay::Broadcast(port)) => port.close(),
            Some(Relay::Storage { area, watch }) => area.unwatch(watch),
            None => {}
        }
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
            tracing::info!(instance_id = %self.instance_id, "bridge relay destroyed");
        }
    }
}

impl Drop for BridgeInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn pump_frames<F, E>(bridge: Weak<BridgeInner>, mut frames: mpsc::UnboundedReceiver<F>, extract: E)
where
    E: Fn(F) -> Option<String>,
{
    while let Some(frame) = frames.recv().await {
        let Some(text) = extract(frame) else {
            continue;
        };
        let Some(bridge) = bridge.upgrade() else {
            break;
        };
        bridge.accept_remote(&text);
    }
}

/// Subscription to one bridge channel.
pub struct ChannelReceiver {
    channel: String,
    rx: mpsc::UnboundedReceiver<Value>,
}

impl ChannelReceiver {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload. Returns `None` once the bridge is gone.
    pub async fn recv(&mut self) -> Option<Value> {
        self.rx.recv().await
    }

    /// Next payload already delivered, if any.
    pub fn try_recv(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = Value> + Send + 'static {
        futures::stream::unfold(self, |mut rx| async move {
            let item = rx.recv().await?;
            Some((item, rx))
        })
    }
}
