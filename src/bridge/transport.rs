//! Cross-context primitives the bridge relays through.
//!
//! A host exposes two capability sets: a named broadcast port (every post
//! reaches the other ports opened under the same name) and a shared storage
//! area whose writes are announced to the other contexts. The bridge only
//! talks to the traits; [`LocalBroadcastHub`] and [`LocalStorageArea`] are
//! in-process implementations for running several contexts in one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::error::{StorageError, TransportError};
use crate::storage::KeyValueStore;

/// Raw text frames received by an open broadcast port.
pub type InboundFrames = mpsc::UnboundedReceiver<String>;

/// Named broadcast primitive.
pub trait BroadcastPrimitive: Send + Sync {
    /// Open a port on `name`. The receiver yields frames posted by other
    /// ports of the same name until the port is closed.
    fn open(&self, name: &str) -> Result<(Box<dyn BroadcastPort>, InboundFrames), TransportError>;
}

/// One open handle on a broadcast primitive.
pub trait BroadcastPort: Send + Sync {
    fn post(&self, frame: &str) -> Result<(), TransportError>;

    /// Stop sending and receiving. Idempotent.
    fn close(&self);
}

/// Change notification raised in other contexts when a storage key changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// `None` when the key was removed.
    pub new_value: Option<String>,
}

/// Handle returned by [`StorageArea::watch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

/// Key-value area shared between contexts, with change notifications.
pub trait StorageArea: KeyValueStore {
    /// Start receiving events for changes made by *other* contexts.
    fn watch(&self) -> (WatchId, mpsc::UnboundedReceiver<StorageEvent>);

    fn unwatch(&self, id: WatchId);
}

// ============================================================================
// In-process broadcast
// ============================================================================

struct PortEntry {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

/// In-process broadcast primitive. Clones share the same set of ports.
#[derive(Clone, Default)]
pub struct LocalBroadcastHub {
    ports: Arc<DashMap<String, Vec<PortEntry>>>,
    next_id: Arc<AtomicU64>,
}

impl LocalBroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of open ports on `name`.
    pub fn port_count(&self, name: &str) -> usize {
        self.ports.get(name).map(|ports| ports.len()).unwrap_or(0)
    }
}

impl BroadcastPrimitive for LocalBroadcastHub {
    fn open(&self, name: &str) -> Result<(Box<dyn BroadcastPort>, InboundFrames), TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.ports
            .entry(name.to_string())
            .or_default()
            .push(PortEntry { id, tx });

        let port = LocalPort {
            hub: self.clone(),
            name: name.to_string(),
            id,
            closed: AtomicBool::new(false),
        };
        Ok((Box::new(port), rx))
    }
}

struct LocalPort {
    hub: LocalBroadcastHub,
    name: String,
    id: u64,
    closed: AtomicBool,
}

impl BroadcastPort for LocalPort {
    fn post(&self, frame: &str) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::PortClosed(self.name.clone()));
        }
        if let Some(ports) = self.hub.ports.get(&self.name) {
            for peer in ports.iter().filter(|p| p.id != self.id) {
                // A peer whose receiver is gone is simply skipped.
                let _ = peer.tx.send(frame.to_string());
            }
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(mut ports) = self.hub.ports.get_mut(&self.name) {
            ports.retain(|p| p.id != self.id);
        }
    }
}

impl Drop for LocalPort {
    fn drop(&mut self) {
        self.close();
    }
}

// ============================================================================
// In-process storage area
// ============================================================================

struct Watcher {
    context: u64,
    tx: mpsc::UnboundedSender<StorageEvent>,
}

#[derive(Default)]
struct SharedArea {
    entries: RwLock<HashMap<String, String>>,
    watchers: DashMap<u64, Watcher>,
    next_context: AtomicU64,
    next_watch: AtomicU64,
    quota: Option<usize>,
}

/// In-process storage area. Each handle acts as one context: its own writes
/// are not reported back to its own watchers. Use [`LocalStorageArea::context`]
/// to obtain a handle for another context on the same area.
#[derive(Clone)]
pub struct LocalStorageArea {
    shared: Arc<SharedArea>,
    context: u64,
}

impl Default for LocalStorageArea {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStorageArea {
    pub fn new() -> Self {
        Self::from_shared(SharedArea::default())
    }

    /// Area that rejects writes once keys plus values exceed `limit` bytes.
    pub fn with_quota(limit: usize) -> Self {
        Self::from_shared(SharedArea {
            quota: Some(limit),
            ..SharedArea::default()
        })
    }

    fn from_shared(shared: SharedArea) -> Self {
        let shared = Arc::new(shared);
        let context = shared.next_context.fetch_add(1, Ordering::Relaxed);
        Self { shared, context }
    }

    /// New handle on the same area, acting as a distinct context.
    pub fn context(&self) -> Self {
        let context = self.shared.next_context.fetch_add(1, Ordering::Relaxed);
        Self {
            shared: Arc::clone(&self.shared),
            context,
        }
    }

    fn announce(&self, key: &str, new_value: Option<&str>) {
        let event = StorageEvent {
            key: key.to_string(),
            new_value: new_value.map(str::to_string),
        };
        for watcher in self.shared.watchers.iter() {
            if watcher.context != self.context {
                let _ = watcher.tx.send(event.clone());
            }
        }
    }
}

impl KeyValueStore for LocalStorageArea {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.shared.entries.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let changed = {
            let mut entries = self.shared.entries.write();
            if let Some(limit) = self.shared.quota {
                let used: usize = entries
                    .iter()
                    .filter(|(k, _)| k.as_str() != key)
                    .map(|(k, v)| k.len() + v.len())
                    .sum::<usize>()
                    + key.len()
                    + value.len();
                if used > limit {
                    return Err(StorageError::Quota { used, limit });
                }
            }
            entries.insert(key.to_string(), value.to_string()).as_deref() != Some(value)
        };
        if changed {
            self.announce(key, Some(value));
        }
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        let existed = self.shared.entries.write().remove(key).is_some();
        if existed {
            self.announce(key, None);
        }
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        let removed: Vec<String> = self.shared.entries.write().drain().map(|(k, _)| k).collect();
        for key in removed {
            self.announce(&key, None);
        }
        Ok(())
    }
}

impl StorageArea for LocalStorageArea {
    fn watch(&self) -> (WatchId, mpsc::UnboundedReceiver<StorageEvent>) {
        let id = self.shared.next_watch.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.watchers.insert(
            id,
            Watcher {
                context: self.context,
                tx,
            },
        );
        (WatchId(id), rx)
    }

    fn unwatch(&self, id: WatchId) {
        self.shared.watchers.remove(&id.0);
    }
}
