//! # mfe-sync
//!
//! Messaging core for micro-frontends sharing one host: a pub/sub bridge
//! that can relay between browsing contexts, an addressable message bus with
//! request/response, and a replicated global state store.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mfe_sync::{Bridge, BridgeConfig, BusConfig, GlobalStateStore, MessageBus, StoreConfig, User};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let bridge = Bridge::new(BridgeConfig::default());
//!
//!     let cart = MessageBus::new(bridge.clone(), BusConfig::new("cart"));
//!     let mut added = cart.on_message::<String>("ADD_ITEM");
//!
//!     let shell = MessageBus::new(bridge.clone(), BusConfig::new("shell"));
//!     shell.send("cart", "ADD_ITEM", "sku-42")?;
//!     assert_eq!(added.recv().await.as_deref(), Some("sku-42"));
//!
//!     let store = GlobalStateStore::new(bridge, StoreConfig::default());
//!     store.set_user(User::new("u1", "Ada"));
//!     assert!(store.get_snapshot().user.is_some());
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod bus;
pub mod config;
pub mod error;
pub mod state;
pub mod storage;

// Re-export main types for library consumers
pub use bridge::{
    Bridge, BridgeConfig, ChannelReceiver, Envelope, HostPrimitives, LocalBroadcastHub, LocalStorageArea,
    TransportKind,
};
pub use bus::{AppMessage, BusConfig, MessageBus, MessageStream, PayloadStream, BROADCAST_TARGET};
pub use config::MeshConfig;
pub use error::{BusError, ConfigError, ErrorCategory, StorageError, TransportError};
pub use state::{
    GlobalAction, GlobalState, GlobalStateStore, ModalContext, Notification, NotificationKind, StoreConfig,
    Selector, Theme, ThemeMode, User,
};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
