//! Durable snapshot of the persisted subset of the state tree.
//!
//! Only `user` and `theme` are written, as `{"v": 1, "user": ..., "theme": ...}`.
//! Reading is lenient: a snapshot with an unknown or missing version, or with
//! one unreadable field, still yields whatever fields parse.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use super::model::{GlobalState, Theme, User};
use crate::error::StorageError;
use crate::storage::KeyValueStore;

pub const DEFAULT_PERSIST_KEY: &str = "mfe:globalState:v1";
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    v: u32,
    user: Option<&'a User>,
    theme: &'a Theme,
}

/// Fields recovered from a stored snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistedSnapshot {
    pub version: Option<u64>,
    pub user: Option<User>,
    pub theme: Option<Theme>,
}

impl PersistedSnapshot {
    /// Best-effort extraction from raw JSON. Returns `None` only when the
    /// text is not a JSON object.
    pub fn parse(raw: &str, expected_version: u32) -> Option<Self> {
        let value: Value = serde_json::from_str(raw).ok()?;
        let object = value.as_object()?;
        let version = object.get("v").and_then(Value::as_u64);

        if version != Some(u64::from(expected_version)) {
            tracing::debug!(
                found = ?version,
                expected = expected_version,
                "persisted snapshot has unexpected schema version, reading best effort"
            );
        }

        Some(Self {
            version,
            user: object.get("user").and_then(read_user),
            theme: object
                .get("theme")
                .and_then(|theme| serde_json::from_value(theme.clone()).ok()),
        })
    }

    /// Overlay the recovered fields on `defaults`.
    pub fn merge_into(self, defaults: &GlobalState) -> GlobalState {
        GlobalState {
            user: self.user.map(Arc::new).or_else(|| defaults.user.clone()),
            theme: self.theme.map(Arc::new).unwrap_or_else(|| Arc::clone(&defaults.theme)),
            ..defaults.clone()
        }
    }
}

fn read_user(raw: &Value) -> Option<User> {
    if raw.is_null() {
        return None;
    }
    match serde_json::from_value(raw.clone()) {
        Ok(user) => Some(user),
        Err(err) => {
            tracing::debug!(error = %err, "ignoring unreadable persisted user");
            None
        }
    }
}

/// Reads and writes snapshots under one key of a [`KeyValueStore`].
#[derive(Clone)]
pub struct Persister {
    store: Arc<dyn KeyValueStore>,
    key: String,
    version: u32,
}

impl Persister {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>, version: u32) -> Self {
        Self {
            store,
            key: key.into(),
            version,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn save(&self, state: &GlobalState) -> Result<(), StorageError> {
        let snapshot = SnapshotRef {
            v: self.version,
            user: state.user.as_deref(),
            theme: &state.theme,
        };
        let raw = serde_json::to_string(&snapshot)?;
        self.store.set_item(&self.key, &raw)
    }

    pub fn load(&self) -> Result<Option<PersistedSnapshot>, StorageError> {
        let Some(raw) = self.store.get_item(&self.key)? else {
            return Ok(None);
        };
        let snapshot = PersistedSnapshot::parse(&raw, self.version);
        if snapshot.is_none() {
            tracing::warn!(key = %self.key, "persisted snapshot is not a JSON object, ignoring");
        }
        Ok(snapshot)
    }
}
