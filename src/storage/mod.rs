//! Durable key-value stores used for state persistence.
//!
//! The store only needs four capabilities, so anything that can hold string
//! values under string keys can back it: a process-local map, a sqlite file,
//! or a host-provided storage area.

pub mod db;

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::StorageError;

pub use db::SqliteStore;

/// Capability set of a durable key-value store.
pub trait KeyValueStore: Send + Sync {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError>;

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError>;

    fn remove_item(&self, key: &str) -> Result<(), StorageError>;

    fn clear(&self) -> Result<(), StorageError>;
}

/// In-memory store, optionally bounded by a byte quota.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, String>>,
    quota: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that rejects writes once keys plus values exceed
    /// `limit` bytes.
    pub fn with_quota(limit: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            quota: Some(limit),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryStore {
    fn get_item(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let mut entries = self.entries.write();

        if let Some(limit) = self.quota {
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

        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) -> Result<(), StorageError> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> Result<(), StorageError> {
        self.entries.write().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryStore::new();
        assert!(store.get_item("k").unwrap().is_none());

        store.set_item("k", "v1").unwrap();
        store.set_item("k", "v2").unwrap();
        assert_eq!(store.get_item("k").unwrap().as_deref(), Some("v2"));
        assert_eq!(store.len(), 1);

        store.remove_item("k").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_memory_store_quota() {
        let store = MemoryStore::with_quota(8);
        store.set_item("ab", "cdef").unwrap();

        // Overwriting the same key only counts the new value.
        store.set_item("ab", "cdefgh").unwrap();

        let err = store.set_item("xy", "z").unwrap_err();
        assert!(matches!(err, StorageError::Quota { limit: 8, .. }));
    }

    #[test]
    fn test_memory_store_clear() {
        let store = MemoryStore::new();
        store.set_item("a", "1").unwrap();
        store.set_item("b", "2").unwrap();
        store.clear().unwrap();
        assert!(store.is_empty());
    }
}
