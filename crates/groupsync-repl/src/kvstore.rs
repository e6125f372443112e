//! Ordered key-value storage backing the replication state.
//!
//! Keys are byte strings compared lexicographically so related records
//! (every row of one group, every value of one named set) can be found with a
//! prefix scan.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

/// Key type for the KV store.
pub type Key = Vec<u8>;
/// Value type for the KV store.
pub type Value = Vec<u8>;
/// A key-value pair.
pub type KvPair = (Key, Value);

/// Errors raised by a KV backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Backend-specific failure (lock poisoning, corrupt records).
    #[error("kv error: {0}")]
    Kv(String),

    /// I/O error from a durable backend.
    #[error("kv I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Record encoding error.
    #[error("kv encoding error: {0}")]
    Encoding(#[from] bincode::Error),
}

/// Key-value store used by [`crate::state::ReplicationState`].
///
/// Implementations must be safe to share between replication loops; every
/// method is a single atomic step and [`KvStore::write_batch`] applies all of
/// its operations or none of them.
pub trait KvStore: Send + Sync {
    /// Get a value by key. Returns None if the key doesn't exist.
    fn get(&self, key: &[u8]) -> Result<Option<Value>, StoreError>;

    /// Put a key-value pair. Overwrites any existing value.
    fn put(&self, key: Key, value: Value) -> Result<(), StoreError>;

    /// Delete a key. Returns Ok(()) even if the key didn't exist.
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;

    /// Scan all keys with the given prefix, returning (key, value) pairs in sorted order.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError>;

    /// Atomically write a batch of operations (puts and deletes), in order.
    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError>;
}

/// A single operation in a write batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BatchOp {
    /// Put a key-value pair.
    Put {
        /// The key to insert or update.
        key: Vec<u8>,
        /// The value to store.
        value: Vec<u8>,
    },
    /// Delete a key.
    Delete {
        /// The key to delete.
        key: Vec<u8>,
    },
}

/// Apply `ops` to an ordered map. Shared by every backend.
pub(crate) fn apply_ops(data: &mut BTreeMap<Key, Value>, ops: impl IntoIterator<Item = BatchOp>) {
    for op in ops {
        match op {
            BatchOp::Put { key, value } => {
                data.insert(key, value);
            }
            BatchOp::Delete { key } => {
                data.remove(&key);
            }
        }
    }
}

pub(crate) fn scan(data: &BTreeMap<Key, Value>, prefix: &[u8]) -> Vec<KvPair> {
    data.range::<Vec<u8>, _>(prefix.to_vec()..)
        .take_while(|(k, _)| k.starts_with(prefix))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// In-memory KV store backed by a BTreeMap. Thread-safe via RwLock.
///
/// Nothing survives a restart; used by tests and the `memory` state backend.
#[derive(Clone, Default)]
pub struct MemoryKvStore {
    data: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryKvStore {
    /// Creates a new empty in-memory KV store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.data.read().map(|d| d.len()).unwrap_or(0)
    }

    /// True if no keys are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Put { key, value }])
    }

    fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.write_batch(vec![BatchOp::Delete { key: key.to_vec() }])
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<KvPair>, StoreError> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        Ok(scan(&data, prefix))
    }

    fn write_batch(&self, ops: Vec<BatchOp>) -> Result<(), StoreError> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Kv(e.to_string()))?;
        apply_ops(&mut data, ops);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_delete() {
        let store = MemoryKvStore::new();
        store.put(b"key1".to_vec(), b"value1".to_vec()).unwrap();
        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), None);

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
        store.delete(b"never-existed").unwrap();
    }

    #[test]
    fn test_scan_prefix_sorted_and_bounded() {
        let store = MemoryKvStore::new();
        store.put(b"set/b".to_vec(), vec![]).unwrap();
        store.put(b"set/a".to_vec(), vec![]).unwrap();
        store.put(b"sex".to_vec(), vec![]).unwrap();
        store.put(b"set0".to_vec(), vec![]).unwrap();

        let keys: Vec<_> = store
            .scan_prefix(b"set/")
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"set/a".to_vec(), b"set/b".to_vec()]);
    }

    #[test]
    fn test_write_batch_applies_in_order() {
        let store = MemoryKvStore::new();
        store.put(b"existing".to_vec(), b"old".to_vec()).unwrap();

        store
            .write_batch(vec![
                BatchOp::Delete {
                    key: b"existing".to_vec(),
                },
                BatchOp::Put {
                    key: b"existing".to_vec(),
                    value: b"new".to_vec(),
                },
                BatchOp::Put {
                    key: b"other".to_vec(),
                    value: b"v".to_vec(),
                },
            ])
            .unwrap();

        assert_eq!(store.get(b"existing").unwrap(), Some(b"new".to_vec()));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_clones_share_data() {
        let store = MemoryKvStore::new();
        let other = store.clone();
        store.put(b"k".to_vec(), b"v".to_vec()).unwrap();
        assert_eq!(other.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(!other.is_empty());
    }
}
