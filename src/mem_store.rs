//! In-memory storage backend.
//!
//! This module provides [`MemStore`], a simple in-memory backend implementing
//! the [`KeyValueStore`] trait over a [`BTreeMap`].
//!
//! # Note
//!
//! `MemStore` is not part of the tree itself. It is merely a storage backend
//! providing the ordered key-value storage the tree persists into. It is
//! primarily intended for unit and integration testing, development, and as
//! a reference implementation of the storage trait. Production deployments
//! should use a database-backed implementation instead.
//!
//! # Thread Safety
//!
//! All operations are thread-safe through the use of [`RwLock`] for interior
//! mutability.

use crate::traits::{KeyValueStore, WriteEntry};
use std::{collections::BTreeMap, sync::RwLock};

/// In-memory [`KeyValueStore`] backed by a [`BTreeMap`].
#[derive(Debug, Default)]
pub struct MemStore {
    kvs: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl Clone for MemStore {
    fn clone(&self) -> Self {
        Self {
            kvs: RwLock::new(self.kvs.read().expect("store lock poisoned").clone()),
        }
    }
}

impl MemStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently stored.
    pub fn len(&self) -> usize {
        self.kvs.read().unwrap().len()
    }

    /// Returns true if the store holds no keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl KeyValueStore for MemStore {
    /// Uses static string references for simplicity in this in-memory
    /// implementation.
    type Error = &'static str;

    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Self::Error> {
        Ok(self.kvs.read().unwrap().get(key).cloned())
    }

    fn batch_write(&self, entries: Vec<WriteEntry>) -> Result<(), Self::Error> {
        let mut kvs = self.kvs.write().unwrap();
        for (key, value) in entries {
            match value {
                Some(value) => kvs.insert(key, value),
                None => kvs.remove(&key),
            };
        }
        Ok(())
    }

    fn read_range(
        &self,
        start: &[u8],
        end: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, Self::Error> {
        Ok(self
            .kvs
            .read()
            .unwrap()
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Tests batch application semantics: upserts land, deletions remove,
    /// and a later entry for the same key wins over an earlier one.
    #[test]
    fn batch_write_semantics() {
        let store = MemStore::new();
        store
            .batch_write(vec![
                (b"a".to_vec(), Some(b"1".to_vec())),
                (b"b".to_vec(), Some(b"2".to_vec())),
                (b"a".to_vec(), Some(b"3".to_vec())),
            ])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));

        store
            .batch_write(vec![(b"a".to_vec(), None)])
            .unwrap();
        assert_eq!(store.get(b"a").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    /// Tests that range reads are ordered and respect the half-open bounds.
    #[test]
    fn range_reads() {
        let store = MemStore::new();
        store
            .batch_write(
                [b"k1", b"k2", b"k3"]
                    .iter()
                    .map(|k| (k.to_vec(), Some(k.to_vec())))
                    .collect(),
            )
            .unwrap();

        let entries = store.read_range(b"k1", b"k3").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, b"k1".to_vec());
        assert_eq!(entries[1].0, b"k2".to_vec());

        assert!(store.read_range(b"x", b"y").unwrap().is_empty());
    }
}
