//! In-process implementation of [`PersistentTier`].

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use super::{PersistentTier, StoreError};

/// A `PersistentTier` that lives in process memory. Nothing survives a
/// restart unless the same instance is shared.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of entries across all collections.
    pub fn len(&self) -> usize {
        self.collections.read().values().map(|c| c.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl PersistentTier for MemoryStore {
    async fn put(
        &self,
        key: &str,
        data: Bytes,
        collection: &str,
        _ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.collections
            .write()
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str, collection: &str) -> Result<Option<Bytes>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .and_then(|c| c.get(key).cloned()))
    }

    async fn delete(&self, key: &str, collection: &str) -> Result<(), StoreError> {
        let mut collections = self.collections.write();
        if let Some(c) = collections.get_mut(collection) {
            c.remove(key);
            if c.is_empty() {
                collections.remove(collection);
            }
        }
        Ok(())
    }

    async fn exists(&self, key: &str, collection: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .is_some_and(|c| c.contains_key(key)))
    }

    async fn get_all_keys(&self, collection: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_collection(&self, collection: &str) -> Result<(), StoreError> {
        self.collections.write().remove(collection);
        Ok(())
    }

    async fn size_of(&self, collection: &str) -> Result<u64, StoreError> {
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|c| c.values().map(|v| v.len() as u64).sum())
            .unwrap_or(0))
    }
}
