//! Metadata store: per-entry freshness, access and pin state.
//!
//! Records are persisted as JSON in a reserved collection of the persistent
//! tier, independent of the payloads they describe, and mirrored in memory so
//! lookups never suspend. Persistence of a key always writes the mirror's
//! current record under a write lock, so the stored `access_count` can only
//! move forward even when several accesses race.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cache::entry::{now_millis, CacheMetadata};
use crate::cache::key::CacheKey;
use crate::error::Result;
use crate::storage::PersistentTier;

/// Collection holding metadata records in the persistent tier.
pub const METADATA_COLLECTION: &str = "__cache_metadata";

pub struct MetadataStore {
    store: Arc<dyn PersistentTier>,
    records: RwLock<HashMap<CacheKey, CacheMetadata>>,
    write_lock: Mutex<()>,
}

impl MetadataStore {
    pub fn new(store: Arc<dyn PersistentTier>) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Read every persisted record. Undecodable records are skipped.
    pub async fn scan_persisted(&self) -> Result<Vec<CacheMetadata>> {
        let ids = self.store.get_all_keys(METADATA_COLLECTION).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = self.store.get(&id, METADATA_COLLECTION).await? else {
                continue;
            };
            match serde_json::from_slice::<CacheMetadata>(&raw) {
                Ok(meta) => records.push(meta),
                Err(e) => warn!(id, error = %e, "Skipping unreadable metadata record"),
            }
        }
        Ok(records)
    }

    /// Replace the in-memory mirror with the persisted records.
    pub async fn load(&self) -> Result<usize> {
        let records = self.scan_persisted().await?;
        let count = records.len();
        let mut mirror = self.records.write();
        mirror.clear();
        for meta in records {
            mirror.insert(meta.key.clone(), meta);
        }
        debug!(count, "Loaded metadata records");
        Ok(count)
    }

    /// Mirror lookup only.
    pub fn get(&self, key: &CacheKey) -> Option<CacheMetadata> {
        self.records.read().get(key).cloned()
    }

    /// Mirror lookup, falling back to the persistent tier. Store failures are
    /// logged and treated as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> Option<CacheMetadata> {
        if let Some(meta) = self.get(key) {
            return Some(meta);
        }

        let raw = match self.store.get(&key.storage_id(), METADATA_COLLECTION).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(key = %key, error = %e, "Metadata read failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice::<CacheMetadata>(&raw) {
            Ok(meta) => Some(
                self.records
                    .write()
                    .entry(key.clone())
                    .or_insert(meta)
                    .clone(),
            ),
            Err(e) => {
                warn!(key = %key, error = %e, "Metadata record unreadable, treating as miss");
                None
            }
        }
    }

    /// Insert or replace a record.
    pub async fn put(&self, meta: CacheMetadata) {
        let key = meta.key.clone();
        self.records.write().insert(key.clone(), meta);
        self.persist(&key).await;
    }

    /// Bump access stats. Returns the updated record, if one exists.
    pub async fn record_access(&self, key: &CacheKey) -> Option<CacheMetadata> {
        self.lookup(key).await?;
        let updated = {
            let mut records = self.records.write();
            let meta = records.get_mut(key)?;
            meta.touch(now_millis());
            meta.clone()
        };
        self.persist(key).await;
        Some(updated)
    }

    /// Change the pin flag. Returns the updated record, if one exists.
    pub async fn set_pinned(&self, key: &CacheKey, pinned: bool) -> Option<CacheMetadata> {
        self.lookup(key).await?;
        let updated = {
            let mut records = self.records.write();
            let meta = records.get_mut(key)?;
            meta.is_pinned = pinned;
            meta.clone()
        };
        self.persist(key).await;
        Some(updated)
    }

    /// Delete a record from the mirror and the persistent tier.
    pub async fn remove(&self, key: &CacheKey) {
        let _guard = self.write_lock.lock().await;
        self.records.write().remove(key);
        if let Err(e) = self.store.delete(&key.storage_id(), METADATA_COLLECTION).await {
            warn!(key = %key, error = %e, "Failed to delete metadata record");
        }
    }

    /// Delete all records of a collection. Returns how many were removed.
    pub async fn remove_collection(&self, collection: &str) -> usize {
        let keys: Vec<CacheKey> = self
            .records
            .read()
            .keys()
            .filter(|k| k.collection == collection)
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key).await;
        }
        keys.len()
    }

    /// Snapshot of all mirrored records.
    pub fn snapshot(&self) -> Vec<CacheMetadata> {
        self.records.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the mirror's current record for `key`. Failures are logged.
    async fn persist(&self, key: &CacheKey) {
        let _guard = self.write_lock.lock().await;
        let Some(meta) = self.get(key) else {
            return;
        };
        let encoded = match serde_json::to_vec(&meta) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to encode metadata record");
                return;
            }
        };
        if let Err(e) = self
            .store
            .put(&key.storage_id(), encoded, METADATA_COLLECTION, None)
            .await
        {
            warn!(key = %key, error = %e, "Failed to persist metadata record");
        }
    }
}
