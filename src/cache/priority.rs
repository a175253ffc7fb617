//! Persisted per-resource retention priority.
//!
//! A resource that finished a full bulk download is marked `High`. The level
//! is a retention hint for the host application; memory-tier eviction only
//! honours explicit pins.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::entry::now_millis;
use crate::error::Result;
use crate::storage::PersistentTier;

/// Collection holding priority records in the persistent tier.
pub const PRIORITY_COLLECTION: &str = "__cache_priorities";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Low,
    #[default]
    Normal,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityRecord {
    pub resource_id: String,
    pub level: PriorityLevel,
    pub last_access_timestamp_ms: u64,
    pub access_count: u64,
}

impl PriorityRecord {
    fn new(resource_id: &str, level: PriorityLevel) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            level,
            last_access_timestamp_ms: now_millis(),
            access_count: 0,
        }
    }
}

pub struct PriorityStore {
    store: Arc<dyn PersistentTier>,
    records: RwLock<HashMap<String, PriorityRecord>>,
}

impl PriorityStore {
    pub fn new(store: Arc<dyn PersistentTier>) -> Self {
        Self {
            store,
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Reload all records from the persistent tier.
    pub async fn load(&self) -> Result<usize> {
        let ids = self.store.get_all_keys(PRIORITY_COLLECTION).await?;
        let mut loaded = HashMap::with_capacity(ids.len());
        for id in ids {
            let Some(raw) = self.store.get(&id, PRIORITY_COLLECTION).await? else {
                continue;
            };
            match serde_json::from_slice::<PriorityRecord>(&raw) {
                Ok(record) => {
                    loaded.insert(record.resource_id.clone(), record);
                }
                Err(e) => warn!(id, error = %e, "Skipping unreadable priority record"),
            }
        }
        let count = loaded.len();
        *self.records.write() = loaded;
        debug!(count, "Loaded priority records");
        Ok(count)
    }

    pub fn get(&self, resource_id: &str) -> Option<PriorityRecord> {
        self.records.read().get(resource_id).cloned()
    }

    /// Priority of a resource; `Normal` when none was recorded.
    pub fn level(&self, resource_id: &str) -> PriorityLevel {
        self.get(resource_id).map(|r| r.level).unwrap_or_default()
    }

    /// Whether the resource is marked for full retention.
    pub fn is_retained(&self, resource_id: &str) -> bool {
        self.level(resource_id) == PriorityLevel::High
    }

    pub async fn set_priority(&self, resource_id: &str, level: PriorityLevel) -> PriorityRecord {
        let record = {
            let mut records = self.records.write();
            let record = records
                .entry(resource_id.to_string())
                .or_insert_with(|| PriorityRecord::new(resource_id, level));
            record.level = level;
            record.clone()
        };
        self.persist(&record).await;
        record
    }

    /// Record a request for the resource.
    pub async fn touch(&self, resource_id: &str) -> PriorityRecord {
        let record = {
            let mut records = self.records.write();
            let record = records
                .entry(resource_id.to_string())
                .or_insert_with(|| PriorityRecord::new(resource_id, PriorityLevel::Normal));
            record.last_access_timestamp_ms = record.last_access_timestamp_ms.max(now_millis());
            record.access_count = record.access_count.saturating_add(1);
            record.clone()
        };
        self.persist(&record).await;
        record
    }

    pub async fn remove(&self, resource_id: &str) {
        self.records.write().remove(resource_id);
        if let Err(e) = self.store.delete(resource_id, PRIORITY_COLLECTION).await {
            warn!(resource_id, error = %e, "Failed to delete priority record");
        }
    }

    async fn persist(&self, record: &PriorityRecord) {
        let encoded = match serde_json::to_vec(record) {
            Ok(encoded) => Bytes::from(encoded),
            Err(e) => {
                warn!(resource_id = record.resource_id, error = %e, "Failed to encode priority record");
                return;
            }
        };
        if let Err(e) = self
            .store
            .put(&record.resource_id, encoded, PRIORITY_COLLECTION, None)
            .await
        {
            warn!(resource_id = record.resource_id, error = %e, "Failed to persist priority record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_default_level_is_normal() {
        let priorities = PriorityStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(priorities.level("book:1"), PriorityLevel::Normal);
        assert!(!priorities.is_retained("book:1"));
    }

    #[tokio::test]
    async fn test_priority_survives_reload() {
        let store = Arc::new(MemoryStore::new());
        let first = PriorityStore::new(store.clone());
        first.set_priority("book:42", PriorityLevel::High).await;
        first.touch("book:42").await;

        let second = PriorityStore::new(store);
        assert_eq!(second.load().await.unwrap(), 1);
        let record = second.get("book:42").unwrap();
        assert_eq!(record.level, PriorityLevel::High);
        assert_eq!(record.access_count, 1);
        assert!(second.is_retained("book:42"));
    }

    #[tokio::test]
    async fn test_touch_keeps_level_and_remove_resets_it() {
        let priorities = PriorityStore::new(Arc::new(MemoryStore::new()));
        priorities.set_priority("a", PriorityLevel::Low).await;
        priorities.touch("a").await;
        let record = priorities.touch("a").await;
        assert_eq!(record.level, PriorityLevel::Low);
        assert_eq!(record.access_count, 2);

        priorities.remove("a").await;
        assert_eq!(priorities.level("a"), PriorityLevel::Normal);
    }
}
