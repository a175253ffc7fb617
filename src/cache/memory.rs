//! Memory tier (L1): bounded, size-accounted, TTL- and pin-aware.
//!
//! All bookkeeping happens under one mutex, and eviction runs inside the same
//! critical section as the insert that needs it, so concurrent puts can never
//! double-free or leave `current_size` out of step with the map.

use std::any::{type_name, Any};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::cache::entry::CacheEntry;
use crate::cache::evictor::EvictionManager;
use crate::cache::key::CacheKey;
use crate::error::{CacheError, Result};
use crate::metrics::{EvictionReason, MetricsRecorder};

/// Locked state of the memory tier.
#[derive(Debug)]
pub(crate) struct MemoryState {
    pub(crate) entries: HashMap<CacheKey, CacheEntry>,
    pub(crate) current_size: usize,
    pub(crate) max_size: usize,
    next_seq: u64,
}

impl MemoryState {
    fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            current_size: 0,
            max_size,
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    /// Remove an entry and release its bytes.
    pub(crate) fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_size = self.current_size.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        self.current_size += entry.size_bytes;
        self.entries.insert(key, entry);
    }
}

/// Result of a [`MemoryTier::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Stored, after evicting `evicted` other entries.
    Inserted { evicted: usize },
    /// The item is larger than the whole tier budget.
    RejectedTooLarge,
    /// Not enough unpinned entries could be evicted to make room.
    RejectedNoRoom,
}

impl PutOutcome {
    pub fn is_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted { .. })
    }
}

/// Point-in-time usage of the memory tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub entries: usize,
    pub pinned_entries: usize,
    pub bytes_used: usize,
    pub capacity: usize,
}

impl MemoryStats {
    /// Usage as a fraction of capacity (0.0 - 1.0).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }
}

/// The in-process cache tier.
pub struct MemoryTier {
    state: Mutex<MemoryState>,
    evictor: EvictionManager,
    metrics: Arc<dyn MetricsRecorder>,
}

impl MemoryTier {
    pub fn new(max_size: usize, metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self {
            state: Mutex::new(MemoryState::new(max_size)),
            evictor: EvictionManager::new(metrics.clone()),
            metrics,
        }
    }

    /// Read a value, dropping it first if its TTL has passed.
    ///
    /// A live entry of another type yields `TypeMismatch`.
    pub fn get<T>(&self, key: &CacheKey) -> Result<Option<T>>
    where
        T: Any + Clone + Send + Sync,
    {
        let mut state = self.state.lock();

        let expired = match state.entries.get(key) {
            Some(entry) => entry.is_expired(Instant::now()),
            None => return Ok(None),
        };
        if expired {
            state.remove(key);
            drop(state);
            self.metrics.record_eviction(key, EvictionReason::Expired);
            debug!(key = %key, "Dropped expired entry on read");
            return Ok(None);
        }

        let seq = state.next_seq();
        let Some(entry) = state.entries.get_mut(key) else {
            return Ok(None);
        };
        entry.touch(seq);

        entry
            .data
            .downcast_ref::<T>()
            .cloned()
            .map(Some)
            .ok_or_else(|| CacheError::TypeMismatch {
                key: key.clone(),
                reason: format!("memory tier holds a different type than {}", type_name::<T>()),
            })
    }

    /// Store a value, evicting least-recently-used unpinned entries if needed.
    ///
    /// Any previous entry for `key` is dropped first so its bytes are
    /// reclaimed before the new size is accounted.
    pub fn put<T>(
        &self,
        key: CacheKey,
        data: T,
        ttl: Duration,
        size_bytes: usize,
        pinned: bool,
    ) -> PutOutcome
    where
        T: Any + Send + Sync,
    {
        let mut state = self.state.lock();
        state.remove(&key);

        if size_bytes > state.max_size {
            warn!(
                key = %key,
                size = size_bytes,
                capacity = state.max_size,
                "Item exceeds memory tier budget, not caching in memory"
            );
            return PutOutcome::RejectedTooLarge;
        }

        let mut evicted = 0;
        let projected = state.current_size + size_bytes;
        if projected > state.max_size {
            let required = projected - state.max_size;
            let evictable: usize = self
                .evictor
                .select_victims(state.entries.iter(), required)
                .iter()
                .map(|c| c.size_bytes)
                .sum();
            if evictable < required {
                warn!(
                    key = %key,
                    size = size_bytes,
                    required,
                    evictable,
                    "Memory tier full of pinned entries, not caching in memory"
                );
                return PutOutcome::RejectedNoRoom;
            }

            let report = self
                .evictor
                .evict(&mut state, required, EvictionReason::Capacity, None);
            evicted = report.evicted.len();
        }

        let seq = state.next_seq();
        state.insert(key, CacheEntry::new(data, size_bytes, ttl, pinned, seq));
        debug_assert!(state.current_size <= state.max_size);

        PutOutcome::Inserted { evicted }
    }

    /// Drop an entry. Returns whether one existed.
    pub fn remove(&self, key: &CacheKey) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Free at least `required_bytes` by evicting unpinned entries, oldest
    /// first. Returns the bytes actually freed.
    pub fn evict(&self, required_bytes: usize) -> usize {
        let mut state = self.state.lock();
        self.evictor
            .evict(&mut state, required_bytes, EvictionReason::Capacity, None)
            .freed_bytes
    }

    /// Evict unpinned entries until usage is at most `target_bytes`.
    pub fn trim_to(&self, target_bytes: usize) -> usize {
        self.trim(target_bytes, None)
    }

    /// Like [`trim_to`](Self::trim_to), but `keep` stays resident even if
    /// the target cannot be reached without it.
    pub fn trim_to_keeping(&self, target_bytes: usize, keep: &CacheKey) -> usize {
        self.trim(target_bytes, Some(keep))
    }

    fn trim(&self, target_bytes: usize, keep: Option<&CacheKey>) -> usize {
        let mut state = self.state.lock();
        let excess = state.current_size.saturating_sub(target_bytes);
        if excess == 0 {
            return 0;
        }
        self.evictor
            .evict(&mut state, excess, EvictionReason::Trim, keep)
            .freed_bytes
    }

    /// Change the pin flag of a resident entry. Returns whether it exists.
    pub fn set_pinned(&self, key: &CacheKey, pinned: bool) -> bool {
        match self.state.lock().entries.get_mut(key) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn is_pinned(&self, key: &CacheKey) -> bool {
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| e.pinned)
    }

    /// Whether a live (unexpired) entry exists. Does not count as an access.
    pub fn contains(&self, key: &CacheKey) -> bool {
        let now = Instant::now();
        self.state
            .lock()
            .entries
            .get(key)
            .is_some_and(|e| !e.is_expired(now))
    }

    /// Drop every entry of a collection. Returns how many were removed.
    pub fn remove_collection(&self, collection: &str) -> usize {
        let mut state = self.state.lock();
        let keys: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.collection == collection)
            .cloned()
            .collect();
        for key in &keys {
            state.remove(key);
        }
        keys.len()
    }

    pub fn current_size(&self) -> usize {
        self.state.lock().current_size
    }

    pub fn max_size(&self) -> usize {
        self.state.lock().max_size
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        let state = self.state.lock();
        MemoryStats {
            entries: state.entries.len(),
            pinned_entries: state.entries.values().filter(|e| e.pinned).count(),
            bytes_used: state.current_size,
            capacity: state.max_size,
        }
    }
}
