//! Entry types for both tiers.
//!
//! [`CacheEntry`] is the memory-tier record and never leaves the process.
//! [`CacheMetadata`] is the persisted freshness/access/pin record that sits
//! next to each L2 payload, so staleness can be decided without decoding it.

use std::any::Any;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cache::key::CacheKey;

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A value held by the memory tier.
pub struct CacheEntry {
    /// The cached value, type-erased; readers downcast to their `T`.
    pub data: Arc<dyn Any + Send + Sync>,

    /// Accounted size in bytes.
    pub size_bytes: usize,

    /// When the value was stored.
    pub fetched_at: Instant,

    /// Lifetime from `fetched_at`.
    pub ttl: Duration,

    /// Timestamp of last read or write.
    pub last_accessed_at: Instant,

    /// Monotonic sequence number of the last access; breaks `Instant` ties.
    pub access_seq: u64,

    /// Exempt from automatic eviction.
    pub pinned: bool,
}

impl CacheEntry {
    pub fn new<T: Any + Send + Sync>(
        data: T,
        size_bytes: usize,
        ttl: Duration,
        pinned: bool,
        access_seq: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            data: Arc::new(data),
            size_bytes,
            fetched_at: now,
            ttl,
            last_accessed_at: now,
            access_seq,
            pinned,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.fetched_at) > self.ttl
    }

    /// Record a read.
    pub fn touch(&mut self, access_seq: u64) {
        self.last_accessed_at = Instant::now();
        self.access_seq = access_seq;
    }
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("size_bytes", &self.size_bytes)
            .field("fetched_at", &self.fetched_at)
            .field("ttl", &self.ttl)
            .field("last_accessed_at", &self.last_accessed_at)
            .field("pinned", &self.pinned)
            .finish_non_exhaustive()
    }
}

/// Persisted bookkeeping for one L2 entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMetadata {
    /// The entry this record describes.
    pub key: CacheKey,

    /// When the payload was written (ms since epoch).
    pub created_at_ms: u64,

    /// Last read or write (ms since epoch).
    pub last_accessed_at_ms: u64,

    /// Number of accesses; never decreases.
    pub access_count: u64,

    /// Freshness window from `created_at_ms`.
    pub ttl: Duration,

    /// Accounted payload size in bytes.
    pub data_size_bytes: usize,

    /// Exempt from automatic eviction and the expiry sweep.
    pub is_pinned: bool,
}

impl CacheMetadata {
    /// Metadata for a freshly written entry.
    pub fn new(key: CacheKey, ttl: Duration, data_size_bytes: usize, is_pinned: bool) -> Self {
        let now = now_millis();
        Self {
            key,
            created_at_ms: now,
            last_accessed_at_ms: now,
            access_count: 1,
            ttl,
            data_size_bytes,
            is_pinned,
        }
    }

    /// `now > created_at + ttl` using the record's own TTL.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.is_stale_for(self.ttl, now_ms)
    }

    /// Staleness against a caller-supplied TTL.
    pub fn is_stale_for(&self, ttl: Duration, now_ms: u64) -> bool {
        now_ms > self.created_at_ms.saturating_add(ttl.as_millis() as u64)
    }

    /// Freshness left under `ttl`, or `None` if already stale.
    pub fn remaining(&self, ttl: Duration, now_ms: u64) -> Option<Duration> {
        let expires_at = self.created_at_ms.saturating_add(ttl.as_millis() as u64);
        expires_at
            .checked_sub(now_ms)
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    /// Record an access, updating timestamp and counter.
    pub fn touch(&mut self, now_ms: u64) {
        self.last_accessed_at_ms = self.last_accessed_at_ms.max(now_ms);
        self.access_count = self.access_count.saturating_add(1);
    }
}
