//! Eviction policy: decides which memory-tier entries to drop under pressure.
//!
//! Plain LRU over `last_accessed_at` (ties broken by access sequence), with
//! pinned entries skipped entirely: they are never victims and never count
//! towards the bytes freed.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::cache::memory::MemoryState;
use crate::metrics::{EvictionReason, MetricsRecorder};

/// An eviction candidate with its recency.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: CacheKey,
    pub last_accessed_at: Instant,
    pub access_seq: u64,
    pub size_bytes: usize,
}

// Older access = smaller = evicted first.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.last_accessed_at
            .cmp(&other.last_accessed_at)
            .then(self.access_seq.cmp(&other.access_seq))
    }
}

/// What an eviction round removed.
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub freed_bytes: usize,
    pub evicted: Vec<CacheKey>,
}

/// The eviction policy engine.
pub struct EvictionManager {
    metrics: Arc<dyn MetricsRecorder>,
}

impl EvictionManager {
    pub fn new(metrics: Arc<dyn MetricsRecorder>) -> Self {
        Self { metrics }
    }

    /// Pick least-recently-used unpinned entries until their sizes add up to
    /// `required_bytes`, or every unpinned entry has been taken.
    ///
    /// Returns candidates oldest first.
    pub fn select_victims<'a>(
        &self,
        entries: impl Iterator<Item = (&'a CacheKey, &'a CacheEntry)>,
        required_bytes: usize,
    ) -> Vec<EvictionCandidate> {
        let mut candidates: Vec<EvictionCandidate> = entries
            .filter(|(_, entry)| !entry.pinned)
            .map(|(key, entry)| EvictionCandidate {
                key: key.clone(),
                last_accessed_at: entry.last_accessed_at,
                access_seq: entry.access_seq,
                size_bytes: entry.size_bytes,
            })
            .collect();
        candidates.sort();

        let mut victims = Vec::new();
        let mut selected = 0usize;
        for candidate in candidates {
            if selected >= required_bytes {
                break;
            }
            selected += candidate.size_bytes;
            victims.push(candidate);
        }

        victims
    }

    /// Remove victims from an already-locked memory tier until at least
    /// `required_bytes` are freed or nothing evictable is left. `keep`, when
    /// given, is never chosen.
    ///
    /// Takes the locked state rather than the tier so it can never re-acquire
    /// the tier lock.
    pub(crate) fn evict(
        &self,
        state: &mut MemoryState,
        required_bytes: usize,
        reason: EvictionReason,
        keep: Option<&CacheKey>,
    ) -> EvictionReport {
        let mut report = EvictionReport::default();
        if required_bytes == 0 {
            return report;
        }

        let entries = state.entries.iter().filter(|(k, _)| Some(*k) != keep);
        let victims = self.select_victims(entries, required_bytes);
        for victim in victims {
            if let Some(entry) = state.remove(&victim.key) {
                report.freed_bytes += entry.size_bytes;
                self.metrics.record_eviction(&victim.key, reason);
                debug!(
                    key = %victim.key,
                    size = entry.size_bytes,
                    reason = reason.as_str(),
                    "Evicted entry"
                );
                report.evicted.push(victim.key);
            }
        }

        report
    }
}
