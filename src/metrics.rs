//! Cache metrics.
//!
//! The engine reports through the [`MetricsRecorder`] trait. [`NoopMetrics`]
//! is the default; [`PrometheusMetrics`] keeps counters in its own registry so
//! several cache instances can coexist in one process.

use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};

use crate::cache::key::CacheKey;

/// Why an entry left a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Freed to make room for a new memory-tier entry.
    Capacity,
    /// Removed by the background memory-tier trim.
    Trim,
    /// Lazily dropped from memory on read after its TTL passed.
    Expired,
    /// Removed from the persistent tier by the expiry sweep.
    Sweep,
}

impl EvictionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionReason::Capacity => "capacity",
            EvictionReason::Trim => "trim",
            EvictionReason::Expired => "expired",
            EvictionReason::Sweep => "sweep",
        }
    }
}

/// Receives cache events. All methods default to no-ops.
pub trait MetricsRecorder: Send + Sync {
    fn record_hit(&self, _key: &CacheKey) {}
    fn record_miss(&self, _key: &CacheKey) {}
    fn record_write(&self, _key: &CacheKey) {}
    fn record_eviction(&self, _key: &CacheKey, _reason: EvictionReason) {}
    fn record_collection_purge(&self, _collection: &str) {}
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {}

/// Prometheus counters labelled by collection.
#[derive(Clone)]
pub struct PrometheusMetrics {
    registry: Registry,
    hits: IntCounterVec,
    misses: IntCounterVec,
    writes: IntCounterVec,
    evictions: IntCounterVec,
    purges: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let hits = IntCounterVec::new(
            Opts::new("fetch_cache_hits_total", "Cache hits by collection"),
            &["collection"],
        )?;
        let misses = IntCounterVec::new(
            Opts::new("fetch_cache_misses_total", "Cache misses by collection"),
            &["collection"],
        )?;
        let writes = IntCounterVec::new(
            Opts::new("fetch_cache_writes_total", "Cache writes by collection"),
            &["collection"],
        )?;
        let evictions = IntCounterVec::new(
            Opts::new(
                "fetch_cache_evictions_total",
                "Entries evicted by collection and reason",
            ),
            &["collection", "reason"],
        )?;
        let purges = IntCounterVec::new(
            Opts::new(
                "fetch_cache_collection_purges_total",
                "Whole-collection purges",
            ),
            &["collection"],
        )?;

        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(misses.clone()))?;
        registry.register(Box::new(writes.clone()))?;
        registry.register(Box::new(evictions.clone()))?;
        registry.register(Box::new(purges.clone()))?;

        Ok(Self {
            registry,
            hits,
            misses,
            writes,
            evictions,
            purges,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all counters in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub fn hits(&self, collection: &str) -> u64 {
        self.hits.with_label_values(&[collection]).get()
    }

    pub fn misses(&self, collection: &str) -> u64 {
        self.misses.with_label_values(&[collection]).get()
    }

    pub fn evictions(&self, collection: &str, reason: EvictionReason) -> u64 {
        self.evictions
            .with_label_values(&[collection, reason.as_str()])
            .get()
    }
}

impl MetricsRecorder for PrometheusMetrics {
    fn record_hit(&self, key: &CacheKey) {
        self.hits.with_label_values(&[key.collection.as_str()]).inc();
    }

    fn record_miss(&self, key: &CacheKey) {
        self.misses.with_label_values(&[key.collection.as_str()]).inc();
    }

    fn record_write(&self, key: &CacheKey) {
        self.writes.with_label_values(&[key.collection.as_str()]).inc();
    }

    fn record_eviction(&self, key: &CacheKey, reason: EvictionReason) {
        self.evictions
            .with_label_values(&[key.collection.as_str(), reason.as_str()])
            .inc();
    }

    fn record_collection_purge(&self, collection: &str) {
        self.purges.with_label_values(&[collection]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_counters() {
        let metrics = PrometheusMetrics::new().unwrap();
        let key = CacheKey::new("books", "book:1");

        metrics.record_hit(&key);
        metrics.record_hit(&key);
        metrics.record_miss(&key);
        metrics.record_eviction(&key, EvictionReason::Capacity);

        assert_eq!(metrics.hits("books"), 2);
        assert_eq!(metrics.misses("books"), 1);
        assert_eq!(metrics.evictions("books", EvictionReason::Capacity), 1);

        let text = metrics.render().unwrap();
        assert!(text.contains("fetch_cache_hits_total"));
    }

    #[test]
    fn test_two_instances_do_not_collide() {
        let a = PrometheusMetrics::new().unwrap();
        let b = PrometheusMetrics::new().unwrap();
        a.record_write(&CacheKey::new("c", "k"));
        assert!(b.render().unwrap().find("fetch_cache_writes_total{").is_none());
    }
}
