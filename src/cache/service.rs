//! Cache orchestrator: the `fetch` / `cache_data` / `get_cached_data` façade.
//!
//! Composes the memory tier, persistent tier, metadata store and fetch
//! coordinator into one request lifecycle:
//!
//! ```text
//! memory hit ──────────────────────────────────────────────► Memory
//! persistent hit, fresh (or CacheOnly) ────────────────────► Persistent
//! persistent hit, stale, SWR / CacheFirst ─► refresh in bg ─► Persistent (stale)
//! otherwise ─► network (deduped, timed out) ─► write-through ► Network
//!                 └── failure + stale copy ────────────────► StaleFallback
//! ```

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cache::coordinator::FetchCoordinator;
use crate::cache::entry::{now_millis, CacheMetadata};
use crate::cache::key::CacheKey;
use crate::cache::lock::KeyLocks;
use crate::cache::maintenance::{self, BackgroundMaintenance, MaintenanceHandle};
use crate::cache::memory::{MemoryStats, MemoryTier};
use crate::cache::metadata::MetadataStore;
use crate::cache::policy::{CachePolicy, CacheResult, CacheSource};
use crate::cache::priority::PriorityStore;
use crate::cache::size::{SerializedLength, SizeEstimator};
use crate::config::{CacheConfig, Config, MaintenanceConfig};
use crate::connectivity::{Connectivity, ConnectivityFlag};
use crate::error::{CacheError, Result};
use crate::metrics::{MetricsRecorder, NoopMetrics};
use crate::storage::PersistentTier;

/// Values the cache can hold in both tiers.
pub trait CacheValue: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// Outcome shared between coalesced network requesters: the encoded payload
/// as written through, plus its metadata.
type FetchOutcome = std::result::Result<(Bytes, CacheMetadata), CacheError>;

/// What the cache tiers produced for a read.
enum TierRead<T> {
    Memory {
        data: T,
        metadata: Option<CacheMetadata>,
    },
    Persistent {
        data: T,
        metadata: Option<CacheMetadata>,
        is_stale: bool,
    },
    Miss,
    Mismatch(CacheError),
}

#[derive(Debug, Default)]
struct Counters {
    memory_hits: AtomicU64,
    persistent_hits: AtomicU64,
    network_fetches: AtomicU64,
    stale_served: AtomicU64,
    misses: AtomicU64,
    errors: AtomicU64,
}

/// Point-in-time view of the cache.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub memory: MemoryStats,
    pub metadata_records: usize,
    pub in_flight_fetches: usize,
    pub memory_hits: u64,
    pub persistent_hits: u64,
    pub network_fetches: u64,
    pub stale_served: u64,
    pub misses: u64,
    pub errors: u64,
}

/// Builds a [`CacheService`] with optional collaborators.
pub struct CacheServiceBuilder {
    cache: CacheConfig,
    maintenance: MaintenanceConfig,
    store: Arc<dyn PersistentTier>,
    connectivity: Arc<dyn Connectivity>,
    metrics: Arc<dyn MetricsRecorder>,
    size_estimator: Arc<dyn SizeEstimator>,
}

impl CacheServiceBuilder {
    pub fn connectivity(mut self, connectivity: Arc<dyn Connectivity>) -> Self {
        self.connectivity = connectivity;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn MetricsRecorder>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn size_estimator(mut self, estimator: Arc<dyn SizeEstimator>) -> Self {
        self.size_estimator = estimator;
        self
    }

    pub fn build(self) -> Arc<CacheService> {
        Arc::new(CacheService {
            memory: MemoryTier::new(self.cache.max_memory_tier_bytes, self.metrics.clone()),
            metadata: MetadataStore::new(self.store.clone()),
            priorities: PriorityStore::new(self.store.clone()),
            coordinator: FetchCoordinator::new(),
            key_locks: KeyLocks::new(),
            config: self.cache,
            maintenance_config: self.maintenance,
            store: self.store,
            connectivity: self.connectivity,
            metrics: self.metrics,
            size_estimator: self.size_estimator,
            counters: Counters::default(),
            maintenance: Mutex::new(None),
            refreshes: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        })
    }
}

/// The two-tier cache.
pub struct CacheService {
    config: CacheConfig,
    maintenance_config: MaintenanceConfig,
    store: Arc<dyn PersistentTier>,
    memory: MemoryTier,
    metadata: MetadataStore,
    priorities: PriorityStore,
    coordinator: FetchCoordinator<FetchOutcome>,
    key_locks: KeyLocks,
    connectivity: Arc<dyn Connectivity>,
    metrics: Arc<dyn MetricsRecorder>,
    size_estimator: Arc<dyn SizeEstimator>,
    counters: Counters,
    maintenance: Mutex<Option<MaintenanceHandle>>,
    refreshes: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl CacheService {
    /// Start building a service over `store`. Defaults: always online, no
    /// metrics, sizes by serialized length.
    pub fn builder(config: &Config, store: Arc<dyn PersistentTier>) -> CacheServiceBuilder {
        CacheServiceBuilder {
            cache: config.cache.clone(),
            maintenance: config.maintenance.clone(),
            store,
            connectivity: Arc::new(ConnectivityFlag::default()),
            metrics: Arc::new(NoopMetrics),
            size_estimator: Arc::new(SerializedLength),
        }
    }

    /// Load persisted metadata and priorities, optionally sweep expired
    /// entries, and start background maintenance when enabled.
    ///
    /// Store failures are logged; the service stays usable with empty state.
    pub async fn init(self: &Arc<Self>) {
        match self.metadata.load().await {
            Ok(count) => debug!(count, "Metadata restored"),
            Err(e) => warn!(error = %e, "Failed to load cache metadata, starting empty"),
        }
        match self.priorities.load().await {
            Ok(count) => debug!(count, "Priorities restored"),
            Err(e) => warn!(error = %e, "Failed to load priorities, starting empty"),
        }

        if self.config.auto_clear_stale_on_start {
            match maintenance::sweep_expired(self).await {
                Ok(removed) => info!(removed, "Cleared stale entries on start"),
                Err(e) => warn!(error = %e, "Startup expiry sweep failed"),
            }
        }

        if self.maintenance_config.enabled {
            let handle = BackgroundMaintenance::start(self);
            if let Some(previous) = self.maintenance.lock().replace(handle) {
                previous.abort();
            }
        }

        info!(
            max_memory_bytes = self.config.max_memory_tier_bytes,
            default_ttl_secs = self.config.default_ttl_secs,
            "Cache service initialized"
        );
    }

    /// Stop background maintenance and wait for it and any in-flight
    /// background refreshes to exit. No new refreshes start afterwards.
    pub async fn dispose(&self) {
        self.closed.store(true, Ordering::Release);
        let handle = self.maintenance.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }

        let mut refreshes = std::mem::take(&mut *self.refreshes.lock());
        let pending = refreshes.len();
        while let Some(joined) = refreshes.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Background refresh ended abnormally");
            }
        }
        info!(pending_refreshes = pending, "Cache service disposed");
    }

    /// Read through the tiers according to `policy`, fetching from the
    /// network when allowed and needed.
    ///
    /// Never fails: misses, stale fallbacks and errors are reported in the
    /// returned [`CacheResult`].
    pub async fn fetch<T, F, Fut>(
        self: &Arc<Self>,
        key: &CacheKey,
        network_fetch: F,
        ttl: Option<Duration>,
        policy: CachePolicy,
    ) -> CacheResult<T>
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());

        if policy == CachePolicy::CacheOnly {
            return self.get_cached_data(key, Some(ttl)).await;
        }

        let mut stale = None;
        if policy.reads_cache() {
            match self.read_tiers::<T>(key, ttl).await {
                TierRead::Memory { data, metadata } => {
                    self.record_hit(key, CacheSource::Memory);
                    return CacheResult::memory(data, metadata);
                }
                TierRead::Persistent {
                    data,
                    metadata,
                    is_stale: false,
                } => {
                    self.record_hit(key, CacheSource::Persistent);
                    return CacheResult::persistent(data, metadata, false);
                }
                TierRead::Persistent {
                    data,
                    metadata,
                    is_stale: true,
                } => match policy {
                    CachePolicy::StaleWhileRevalidate => {
                        self.record_hit(key, CacheSource::Persistent);
                        self.spawn_refresh(key.clone(), network_fetch, ttl);
                        return CacheResult::persistent(data, metadata, true);
                    }
                    CachePolicy::CacheFirst => {
                        self.record_hit(key, CacheSource::Persistent);
                        if self.connectivity.is_online() {
                            self.spawn_refresh(key.clone(), network_fetch, ttl);
                        }
                        return CacheResult::persistent(data, metadata, true);
                    }
                    _ => stale = Some((data, metadata)),
                },
                TierRead::Miss | TierRead::Mismatch(_) => {}
            }
        }

        self.record_miss(key);

        match self.fetch_from_network(key, network_fetch, ttl).await {
            Ok((data, metadata)) => CacheResult::network(data, Some(metadata)),
            Err(err) => match stale {
                Some((data, metadata)) => {
                    warn!(key = %key, error = %err, "Serving stale data after network failure");
                    if self.config.enable_analytics {
                        self.counters.stale_served.fetch_add(1, Ordering::Relaxed);
                    }
                    CacheResult::stale_fallback(data, metadata, err)
                }
                None => {
                    warn!(key = %key, error = %err, "Fetch failed with no cached fallback");
                    if self.config.enable_analytics {
                        self.counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                    CacheResult::error(err)
                }
            },
        }
    }

    /// Cache-only read. Persistent data older than `ttl` is still returned,
    /// flagged `is_stale`.
    pub async fn get_cached_data<T: CacheValue>(
        &self,
        key: &CacheKey,
        ttl: Option<Duration>,
    ) -> CacheResult<T> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        match self.read_tiers::<T>(key, ttl).await {
            TierRead::Memory { data, metadata } => {
                self.record_hit(key, CacheSource::Memory);
                CacheResult::memory(data, metadata)
            }
            TierRead::Persistent {
                data,
                metadata,
                is_stale,
            } => {
                self.record_hit(key, CacheSource::Persistent);
                CacheResult::persistent(data, metadata, is_stale)
            }
            TierRead::Miss => {
                self.record_miss(key);
                CacheResult::not_found(key)
            }
            TierRead::Mismatch(err) => {
                self.record_miss(key);
                CacheResult::error(err)
            }
        }
    }

    /// Write `data` through both tiers and return its fresh metadata.
    ///
    /// Only encoding can fail; persistent-store failures are logged and the
    /// value is still cached in memory.
    pub async fn cache_data<T: CacheValue>(
        &self,
        key: &CacheKey,
        data: T,
        ttl: Option<Duration>,
        pinned: bool,
    ) -> Result<CacheMetadata> {
        let ttl = ttl.unwrap_or_else(|| self.config.default_ttl());
        let (_, metadata) = self.store_value(key, data, ttl, pinned).await?;
        Ok(metadata)
    }

    /// Remove an entry from every tier, pinned or not.
    pub async fn remove(&self, key: &CacheKey) {
        let _guard = self.key_locks.lock(key).await;
        self.memory.remove(key);
        if let Err(e) = self.store.delete(&key.key, &key.collection).await {
            warn!(key = %key, error = %e, "Failed to delete persisted payload");
        }
        self.metadata.remove(key).await;
        debug!(key = %key, "Removed entry");
    }

    /// Exempt an entry from eviction and the expiry sweep. Returns whether
    /// the entry exists in either tier.
    pub async fn pin(&self, key: &CacheKey) -> bool {
        self.set_pinned(key, true).await
    }

    /// Make an entry evictable again.
    pub async fn unpin(&self, key: &CacheKey) -> bool {
        self.set_pinned(key, false).await
    }

    async fn set_pinned(&self, key: &CacheKey, pinned: bool) -> bool {
        let in_memory = self.memory.set_pinned(key, pinned);
        let persisted = self.metadata.set_pinned(key, pinned).await.is_some();
        in_memory || persisted
    }

    /// Drop a whole collection from every tier.
    pub async fn clear_collection(&self, collection: &str) {
        let from_memory = self.memory.remove_collection(collection);
        if let Err(e) = self.store.clear_collection(collection).await {
            warn!(collection, error = %e, "Failed to clear persisted collection");
        }
        let records = self.metadata.remove_collection(collection).await;
        self.metrics.record_collection_purge(collection);
        info!(collection, from_memory, records, "Collection purged");
    }

    /// Whether either tier holds the key (fresh or not).
    pub async fn contains(&self, key: &CacheKey) -> bool {
        if self.memory.contains(key) {
            return true;
        }
        match self.store.exists(&key.key, &key.collection).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent existence check failed");
                false
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            memory: self.memory.stats(),
            metadata_records: self.metadata.len(),
            in_flight_fetches: self.coordinator.in_flight(),
            memory_hits: c.memory_hits.load(Ordering::Relaxed),
            persistent_hits: c.persistent_hits.load(Ordering::Relaxed),
            network_fetches: c.network_fetches.load(Ordering::Relaxed),
            stale_served: c.stale_served.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
        }
    }

    pub fn memory(&self) -> &MemoryTier {
        &self.memory
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.metadata
    }

    pub fn priorities(&self) -> &PriorityStore {
        &self.priorities
    }

    pub fn store(&self) -> &Arc<dyn PersistentTier> {
        &self.store
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsRecorder> {
        &self.metrics
    }

    pub fn connectivity(&self) -> &Arc<dyn Connectivity> {
        &self.connectivity
    }

    pub(crate) fn key_locks(&self) -> &KeyLocks {
        &self.key_locks
    }

    /// Background refreshes spawned and not yet reaped.
    pub fn pending_refreshes(&self) -> usize {
        self.refreshes.lock().len()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn maintenance_config(&self) -> &MaintenanceConfig {
        &self.maintenance_config
    }

    /// Memory tier, then persistent tier. Fresh persistent hits are promoted
    /// into memory for the freshness they have left.
    async fn read_tiers<T: CacheValue>(&self, key: &CacheKey, ttl: Duration) -> TierRead<T> {
        match self.memory.get::<T>(key) {
            Ok(Some(data)) => {
                let metadata = self.metadata.record_access(key).await;
                return TierRead::Memory { data, metadata };
            }
            Ok(None) => {}
            Err(e) => debug!(key = %key, error = %e, "Memory entry unusable, trying persistent tier"),
        }

        let raw = match self.store.get(&key.key, &key.collection).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return TierRead::Miss,
            Err(e) => {
                warn!(key = %key, error = %e, "Persistent read failed, treating as miss");
                return TierRead::Miss;
            }
        };

        let data = match serde_json::from_slice::<T>(&raw) {
            Ok(data) => data,
            Err(e) => {
                warn!(key = %key, error = %e, "Persisted payload does not match requested type");
                return TierRead::Mismatch(CacheError::TypeMismatch {
                    key: key.clone(),
                    reason: e.to_string(),
                });
            }
        };

        let now = now_millis();
        let metadata = self.metadata.lookup(key).await;
        let is_stale = metadata.as_ref().map_or(true, |m| m.is_stale_for(ttl, now));

        if let Some(meta) = &metadata {
            if let Some(remaining) = meta.remaining(ttl, now) {
                self.memory.put(
                    key.clone(),
                    data.clone(),
                    remaining,
                    meta.data_size_bytes,
                    meta.is_pinned,
                );
            }
        }

        let metadata = match metadata {
            Some(_) => self.metadata.record_access(key).await,
            None => None,
        };

        TierRead::Persistent {
            data,
            metadata,
            is_stale,
        }
    }

    /// Fetch through the coordinator so concurrent requesters share one
    /// network call and one write-through.
    async fn fetch_from_network<T, F, Fut>(
        self: &Arc<Self>,
        key: &CacheKey,
        network_fetch: F,
        ttl: Duration,
    ) -> Result<(T, CacheMetadata)>
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if !self.connectivity.is_online() {
            return Err(CacheError::Offline);
        }

        let service = Arc::clone(self);
        let owned_key = key.clone();
        let (encoded, metadata) = self
            .coordinator
            .run_deduped(key, move || async move {
                service.fetch_and_store(owned_key, network_fetch, ttl).await
            })
            .await?;

        let data = serde_json::from_slice::<T>(&encoded).map_err(|e| CacheError::TypeMismatch {
            key: key.clone(),
            reason: e.to_string(),
        })?;
        Ok((data, metadata))
    }

    /// The shared body of a coalesced fetch: call the network with a
    /// timeout, then write through. Runs once per in-flight key.
    async fn fetch_and_store<T, F, Fut>(
        self: Arc<Self>,
        key: CacheKey,
        network_fetch: F,
        ttl: Duration,
    ) -> FetchOutcome
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let timeout = self.config.fetch_timeout();
        debug!(key = %key, "Fetching from network");

        let data = match tokio::time::timeout(timeout, network_fetch()).await {
            Ok(Ok(data)) => data,
            Ok(Err(e)) => return Err(CacheError::Network(format!("{e:#}"))),
            Err(_) => return Err(CacheError::Timeout(timeout)),
        };
        if self.config.enable_analytics {
            self.counters.network_fetches.fetch_add(1, Ordering::Relaxed);
        }

        // A refresh keeps an existing pin.
        let pinned = self.metadata.get(&key).is_some_and(|m| m.is_pinned);
        self.store_value(&key, data, ttl, pinned).await
    }

    fn spawn_refresh<T, F, Fut>(self: &Arc<Self>, key: CacheKey, network_fetch: F, ttl: Duration)
    where
        T: CacheValue,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            debug!(key = %key, "Service disposed, skipping background refresh");
            return;
        }

        let service = Arc::clone(self);
        let mut refreshes = self.refreshes.lock();
        while refreshes.try_join_next().is_some() {}
        refreshes.spawn(async move {
            match service.fetch_from_network(&key, network_fetch, ttl).await {
                Ok(_) => debug!(key = %key, "Background refresh complete"),
                Err(e) => warn!(key = %key, error = %e, "Background refresh failed"),
            }
        });
    }

    /// Encode, size, and write a value to the persistent tier, the metadata
    /// store and the memory tier, in that order, under the key's lock.
    async fn store_value<T: CacheValue>(
        &self,
        key: &CacheKey,
        data: T,
        ttl: Duration,
        pinned: bool,
    ) -> FetchOutcome {
        let encoded = Bytes::from(serde_json::to_vec(&data)?);
        let size = self.size_estimator.estimate(key, &encoded);
        let metadata = CacheMetadata::new(key.clone(), ttl, size, pinned);

        let _guard = self.key_locks.lock(key).await;
        if let Err(e) = self
            .store
            .put(&key.key, encoded.clone(), &key.collection, Some(ttl))
            .await
        {
            warn!(key = %key, error = %e, "Failed to persist payload, caching in memory only");
        }
        self.metadata.put(metadata.clone()).await;

        let outcome = self.memory.put(key.clone(), data, ttl, size, pinned);
        debug!(key = %key, size, ?outcome, "Cached value");
        self.metrics.record_write(key);

        maintenance::trim_after_write(&self.memory, &self.maintenance_config, key);

        Ok((encoded, metadata))
    }

    fn record_hit(&self, key: &CacheKey, source: CacheSource) {
        self.metrics.record_hit(key);
        if !self.config.enable_analytics {
            return;
        }
        let counter = match source {
            CacheSource::Memory => &self.counters.memory_hits,
            _ => &self.counters.persistent_hits,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self, key: &CacheKey) {
        self.metrics.record_miss(key);
        if self.config.enable_analytics {
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::storage::MemoryStore;

    fn service() -> Arc<CacheService> {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        CacheService::builder(&config, Arc::new(MemoryStore::new())).build()
    }

    #[tokio::test]
    async fn test_cache_only_miss_is_not_found() {
        let service = service();
        let key = CacheKey::new("books", "missing");
        let result: CacheResult<String> = service
            .fetch(&key, || async { Ok("unused".to_string()) }, None, CachePolicy::CacheOnly)
            .await;
        assert_eq!(result.source, CacheSource::NotFound);
        assert!(!result.is_hit);
        assert_eq!(result.error, Some(CacheError::NotFound(key)));
    }

    #[tokio::test]
    async fn test_network_only_always_fetches() {
        let service = service();
        let key = CacheKey::new("books", "1");
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = calls.clone();
            let result = service
                .fetch(
                    &key,
                    move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok(1u32)
                    },
                    None,
                    CachePolicy::NetworkOnly,
                )
                .await;
            assert_eq!(result.source, CacheSource::Network);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_network_error_without_fallback() {
        let service = service();
        let key = CacheKey::new("books", "1");
        let result: CacheResult<u32> = service
            .fetch(
                &key,
                || async { Err(anyhow::anyhow!("503 Service Unavailable")) },
                None,
                CachePolicy::NetworkFirst,
            )
            .await;
        assert_eq!(result.source, CacheSource::Error);
        assert!(matches!(result.error, Some(CacheError::Network(ref m)) if m.contains("503")));
        assert_eq!(service.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_fetch_timeout() {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        config.cache.fetch_timeout_ms = 20;
        let service = CacheService::builder(&config, Arc::new(MemoryStore::new())).build();

        let result: CacheResult<u32> = service
            .fetch(
                &CacheKey::new("books", "slow"),
                || async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(1)
                },
                None,
                CachePolicy::NetworkFirst,
            )
            .await;
        assert_eq!(result.error, Some(CacheError::Timeout(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn test_type_mismatch_reported_for_cache_only() {
        let service = service();
        let key = CacheKey::new("books", "1");
        service.cache_data(&key, 5u32, None, false).await.unwrap();
        service.memory().remove(&key);

        let result: CacheResult<Vec<String>> = service.get_cached_data(&key, None).await;
        assert_eq!(result.source, CacheSource::Error);
        assert!(matches!(result.error, Some(CacheError::TypeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_pin_and_remove() {
        let service = service();
        let key = CacheKey::new("books", "1");
        service.cache_data(&key, 5u32, None, false).await.unwrap();

        assert!(service.pin(&key).await);
        assert!(service.memory().is_pinned(&key));
        assert!(service.metadata().get(&key).unwrap().is_pinned);

        service.remove(&key).await;
        assert!(!service.contains(&key).await);
        assert!(service.metadata().get(&key).is_none());
        assert!(!service.pin(&key).await);
    }

    #[tokio::test]
    async fn test_dispose_waits_for_background_refresh() {
        let service = service();
        let key = CacheKey::new("books", "1");
        let ttl = Some(Duration::from_millis(5));
        service.cache_data(&key, 1u32, ttl, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let result = service
            .fetch(
                &key,
                || async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(2u32)
                },
                ttl,
                CachePolicy::StaleWhileRevalidate,
            )
            .await;
        assert_eq!(result.data, Some(1));
        assert_eq!(service.pending_refreshes(), 1);

        service.dispose().await;
        assert_eq!(service.pending_refreshes(), 0);
        assert_eq!(service.stats().in_flight_fetches, 0);
        let raw = service.store().get("1", "books").await.unwrap().unwrap();
        assert_eq!(serde_json::from_slice::<u32>(&raw).unwrap(), 2);

        // Disposed services serve stale data without refreshing.
        tokio::time::sleep(Duration::from_millis(20)).await;
        service
            .fetch(&key, || async { Ok(3u32) }, ttl, CachePolicy::StaleWhileRevalidate)
            .await;
        assert_eq!(service.pending_refreshes(), 0);
    }

    #[tokio::test]
    async fn test_clear_collection() {
        let service = service();
        service
            .cache_data(&CacheKey::new("books", "1"), 1u32, None, false)
            .await
            .unwrap();
        service
            .cache_data(&CacheKey::new("authors", "1"), 1u32, None, false)
            .await
            .unwrap();

        service.clear_collection("books").await;
        assert!(!service.contains(&CacheKey::new("books", "1")).await);
        assert!(service.contains(&CacheKey::new("authors", "1")).await);
        assert_eq!(service.stats().metadata_records, 1);
    }
}
