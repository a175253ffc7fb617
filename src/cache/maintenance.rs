//! Background maintenance.
//!
//! Two jobs keep the tiers bounded:
//! - memory trim: once usage crosses the high watermark, evict unpinned
//!   entries down to the low watermark. Also run after every write, sparing
//!   the entry just written.
//! - expiry sweep: delete persisted payloads and metadata whose TTL has
//!   passed. Runs after a random initial delay and then on a fixed interval,
//!   only while online. A failing pass is retried after a shorter delay.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::entry::now_millis;
use crate::cache::key::CacheKey;
use crate::cache::memory::MemoryTier;
use crate::cache::service::CacheService;
use crate::config::MaintenanceConfig;
use crate::error::Result;
use crate::metrics::EvictionReason;

/// Trim the memory tier to the low watermark if it is above the high one.
/// Returns the bytes freed.
pub fn trim_memory(memory: &MemoryTier, config: &MaintenanceConfig) -> usize {
    trim(memory, config, None)
}

/// Trim run right after `written` was stored. The new entry itself is never
/// the victim, so an item that fits the budget stays resident.
pub fn trim_after_write(memory: &MemoryTier, config: &MaintenanceConfig, written: &CacheKey) -> usize {
    trim(memory, config, Some(written))
}

fn trim(memory: &MemoryTier, config: &MaintenanceConfig, keep: Option<&CacheKey>) -> usize {
    let stats = memory.stats();
    if stats.usage_fraction() <= config.trim_high_watermark {
        return 0;
    }

    let target = (stats.capacity as f64 * config.trim_low_watermark) as usize;
    let freed = match keep {
        Some(key) => memory.trim_to_keeping(target, key),
        None => memory.trim_to(target),
    };
    debug!(
        freed,
        before = stats.bytes_used,
        after = memory.current_size(),
        "Trimmed memory tier"
    );
    freed
}

/// Delete every expired, unpinned entry from the persistent tier along with
/// its metadata. Returns how many entries were removed.
///
/// Records come from a fresh scan of the persistent tier so entries written
/// by earlier processes are covered too.
pub async fn sweep_expired(service: &CacheService) -> Result<usize> {
    let records = service.metadata().scan_persisted().await?;
    let scanned = records.len();
    let now = now_millis();
    let mut removed = 0;

    for record in records {
        if record.is_pinned || !record.is_expired(now) {
            continue;
        }

        let key = &record.key;
        // Writes to the key wait until both deletes are done.
        let _guard = service.key_locks().lock(key).await;
        // Skip records pinned or rewritten since the scan.
        if let Some(current) = service.metadata().get(key) {
            if current.is_pinned
                || !current.is_expired(now_millis())
                || current.created_at_ms != record.created_at_ms
            {
                continue;
            }
        }

        service.store().delete(&key.key, &key.collection).await?;
        service.metadata().remove(key).await;
        service.metrics().record_eviction(key, EvictionReason::Sweep);
        removed += 1;
    }

    info!(scanned, removed, "Expiry sweep complete");
    Ok(removed)
}

/// Handle to a running maintenance task.
pub struct MaintenanceHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }
    }

    pub fn abort(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

pub struct BackgroundMaintenance;

impl BackgroundMaintenance {
    /// Spawn the maintenance loop. The task holds only a weak reference to
    /// the service and exits once the service is dropped.
    pub fn start(service: &Arc<CacheService>) -> MaintenanceHandle {
        let config = service.maintenance_config().clone();
        let weak = Arc::downgrade(service);
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let mut delay = initial_delay(&config);

        info!(
            initial_delay_ms = delay.as_millis() as u64,
            interval_secs = config.sweep_interval_secs,
            "Starting background maintenance"
        );

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_rx.changed() => break,
                }

                let Some(service) = weak.upgrade() else {
                    break;
                };

                delay = match AssertUnwindSafe(run_pass(&service)).catch_unwind().await {
                    Ok(Ok(_)) => config.sweep_interval(),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Maintenance pass failed, retrying later");
                        config.sweep_retry_delay()
                    }
                    Err(_) => {
                        error!("Maintenance pass panicked, retrying later");
                        config.sweep_retry_delay()
                    }
                };
            }
            debug!("Background maintenance stopped");
        });

        MaintenanceHandle { shutdown, task }
    }
}

fn initial_delay(config: &MaintenanceConfig) -> Duration {
    let max_ms = config.sweep_initial_delay_max().as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..max_ms))
}

async fn run_pass(service: &CacheService) -> Result<usize> {
    trim_memory(service.memory(), service.maintenance_config());

    if !service.connectivity().is_online() {
        debug!("Offline, skipping expiry sweep");
        return Ok(0);
    }
    sweep_expired(service).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;

    use crate::config::Config;
    use crate::connectivity::ConnectivityFlag;
    use crate::metrics::NoopMetrics;
    use crate::storage::{MemoryStore, PersistentTier, StoreError};

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn test_trim_only_above_high_watermark() {
        let memory = MemoryTier::new(100, Arc::new(NoopMetrics));
        let config = MaintenanceConfig::default();
        for i in 0..8 {
            memory.put(CacheKey::new("c", i.to_string()), 0u8, HOUR, 10, false);
        }
        assert_eq!(trim_memory(&memory, &config), 0);

        memory.put(CacheKey::new("c", "8"), 0u8, HOUR, 10, false);
        assert_eq!(trim_memory(&memory, &config), 20);
        assert_eq!(memory.current_size(), 70);
    }

    #[tokio::test]
    async fn test_sweep_skips_pinned_and_fresh() {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        let service = CacheService::builder(&config, Arc::new(MemoryStore::new())).build();

        let short = Some(Duration::from_millis(10));
        service
            .cache_data(&CacheKey::new("c", "expired"), 1u32, short, false)
            .await
            .unwrap();
        service
            .cache_data(&CacheKey::new("c", "pinned"), 1u32, short, true)
            .await
            .unwrap();
        service
            .cache_data(&CacheKey::new("c", "fresh"), 1u32, None, false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(sweep_expired(&service).await.unwrap(), 1);
        let store = service.store();
        assert!(!store.exists("expired", "c").await.unwrap());
        assert!(store.exists("pinned", "c").await.unwrap());
        assert!(store.exists("fresh", "c").await.unwrap());
        assert!(service.metadata().get(&CacheKey::new("c", "expired")).is_none());
    }

    /// Memory store whose deletes take a while.
    struct SlowDeletes(MemoryStore);

    #[async_trait]
    impl PersistentTier for SlowDeletes {
        async fn put(
            &self,
            key: &str,
            data: Bytes,
            collection: &str,
            ttl: Option<Duration>,
        ) -> std::result::Result<(), StoreError> {
            self.0.put(key, data, collection, ttl).await
        }

        async fn get(&self, key: &str, collection: &str) -> std::result::Result<Option<Bytes>, StoreError> {
            self.0.get(key, collection).await
        }

        async fn delete(&self, key: &str, collection: &str) -> std::result::Result<(), StoreError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.0.delete(key, collection).await
        }

        async fn exists(&self, key: &str, collection: &str) -> std::result::Result<bool, StoreError> {
            self.0.exists(key, collection).await
        }

        async fn get_all_keys(&self, collection: &str) -> std::result::Result<Vec<String>, StoreError> {
            self.0.get_all_keys(collection).await
        }

        async fn clear_collection(&self, collection: &str) -> std::result::Result<(), StoreError> {
            self.0.clear_collection(collection).await
        }

        async fn size_of(&self, collection: &str) -> std::result::Result<u64, StoreError> {
            self.0.size_of(collection).await
        }
    }

    #[tokio::test]
    async fn test_write_during_sweep_delete_survives() {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        let service =
            CacheService::builder(&config, Arc::new(SlowDeletes(MemoryStore::new()))).build();
        let key = CacheKey::new("c", "raced");

        service
            .cache_data(&key, 1u32, Some(Duration::from_millis(1)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let sweeper = service.clone();
        let sweep = tokio::spawn(async move { sweep_expired(&sweeper).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.cache_data(&key, 2u32, Some(HOUR), false).await.unwrap();

        assert_eq!(sweep.await.unwrap().unwrap(), 1);
        assert!(service.store().exists("raced", "c").await.unwrap());
        let meta = service.metadata().get(&key).unwrap();
        assert!(!meta.is_expired(now_millis()));

        service.memory().remove(&key);
        let reread = service.get_cached_data::<u32>(&key, None).await;
        assert_eq!(reread.data, Some(2));
    }

    #[tokio::test]
    async fn test_offline_pass_skips_sweep() {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        let service = CacheService::builder(&config, Arc::new(MemoryStore::new()))
            .connectivity(Arc::new(ConnectivityFlag::new(false)))
            .build();

        service
            .cache_data(&CacheKey::new("c", "a"), 1u32, Some(Duration::from_millis(1)), false)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(run_pass(&service).await.unwrap(), 0);
        assert!(service.store().exists("a", "c").await.unwrap());
    }

    #[tokio::test]
    async fn test_handle_stops_task() {
        let mut config = Config::default();
        config.maintenance.sweep_initial_delay_max_secs = 0;
        config.maintenance.sweep_interval_secs = 3600;
        let service = CacheService::builder(&config, Arc::new(MemoryStore::new())).build();

        let handle = BackgroundMaintenance::start(&service);
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop().await;
    }
}
