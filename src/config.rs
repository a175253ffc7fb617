//! Runtime configuration for fetch-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All cache knobs (budgets, TTLs, watermarks, retry policy) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "fetch-cache-tier", about = "Two-tier fetch cache service")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address for the admin API (overrides `server.listen`).
    #[arg(long)]
    pub listen: Option<String>,

    /// Override the persistent store directory.
    #[arg(long)]
    pub data_dir: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Admin server configuration.
    pub server: ServerConfig,

    /// Core cache behaviour.
    pub cache: CacheConfig,

    /// Background trimming and expiry sweep.
    pub maintenance: MaintenanceConfig,

    /// Bulk download queue.
    pub downloads: DownloadConfig,

    /// Persistent store location and encoding.
    pub storage: StorageConfig,
}

/// HTTP admin server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "127.0.0.1:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
        }
    }
}

/// Core cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL applied when a caller does not supply one.
    pub default_ttl_secs: u64,

    /// Run an expiry sweep over the persistent tier during `init`.
    pub auto_clear_stale_on_start: bool,

    /// Keep in-process hit/miss/fetch counters (see `CacheStats`).
    pub enable_analytics: bool,

    /// Export Prometheus counters.
    pub track_cache_metrics: bool,

    /// Memory tier budget in bytes.
    pub max_memory_tier_bytes: usize,

    /// Upper bound on a single network fetch.
    pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60 * 60,
            auto_clear_stale_on_start: false,
            enable_analytics: true,
            track_cache_metrics: false,
            max_memory_tier_bytes: 50 * 1024 * 1024, // 50 MB
            fetch_timeout_ms: 30_000,
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

/// Background maintenance settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Start the background sweep task during `init`.
    pub enabled: bool,

    /// Trim the memory tier when usage exceeds this fraction of its budget.
    pub trim_high_watermark: f64,

    /// Trim down to this fraction of the budget.
    pub trim_low_watermark: f64,

    /// Interval between persistent-tier expiry sweeps.
    pub sweep_interval_secs: u64,

    /// The first sweep waits a random delay in `[0, this)`.
    pub sweep_initial_delay_max_secs: u64,

    /// Delay before retrying after a failed sweep.
    pub sweep_retry_delay_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            trim_high_watermark: 0.80,
            trim_low_watermark: 0.70,
            sweep_interval_secs: 6 * 60 * 60,
            sweep_initial_delay_max_secs: 60,
            sweep_retry_delay_secs: 5 * 60,
        }
    }
}

impl MaintenanceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn sweep_initial_delay_max(&self) -> Duration {
        Duration::from_secs(self.sweep_initial_delay_max_secs)
    }

    pub fn sweep_retry_delay(&self) -> Duration {
        Duration::from_secs(self.sweep_retry_delay_secs)
    }
}

/// Bulk download queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Maximum number of resources downloading at once.
    pub workers: usize,

    /// Retries per child item after the first attempt.
    pub max_retries: u32,

    /// Base backoff between retries; attempt `n` waits `n * backoff`.
    pub retry_backoff_ms: u64,

    /// Capacity of the progress broadcast channel.
    pub progress_buffer: usize,

    /// TTL for downloaded items.
    pub item_ttl_secs: u64,

    /// Collection for resource root metadata.
    pub meta_collection: String,

    /// Collection for child indexes.
    pub index_collection: String,

    /// Collection for child content.
    pub content_collection: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            max_retries: 2,
            retry_backoff_ms: 500,
            progress_buffer: 256,
            item_ttl_secs: 30 * 24 * 60 * 60,
            meta_collection: "resources".to_string(),
            index_collection: "resource_index".to_string(),
            content_collection: "resource_content".to_string(),
        }
    }
}

impl DownloadConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn item_ttl(&self) -> Duration {
        Duration::from_secs(self.item_ttl_secs)
    }
}

/// Persistent store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the file store.
    pub path: PathBuf,

    /// Apply zstd compression to stored payloads.
    pub zstd_compression: bool,

    /// zstd compression level (1-22).
    pub zstd_level: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/cache"),
            zstd_compression: true,
            zstd_level: 3,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the cache misbehave.
    pub fn validate(&self) -> anyhow::Result<()> {
        let m = &self.maintenance;
        if !(0.0..=1.0).contains(&m.trim_low_watermark)
            || !(0.0..=1.0).contains(&m.trim_high_watermark)
            || m.trim_low_watermark > m.trim_high_watermark
        {
            anyhow::bail!(
                "invalid trim watermarks: low={} high={}",
                m.trim_low_watermark,
                m.trim_high_watermark
            );
        }
        if self.downloads.workers == 0 {
            anyhow::bail!("downloads.workers must be at least 1");
        }
        if self.downloads.progress_buffer == 0 {
            anyhow::bail!("downloads.progress_buffer must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::default();
        assert_eq!(cfg.cache.default_ttl(), Duration::from_secs(3600));
        assert_eq!(cfg.downloads.workers, 3);
        assert_eq!(cfg.downloads.max_retries, 2);
        assert_eq!(cfg.maintenance.trim_high_watermark, 0.80);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: Config =
            serde_json::from_str(r#"{ "cache": { "max_memory_tier_bytes": 1024 } }"#).unwrap();
        assert_eq!(cfg.cache.max_memory_tier_bytes, 1024);
        assert_eq!(cfg.cache.default_ttl_secs, 3600);
        assert_eq!(cfg.downloads.meta_collection, "resources");
    }

    #[test]
    fn test_inverted_watermarks_rejected() {
        let mut cfg = Config::default();
        cfg.maintenance.trim_low_watermark = 0.9;
        cfg.maintenance.trim_high_watermark = 0.5;
        assert!(cfg.validate().is_err());
    }
}
