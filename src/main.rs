//! fetch-cache-tier admin server.
//!
//! Opens the file-backed persistent tier, restores cache metadata and
//! priorities, starts background maintenance and exposes the admin API.

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info};

use fetch_cache_tier::cache::CacheService;
use fetch_cache_tier::config::{Cli, Config};
use fetch_cache_tier::download::DownloadQueue;
use fetch_cache_tier::metrics::{MetricsRecorder, NoopMetrics, PrometheusMetrics};
use fetch_cache_tier::server::api::{build_router, AppState};
use fetch_cache_tier::storage::{FileStore, PersistentTier};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "fetch_cache_tier=debug,tower_http=debug"
    } else {
        "fetch_cache_tier=info,tower_http=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .init();

    info!("fetch-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let mut config = Config::load(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        config.storage.path = dir;
    }
    if let Some(listen) = cli.listen {
        config.server.listen = listen;
    }

    info!(
        store = %config.storage.path.display(),
        max_memory_bytes = config.cache.max_memory_tier_bytes,
        default_ttl_secs = config.cache.default_ttl_secs,
        workers = config.downloads.workers,
        "Configuration loaded"
    );

    // Open the persistent tier.
    let store: Arc<dyn PersistentTier> = Arc::new(FileStore::open(&config.storage).await?);

    // Metrics are opt-in.
    let prometheus = if config.cache.track_cache_metrics {
        Some(Arc::new(PrometheusMetrics::new()?))
    } else {
        None
    };
    let recorder: Arc<dyn MetricsRecorder> = match &prometheus {
        Some(metrics) => metrics.clone(),
        None => Arc::new(NoopMetrics),
    };

    // Build and initialize the cache.
    let service = CacheService::builder(&config, store)
        .metrics(recorder)
        .build();
    service.init().await;

    let downloads = Arc::new(DownloadQueue::new(service.clone(), config.downloads.clone()));

    // Build application state.
    let state = Arc::new(AppState {
        service: service.clone(),
        downloads: downloads.clone(),
        metrics: prometheus,
        start_time: Instant::now(),
    });

    // Build the HTTP router.
    let app = build_router(state);

    // Start the server.
    let listen_addr = config.server.listen.clone();
    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    // Tear down background work even if the server failed.
    downloads.shutdown().await;
    service.dispose().await;

    if let Err(e) = served {
        error!(error = %e, "Server error");
        return Err(e.into());
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
