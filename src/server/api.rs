//! Admin HTTP API.
//!
//! - GET /health
//! - GET /v1/cache/stats
//! - GET /metrics
//! - DELETE /v1/cache/{collection}
//! - GET /v1/downloads/events

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{delete, get};
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::cache::memory::MemoryStats;
use crate::cache::service::{CacheService, CacheStats};
use crate::download::DownloadQueue;
use crate::metrics::PrometheusMetrics;
use crate::server::streaming::progress_to_sse_stream;

/// Application state shared across handlers.
pub struct AppState {
    pub service: Arc<CacheService>,
    pub downloads: Arc<DownloadQueue>,
    /// Present when `track_cache_metrics` is enabled.
    pub metrics: Option<Arc<PrometheusMetrics>>,
    pub start_time: Instant,
}

/// Build the axum router with all admin routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/cache/stats", get(cache_stats))
        .route("/v1/cache/{collection}", delete(clear_collection))
        .route("/v1/downloads/events", get(download_events))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub online: bool,
    pub memory: TierStatsResponse,
    pub active_downloads: usize,
}

#[derive(Debug, Serialize)]
pub struct TierStatsResponse {
    pub entries: usize,
    pub pinned_entries: usize,
    pub bytes_used: usize,
    pub capacity: usize,
    pub utilization: f64,
}

impl From<MemoryStats> for TierStatsResponse {
    fn from(stats: MemoryStats) -> Self {
        Self {
            entries: stats.entries,
            pinned_entries: stats.pinned_entries,
            bytes_used: stats.bytes_used,
            capacity: stats.capacity,
            utilization: stats.usage_fraction(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        online: state.service.connectivity().is_online(),
        memory: state.service.memory().stats().into(),
        active_downloads: state.downloads.active_downloads().len(),
    })
}

async fn cache_stats(State(state): State<Arc<AppState>>) -> Json<CacheStats> {
    Json(state.service.stats())
}

async fn clear_collection(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
) -> impl IntoResponse {
    // Reserved collections hold cache bookkeeping.
    if collection.starts_with("__") {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("collection '{collection}' is reserved"),
            }),
        )
            .into_response();
    }

    info!(collection = %collection, "Clearing collection via API");
    state.service.clear_collection(&collection).await;
    StatusCode::NO_CONTENT.into_response()
}

async fn download_events(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let stream = progress_to_sse_stream(state.downloads.subscribe());
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let Some(metrics) = &state.metrics else {
        return (StatusCode::NOT_FOUND, "metrics disabled\n".to_string()).into_response();
    };
    match metrics.render() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to render metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::cache::key::CacheKey;
    use crate::config::Config;
    use crate::metrics::MetricsRecorder;
    use crate::storage::MemoryStore;

    fn state(with_metrics: bool) -> Arc<AppState> {
        let mut config = Config::default();
        config.maintenance.enabled = false;
        let prometheus = with_metrics.then(|| Arc::new(PrometheusMetrics::new().unwrap()));
        let mut builder = CacheService::builder(&config, Arc::new(MemoryStore::new()));
        if let Some(metrics) = &prometheus {
            builder = builder.metrics(metrics.clone() as Arc<dyn MetricsRecorder>);
        }
        let service = builder.build();
        Arc::new(AppState {
            downloads: Arc::new(DownloadQueue::new(service.clone(), config.downloads)),
            service,
            metrics: prometheus,
            start_time: Instant::now(),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = build_router(state(false));
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["online"], true);
    }

    #[tokio::test]
    async fn test_stats_reflect_writes() {
        let state = state(false);
        state
            .service
            .cache_data(&CacheKey::new("books", "1"), "x".to_string(), None, false)
            .await
            .unwrap();

        let response = build_router(state)
            .oneshot(Request::get("/v1/cache/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let json = body_json(response).await;
        assert_eq!(json["memory"]["entries"], 1);
        assert_eq!(json["metadata_records"], 1);
    }

    #[tokio::test]
    async fn test_clear_collection() {
        let state = state(false);
        let key = CacheKey::new("books", "1");
        state.service.cache_data(&key, 1u32, None, false).await.unwrap();

        let response = build_router(state.clone())
            .oneshot(
                Request::delete("/v1/cache/books")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(!state.service.contains(&key).await);
    }

    #[tokio::test]
    async fn test_reserved_collection_rejected() {
        let response = build_router(state(false))
            .oneshot(
                Request::delete("/v1/cache/__cache_metadata")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let response = build_router(state(false))
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let state = state(true);
        let key = CacheKey::new("books", "1");
        state.service.cache_data(&key, 1u32, None, false).await.unwrap();
        let response = build_router(state)
            .oneshot(Request::get("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(text.contains("fetch_cache_writes_total"));
    }
}
