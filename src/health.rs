//! Read-only HTTP surface: liveness and a status snapshot.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tracing::warn;

use crate::monitor::ResourceSummary;
use crate::pipeline::PipelineSnapshot;
use crate::rate_limit::RateLimiterStats;
use crate::supervisor::RelayHandle;

/// Aggregated view of the running relay.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub uptime_secs: u64,
    pub running: bool,
    pub paused: bool,
    pub queue_len: usize,
    pub queue_capacity: usize,
    pub in_flight: usize,
    pub active_workers: usize,
    pub active_rules: usize,
    pub pipeline: PipelineSnapshot,
    pub rate_limiter: RateLimiterStats,
    pub resources: ResourceSummary,
}

/// Build the router. Mounted only when a health port is configured.
pub fn health_routes(handle: RelayHandle) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .with_state(handle)
}

async fn health(State(handle): State<RelayHandle>) -> impl IntoResponse {
    match handle.ping_store().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ok",
                "running": handle.is_running(),
            })),
        ),
        Err(e) => {
            warn!(error = %e, "Health check failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "unavailable",
                    "error": e.to_string(),
                })),
            )
        }
    }
}

async fn status(State(handle): State<RelayHandle>) -> Json<StatusSnapshot> {
    Json(handle.status().await)
}
