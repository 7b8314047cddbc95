//! Liveness and scheduler statistics.

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::scheduler::MetricsSnapshot;
use crate::server::app::AppState;
use crate::server::error::ApiError;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

/// `GET /health`: unauthenticated liveness.
pub async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /stats`: scheduler metrics snapshot.
pub async fn stats_handler(
    State(state): State<AppState>,
) -> Result<Json<MetricsSnapshot>, ApiError> {
    Ok(Json(state.metrics.snapshot()))
}
