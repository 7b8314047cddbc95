//! Worker registration, heartbeats and read endpoints.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use ffrtmp_core::protocol::{HeartbeatRequest, RegisterRequest, RegisterResponse};
use ffrtmp_core::{Worker, WorkerRegistration};
use tracing::info;
use uuid::Uuid;

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// `POST /nodes/register`. A duplicate address from a live worker is a
/// `409 Conflict`; a worker previously marked offline re-activates under
/// its original ID.
pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<RegisterResponse>), ApiError> {
    if req.address.trim().is_empty() {
        return Err(ApiError::BadRequest("address must not be empty".into()));
    }

    let worker = state
        .store
        .register_worker(WorkerRegistration {
            name: req.name,
            address: req.address,
            capabilities: req.capabilities,
        })
        .await?;

    info!(
        worker = %worker.name,
        address = %worker.address,
        gpu = worker.capabilities.has_gpu,
        threads = worker.capabilities.cpu_threads,
        "worker registered"
    );
    Ok((StatusCode::CREATED, Json(RegisterResponse { worker_id: worker.id })))
}

/// `POST /nodes/{id}/heartbeat`.
pub async fn node_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<HeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    state
        .store
        .worker_heartbeat(id, req.snapshot, req.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /nodes`.
pub async fn list_nodes(
    State(state): State<AppState>,
) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.store.get_all_workers().await?))
}

/// `GET /nodes/{id}`.
pub async fn get_node(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.store.get_worker(id).await?))
}
