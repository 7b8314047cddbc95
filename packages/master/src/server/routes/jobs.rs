//! Job submission, polling, claiming and operator controls.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use ffrtmp_core::protocol::{
    ClaimRequest, CreateJobRequest, CreateJobResponse, JobHeartbeatRequest, NextJobResponse,
};
use ffrtmp_core::{CapabilityRequirements, Job, JobSpec, JobStatus, WorkerStatus};
use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// `POST /jobs`.
pub async fn create_job(
    State(state): State<AppState>,
    Json(req): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<CreateJobResponse>), ApiError> {
    if req.scenario.trim().is_empty() {
        return Err(ApiError::BadRequest("scenario must not be empty".into()));
    }

    let mut spec = JobSpec::builder()
        .scenario(req.scenario)
        .queue(req.queue)
        .priority(req.priority)
        .engine(req.engine)
        .params(req.params)
        .build();
    spec.tenant = req.tenant;
    if let Some(max) = req.max_retries {
        spec.max_retries = max;
    }

    let job = state.store.create_job(spec).await?;
    debug!(job_id = %job.id, seq = job.seq, "job created");
    Ok((
        StatusCode::CREATED,
        Json(CreateJobResponse { id: job.id, seq: job.seq }),
    ))
}

/// `GET /jobs`.
pub async fn list_jobs(State(state): State<AppState>) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.store.list_jobs().await?))
}

/// `GET /jobs/{id}`.
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.store.get_job(id).await?))
}

/// `GET /jobs/{id}/logs`: captured output of the latest result.
pub async fn job_logs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<String, ApiError> {
    let job = state.store.get_job(id).await?;
    match job.result {
        Some(result) => Ok(result.logs),
        None => Err(ApiError::NotFound(format!("job {id} has no captured logs yet"))),
    }
}

#[derive(Debug, Deserialize)]
pub struct NextJobQuery {
    pub node_id: Uuid,
}

/// `GET /jobs/next?node_id=...`: pull-based dispatch.
///
/// Returns the job the assignment loop already bound to this node when
/// there is one; otherwise attempts a single on-demand assignment in
/// priority order, inducing `Queued -> Assigned` against this node. A
/// `null` job means nothing is eligible right now.
pub async fn next_job(
    State(state): State<AppState>,
    Query(query): Query<NextJobQuery>,
) -> Result<Json<NextJobResponse>, ApiError> {
    let node_id = query.node_id;
    let worker = state.store.get_worker(node_id).await?;

    let assigned = state.store.get_jobs_by_status(JobStatus::Assigned).await?;
    if let Some(job) = assigned.into_iter().find(|j| j.worker_id == Some(node_id)) {
        return Ok(Json(NextJobResponse { job: Some(job) }));
    }

    if worker.status != WorkerStatus::Available {
        return Ok(Json(NextJobResponse { job: None }));
    }

    // Fresh submissions are eligible too, even if the assignment loop has
    // not passed over them yet.
    for pending in state.store.get_jobs_by_status(JobStatus::Pending).await? {
        if let Err(e) = state.store.try_queue_pending(pending.id).await {
            warn!(job_id = %pending.id, error = %e, "failed to enqueue pending job");
        }
    }

    for job in state.store.get_jobs_by_status(JobStatus::Queued).await? {
        let req = CapabilityRequirements::from_job(&job);
        if !req.satisfied_by(&worker) {
            continue;
        }
        match state.store.assign_job(job.id, node_id).await {
            Ok(true) => {
                let job = state.store.get_job(job.id).await?;
                return Ok(Json(NextJobResponse { job: Some(job) }));
            }
            // Raced with the assignment loop or another poller; keep
            // scanning.
            Ok(false) => continue,
            Err(e) => {
                debug!(job_id = %job.id, error = %e, "poll-path assignment lost the race");
                continue;
            }
        }
    }

    Ok(Json(NextJobResponse { job: None }))
}

/// `POST /jobs/{id}/claim`: the worker's acknowledgement that execution
/// begins, inducing `Assigned -> Running`. Idempotent on retries.
pub async fn claim_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<ClaimRequest>,
) -> Result<Json<Job>, ApiError> {
    let job = state.store.get_job(id).await?;
    if job.worker_id != Some(req.node_id) {
        return Err(ApiError::BadRequest(format!(
            "job {id} is not assigned to node {}",
            req.node_id
        )));
    }

    state
        .store
        .transition_job(id, JobStatus::Running, "claimed by worker")
        .await?;
    Ok(Json(state.store.get_job(id).await?))
}

/// `POST /jobs/{id}/heartbeat`: activity signal from the executing
/// worker, with optional progress.
pub async fn job_heartbeat(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<JobHeartbeatRequest>,
) -> Result<StatusCode, ApiError> {
    let job = state.store.get_job(id).await?;
    if job.worker_id != Some(req.node_id) {
        return Err(ApiError::BadRequest(format!(
            "job {id} is not assigned to node {}",
            req.node_id
        )));
    }
    state.store.update_job_heartbeat(id, req.progress).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /jobs/{id}/pause`.
pub async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state
        .store
        .transition_job(id, JobStatus::Paused, "paused by operator")
        .await?;
    Ok(Json(state.store.get_job(id).await?))
}

/// `POST /jobs/{id}/resume`.
pub async fn resume_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    state
        .store
        .transition_job(id, JobStatus::Running, "resumed by operator")
        .await?;
    Ok(Json(state.store.get_job(id).await?))
}

/// `POST /jobs/{id}/cancel`. A job still sitting in `Pending` is queued
/// first so the cancellation lands on a legal edge.
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    let job = state.store.get_job(id).await?;
    if job.status == JobStatus::Pending {
        state.store.try_queue_pending(id).await?;
    }
    state
        .store
        .transition_job(id, JobStatus::Canceled, "canceled by operator")
        .await?;
    Ok(Json(state.store.get_job(id).await?))
}
