//! Terminal result ingestion.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use ffrtmp_core::protocol::{ReportedStatus, ResultReport};
use ffrtmp_core::{FailureReason, JobResult, JobStatus};
use tracing::{info, warn};

use crate::server::app::AppState;
use crate::server::error::ApiError;

/// `POST /results`.
///
/// The result record is persisted before the transition so captured logs
/// survive even when the status change turns out to be a duplicate. A
/// retryable failure is immediately reclassified `Failed -> Retrying`;
/// the cleanup loop re-queues it once the backoff elapses.
pub async fn report_result(
    State(state): State<AppState>,
    Json(report): Json<ResultReport>,
) -> Result<StatusCode, ApiError> {
    let job = state.store.get_job(report.job_id).await?;
    if job.status.holds_worker() && job.worker_id != Some(report.node_id) {
        return Err(ApiError::BadRequest(format!(
            "job {} is not assigned to node {}",
            report.job_id, report.node_id
        )));
    }

    let failure_reason = match report.status {
        ReportedStatus::Failed => Some(report.failure_reason.unwrap_or(FailureReason::RuntimeError)),
        _ => None,
    };
    state
        .store
        .record_result(
            report.job_id,
            JobResult {
                metrics: report.metrics,
                quality_score: report.quality_score,
                efficiency_score: report.efficiency_score,
                logs: report.logs,
                error: report.error,
            },
            failure_reason,
        )
        .await?;

    match report.status {
        ReportedStatus::Completed => {
            let applied = state
                .store
                .complete_job(report.job_id, report.node_id)
                .await?;
            if applied {
                info!(job_id = %report.job_id, "job completed");
            }
        }
        ReportedStatus::Canceled => {
            state
                .store
                .transition_job(report.job_id, JobStatus::Canceled, "canceled by worker: graceful shutdown")
                .await?;
        }
        ReportedStatus::Failed => {
            let reason = report.failure_reason.unwrap_or(FailureReason::RuntimeError);
            let applied = state
                .store
                .transition_job(
                    report.job_id,
                    JobStatus::Failed,
                    &format!("worker reported failure: {reason:?}"),
                )
                .await?;
            if applied {
                let job = state.store.get_job(report.job_id).await?;
                if state.retry.should_retry(&job, reason) {
                    match state
                        .store
                        .transition_job(
                            report.job_id,
                            JobStatus::Retrying,
                            "transient failure, scheduling retry",
                        )
                        .await
                    {
                        Ok(_) => {}
                        Err(e) => {
                            warn!(job_id = %report.job_id, error = %e, "failed to reclassify for retry")
                        }
                    }
                } else {
                    warn!(
                        job_id = %report.job_id,
                        reason = ?reason,
                        retry_count = job.retry_count,
                        "job failed permanently"
                    );
                }
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}
