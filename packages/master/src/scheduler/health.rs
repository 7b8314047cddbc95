//! Health cycle: worker liveness and running-job timeouts.

use chrono::Utc;
use ffrtmp_core::{FailureReason, JobStatus, StoreError, WorkerStatus};
use tracing::{info, warn};

use super::{Scheduler, SchedulerMetrics};

impl Scheduler {
    pub async fn run_health_cycle(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        for worker in self.store.get_all_workers().await? {
            if worker.status == WorkerStatus::Offline {
                continue;
            }
            let silent = (now - worker.last_heartbeat).to_std().unwrap_or_default();
            if silent >= self.config.worker_timeout {
                match self.store.mark_worker_offline(worker.id).await {
                    Ok(true) => {
                        SchedulerMetrics::incr(&self.metrics.workers_marked_offline);
                        warn!(
                            worker = %worker.name,
                            silent_secs = silent.as_secs(),
                            "worker missed heartbeats, marked offline"
                        );
                    }
                    Ok(false) => {}
                    Err(e) => warn!(worker = %worker.name, error = %e, "failed to mark worker offline"),
                }
            }
        }

        for job in self.store.get_timed_out_jobs().await? {
            let applied = match self
                .store
                .transition_job(job.id, JobStatus::TimedOut, "no activity within the timeout threshold")
                .await
            {
                Ok(applied) => applied,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "failed to time out job");
                    continue;
                }
            };
            if !applied {
                continue;
            }
            SchedulerMetrics::incr(&self.metrics.timeouts);

            // Decide the job's next hop while it sits in TimedOut.
            let job = self.store.get_job(job.id).await?;
            if self.config.retry.should_retry(&job, FailureReason::Timeout) {
                match self
                    .store
                    .transition_job(job.id, JobStatus::Retrying, "timed out, scheduling retry")
                    .await
                {
                    Ok(true) => {
                        SchedulerMetrics::incr(&self.metrics.retries_scheduled);
                        info!(job_id = %job.id, retry_count = job.retry_count, "timed-out job scheduled for retry");
                    }
                    Ok(false) => {}
                    Err(e) => warn!(job_id = %job.id, error = %e, "failed to schedule retry"),
                }
            } else if let Err(e) = self
                .store
                .transition_job(job.id, JobStatus::Failed, "timed out, retries exhausted")
                .await
            {
                warn!(job_id = %job.id, error = %e, "failed to fail timed-out job");
            }
        }

        self.metrics.touch_health_cycle();
        Ok(())
    }
}
