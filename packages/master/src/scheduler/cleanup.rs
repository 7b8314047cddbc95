//! Cleanup cycle: orphan recovery and retry re-queueing.

use chrono::Utc;
use ffrtmp_core::{JobStatus, StoreError};
use tracing::{info, warn};

use super::{Scheduler, SchedulerMetrics};

impl Scheduler {
    pub async fn run_cleanup_cycle(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        // Jobs whose worker died are parked in Retrying; the cap is
        // enforced below at requeue time, so recovery itself never burns
        // an attempt.
        for job in self
            .store
            .get_orphaned_jobs(self.config.worker_timeout)
            .await?
        {
            match self
                .store
                .transition_job(job.id, JobStatus::Retrying, "worker died")
                .await
            {
                Ok(true) => {
                    SchedulerMetrics::incr(&self.metrics.orphans_recovered);
                    info!(job_id = %job.id, worker = ?job.worker_name, "orphaned job recovered");
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to recover orphan"),
            }
        }

        for job in self.store.get_retrying_jobs().await? {
            if job.retry_count >= job.max_retries {
                if let Err(e) = self
                    .store
                    .transition_job(job.id, JobStatus::Failed, "retries exhausted")
                    .await
                {
                    warn!(job_id = %job.id, error = %e, "failed to fail exhausted job");
                }
                continue;
            }

            let backoff = self.config.retry.backoff(job.retry_count + 1);
            let waited = (now - job.entered_current_state_at())
                .to_std()
                .unwrap_or_default();
            if waited < backoff {
                continue;
            }

            let reason = format!("retry attempt {}/{}", job.retry_count + 1, job.max_retries);
            match self.store.transition_job(job.id, JobStatus::Queued, &reason).await {
                Ok(true) => {
                    SchedulerMetrics::incr(&self.metrics.retries_scheduled);
                    info!(job_id = %job.id, attempt = job.retry_count + 1, "job re-queued after backoff");
                }
                Ok(false) => {}
                Err(e) => warn!(job_id = %job.id, error = %e, "failed to re-queue retrying job"),
            }
        }

        self.metrics.touch_cleanup_cycle();
        Ok(())
    }
}
