//! Assignment cycle: queue fresh submissions, order the backlog, match
//! capabilities, bind jobs to workers.

use chrono::{DateTime, Utc};
use ffrtmp_core::{CapabilityRequirements, Job, JobStatus, StoreError};
use tracing::{debug, info, warn};

use super::{Scheduler, SchedulerMetrics};

impl Scheduler {
    /// One pass of the assignment loop. Public so tests (and the pull
    /// path in `GET /jobs/next`) can run cycles deterministically.
    pub async fn run_assignment_cycle(&self) -> Result<(), StoreError> {
        let now = Utc::now();

        // Fresh submissions compete in this same pass.
        for job in self.store.get_jobs_by_status(JobStatus::Pending).await? {
            if let Err(e) = self.store.try_queue_pending(job.id).await {
                warn!(job_id = %job.id, error = %e, "failed to enqueue pending job");
            }
        }

        let queued = self.store.get_jobs_by_status(JobStatus::Queued).await?;
        self.metrics
            .queue_depth
            .store(queued.len() as u64, std::sync::atomic::Ordering::Relaxed);
        if queued.is_empty() {
            self.metrics.touch_assignment_cycle();
            return Ok(());
        }

        let all_workers = self.store.get_all_workers().await?;
        let mut available = self.store.get_available_workers().await?;

        for job in order_with_aging(queued, now) {
            let req = CapabilityRequirements::from_job(&job);

            // Rejection is final, so it is only pronounced when there is a
            // cluster to measure against and the job has burned no retries.
            if !req.cluster_can_satisfy(&all_workers) {
                if job.retry_count == 0 {
                    match self
                        .store
                        .transition_job(
                            job.id,
                            JobStatus::Rejected,
                            "no worker in the cluster satisfies the capability requirements",
                        )
                        .await
                    {
                        Ok(true) => {
                            SchedulerMetrics::incr(&self.metrics.rejections);
                            info!(job_id = %job.id, scenario = %job.scenario, "job rejected: capability mismatch");
                        }
                        Ok(false) => {}
                        Err(e) => warn!(job_id = %job.id, error = %e, "failed to reject job"),
                    }
                }
                continue;
            }

            let Some(idx) = available.iter().position(|w| req.satisfied_by(w)) else {
                // Satisfiable in principle, just not right now.
                continue;
            };
            let worker = available.remove(idx);

            SchedulerMetrics::incr(&self.metrics.assignment_attempts);
            match self.store.assign_job(job.id, worker.id).await {
                Ok(true) => {
                    SchedulerMetrics::incr(&self.metrics.assignment_successes);
                    debug!(job_id = %job.id, worker = %worker.name, "job assigned");
                }
                Ok(false) => {}
                Err(e) => {
                    SchedulerMetrics::incr(&self.metrics.assignment_failures);
                    warn!(job_id = %job.id, worker = %worker.name, error = %e, "assignment failed");
                    // The worker was not consumed; let it take another job
                    // this cycle.
                    available.push(worker);
                }
            }
        }

        self.metrics.touch_assignment_cycle();
        Ok(())
    }
}

/// Starvation mitigation: within the queue-class ordering the store
/// already provides, a job's priority weight gains one point per five
/// minutes of age, letting old low-priority work overtake fresh
/// high-priority work of the same class. `created_at` breaks ties.
fn order_with_aging(mut jobs: Vec<Job>, now: DateTime<Utc>) -> Vec<Job> {
    jobs.sort_by(|a, b| {
        b.queue
            .weight()
            .cmp(&a.queue.weight())
            .then(effective_priority(b, now).cmp(&effective_priority(a, now)))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.seq.cmp(&b.seq))
    });
    jobs
}

fn effective_priority(job: &Job, now: DateTime<Utc>) -> i64 {
    let age_minutes = job.age(now).num_minutes().max(0);
    job.priority.weight() as i64 + age_minutes / 5
}
