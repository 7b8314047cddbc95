//! In-memory store.
//!
//! The default backend for single-node deployments and the test backend.
//! One mutex guards both tables, which makes every compare-and-set below
//! trivially atomic: whoever holds the lock observes and mutates a
//! consistent world. Job-side and worker-side effects of a transition
//! commit together, so the binding invariants hold at every observable
//! point.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ffrtmp_core::{
    FailureReason, Job, JobResult, JobSpec, JobStatus, ResourceSnapshot, Store, StoreError,
    TimeoutPolicy, Worker, WorkerRegistration, WorkerStatus,
};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    workers: HashMap<Uuid, Worker>,
    next_seq: i64,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
    timeouts: TimeoutPolicy,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_policy(TimeoutPolicy::default())
    }

    pub fn with_policy(timeouts: TimeoutPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            timeouts,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Compound scheduling order: queue weight, then priority weight, then
/// FIFO by creation time (sequence number as the final deterministic
/// tie-break).
pub(crate) fn scheduling_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    b.queue
        .weight()
        .cmp(&a.queue.weight())
        .then(b.priority.weight().cmp(&a.priority.weight()))
        .then(a.created_at.cmp(&b.created_at))
        .then(a.seq.cmp(&b.seq))
}

impl Inner {
    fn job_mut(&mut self, id: Uuid) -> Result<&mut Job, StoreError> {
        self.jobs.get_mut(&id).ok_or(StoreError::JobNotFound(id))
    }

    /// Apply a transition and mirror its worker-side effects in the same
    /// critical section.
    fn transition(
        &mut self,
        id: Uuid,
        target: JobStatus,
        reason: &str,
        timeouts: &TimeoutPolicy,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let job = self.job_mut(id)?;
        let bound_worker = job.worker_id;

        if !job.apply_transition(target, reason, now)? {
            return Ok(false);
        }

        if target == JobStatus::Running {
            let deadline = job.started_at.and_then(|s| timeouts.deadline_for(job, s));
            job.timeout_at = deadline;
        }

        // Leaving the bound states releases the worker row too, unless the
        // health loop already took it offline; the binding is cleared
        // either way so the job can be handed elsewhere.
        if !target.holds_worker() {
            if let Some(worker) = bound_worker.and_then(|w| self.workers.get_mut(&w)) {
                if worker.current_job_id == Some(id) {
                    worker.current_job_id = None;
                    if worker.status == WorkerStatus::Busy {
                        worker.status = WorkerStatus::Available;
                    }
                }
            }
        }

        Ok(true)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_job(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.next_seq += 1;
        let job = Job::from_spec(spec, inner.next_seq, Utc::now());
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let inner = self.inner.lock().await;
        inner.jobs.get(&id).cloned().ok_or(StoreError::JobNotFound(id))
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.seq.cmp(&b.seq));
        Ok(jobs)
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(scheduling_order);
        Ok(jobs)
    }

    async fn try_queue_pending(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, JobStatus::Queued, "enqueued", &self.timeouts)
    }

    async fn transition_job(
        &self,
        id: Uuid,
        target: JobStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.transition(id, target, reason, &self.timeouts)
    }

    async fn assign_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        let job = inner.jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if job.status == JobStatus::Assigned {
            if job.worker_id == Some(worker_id) {
                return Ok(false);
            }
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("already assigned to worker {:?}", job.worker_id),
            });
        }

        let worker = inner
            .workers
            .get(&worker_id)
            .ok_or(StoreError::WorkerNotFound(worker_id))?;
        if worker.status != WorkerStatus::Available {
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("worker {} is {:?}", worker.name, worker.status),
            });
        }
        let worker_name = worker.name.clone();

        // Job-side CAS first; a failure here leaves the worker untouched.
        let job = inner.job_mut(job_id)?;
        let reason = format!("assigned to {worker_name}");
        if !job.apply_transition(JobStatus::Assigned, &reason, now)? {
            return Ok(false);
        }
        job.worker_id = Some(worker_id);
        job.worker_name = Some(worker_name);

        if let Some(worker) = inner.workers.get_mut(&worker_id) {
            worker.status = WorkerStatus::Busy;
            worker.current_job_id = Some(job_id);
        }

        Ok(true)
    }

    async fn complete_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
        if job.status == JobStatus::Completed {
            return Ok(false);
        }
        if job.worker_id != Some(worker_id) {
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("job is not bound to worker {worker_id}"),
            });
        }
        inner.transition(job_id, JobStatus::Completed, "worker reported success", &self.timeouts)
    }

    async fn update_job_heartbeat(
        &self,
        id: Uuid,
        progress: Option<u8>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        job.last_activity_at = Some(Utc::now());
        if let Some(p) = progress {
            job.progress = p.min(100);
        }
        Ok(())
    }

    async fn record_result(
        &self,
        id: Uuid,
        result: JobResult,
        failure_reason: Option<FailureReason>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let job = inner.job_mut(id)?;
        job.result = Some(result);
        if failure_reason.is_some() {
            job.failure_reason = failure_reason;
        }
        Ok(())
    }

    async fn get_orphaned_jobs(&self, worker_timeout: Duration) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        let orphaned = inner
            .jobs
            .values()
            .filter(|j| j.status.holds_worker())
            .filter(|j| match j.worker_id.and_then(|w| inner.workers.get(&w)) {
                None => true,
                Some(w) => {
                    w.status == WorkerStatus::Offline
                        || (now - w.last_heartbeat)
                            .to_std()
                            .map(|d| d >= worker_timeout)
                            .unwrap_or(false)
                }
            })
            .cloned()
            .collect();
        Ok(orphaned)
    }

    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.lock().await;
        let now = Utc::now();
        Ok(inner
            .jobs
            .values()
            .filter(|j| self.timeouts.is_stale(j, now))
            .cloned()
            .collect())
    }

    async fn get_retrying_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.get_jobs_by_status(JobStatus::Retrying).await
    }

    async fn register_worker(&self, reg: WorkerRegistration) -> Result<Worker, StoreError> {
        let mut inner = self.inner.lock().await;
        let now = Utc::now();

        if let Some(existing) = inner
            .workers
            .values_mut()
            .find(|w| w.address == reg.address)
        {
            if existing.status != WorkerStatus::Offline {
                return Err(StoreError::DuplicateAddress(reg.address));
            }
            // Same address coming back from the dead re-activates in place;
            // any stale binding was (or will be) orphan-recovered.
            existing.name = reg.name;
            existing.capabilities = reg.capabilities;
            existing.status = WorkerStatus::Available;
            existing.current_job_id = None;
            existing.last_heartbeat = now;
            return Ok(existing.clone());
        }

        let worker = Worker::from_registration(reg, now);
        inner.workers.insert(worker.id, worker.clone());
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Worker, StoreError> {
        let inner = self.inner.lock().await;
        inner
            .workers
            .get(&id)
            .cloned()
            .ok_or(StoreError::WorkerNotFound(id))
    }

    async fn get_worker_by_address(&self, address: &str) -> Result<Option<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.workers.values().find(|w| w.address == address).cloned())
    }

    async fn get_all_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let inner = self.inner.lock().await;
        let mut workers: Vec<Worker> = inner.workers.values().cloned().collect();
        workers.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.id.cmp(&b.id)));
        Ok(workers)
    }

    async fn get_available_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let workers = self.get_all_workers().await?;
        Ok(workers
            .into_iter()
            .filter(|w| w.status == WorkerStatus::Available)
            .collect())
    }

    async fn worker_heartbeat(
        &self,
        id: Uuid,
        snapshot: ResourceSnapshot,
        status: Option<WorkerStatus>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(&id)
            .ok_or(StoreError::WorkerNotFound(id))?;
        worker.last_heartbeat = Utc::now();
        worker.last_snapshot = Some(snapshot);
        match status {
            Some(WorkerStatus::Draining) => worker.status = WorkerStatus::Draining,
            _ => {
                // A heartbeat from a worker we declared dead revives it;
                // its old job is handled by orphan recovery.
                if worker.status == WorkerStatus::Offline {
                    worker.status = WorkerStatus::Available;
                    worker.current_job_id = None;
                }
            }
        }
        Ok(())
    }

    async fn mark_worker_offline(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().await;
        let worker = inner
            .workers
            .get_mut(&id)
            .ok_or(StoreError::WorkerNotFound(id))?;
        if worker.status == WorkerStatus::Offline {
            return Ok(false);
        }
        // Bindings are not evicted here; the cleanup loop recovers orphans.
        worker.status = WorkerStatus::Offline;
        Ok(true)
    }
}
