//! The persistence contract.
//!
//! Everything mutable in the control plane flows through this trait: jobs,
//! workers, and the bindings between them. Implementations must serialize
//! all operations touching the same job, so that every compare-and-set
//! below is atomic; concurrent assignment attempts on one job yield at
//! most one `applied = true`.
//!
//! The contract is satisfied at construction time: the scheduler takes an
//! `Arc<dyn Store>` and never probes for extended interfaces at runtime.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::job::{FailureReason, Job, JobResult, JobSpec, JobStatus};
use crate::state::IllegalTransition;
use crate::worker::{ResourceSnapshot, Worker, WorkerRegistration, WorkerStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(Uuid),

    #[error("worker {0} not found")]
    WorkerNotFound(Uuid),

    #[error(transparent)]
    IllegalTransition(#[from] IllegalTransition),

    #[error("address {0} is already registered to a live worker")]
    DuplicateAddress(String),

    #[error("assignment conflict on job {job_id}: {detail}")]
    AssignConflict { job_id: Uuid, detail: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Transactional storage for jobs and workers.
///
/// Methods returning `bool` follow CAS semantics: `Ok(true)` means the
/// operation was applied, `Ok(false)` means it was an idempotent no-op
/// (already in the requested state), and `Err` means it could not be
/// applied at all.
#[async_trait]
pub trait Store: Send + Sync {
    // ------------------------------------------------------------------
    // Jobs
    // ------------------------------------------------------------------

    /// Persist a new job in `Pending`, assigning its ID and sequence number.
    async fn create_job(&self, spec: JobSpec) -> Result<Job, StoreError>;

    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError>;

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Jobs in `status`, ordered by
    /// `queue_weight DESC, priority_weight DESC, created_at ASC`.
    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError>;

    /// CAS `Pending -> Queued`.
    async fn try_queue_pending(&self, id: Uuid) -> Result<bool, StoreError>;

    /// Atomic CAS of the job's status per the state machine, with the
    /// transition's side-effects applied in the same critical section.
    async fn transition_job(
        &self,
        id: Uuid,
        target: JobStatus,
        reason: &str,
    ) -> Result<bool, StoreError>;

    /// Atomically bind a queued job to an available worker: job
    /// `Queued -> Assigned` and worker `available -> busy`, both or
    /// neither. Re-asserting an existing binding is a no-op.
    async fn assign_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError>;

    /// Atomically finish a job: job `-> Completed`, worker released back
    /// to `available`. Idempotent on repeat.
    async fn complete_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError>;

    /// Record liveness (and optionally progress) for a running job.
    async fn update_job_heartbeat(&self, id: Uuid, progress: Option<u8>)
        -> Result<(), StoreError>;

    /// Attach a terminal result record, stamping the job's failure
    /// classification when the worker reported one.
    async fn record_result(
        &self,
        id: Uuid,
        result: JobResult,
        failure_reason: Option<FailureReason>,
    ) -> Result<(), StoreError>;

    /// Jobs in `Assigned`/`Running` whose bound worker is offline or has
    /// not heartbeated within `worker_timeout`.
    async fn get_orphaned_jobs(&self, worker_timeout: Duration) -> Result<Vec<Job>, StoreError>;

    /// `Running` jobs stale per the store's timeout policy.
    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Jobs currently parked in `Retrying`.
    async fn get_retrying_jobs(&self) -> Result<Vec<Job>, StoreError>;

    // ------------------------------------------------------------------
    // Workers
    // ------------------------------------------------------------------

    /// Register a worker. Addresses are unique: a live worker on the same
    /// address is a [`StoreError::DuplicateAddress`]; an offline worker on
    /// the same address is re-activated in place.
    async fn register_worker(&self, reg: WorkerRegistration) -> Result<Worker, StoreError>;

    async fn get_worker(&self, id: Uuid) -> Result<Worker, StoreError>;

    async fn get_worker_by_address(&self, address: &str) -> Result<Option<Worker>, StoreError>;

    async fn get_all_workers(&self) -> Result<Vec<Worker>, StoreError>;

    async fn get_available_workers(&self) -> Result<Vec<Worker>, StoreError>;

    /// Record a worker heartbeat with its resource snapshot; optionally
    /// moves the worker into `draining`.
    async fn worker_heartbeat(
        &self,
        id: Uuid,
        snapshot: ResourceSnapshot,
        status: Option<WorkerStatus>,
    ) -> Result<(), StoreError>;

    /// Health loop: mark a worker offline. Does not evict its job binding;
    /// the cleanup loop handles orphans.
    ///
    /// There is no separate release operation: any transition that moves a
    /// job out of its bound states returns the worker to `available` in
    /// the same critical section.
    async fn mark_worker_offline(&self, id: Uuid) -> Result<bool, StoreError>;
}
