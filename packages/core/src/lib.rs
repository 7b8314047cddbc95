//! Shared domain layer for the ffrtmp transcoding control plane.
//!
//! This crate owns the vocabulary the master, worker and governor agree on:
//! the job and worker models, the job state machine, capability matching,
//! retry and timeout policy, the persistence contract, and the wire DTOs.
//! It contains no IO. Policy *decisions* (loop cadence, backend choice,
//! concurrency limits) belong to the binaries that depend on it.

pub mod capability;
pub mod job;
pub mod protocol;
pub mod retry;
pub mod state;
pub mod store;
pub mod worker;

pub use capability::CapabilityRequirements;
pub use job::{
    Engine, FailureReason, Job, JobPriority, JobResult, JobSpec, JobStatus, QueueClass,
    TransitionRecord,
};
pub use retry::{RetryPolicy, TimeoutPolicy};
pub use state::{transition_allowed, IllegalTransition};
pub use store::{Store, StoreError};
pub use worker::{Capabilities, ResourceSnapshot, Worker, WorkerRegistration, WorkerStatus};
