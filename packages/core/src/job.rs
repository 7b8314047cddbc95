//! Job model for distributed transcoding work.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::state::{self, IllegalTransition, TransitionCheck};

/// Default retry budget for newly created jobs.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Queued,
    Assigned,
    Running,
    Retrying,
    Completed,
    Failed,
    TimedOut,
    Canceled,
    Paused,
    Rejected,
}

impl JobStatus {
    /// Terminal states never transition again.
    ///
    /// `Failed` is terminal in practice but keeps a single outgoing edge
    /// (`Failed -> Retrying`) for transient reclassification, so it is not
    /// listed here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Canceled | JobStatus::Rejected
        )
    }

    /// States in which a job holds a worker binding.
    pub fn holds_worker(&self) -> bool {
        matches!(self, JobStatus::Assigned | JobStatus::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Queued => "queued",
            JobStatus::Assigned => "assigned",
            JobStatus::Running => "running",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Canceled => "canceled",
            JobStatus::Paused => "paused",
            JobStatus::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

/// Scheduling queue a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum QueueClass {
    Live,
    #[default]
    Default,
    Batch,
}

impl QueueClass {
    /// Compound-ordering weight. Live traffic always outranks batch.
    pub fn weight(&self) -> i32 {
        match self {
            QueueClass::Live => 10,
            QueueClass::Default => 5,
            QueueClass::Batch => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    High,
    #[default]
    Medium,
    Low,
}

impl JobPriority {
    pub fn weight(&self) -> i32 {
        match self {
            JobPriority::High => 3,
            JobPriority::Medium => 2,
            JobPriority::Low => 1,
        }
    }
}

/// Transcoding engine requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Engine {
    #[default]
    Auto,
    Ffmpeg,
    Gstreamer,
}

/// Classification of a job failure, surfaced in results and consulted by
/// the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No worker can satisfy the job's requirements. Never retried.
    CapabilityMismatch,
    /// The workload executed and reported an error. Retried under policy.
    RuntimeError,
    /// No heartbeat for the policy interval. Retried under policy.
    Timeout,
    /// Invalid input detected before or during execution. Never retried.
    UserError,
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FailureReason::RuntimeError | FailureReason::Timeout)
    }
}

// ============================================================================
// Records
// ============================================================================

/// Immutable audit record appended to a job on every status change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: JobStatus,
    pub to: JobStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Terminal outcome reported by a worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobResult {
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub efficiency_score: Option<f64>,
    #[serde(default)]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ============================================================================
// Job
// ============================================================================

/// Creation-time description of a job. Everything else on [`Job`] is owned
/// by the store.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobSpec {
    pub scenario: String,
    #[builder(default)]
    pub queue: QueueClass,
    #[builder(default)]
    pub priority: JobPriority,
    #[builder(default)]
    pub engine: Engine,
    #[builder(default)]
    pub params: HashMap<String, serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub tenant: Option<String>,
    #[builder(default = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,
}

/// The unit of work tracked by the control plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    /// Monotonic sequence number for human display.
    pub seq: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,

    pub scenario: String,
    pub queue: QueueClass,
    pub priority: JobPriority,
    pub engine: Engine,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,

    pub status: JobStatus,
    /// 0-100.
    pub progress: u8,
    pub retry_count: u32,
    pub max_retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_name: Option<String>,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub transitions: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JobResult>,
}

impl Job {
    /// Materialize a new job from its spec. Sequence numbers are assigned
    /// by the store.
    pub fn from_spec(spec: JobSpec, seq: i64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq,
            tenant: spec.tenant,
            scenario: spec.scenario,
            queue: spec.queue,
            priority: spec.priority,
            engine: spec.engine,
            params: spec.params,
            status: JobStatus::Pending,
            progress: 0,
            retry_count: 0,
            max_retries: spec.max_retries,
            failure_reason: None,
            worker_id: None,
            worker_name: None,
            created_at: now,
            started_at: None,
            last_activity_at: None,
            completed_at: None,
            timeout_at: None,
            transitions: Vec::new(),
            result: None,
        }
    }

    /// Apply a state transition and its side-effects in place.
    ///
    /// Returns `Ok(true)` when the transition was applied, `Ok(false)` when
    /// the job already sits in the target state (idempotent no-op), and an
    /// error when the transition is illegal from the current state. Both
    /// store backends funnel every status change through here so the
    /// side-effect rules cannot drift between them.
    pub fn apply_transition(
        &mut self,
        to: JobStatus,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, IllegalTransition> {
        match state::check_transition(self.status, to)? {
            TransitionCheck::Noop => return Ok(false),
            TransitionCheck::Apply => {}
        }

        self.transitions.push(TransitionRecord {
            from: self.status,
            to,
            at: now,
            reason: reason.to_string(),
        });

        let from = self.status;
        self.status = to;

        match to {
            JobStatus::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(now);
                }
                self.last_activity_at = Some(now);
            }
            JobStatus::TimedOut => {
                self.failure_reason = Some(FailureReason::Timeout);
            }
            JobStatus::Rejected => {
                self.failure_reason = Some(FailureReason::CapabilityMismatch);
                self.completed_at = Some(now);
            }
            JobStatus::Completed | JobStatus::Canceled => {
                self.completed_at = Some(now);
            }
            JobStatus::Failed => {
                self.completed_at = Some(now);
            }
            JobStatus::Queued => {
                // Entering through the retry edge counts the new attempt;
                // the previous attempt's progress and deadline no longer
                // apply. Parking in `Retrying` does not count: the cap is
                // enforced at requeue time, so the count never outruns it.
                if from == JobStatus::Retrying {
                    self.retry_count += 1;
                }
                self.progress = 0;
                self.timeout_at = None;
            }
            _ => {}
        }

        // Leaving Failed through the reclassification edge un-terminates it.
        if from == JobStatus::Failed && to == JobStatus::Retrying {
            self.completed_at = None;
        }

        if !to.holds_worker() {
            self.worker_id = None;
            self.worker_name = None;
        }

        Ok(true)
    }

    /// Time spent in queue, used for the starvation aging bonus.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }

    /// Timestamp of the most recent entry into the current state, falling
    /// back to creation time. The cleanup loop measures retry backoff from
    /// this.
    pub fn entered_current_state_at(&self) -> DateTime<Utc> {
        self.transitions
            .last()
            .map(|t| t.at)
            .unwrap_or(self.created_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::from_spec(
            JobSpec::builder().scenario("vod-1080p").build(),
            1,
            Utc::now(),
        )
    }

    #[test]
    fn test_queue_and_priority_weights() {
        assert!(QueueClass::Live.weight() > QueueClass::Default.weight());
        assert!(QueueClass::Default.weight() > QueueClass::Batch.weight());
        assert!(JobPriority::High.weight() > JobPriority::Low.weight());
    }

    #[test]
    fn test_transition_records_are_appended() {
        let mut j = job();
        let now = Utc::now();
        assert!(j.apply_transition(JobStatus::Queued, "enqueue", now).unwrap());
        assert_eq!(j.transitions.len(), 1);
        assert_eq!(j.transitions[0].from, JobStatus::Pending);
        assert_eq!(j.transitions[0].to, JobStatus::Queued);
    }

    #[test]
    fn test_same_state_transition_is_noop() {
        let mut j = job();
        let now = Utc::now();
        j.apply_transition(JobStatus::Queued, "enqueue", now).unwrap();
        assert!(!j.apply_transition(JobStatus::Queued, "again", now).unwrap());
        assert_eq!(j.transitions.len(), 1);
    }

    #[test]
    fn test_illegal_transition_is_error() {
        let mut j = job();
        let err = j
            .apply_transition(JobStatus::Completed, "skip ahead", Utc::now())
            .unwrap_err();
        assert_eq!(err.from, JobStatus::Pending);
        assert_eq!(err.to, JobStatus::Completed);
    }

    #[test]
    fn test_started_at_set_on_first_running_only() {
        let mut j = job();
        let now = Utc::now();
        j.apply_transition(JobStatus::Queued, "", now).unwrap();
        j.worker_id = Some(Uuid::new_v4());
        j.apply_transition(JobStatus::Assigned, "", now).unwrap();
        j.apply_transition(JobStatus::Running, "", now).unwrap();
        let first = j.started_at.unwrap();

        j.apply_transition(JobStatus::Paused, "", now).unwrap();
        j.apply_transition(JobStatus::Running, "", now + chrono::Duration::seconds(5))
            .unwrap();
        assert_eq!(j.started_at.unwrap(), first);
    }

    #[test]
    fn test_worker_binding_cleared_outside_assigned_running() {
        let mut j = job();
        let now = Utc::now();
        j.apply_transition(JobStatus::Queued, "", now).unwrap();
        j.worker_id = Some(Uuid::new_v4());
        j.worker_name = Some("w1".into());
        j.apply_transition(JobStatus::Assigned, "", now).unwrap();
        assert!(j.worker_id.is_some());
        j.apply_transition(JobStatus::Running, "", now).unwrap();
        assert!(j.worker_id.is_some());
        j.apply_transition(JobStatus::Retrying, "worker died", now).unwrap();
        assert!(j.worker_id.is_none());
        assert!(j.worker_name.is_none());
        assert_eq!(j.retry_count, 0);
        j.apply_transition(JobStatus::Queued, "retry attempt 1/3", now)
            .unwrap();
        assert_eq!(j.retry_count, 1);
    }

    #[test]
    fn test_timeout_and_rejection_stamp_failure_reason() {
        let now = Utc::now();
        let mut j = job();
        j.apply_transition(JobStatus::Queued, "", now).unwrap();
        j.apply_transition(JobStatus::Rejected, "no capable worker", now)
            .unwrap();
        assert_eq!(j.failure_reason, Some(FailureReason::CapabilityMismatch));
        assert!(j.completed_at.is_some());

        let mut j = job();
        j.apply_transition(JobStatus::Queued, "", now).unwrap();
        j.apply_transition(JobStatus::Assigned, "", now).unwrap();
        j.apply_transition(JobStatus::Running, "", now).unwrap();
        j.apply_transition(JobStatus::TimedOut, "stale", now).unwrap();
        assert_eq!(j.failure_reason, Some(FailureReason::Timeout));
    }

    #[test]
    fn test_failed_reclassification_clears_completed_at() {
        let mut j = job();
        let now = Utc::now();
        j.apply_transition(JobStatus::Queued, "", now).unwrap();
        j.apply_transition(JobStatus::Assigned, "", now).unwrap();
        j.apply_transition(JobStatus::Running, "", now).unwrap();
        j.apply_transition(JobStatus::Failed, "boom", now).unwrap();
        assert!(j.completed_at.is_some());
        j.apply_transition(JobStatus::Retrying, "transient", now).unwrap();
        assert!(j.completed_at.is_none());
    }

    #[test]
    fn test_failure_reason_retryability() {
        assert!(FailureReason::RuntimeError.is_retryable());
        assert!(FailureReason::Timeout.is_retryable());
        assert!(!FailureReason::CapabilityMismatch.is_retryable());
        assert!(!FailureReason::UserError.is_retryable());
    }
}
