//! Retry backoff and job timeout policy.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::job::{FailureReason, Job, JobStatus, QueueClass};

/// Exponential backoff policy for job retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    pub multiplier: u32,
    /// Upper bound on any single backoff delay.
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            multiplier: 2,
            cap: Duration::from_secs(300),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry attempt `retry_count` (1-based; the
    /// count is incremented when a job enters `Retrying`).
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let exp = retry_count.saturating_sub(1).min(31);
        let factor = (self.multiplier as u64).saturating_pow(exp);
        let delay = self
            .base
            .checked_mul(factor.try_into().unwrap_or(u32::MAX))
            .unwrap_or(self.cap);
        delay.min(self.cap)
    }

    /// Whether a failed job should get another attempt.
    ///
    /// Capability mismatches and user errors are final no matter how many
    /// retries remain; rejected jobs never reach this check.
    pub fn should_retry(&self, job: &Job, reason: FailureReason) -> bool {
        reason.is_retryable() && job.retry_count < job.max_retries
    }
}

/// Queue-aware staleness policy for running jobs.
///
/// Batch and default queue jobs are bounded by total runtime. Live jobs
/// may run indefinitely as long as activity keeps flowing, so only their
/// heartbeat gap is bounded. A per-scenario override, when configured,
/// bounds total runtime regardless of queue class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    /// Total-runtime bound for batch/default queue jobs.
    pub run_timeout: Duration,
    /// Heartbeat-gap bound for live queue jobs.
    pub activity_timeout: Duration,
    #[serde(default)]
    pub scenario_overrides: HashMap<String, Duration>,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(30 * 60),
            activity_timeout: Duration::from_secs(5 * 60),
            scenario_overrides: HashMap::new(),
        }
    }
}

impl TimeoutPolicy {
    /// Hard deadline for a job entering `Running`, if its class has one.
    pub fn deadline_for(&self, job: &Job, started: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if let Some(limit) = self.scenario_overrides.get(&job.scenario) {
            return Some(started + chrono::Duration::from_std(*limit).unwrap_or_default());
        }
        match job.queue {
            QueueClass::Live => None,
            QueueClass::Default | QueueClass::Batch => {
                Some(started + chrono::Duration::from_std(self.run_timeout).unwrap_or_default())
            }
        }
    }

    /// Whether a `Running` job has gone stale at `now`.
    pub fn is_stale(&self, job: &Job, now: DateTime<Utc>) -> bool {
        if job.status != JobStatus::Running {
            return false;
        }
        if let Some(limit) = self.scenario_overrides.get(&job.scenario) {
            if let Some(started) = job.started_at {
                return elapsed_exceeds(started, now, *limit);
            }
            return false;
        }
        match job.queue {
            QueueClass::Live => match job.last_activity_at {
                Some(last) => elapsed_exceeds(last, now, self.activity_timeout),
                None => false,
            },
            QueueClass::Default | QueueClass::Batch => match job.started_at {
                Some(started) => elapsed_exceeds(started, now, self.run_timeout),
                None => false,
            },
        }
    }
}

fn elapsed_exceeds(since: DateTime<Utc>, now: DateTime<Utc>, limit: Duration) -> bool {
    (now - since).to_std().map(|d| d > limit).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobSpec;

    fn job(queue: QueueClass, scenario: &str) -> Job {
        let mut j = Job::from_spec(
            JobSpec::builder().scenario(scenario).queue(queue).build(),
            1,
            Utc::now(),
        );
        j.status = JobStatus::Running;
        j
    }

    #[test]
    fn test_backoff_doubles_up_to_cap() {
        let p = RetryPolicy::default();
        assert_eq!(p.backoff(1), Duration::from_secs(1));
        assert_eq!(p.backoff(2), Duration::from_secs(2));
        assert_eq!(p.backoff(3), Duration::from_secs(4));
        assert_eq!(p.backoff(10), Duration::from_secs(300));
        assert_eq!(p.backoff(31), Duration::from_secs(300));
    }

    #[test]
    fn test_should_retry_respects_cap_and_reason() {
        let p = RetryPolicy::default();
        let mut j = job(QueueClass::Default, "s");
        assert!(p.should_retry(&j, FailureReason::RuntimeError));
        assert!(!p.should_retry(&j, FailureReason::UserError));
        assert!(!p.should_retry(&j, FailureReason::CapabilityMismatch));

        j.retry_count = j.max_retries;
        assert!(!p.should_retry(&j, FailureReason::RuntimeError));
    }

    #[test]
    fn test_batch_jobs_are_runtime_bounded() {
        let p = TimeoutPolicy::default();
        let now = Utc::now();
        let mut j = job(QueueClass::Batch, "s");
        j.started_at = Some(now - chrono::Duration::minutes(31));
        j.last_activity_at = Some(now);
        assert!(p.is_stale(&j, now));
    }

    #[test]
    fn test_live_jobs_are_activity_bounded_only() {
        let p = TimeoutPolicy::default();
        let now = Utc::now();
        let mut j = job(QueueClass::Live, "s");
        // Hours of runtime are fine while heartbeats flow.
        j.started_at = Some(now - chrono::Duration::hours(6));
        j.last_activity_at = Some(now - chrono::Duration::minutes(1));
        assert!(!p.is_stale(&j, now));

        j.last_activity_at = Some(now - chrono::Duration::minutes(6));
        assert!(p.is_stale(&j, now));
    }

    #[test]
    fn test_scenario_override_wins() {
        let mut p = TimeoutPolicy::default();
        p.scenario_overrides
            .insert("quick".to_string(), Duration::from_secs(60));
        let now = Utc::now();
        let mut j = job(QueueClass::Live, "quick");
        j.started_at = Some(now - chrono::Duration::minutes(2));
        j.last_activity_at = Some(now);
        assert!(p.is_stale(&j, now));
    }

    #[test]
    fn test_live_deadline_is_open_ended() {
        let p = TimeoutPolicy::default();
        let j = job(QueueClass::Live, "s");
        assert!(p.deadline_for(&j, Utc::now()).is_none());
        let j = job(QueueClass::Default, "s");
        assert!(p.deadline_for(&j, Utc::now()).is_some());
    }
}
