//! Scheduler counters, exported through `GET /stats`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Lock-free counters shared by the three loops and the API. Gauges are
/// overwritten each cycle; counters only ever increase.
#[derive(Debug, Default)]
pub struct SchedulerMetrics {
    pub queue_depth: AtomicU64,
    pub assignment_attempts: AtomicU64,
    pub assignment_successes: AtomicU64,
    pub assignment_failures: AtomicU64,
    pub rejections: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub timeouts: AtomicU64,
    pub orphans_recovered: AtomicU64,
    pub workers_marked_offline: AtomicU64,

    last_assignment_cycle_ms: AtomicI64,
    last_health_cycle_ms: AtomicI64,
    last_cleanup_cycle_ms: AtomicI64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub queue_depth: u64,
    pub assignment_attempts: u64,
    pub assignment_successes: u64,
    pub assignment_failures: u64,
    pub rejections: u64,
    pub retries_scheduled: u64,
    pub timeouts: u64,
    pub orphans_recovered: u64,
    pub workers_marked_offline: u64,
    pub last_assignment_cycle: Option<DateTime<Utc>>,
    pub last_health_cycle: Option<DateTime<Utc>>,
    pub last_cleanup_cycle: Option<DateTime<Utc>>,
}

impl SchedulerMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch_assignment_cycle(&self) {
        self.last_assignment_cycle_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn touch_health_cycle(&self) {
        self.last_health_cycle_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn touch_cleanup_cycle(&self) {
        self.last_cleanup_cycle_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_depth: self.queue_depth.load(Ordering::Relaxed),
            assignment_attempts: self.assignment_attempts.load(Ordering::Relaxed),
            assignment_successes: self.assignment_successes.load(Ordering::Relaxed),
            assignment_failures: self.assignment_failures.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            orphans_recovered: self.orphans_recovered.load(Ordering::Relaxed),
            workers_marked_offline: self.workers_marked_offline.load(Ordering::Relaxed),
            last_assignment_cycle: millis_to_time(&self.last_assignment_cycle_ms),
            last_health_cycle: millis_to_time(&self.last_health_cycle_ms),
            last_cleanup_cycle: millis_to_time(&self.last_cleanup_cycle_ms),
        }
    }
}

fn millis_to_time(ms: &AtomicI64) -> Option<DateTime<Utc>> {
    let v = ms.load(Ordering::Relaxed);
    if v == 0 {
        None
    } else {
        DateTime::from_timestamp_millis(v)
    }
}
