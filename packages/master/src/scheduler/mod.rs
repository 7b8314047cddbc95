//! The three scheduler loops.
//!
//! Assignment, health and cleanup run as independent services sharing
//! nothing but the store and a metrics sink. Each loop finishes its
//! current cycle before honoring the next tick; a slow cycle skips the
//! ticks it overlapped instead of piling up. Errors inside a cycle are
//! logged and retried on the next tick; a single job's failure never
//! stalls a loop, and nothing in here panics.

mod assignment;
mod cleanup;
mod health;
mod metrics;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use ffrtmp_core::{RetryPolicy, Store};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub use metrics::{MetricsSnapshot, SchedulerMetrics};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub assignment_interval: Duration,
    pub health_interval: Duration,
    pub cleanup_interval: Duration,
    /// A worker missing heartbeats for this long is marked offline.
    pub worker_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            assignment_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(10),
            worker_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared state of the three loops. Cheap to clone; all fields are
/// handles.
#[derive(Clone)]
pub struct Scheduler {
    store: Arc<dyn Store>,
    config: SchedulerConfig,
    metrics: Arc<SchedulerMetrics>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            store,
            config,
            metrics: Arc::new(SchedulerMetrics::default()),
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        self.metrics.clone()
    }

    /// The three loops as host services.
    pub fn services(&self) -> (AssignmentLoop, HealthLoop, CleanupLoop) {
        (
            AssignmentLoop(self.clone()),
            HealthLoop(self.clone()),
            CleanupLoop(self.clone()),
        )
    }
}

/// One cycle per tick until cancelled; the tick after a slow cycle is
/// skipped rather than queued, and overruns are logged.
macro_rules! loop_service {
    ($ty:ident, $name:literal, $interval:ident, $cycle:ident) => {
        pub struct $ty(Scheduler);

        #[async_trait]
        impl crate::service::Service for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            async fn run(self: Box<Self>, shutdown: CancellationToken) -> Result<()> {
                let scheduler = self.0;
                let period = scheduler.config.$interval;
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            debug!(loop_name = $name, "loop stopping");
                            return Ok(());
                        }
                        _ = ticker.tick() => {}
                    }

                    let started = std::time::Instant::now();
                    if let Err(e) = scheduler.$cycle().await {
                        warn!(loop_name = $name, error = %e, "cycle failed, will retry on next tick");
                    }
                    let elapsed = started.elapsed();
                    if elapsed > period {
                        warn!(
                            loop_name = $name,
                            elapsed_ms = elapsed.as_millis() as u64,
                            period_ms = period.as_millis() as u64,
                            "cycle overran its period"
                        );
                    }
                }
            }
        }
    };
}

loop_service!(AssignmentLoop, "scheduler-assignment", assignment_interval, run_assignment_cycle);
loop_service!(HealthLoop, "scheduler-health", health_interval, run_health_cycle);
loop_service!(CleanupLoop, "scheduler-cleanup", cleanup_interval, run_cleanup_cycle);
