//! The worker agent: registration, heartbeats, polling, execution,
//! drain-on-shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use ffrtmp_core::protocol::{HeartbeatRequest, RegisterRequest, ResultReport};
use ffrtmp_core::{Job, WorkerStatus};
use sysinfo::System;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capabilities::{self, Inventory};
use crate::client::MasterClient;
use crate::config::{default_max_concurrent, WorkerArgs};
use crate::executor;

/// Split so the binary can map failures onto its exit-code contract.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

/// Run the agent until the shutdown token fires.
pub async fn run(args: WorkerArgs, shutdown: CancellationToken) -> Result<(), AgentError> {
    let inventory = Inventory::new();
    let capabilities = capabilities::detect(&inventory, args.skip_encoder_probe).await;
    info!(
        threads = capabilities.cpu_threads,
        ram_gb = capabilities.ram_bytes >> 30,
        gpu = capabilities.has_gpu,
        encoders = ?capabilities.gpu_capabilities,
        engines = ?capabilities.engines,
        "local capabilities detected"
    );

    let client = Arc::new(
        MasterClient::new(&args.master_url, args.auth_token.clone())
            .map_err(|e| AgentError::Config(e.to_string()))?,
    );

    let name = args
        .name
        .clone()
        .or_else(System::host_name)
        .unwrap_or_else(|| "worker".to_string());
    let request = RegisterRequest {
        name: name.clone(),
        address: args.address.clone(),
        capabilities: capabilities.clone(),
    };

    let node_id = register(&client, &request, &args, &shutdown).await?;
    info!(node_id = %node_id, name = %name, "registered with master");

    let max_jobs = args
        .max_concurrent_jobs
        .unwrap_or_else(|| default_max_concurrent(capabilities.cpu_threads as usize, capabilities.has_gpu));
    info!(max_concurrent_jobs = max_jobs, "executor pool sized");

    let running = Arc::new(AtomicU32::new(0));
    let semaphore = Arc::new(Semaphore::new(max_jobs));

    // In-flight jobs observe their own token so that shutdown can stop the
    // poller immediately while still giving executors the drain interval.
    let job_cancel = CancellationToken::new();

    let heartbeats = tokio::spawn(heartbeat_loop(
        client.clone(),
        node_id,
        inventory,
        running.clone(),
        args.heartbeat_interval(),
        shutdown.clone(),
    ));

    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut poll = tokio::time::interval(args.poll_interval());
    poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = poll.tick() => {}
        }

        while in_flight.try_join_next().is_some() {}

        let Ok(permit) = semaphore.clone().try_acquire_owned() else {
            debug!("executor pool full, skipping poll");
            continue;
        };

        match client.next_job(node_id).await {
            Ok(Some(job)) => {
                running.fetch_add(1, Ordering::Relaxed);
                let client = client.clone();
                let running = running.clone();
                let cancel = job_cancel.clone();
                let hb_interval = args.job_heartbeat_interval();
                in_flight.spawn(async move {
                    run_job(client, node_id, job, cancel, hb_interval).await;
                    running.fetch_sub(1, Ordering::Relaxed);
                    drop(permit);
                });
            }
            Ok(None) => drop(permit),
            Err(e) => {
                warn!(error = %e, "job poll failed");
                drop(permit);
            }
        }
    }

    // Drain: in-flight work gets its interval, stragglers get canceled and
    // reported as such by their executors.
    let drain = args.drain_timeout();
    if !in_flight.is_empty() {
        info!(
            in_flight = running.load(Ordering::Relaxed),
            drain_secs = drain.as_secs(),
            "draining in-flight jobs"
        );
    }
    let drained = tokio::time::timeout(drain, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("drain deadline exceeded, canceling remaining jobs");
        job_cancel.cancel();
        let grace = tokio::time::timeout(Duration::from_secs(5), async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;
        if grace.is_err() {
            warn!("executors did not stop in time, abandoning them");
            in_flight.abort_all();
        }
    }

    // The heartbeat loop sends its final draining beat on cancellation.
    let _ = heartbeats.await;

    info!("worker agent stopped");
    Ok(())
}

/// Registration with the duplicate-address policy: a live worker on our
/// address fails startup unless `--takeover` tells us to wait for the
/// health loop to declare it dead.
async fn register(
    client: &MasterClient,
    request: &RegisterRequest,
    args: &WorkerArgs,
    shutdown: &CancellationToken,
) -> Result<Uuid, AgentError> {
    loop {
        match client.register(request).await {
            Ok(resp) => return Ok(resp.worker_id),
            Err(e) if e.status() == Some(409) => {
                if !args.takeover {
                    return Err(AgentError::Config(format!(
                        "address {} is already registered to a live worker (pass --takeover to wait for it to expire)",
                        request.address
                    )));
                }
                warn!(
                    address = %request.address,
                    "address held by a live worker, waiting for the master to free it"
                );
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        return Err(AgentError::Runtime(anyhow!("interrupted during registration")));
                    }
                    _ = tokio::time::sleep(Duration::from_secs(30)) => {}
                }
            }
            Err(e) => {
                return Err(AgentError::Runtime(
                    anyhow::Error::new(e).context("registration failed"),
                ));
            }
        }
    }
}

/// Periodic liveness with a resource snapshot; emits one final beat
/// advertising `draining` on the way out.
async fn heartbeat_loop(
    client: Arc<MasterClient>,
    node_id: Uuid,
    mut inventory: Inventory,
    running: Arc<AtomicU32>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let snapshot = inventory.snapshot(running.load(Ordering::Relaxed));
        if let Err(e) = client
            .heartbeat(node_id, &HeartbeatRequest { snapshot, status: None })
            .await
        {
            warn!(error = %e, "heartbeat failed");
        }
    }

    let snapshot = inventory.snapshot(running.load(Ordering::Relaxed));
    if let Err(e) = client
        .heartbeat(
            node_id,
            &HeartbeatRequest {
                snapshot,
                status: Some(WorkerStatus::Draining),
            },
        )
        .await
    {
        warn!(error = %e, "final draining heartbeat failed");
    }
}

/// Claim, execute with activity heartbeats, report. Mirrors the job's
/// lifecycle contract: claiming induces `Assigned -> Running`; the result
/// report induces the terminal transition on the master.
async fn run_job(
    client: Arc<MasterClient>,
    node_id: Uuid,
    job: Job,
    cancel: CancellationToken,
    hb_interval: Duration,
) {
    let job = match client.claim_job(job.id, node_id).await {
        Ok(job) => job,
        Err(e) => {
            // Most likely re-assigned while we were polling; drop it.
            warn!(job_id = %job.id, error = %e, "claim failed, skipping job");
            return;
        }
    };
    info!(job_id = %job.id, seq = job.seq, scenario = %job.scenario, "job claimed");

    let hb_cancel = CancellationToken::new();
    let heartbeat = {
        let client = client.clone();
        let cancel = hb_cancel.clone();
        let job_id = job.id;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(hb_interval);
            ticker.tick().await; // the claim itself just proved liveness
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = client.job_heartbeat(job_id, node_id, None).await {
                            warn!(job_id = %job_id, error = %e, "job heartbeat failed");
                        }
                    }
                }
            }
        })
    };

    let outcome = executor::execute(&job, &cancel).await;

    hb_cancel.cancel();
    let _ = heartbeat.await;

    let report = ResultReport {
        job_id: job.id,
        node_id,
        status: outcome.status,
        failure_reason: outcome.failure_reason,
        metrics: outcome.metrics,
        quality_score: None,
        efficiency_score: None,
        logs: outcome.logs,
        error: outcome.error,
    };
    match client.report_result(&report).await {
        Ok(()) => info!(job_id = %job.id, status = ?report.status, "result reported"),
        // The master's orphan recovery covers us if this never lands.
        Err(e) => error!(job_id = %job.id, error = %e, "failed to report result"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_error_distinguishes_config() {
        let e = AgentError::Config("bad flag".into());
        assert!(matches!(e, AgentError::Config(_)));
        let e: AgentError = anyhow!("boom").into();
        assert!(matches!(e, AgentError::Runtime(_)));
    }
}
