//! End-to-end scheduler behavior against the in-memory store, driven one
//! cycle at a time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ffrtmp_core::{
    Capabilities, FailureReason, JobPriority, JobSpec, JobStatus, QueueClass, RetryPolicy, Store,
    StoreError, TimeoutPolicy, WorkerRegistration, WorkerStatus,
};
use master_core::{MemoryStore, Scheduler, SchedulerConfig};
use uuid::Uuid;

fn cpu_worker(name: &str) -> WorkerRegistration {
    WorkerRegistration {
        name: name.into(),
        address: format!("{name}:9000"),
        capabilities: Capabilities {
            cpu_threads: 8,
            cpu_model: "test-cpu".into(),
            ram_bytes: 16 << 30,
            has_gpu: false,
            gpu_type: None,
            gpu_capabilities: vec![],
            engines: vec![],
        },
    }
}

fn job_spec(queue: QueueClass, priority: JobPriority) -> JobSpec {
    JobSpec::builder()
        .scenario("vod-1080p")
        .queue(queue)
        .priority(priority)
        .build()
}

fn fast_scheduler(store: Arc<MemoryStore>) -> Scheduler {
    Scheduler::new(
        store,
        SchedulerConfig {
            worker_timeout: Duration::from_millis(150),
            retry: RetryPolicy {
                base: Duration::from_millis(10),
                multiplier: 2,
                cap: Duration::from_secs(1),
            },
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn scenario_gpu_job_on_cpu_only_cluster_is_rejected() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let worker = store.register_worker(cpu_worker("cpu-1")).await.unwrap();

    let mut params: HashMap<String, serde_json::Value> = HashMap::new();
    params.insert("codec".into(), "h264_nvenc".into());
    params.insert("bitrate".into(), "10M".into());
    let job = store
        .create_job(
            JobSpec::builder()
                .scenario("gpu-encode")
                .queue(QueueClass::Default)
                .priority(JobPriority::Medium)
                .params(params)
                .build(),
        )
        .await
        .unwrap();

    scheduler.run_assignment_cycle().await.unwrap();

    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.status, JobStatus::Rejected);
    assert_eq!(job.failure_reason, Some(FailureReason::CapabilityMismatch));
    assert_eq!(job.retry_count, 0);

    let worker = store.get_worker(worker.id).await.unwrap();
    assert_eq!(worker.status, WorkerStatus::Available);
    assert!(worker.current_job_id.is_none());

    // Rejection is final: no later cycle revives it.
    scheduler.run_assignment_cycle().await.unwrap();
    scheduler.run_cleanup_cycle().await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Rejected);
}

#[tokio::test]
async fn scenario_queue_class_ordering() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    store.register_worker(cpu_worker("w1")).await.unwrap();
    store.register_worker(cpu_worker("w2")).await.unwrap();

    let batch = store.create_job(job_spec(QueueClass::Batch, JobPriority::Medium)).await.unwrap();
    let default = store.create_job(job_spec(QueueClass::Default, JobPriority::Medium)).await.unwrap();
    let live = store.create_job(job_spec(QueueClass::Live, JobPriority::Medium)).await.unwrap();

    scheduler.run_assignment_cycle().await.unwrap();

    assert_eq!(store.get_job(live.id).await.unwrap().status, JobStatus::Assigned);
    assert_eq!(store.get_job(default.id).await.unwrap().status, JobStatus::Assigned);
    assert_eq!(store.get_job(batch.id).await.unwrap().status, JobStatus::Queued);

    // Completing the default job frees a worker; the batch job rides the
    // next cycle.
    let default_job = store.get_job(default.id).await.unwrap();
    let worker_id = default_job.worker_id.unwrap();
    store.transition_job(default.id, JobStatus::Running, "claimed").await.unwrap();
    store.complete_job(default.id, worker_id).await.unwrap();

    scheduler.run_assignment_cycle().await.unwrap();
    assert_eq!(store.get_job(batch.id).await.unwrap().status, JobStatus::Assigned);
}

#[tokio::test]
async fn scenario_fifo_within_equal_priority() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    store.register_worker(cpu_worker("w1")).await.unwrap();

    let first = store.create_job(job_spec(QueueClass::Default, JobPriority::Low)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = store.create_job(job_spec(QueueClass::Default, JobPriority::Low)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let third = store.create_job(job_spec(QueueClass::Default, JobPriority::Low)).await.unwrap();

    scheduler.run_assignment_cycle().await.unwrap();

    assert_eq!(store.get_job(first.id).await.unwrap().status, JobStatus::Assigned);
    assert_eq!(store.get_job(second.id).await.unwrap().status, JobStatus::Queued);
    assert_eq!(store.get_job(third.id).await.unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn scenario_orphan_recovery_with_retry() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let w1 = store.register_worker(cpu_worker("w1")).await.unwrap();
    let job = store.create_job(job_spec(QueueClass::Default, JobPriority::Medium)).await.unwrap();

    scheduler.run_assignment_cycle().await.unwrap();
    store.transition_job(job.id, JobStatus::Running, "claimed").await.unwrap();

    // Freeze heartbeats past the worker timeout.
    tokio::time::sleep(Duration::from_millis(200)).await;
    scheduler.run_health_cycle().await.unwrap();
    assert_eq!(store.get_worker(w1.id).await.unwrap().status, WorkerStatus::Offline);

    scheduler.run_cleanup_cycle().await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Retrying);

    // Backoff (10ms base) elapses; the next cleanup pass re-queues.
    tokio::time::sleep(Duration::from_millis(30)).await;
    scheduler.run_cleanup_cycle().await.unwrap();
    let requeued = store.get_job(job.id).await.unwrap();
    assert_eq!(requeued.status, JobStatus::Queued);
    assert_eq!(requeued.retry_count, 1);
    assert!(requeued.worker_id.is_none());

    // A fresh worker picks it up and completes it.
    let w2 = store.register_worker(cpu_worker("w2")).await.unwrap();
    scheduler.run_assignment_cycle().await.unwrap();
    let assigned = store.get_job(job.id).await.unwrap();
    assert_eq!(assigned.status, JobStatus::Assigned);
    assert_eq!(assigned.worker_id, Some(w2.id));

    store.transition_job(job.id, JobStatus::Running, "claimed").await.unwrap();
    store.complete_job(job.id, w2.id).await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn scenario_idempotent_completion() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let worker = store.register_worker(cpu_worker("w1")).await.unwrap();
    let job = store.create_job(job_spec(QueueClass::Default, JobPriority::Medium)).await.unwrap();

    scheduler.run_assignment_cycle().await.unwrap();
    store.transition_job(job.id, JobStatus::Running, "claimed").await.unwrap();

    let first = store.complete_job(job.id, worker.id).await.unwrap();
    let second = store.complete_job(job.id, worker.id).await.unwrap();
    assert!(first);
    assert!(!second);

    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Completed);
    assert_eq!(store.get_worker(worker.id).await.unwrap().status, WorkerStatus::Available);
}

#[tokio::test]
async fn scenario_retry_cap_exhaustion_through_worker_deaths() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let job = store
        .create_job(
            JobSpec::builder()
                .scenario("flaky")
                .queue(QueueClass::Default)
                .priority(JobPriority::Medium)
                .max_retries(2u32)
                .build(),
        )
        .await
        .unwrap();

    let mut retrying_intervals = 0;
    for round in 0..3 {
        let worker = store
            .register_worker(cpu_worker(&format!("w{round}")))
            .await
            .unwrap();
        scheduler.run_assignment_cycle().await.unwrap();
        assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Assigned);
        store.transition_job(job.id, JobStatus::Running, "claimed").await.unwrap();

        // Kill the worker mid-execution.
        tokio::time::sleep(Duration::from_millis(200)).await;
        scheduler.run_health_cycle().await.unwrap();
        assert_eq!(store.get_worker(worker.id).await.unwrap().status, WorkerStatus::Offline);

        scheduler.run_cleanup_cycle().await.unwrap();
        let current = store.get_job(job.id).await.unwrap();
        if current.status == JobStatus::Retrying {
            retrying_intervals += 1;
        }
        // Invariant at every point in the churn.
        assert!(current.retry_count <= current.max_retries);

        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.run_cleanup_cycle().await.unwrap();
    }

    let final_job = store.get_job(job.id).await.unwrap();
    assert_eq!(final_job.status, JobStatus::Failed);
    assert_eq!(final_job.retry_count, 2);
    assert!(retrying_intervals >= 2);
}

#[tokio::test]
async fn boundary_empty_cluster_keeps_jobs_queued() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let mut params: HashMap<String, serde_json::Value> = HashMap::new();
    params.insert("codec".into(), "h264_nvenc".into());
    let job = store
        .create_job(JobSpec::builder().scenario("gpu").params(params).build())
        .await
        .unwrap();

    scheduler.run_assignment_cycle().await.unwrap();
    // No cluster to measure against: not rejected, still queued.
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Queued);
}

#[tokio::test]
async fn boundary_rejected_jobs_never_transition_again() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());
    store.register_worker(cpu_worker("cpu-1")).await.unwrap();

    let mut params: HashMap<String, serde_json::Value> = HashMap::new();
    params.insert("codec".into(), "hevc_nvenc".into());
    let job = store
        .create_job(JobSpec::builder().scenario("gpu").params(params).build())
        .await
        .unwrap();
    scheduler.run_assignment_cycle().await.unwrap();
    assert_eq!(store.get_job(job.id).await.unwrap().status, JobStatus::Rejected);

    for target in [JobStatus::Queued, JobStatus::Retrying, JobStatus::Canceled] {
        let err = store.transition_job(job.id, target, "poke").await.unwrap_err();
        assert!(matches!(err, StoreError::IllegalTransition(_)));
    }
    let job = store.get_job(job.id).await.unwrap();
    assert_eq!(job.retry_count, 0);
}

#[tokio::test]
async fn concurrent_completion_has_single_winner() {
    let store = Arc::new(MemoryStore::new());
    let scheduler = fast_scheduler(store.clone());

    let worker = store.register_worker(cpu_worker("w1")).await.unwrap();
    let job = store.create_job(job_spec(QueueClass::Default, JobPriority::Medium)).await.unwrap();
    scheduler.run_assignment_cycle().await.unwrap();
    store.transition_job(job.id, JobStatus::Running, "claimed").await.unwrap();

    let (a, b) = {
        let (s1, s2) = (store.clone(), store.clone());
        let (jid, wid): (Uuid, Uuid) = (job.id, worker.id);
        tokio::join!(
            tokio::spawn(async move { s1.complete_job(jid, wid).await }),
            tokio::spawn(async move { s2.complete_job(jid, wid).await }),
        )
    };
    let results = [a.unwrap(), b.unwrap()];
    assert!(results.iter().all(|r| r.is_ok()));
    let applied = results.into_iter().filter(|r| matches!(r, Ok(true))).count();
    assert_eq!(applied, 1);
}

#[tokio::test]
async fn live_jobs_survive_long_runtimes_with_activity() {
    let store = Arc::new(MemoryStore::with_policy(TimeoutPolicy {
        run_timeout: Duration::from_millis(100),
        activity_timeout: Duration::from_millis(100),
        scenario_overrides: HashMap::new(),
    }));
    let scheduler = fast_scheduler(store.clone());
    store.register_worker(cpu_worker("w1")).await.unwrap();

    let live = store.create_job(job_spec(QueueClass::Live, JobPriority::High)).await.unwrap();
    scheduler.run_assignment_cycle().await.unwrap();
    store.transition_job(live.id, JobStatus::Running, "claimed").await.unwrap();

    // Runtime exceeds run_timeout, but heartbeats keep flowing.
    for _ in 0..4 {
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.update_job_heartbeat(live.id, Some(50)).await.unwrap();
        scheduler.run_health_cycle().await.unwrap();
    }
    assert_eq!(store.get_job(live.id).await.unwrap().status, JobStatus::Running);

    // Silence past the activity threshold times it out.
    tokio::time::sleep(Duration::from_millis(150)).await;
    scheduler.run_health_cycle().await.unwrap();
    let timed = store.get_job(live.id).await.unwrap();
    assert_eq!(timed.status, JobStatus::Retrying);
    assert_eq!(timed.failure_reason, Some(FailureReason::Timeout));
}
