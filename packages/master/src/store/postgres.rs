//! PostgreSQL-backed store.
//!
//! Rows carry the full entity as JSONB plus the columns the scheduler
//! sorts and filters on. Every compare-and-set runs in a transaction that
//! locks the affected row(s) with `SELECT … FOR UPDATE`; the transition
//! side-effect rules are the same Rust code the in-memory backend uses
//! ([`Job::apply_transition`]), applied between the lock and the write.
//!
//! Lock order is always job first, then worker, so concurrent assignment
//! and completion cannot deadlock.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ffrtmp_core::{
    FailureReason, Job, JobResult, JobSpec, JobStatus, ResourceSnapshot, Store, StoreError,
    TimeoutPolicy, Worker, WorkerRegistration, WorkerStatus,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

pub struct PgStore {
    pool: PgPool,
    timeouts: TimeoutPolicy,
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn codec_err(e: serde_json::Error) -> StoreError {
    StoreError::Backend(format!("row decode: {e}"))
}

fn status_str(s: JobStatus) -> String {
    s.to_string()
}

impl PgStore {
    pub async fn connect(database_url: &str, timeouts: TimeoutPolicy) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Ok(Self { pool, timeouts })
    }

    pub fn with_pool(pool: PgPool, timeouts: TimeoutPolicy) -> Self {
        Self { pool, timeouts }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    async fn load_job_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::JobNotFound(id))?;
        let data: serde_json::Value = row.get("data");
        serde_json::from_value(data).map_err(codec_err)
    }

    async fn save_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), StoreError> {
        sqlx::query("UPDATE jobs SET status = $2, data = $3 WHERE id = $1")
            .bind(job.id)
            .bind(status_str(job.status))
            .bind(serde_json::to_value(job).map_err(codec_err)?)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn load_worker_for_update(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
    ) -> Result<Worker, StoreError> {
        let row = sqlx::query("SELECT data FROM workers WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkerNotFound(id))?;
        let data: serde_json::Value = row.get("data");
        serde_json::from_value(data).map_err(codec_err)
    }

    async fn save_worker(
        tx: &mut Transaction<'_, Postgres>,
        worker: &Worker,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE workers SET status = $2, last_heartbeat = $3, data = $4 WHERE id = $1",
        )
        .bind(worker.id)
        .bind(format!("{:?}", worker.status).to_lowercase())
        .bind(worker.last_heartbeat)
        .bind(serde_json::to_value(worker).map_err(codec_err)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    /// Apply a transition inside an open transaction, mirroring the
    /// worker-side release when the job leaves its bound states.
    async fn transition_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        target: JobStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut job = Self::load_job_for_update(tx, id).await?;
        let bound_worker = job.worker_id;

        if !job.apply_transition(target, reason, now)? {
            return Ok(false);
        }
        if target == JobStatus::Running {
            let deadline = job.started_at.and_then(|s| self.timeouts.deadline_for(&job, s));
            job.timeout_at = deadline;
        }
        Self::save_job(tx, &job).await?;

        if !target.holds_worker() {
            if let Some(worker_id) = bound_worker {
                if let Ok(mut worker) = Self::load_worker_for_update(tx, worker_id).await {
                    if worker.current_job_id == Some(id) {
                        worker.current_job_id = None;
                        if worker.status == WorkerStatus::Busy {
                            worker.status = WorkerStatus::Available;
                        }
                        Self::save_worker(tx, &worker).await?;
                    }
                }
            }
        }

        Ok(true)
    }

    async fn fetch_jobs(&self, query: &str, bind_status: Option<String>) -> Result<Vec<Job>, StoreError> {
        let mut q = sqlx::query(query);
        if let Some(s) = bind_status {
            q = q.bind(s);
        }
        let rows = q.fetch_all(&self.pool).await.map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.get("data");
                serde_json::from_value(data).map_err(codec_err)
            })
            .collect()
    }
}

const ORDERED_BY_SCHEDULE: &str = r#"
    SELECT data FROM jobs
    WHERE status = $1
    ORDER BY
        CASE queue WHEN 'live' THEN 10 WHEN 'default' THEN 5 ELSE 1 END DESC,
        CASE priority WHEN 'high' THEN 3 WHEN 'medium' THEN 2 ELSE 1 END DESC,
        created_at ASC,
        seq ASC
"#;

#[async_trait]
impl Store for PgStore {
    async fn create_job(&self, spec: JobSpec) -> Result<Job, StoreError> {
        let seq: i64 =
            sqlx::query_scalar("SELECT nextval(pg_get_serial_sequence('jobs', 'seq'))")
                .fetch_one(&self.pool)
                .await
                .map_err(db_err)?;
        let job = Job::from_spec(spec, seq, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO jobs (id, seq, status, queue, priority, created_at, data)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(job.id)
        .bind(job.seq)
        .bind(status_str(job.status))
        .bind(format!("{:?}", job.queue).to_lowercase())
        .bind(format!("{:?}", job.priority).to_lowercase())
        .bind(job.created_at)
        .bind(serde_json::to_value(&job).map_err(codec_err)?)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(job)
    }

    async fn get_job(&self, id: Uuid) -> Result<Job, StoreError> {
        let row = sqlx::query("SELECT data FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::JobNotFound(id))?;
        let data: serde_json::Value = row.get("data");
        serde_json::from_value(data).map_err(codec_err)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.fetch_jobs("SELECT data FROM jobs ORDER BY seq ASC", None).await
    }

    async fn get_jobs_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        self.fetch_jobs(ORDERED_BY_SCHEDULE, Some(status_str(status))).await
    }

    async fn try_queue_pending(&self, id: Uuid) -> Result<bool, StoreError> {
        self.transition_job(id, JobStatus::Queued, "enqueued").await
    }

    async fn transition_job(
        &self,
        id: Uuid,
        target: JobStatus,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let applied = self.transition_in_tx(&mut tx, id, target, reason).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(applied)
    }

    async fn assign_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let mut job = Self::load_job_for_update(&mut tx, job_id).await?;
        if job.status == JobStatus::Assigned {
            if job.worker_id == Some(worker_id) {
                return Ok(false);
            }
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("already assigned to worker {:?}", job.worker_id),
            });
        }

        let mut worker = Self::load_worker_for_update(&mut tx, worker_id).await?;
        if worker.status != WorkerStatus::Available {
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("worker {} is {:?}", worker.name, worker.status),
            });
        }

        let reason = format!("assigned to {}", worker.name);
        if !job.apply_transition(JobStatus::Assigned, &reason, now)? {
            return Ok(false);
        }
        job.worker_id = Some(worker_id);
        job.worker_name = Some(worker.name.clone());
        worker.status = WorkerStatus::Busy;
        worker.current_job_id = Some(job_id);

        Self::save_job(&mut tx, &job).await?;
        Self::save_worker(&mut tx, &worker).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }

    async fn complete_job(&self, job_id: Uuid, worker_id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let job = Self::load_job_for_update(&mut tx, job_id).await?;
        if job.status == JobStatus::Completed {
            return Ok(false);
        }
        if job.worker_id != Some(worker_id) {
            return Err(StoreError::AssignConflict {
                job_id,
                detail: format!("job is not bound to worker {worker_id}"),
            });
        }
        let applied = self
            .transition_in_tx(&mut tx, job_id, JobStatus::Completed, "worker reported success")
            .await?;
        tx.commit().await.map_err(db_err)?;
        Ok(applied)
    }

    async fn update_job_heartbeat(
        &self,
        id: Uuid,
        progress: Option<u8>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = Self::load_job_for_update(&mut tx, id).await?;
        job.last_activity_at = Some(Utc::now());
        if let Some(p) = progress {
            job.progress = p.min(100);
        }
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn record_result(
        &self,
        id: Uuid,
        result: JobResult,
        failure_reason: Option<FailureReason>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut job = Self::load_job_for_update(&mut tx, id).await?;
        job.result = Some(result);
        if failure_reason.is_some() {
            job.failure_reason = failure_reason;
        }
        Self::save_job(&mut tx, &job).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn get_orphaned_jobs(&self, worker_timeout: Duration) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let mut bound = self
            .fetch_jobs(
                "SELECT data FROM jobs WHERE status IN ('assigned', 'running')",
                None,
            )
            .await?;
        let workers = self.get_all_workers().await?;

        bound.retain(|j| match j.worker_id {
            None => true,
            Some(wid) => match workers.iter().find(|w| w.id == wid) {
                None => true,
                Some(w) => {
                    w.status == WorkerStatus::Offline
                        || (now - w.last_heartbeat)
                            .to_std()
                            .map(|d| d >= worker_timeout)
                            .unwrap_or(false)
                }
            },
        });
        Ok(bound)
    }

    async fn get_timed_out_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let now = Utc::now();
        let running = self
            .fetch_jobs("SELECT data FROM jobs WHERE status = 'running'", None)
            .await?;
        Ok(running
            .into_iter()
            .filter(|j| self.timeouts.is_stale(j, now))
            .collect())
    }

    async fn get_retrying_jobs(&self) -> Result<Vec<Job>, StoreError> {
        self.get_jobs_by_status(JobStatus::Retrying).await
    }

    async fn register_worker(&self, reg: WorkerRegistration) -> Result<Worker, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let existing = sqlx::query("SELECT data FROM workers WHERE address = $1 FOR UPDATE")
            .bind(&reg.address)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;

        if let Some(row) = existing {
            let data: serde_json::Value = row.get("data");
            let mut worker: Worker = serde_json::from_value(data).map_err(codec_err)?;
            if worker.status != WorkerStatus::Offline {
                return Err(StoreError::DuplicateAddress(reg.address));
            }
            worker.name = reg.name;
            worker.capabilities = reg.capabilities;
            worker.status = WorkerStatus::Available;
            worker.current_job_id = None;
            worker.last_heartbeat = now;
            Self::save_worker(&mut tx, &worker).await?;
            tx.commit().await.map_err(db_err)?;
            return Ok(worker);
        }

        let worker = Worker::from_registration(reg, now);
        sqlx::query(
            r#"
            INSERT INTO workers (id, address, status, last_heartbeat, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(worker.id)
        .bind(&worker.address)
        .bind(format!("{:?}", worker.status).to_lowercase())
        .bind(worker.last_heartbeat)
        .bind(serde_json::to_value(&worker).map_err(codec_err)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(worker)
    }

    async fn get_worker(&self, id: Uuid) -> Result<Worker, StoreError> {
        let row = sqlx::query("SELECT data FROM workers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?
            .ok_or(StoreError::WorkerNotFound(id))?;
        let data: serde_json::Value = row.get("data");
        serde_json::from_value(data).map_err(codec_err)
    }

    async fn get_worker_by_address(&self, address: &str) -> Result<Option<Worker>, StoreError> {
        let row = sqlx::query("SELECT data FROM workers WHERE address = $1")
            .bind(address)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.map(|row| {
            let data: serde_json::Value = row.get("data");
            serde_json::from_value(data).map_err(codec_err)
        })
        .transpose()
    }

    async fn get_all_workers(&self) -> Result<Vec<Worker>, StoreError> {
        let rows = sqlx::query("SELECT data FROM workers ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;
        rows.into_iter()
            .map(|row| {
                let data: serde_json::Value = row.get("data");
                serde_json::from_value(data).map_err(codec_err)
            })
            .collect()
    }

    async fn get_available_workers(&self) -> Result<Vec<Worker>, StoreError> {
        Ok(self
            .get_all_workers()
            .await?
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
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut worker = Self::load_worker_for_update(&mut tx, id).await?;
        worker.last_heartbeat = Utc::now();
        worker.last_snapshot = Some(snapshot);
        match status {
            Some(WorkerStatus::Draining) => worker.status = WorkerStatus::Draining,
            _ => {
                if worker.status == WorkerStatus::Offline {
                    worker.status = WorkerStatus::Available;
                    worker.current_job_id = None;
                }
            }
        }
        Self::save_worker(&mut tx, &worker).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    async fn mark_worker_offline(&self, id: Uuid) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut worker = Self::load_worker_for_update(&mut tx, id).await?;
        if worker.status == WorkerStatus::Offline {
            return Ok(false);
        }
        worker.status = WorkerStatus::Offline;
        Self::save_worker(&mut tx, &worker).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(true)
    }
}
