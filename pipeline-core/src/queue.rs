//! Queue Abstraction (C7): named persistent queues with add/consume/counts/
//! cleanup. The Postgres-backed implementation follows
//! `PostgresQueueService` (`ferrex-core::scan::orchestration::persistence`)
//! — same health-check-on-construct and `FOR UPDATE SKIP LOCKED` claim
//! pattern — but uses runtime-checked `sqlx::query`/`sqlx::query_as` rather
//! than its `sqlx::query!` macros, since this workspace has no committed
//! `.sqlx` offline-query cache and none can be generated without running
//! the toolchain (see DESIGN.md).

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use pipeline_contracts::error::{PipelineError, Result};
use pipeline_contracts::prelude::{JobQueue, Lease};
use pipeline_model::{EnqueueOptions, EntityKey, Job, JobCounts, JobId, JobStatus, LeaseId, RunId, StageName};

/// Postgres-backed queue for one stage. Table shape:
/// `jobs(id, run_id, stage, entity_key jsonb, payload jsonb, status,
/// attempts, created_at, updated_at, lease_id, lease_expires_at,
/// enqueue_options jsonb)`.
pub struct PostgresJobQueue {
    pool: PgPool,
    stage: StageName,
    lease_duration: Duration,
}

impl PostgresJobQueue {
    /// Verifies connectivity and the dequeue index exist before returning,
    /// mirroring `PostgresQueueService::new_with_retry`'s health check.
    pub async fn new(pool: PgPool, stage: StageName, lease_duration: Duration) -> Result<Self> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(|e| PipelineError::DependencyUnreachable("postgres".into(), e.to_string()))?;

        let idx_exists: Option<i32> = sqlx::query_scalar(
            "SELECT 1 FROM pg_indexes WHERE indexname = $1 LIMIT 1",
        )
        .bind("idx_jobs_stage_status_created_at")
        .fetch_optional(&pool)
        .await?;

        if idx_exists.is_none() {
            warn!("idx_jobs_stage_status_created_at missing; dequeue will table-scan until migrations run");
        }

        info!(stage = %stage, "queue connected to postgres");
        Ok(Self { pool, stage, lease_duration })
    }

    fn entity_key_json(key: &EntityKey) -> serde_json::Value {
        serde_json::to_value(key).expect("EntityKey always serializes")
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn enqueue(&self, run_id: RunId, job: Job, options: EnqueueOptions) -> Result<JobId> {
        let options_json = serde_json::to_value(&options)?;
        sqlx::query(
            r#"
            INSERT INTO jobs (id, run_id, stage, entity_key, payload, status, attempts, created_at, updated_at, enqueue_options)
            VALUES ($1, $2, $3, $4, $5, 'waiting', 0, $6, $6, $7)
            "#,
        )
        .bind(job.id.0)
        .bind(run_id.0)
        .bind(self.stage.queue_name())
        .bind(Self::entity_key_json(&job.entity_key))
        .bind(&job.payload)
        .bind(job.created_at)
        .bind(options_json)
        .execute(&self.pool)
        .await?;
        Ok(job.id)
    }

    async fn reserve(&self, max: usize) -> Result<Vec<Lease>> {
        let mut tx = self.pool.begin().await?;
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();

        let rows = sqlx::query_as::<_, JobRow>(
            r#"
            WITH claimed AS (
                SELECT id FROM jobs
                WHERE stage = $1 AND status = 'waiting'
                ORDER BY created_at
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs
            SET status = 'active', lease_id = gen_random_uuid(), lease_expires_at = $3,
                attempts = attempts + 1, updated_at = NOW()
            FROM claimed
            WHERE jobs.id = claimed.id
            RETURNING jobs.id, jobs.run_id, jobs.stage, jobs.entity_key, jobs.payload,
                      jobs.status, jobs.attempts, jobs.created_at, jobs.updated_at, jobs.lease_id
            "#,
        )
        .bind(self.stage.queue_name())
        .bind(max as i64)
        .bind(expires_at)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.into_iter().map(JobRow::into_lease).collect()
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();
        let affected = sqlx::query(
            "UPDATE jobs SET lease_expires_at = $1 WHERE id = $2 AND lease_id = $3",
        )
        .bind(expires_at)
        .bind(lease.job.id.0)
        .bind(lease.id.0)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if affected == 0 {
            return Err(PipelineError::LeaseExpired(lease.id.to_string()));
        }
        Ok(())
    }

    async fn ack(&self, lease: Lease) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', updated_at = NOW() WHERE id = $1 AND lease_id = $2",
        )
        .bind(lease.job.id.0)
        .bind(lease.id.0)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn nack(&self, lease: Lease, requeue: bool) -> Result<()> {
        if requeue {
            sqlx::query(
                "UPDATE jobs SET status = 'waiting', lease_id = NULL, lease_expires_at = NULL, updated_at = NOW() WHERE id = $1 AND lease_id = $2",
            )
            .bind(lease.job.id.0)
            .bind(lease.id.0)
            .execute(&self.pool)
            .await?;
        } else {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', updated_at = NOW() WHERE id = $1 AND lease_id = $2",
            )
            .bind(lease.job.id.0)
            .bind(lease.id.0)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT status, COUNT(*) FROM jobs WHERE stage = $1 GROUP BY status",
        )
        .bind(self.stage.queue_name())
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for (status, n) in rows {
            let n = n as u64;
            match status.as_str() {
                "active" => counts.active = n,
                "waiting" => counts.waiting = n,
                "delayed" => counts.delayed = n,
                "completed" => counts.completed = n,
                "failed" => counts.failed = n,
                _ => {}
            }
        }
        Ok(counts)
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'waiting', lease_id = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE stage = $1 AND status = 'active' AND lease_expires_at IS NOT NULL AND lease_expires_at < NOW()
            "#,
        )
        .bind(self.stage.queue_name())
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: uuid::Uuid,
    run_id: uuid::Uuid,
    stage: String,
    entity_key: serde_json::Value,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    lease_id: Option<uuid::Uuid>,
}

impl JobRow {
    fn into_lease(self) -> Result<Lease> {
        let entity_key: EntityKey = serde_json::from_value(self.entity_key)?;
        let status = match self.status.as_str() {
            "waiting" => JobStatus::Waiting,
            "delayed" => JobStatus::Delayed,
            "active" => JobStatus::Active,
            "completed" => JobStatus::Completed,
            _ => JobStatus::Failed,
        };
        let job = Job {
            id: JobId(self.id),
            run_id: RunId(self.run_id),
            stage: StageName::ALL
                .into_iter()
                .find(|s| s.queue_name() == self.stage)
                .unwrap_or(StageName::FileAnalysis),
            entity_key,
            payload: self.payload,
            status,
            attempts: self.attempts.max(0) as u16,
            created_at: self.created_at,
            updated_at: self.updated_at,
        };
        let lease_id = self
            .lease_id
            .map(LeaseId)
            .ok_or_else(|| PipelineError::Internal("reserved row missing lease_id".into()))?;
        Ok(Lease { id: lease_id, job })
    }
}

/// In-memory `JobQueue` fake used by tests and by `pipeline-runner` demo
/// runs without a database; a test double for the Postgres implementation
/// above.
pub struct InMemoryJobQueue {
    stage: StageName,
    inner: Mutex<InMemoryState>,
    lease_duration: Duration,
    sequence: AtomicU64,
}

struct InMemoryState {
    waiting: Vec<Job>,
    active: std::collections::HashMap<LeaseId, (Job, chrono::DateTime<Utc>)>,
    completed: u64,
    failed: u64,
}

impl InMemoryJobQueue {
    pub fn new(stage: StageName, lease_duration: Duration) -> Self {
        Self {
            stage,
            inner: Mutex::new(InMemoryState {
                waiting: Vec::new(),
                active: std::collections::HashMap::new(),
                completed: 0,
                failed: 0,
            }),
            lease_duration,
            sequence: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn enqueue(&self, _run_id: RunId, job: Job, _options: EnqueueOptions) -> Result<JobId> {
        self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut state = self.inner.lock().await;
        state.waiting.push(job.clone());
        Ok(job.id)
    }

    async fn reserve(&self, max: usize) -> Result<Vec<Lease>> {
        let mut state = self.inner.lock().await;
        let n = max.min(state.waiting.len());
        let claimed: Vec<Job> = state.waiting.drain(0..n).collect();
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();
        let mut leases = Vec::with_capacity(claimed.len());
        for mut job in claimed {
            job.mark_active();
            let lease = Lease {
                id: LeaseId::new(),
                job: job.clone(),
            };
            state.active.insert(lease.id, (job, expires_at));
            leases.push(lease);
        }
        Ok(leases)
    }

    async fn renew_lease(&self, lease: &Lease) -> Result<()> {
        let mut state = self.inner.lock().await;
        let expires_at = Utc::now() + chrono::Duration::from_std(self.lease_duration).unwrap_or_default();
        match state.active.get_mut(&lease.id) {
            Some((_, exp)) => {
                *exp = expires_at;
                Ok(())
            }
            None => Err(PipelineError::LeaseExpired(lease.id.to_string())),
        }
    }

    async fn ack(&self, lease: Lease) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.active.remove(&lease.id).is_some() {
            state.completed += 1;
        }
        Ok(())
    }

    async fn nack(&self, lease: Lease, requeue: bool) -> Result<()> {
        let mut state = self.inner.lock().await;
        if let Some((mut job, _)) = state.active.remove(&lease.id) {
            if requeue {
                job.status = JobStatus::Waiting;
                state.waiting.push(job);
            } else {
                job.mark_failed();
                state.failed += 1;
            }
        }
        Ok(())
    }

    async fn job_counts(&self) -> Result<JobCounts> {
        let state = self.inner.lock().await;
        Ok(JobCounts {
            active: state.active.len() as u64,
            waiting: state.waiting.len() as u64,
            delayed: 0,
            completed: state.completed,
            failed: state.failed,
        })
    }

    async fn reclaim_expired_leases(&self) -> Result<u64> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();
        let expired: Vec<LeaseId> = state
            .active
            .iter()
            .filter(|(_, (_, exp))| *exp < now)
            .map(|(id, _)| *id)
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            if let Some((mut job, _)) = state.active.remove(&id) {
                job.status = JobStatus::Waiting;
                state.waiting.push(job);
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_model::EntityKey;

    #[tokio::test]
    async fn reserve_then_ack_drains_waiting_and_bumps_completed() {
        let queue = InMemoryJobQueue::new(StageName::FileAnalysis, Duration::from_secs(30));
        let run_id = RunId::new();
        let job = Job::new(run_id, StageName::FileAnalysis, EntityKey::FilePath("a.rs".into()), serde_json::json!({}));
        queue.enqueue(run_id, job, EnqueueOptions::default()).await.unwrap();

        let leases = queue.reserve(10).await.unwrap();
        assert_eq!(leases.len(), 1);
        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.active, 1);

        queue.ack(leases.into_iter().next().unwrap()).await.unwrap();
        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.completed, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn nack_with_requeue_returns_job_to_waiting() {
        let queue = InMemoryJobQueue::new(StageName::Validation, Duration::from_secs(30));
        let run_id = RunId::new();
        let job = Job::new(run_id, StageName::Validation, EntityKey::FilePath("b.rs".into()), serde_json::json!({}));
        queue.enqueue(run_id, job, EnqueueOptions::default()).await.unwrap();

        let lease = queue.reserve(1).await.unwrap().remove(0);
        queue.nack(lease, true).await.unwrap();

        let counts = queue.job_counts().await.unwrap();
        assert_eq!(counts.waiting, 1);
        assert_eq!(counts.active, 0);
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_to_waiting() {
        let queue = InMemoryJobQueue::new(StageName::Reconciliation, Duration::from_millis(1));
        let run_id = RunId::new();
        let job = Job::new(run_id, StageName::Reconciliation, EntityKey::FilePath("c.rs".into()), serde_json::json!({}));
        queue.enqueue(run_id, job, EnqueueOptions::default()).await.unwrap();
        queue.reserve(1).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        let reclaimed = queue.reclaim_expired_leases().await.unwrap();
        assert_eq!(reclaimed, 1);
        assert_eq!(queue.job_counts().await.unwrap().waiting, 1);
    }
}
