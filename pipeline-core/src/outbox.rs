//! Transactional Outbox Publisher (C8): claim-and-flip persistence for rows
//! written alongside an entity's own write, then fanned out to the stage
//! queue named by `eventType`. Follows `PostgresQueueService::enqueue_many`'s
//! transaction pattern (`ferrex-core::scan::orchestration::persistence`),
//! using runtime `sqlx::query`/`sqlx::query_as` rather than compile-time
//! `sqlx::query!` macros (see DESIGN.md).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;
use uuid::Uuid;

use pipeline_contracts::error::Result;
use pipeline_contracts::prelude::OutboxStore;
use pipeline_model::{OutboxEventType, OutboxId, OutboxRow, OutboxStatus, RunId};

/// Postgres-backed outbox. Table shape:
/// `outbox(id, run_id, event_type, payload jsonb, status, attempts,
/// created_at, published_at, claimed_by, claim_expires_at)`.
pub struct PostgresOutboxStore {
    pool: PgPool,
    claim_ttl: Duration,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool, claim_ttl: Duration) -> Self {
        Self { pool, claim_ttl }
    }

    fn event_type_str(event_type: OutboxEventType) -> &'static str {
        match event_type {
            OutboxEventType::DirectoryAggregation => "directory_aggregation",
            OutboxEventType::DirectoryResolution => "directory_resolution",
            OutboxEventType::RelationshipResolution => "relationship_resolution",
            OutboxEventType::Validation => "validation",
            OutboxEventType::Reconciliation => "reconciliation",
            OutboxEventType::GraphIngestion => "graph_ingestion",
        }
    }

    fn event_type_from_str(s: &str) -> OutboxEventType {
        match s {
            "directory_aggregation" => OutboxEventType::DirectoryAggregation,
            "directory_resolution" => OutboxEventType::DirectoryResolution,
            "relationship_resolution" => OutboxEventType::RelationshipResolution,
            "validation" => OutboxEventType::Validation,
            "reconciliation" => OutboxEventType::Reconciliation,
            _ => OutboxEventType::GraphIngestion,
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, run_id: RunId, event_type: OutboxEventType, payload: serde_json::Value) -> Result<OutboxId> {
        let id = OutboxId::new();
        sqlx::query(
            r#"
            INSERT INTO outbox (id, run_id, event_type, payload, status, attempts, created_at)
            VALUES ($1, $2, $3, $4, 'pending', 0, NOW())
            "#,
        )
        .bind(id.0)
        .bind(run_id.0)
        .bind(Self::event_type_str(event_type))
        .bind(&payload)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    async fn claim_pending(&self, claimant: &str, max: usize) -> Result<Vec<OutboxRow>> {
        let claim_expires_at = Utc::now() + chrono::Duration::from_std(self.claim_ttl).unwrap_or_default();
        let rows = sqlx::query_as::<_, OutboxRowSql>(
            r#"
            WITH claimed AS (
                SELECT id FROM outbox
                WHERE status = 'pending'
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE outbox
            SET status = 'publishing', claimed_by = $2, claim_expires_at = $3, attempts = attempts + 1
            FROM claimed
            WHERE outbox.id = claimed.id
            RETURNING outbox.id, outbox.run_id, outbox.event_type, outbox.payload, outbox.status,
                      outbox.attempts, outbox.created_at, outbox.published_at, outbox.claimed_by,
                      outbox.claim_expires_at
            "#,
        )
        .bind(max as i64)
        .bind(claimant)
        .bind(claim_expires_at)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(OutboxRowSql::into_model).collect())
    }

    async fn mark_published(&self, id: OutboxId) -> Result<()> {
        sqlx::query("UPDATE outbox SET status = 'published', published_at = NOW() WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, id: OutboxId) -> Result<()> {
        sqlx::query("UPDATE outbox SET status = 'failed' WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn reclaim_stale_claims(&self) -> Result<u64> {
        let affected = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', claimed_by = NULL, claim_expires_at = NULL
            WHERE status = 'publishing' AND claim_expires_at IS NOT NULL AND claim_expires_at < NOW()
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRowSql {
    id: Uuid,
    run_id: Uuid,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    created_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    claimed_by: Option<String>,
    claim_expires_at: Option<DateTime<Utc>>,
}

impl OutboxRowSql {
    fn into_model(self) -> OutboxRow {
        let status = match self.status.as_str() {
            "pending" => OutboxStatus::Pending,
            "publishing" => OutboxStatus::Publishing,
            "published" => OutboxStatus::Published,
            _ => OutboxStatus::Failed,
        };
        OutboxRow {
            id: OutboxId(self.id),
            run_id: RunId(self.run_id),
            event_type: PostgresOutboxStore::event_type_from_str(&self.event_type),
            payload: self.payload,
            status,
            attempts: self.attempts.max(0) as u32,
            created_at: self.created_at,
            published_at: self.published_at,
            claimed_by: self.claimed_by,
            claim_expires_at: self.claim_expires_at,
        }
    }
}

/// In-memory fake used by tests.
#[derive(Default)]
pub struct InMemoryOutboxStore {
    rows: Mutex<HashMap<OutboxId, OutboxRow>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, run_id: RunId, event_type: OutboxEventType, payload: serde_json::Value) -> Result<OutboxId> {
        let row = OutboxRow::new(run_id, event_type, payload);
        let id = row.id;
        self.rows.lock().await.insert(id, row);
        Ok(id)
    }

    async fn claim_pending(&self, claimant: &str, max: usize) -> Result<Vec<OutboxRow>> {
        let mut rows = self.rows.lock().await;
        let mut claimed = Vec::new();
        let mut ids: Vec<OutboxId> = rows
            .values()
            .filter(|r| r.status == OutboxStatus::Pending)
            .map(|r| r.id)
            .collect();
        ids.sort_by_key(|id| rows[id].created_at);
        for id in ids.into_iter().take(max) {
            if let Some(row) = rows.get_mut(&id) {
                row.status = OutboxStatus::Publishing;
                row.attempts += 1;
                row.claimed_by = Some(claimant.to_string());
                claimed.push(row.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(&self, id: OutboxId) -> Result<()> {
        if let Some(row) = self.rows.lock().await.get_mut(&id) {
            row.status = OutboxStatus::Published;
            row.published_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn mark_failed(&self, id: OutboxId) -> Result<()> {
        if let Some(row) = self.rows.lock().await.get_mut(&id) {
            row.status = OutboxStatus::Failed;
        }
        Ok(())
    }

    async fn reclaim_stale_claims(&self) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let now = Utc::now();
        let mut count = 0;
        for row in rows.values_mut() {
            if row.status == OutboxStatus::Publishing {
                if let Some(expires) = row.claim_expires_at {
                    if expires < now {
                        row.status = OutboxStatus::Pending;
                        row.claimed_by = None;
                        row.claim_expires_at = None;
                        count += 1;
                    }
                }
            }
        }
        Ok(count)
    }
}

/// Drains pending outbox rows and publishes each onto its destination queue
///. Takes a small publish function rather than a concrete queue
/// type so it can fan out across stage-specific `JobQueue` instances.
pub struct OutboxPublisher<F> {
    store: std::sync::Arc<dyn OutboxStore>,
    claimant: String,
    batch_size: usize,
    max_attempts: u32,
    publish: F,
}

impl<F> OutboxPublisher<F>
where
    F: Fn(&OutboxRow) -> Result<()> + Send + Sync,
{
    pub fn new(store: std::sync::Arc<dyn OutboxStore>, claimant: impl Into<String>, batch_size: usize, max_attempts: u32, publish: F) -> Self {
        Self {
            store,
            claimant: claimant.into(),
            batch_size,
            max_attempts,
            publish,
        }
    }

    /// One publish cycle: claim a batch, publish each row, flip status. On
    /// failure under `maxAttempts`, the row stays `publishing` until its
    /// claim expires and the sweeper returns it to `pending` for a later
    /// attempt ("backoff with attempt counter").
    pub async fn run_once(&self) -> Result<PublishCycleStats> {
        let rows = self.store.claim_pending(&self.claimant, self.batch_size).await?;
        let mut stats = PublishCycleStats::default();
        for row in &rows {
            match (self.publish)(row) {
                Ok(()) => {
                    self.store.mark_published(row.id).await?;
                    stats.published += 1;
                }
                Err(err) => {
                    if row.attempts >= self.max_attempts {
                        self.store.mark_failed(row.id).await?;
                        stats.failed += 1;
                    } else {
                        stats.retried += 1;
                    }
                    tracing::warn!(outbox_id = %row.id, attempts = row.attempts, error = %err, "outbox publish failed");
                }
            }
        }
        Ok(stats)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PublishCycleStats {
    pub published: u32,
    pub retried: u32,
    pub failed: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn append_then_claim_flips_to_publishing() {
        let store = InMemoryOutboxStore::new();
        let run_id = RunId::new();
        store.append(run_id, OutboxEventType::Validation, serde_json::json!({"k": 1})).await.unwrap();

        let claimed = store.claim_pending("worker-1", 10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].status, OutboxStatus::Publishing);

        let claimed_again = store.claim_pending("worker-2", 10).await.unwrap();
        assert!(claimed_again.is_empty(), "already-claimed row must not be claimed twice");
    }

    #[tokio::test]
    async fn publisher_flips_claimed_row_to_published_on_success() {
        let store = std::sync::Arc::new(InMemoryOutboxStore::new());
        let run_id = RunId::new();
        store.append(run_id, OutboxEventType::Reconciliation, serde_json::json!({})).await.unwrap();

        let publisher = OutboxPublisher::new(store.clone(), "worker-1", 10, 3, |_row| Ok(()));
        let stats = publisher.run_once().await.unwrap();
        assert_eq!(stats.published, 1);

        let claimed = store.claim_pending("worker-2", 10).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test]
    async fn publisher_marks_failed_after_max_attempts() {
        let store = std::sync::Arc::new(InMemoryOutboxStore::new());
        let run_id = RunId::new();
        store.append(run_id, OutboxEventType::GraphIngestion, serde_json::json!({})).await.unwrap();

        let publisher = OutboxPublisher::new(
            store.clone(),
            "worker-1",
            10,
            1,
            |_row| Err(pipeline_contracts::error::PipelineError::Internal("boom".into())),
        );
        let stats = publisher.run_once().await.unwrap();
        assert_eq!(stats.failed, 1);
    }
}
