use async_trait::async_trait;

use pipeline_model::{OutboxEventType, OutboxId, OutboxRow, RunId};

use crate::error::Result;

/// Transactional outbox persistence. Implementors must provide
/// atomic claim-and-flip semantics: two concurrent publishers may both call
/// [`OutboxStore::claim_pending`] but must never both receive the same row.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Insert a row in the same transaction as the caller's own write. Takes
    /// no transaction handle here because `pipeline-core`'s stage handlers
    /// write the outbox row through the same `sqlx::Transaction` they used
    /// for the entity write before committing (invariant 1).
    async fn append(
        &self,
        run_id: RunId,
        event_type: OutboxEventType,
        payload: serde_json::Value,
    ) -> Result<OutboxId>;

    /// Atomically claim up to `max` pending (or stale-claimed) rows for
    /// `claimant`, marking them `publishing` with a claim expiry.
    async fn claim_pending(&self, claimant: &str, max: usize) -> Result<Vec<OutboxRow>>;

    async fn mark_published(&self, id: OutboxId) -> Result<()>;

    async fn mark_failed(&self, id: OutboxId) -> Result<()>;

    /// Sweep rows whose claim has expired back to `pending`.
    async fn reclaim_stale_claims(&self) -> Result<u64>;
}
