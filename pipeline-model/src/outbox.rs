use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{OutboxId, RunId};

/// The event types a row can fan out to; mirrors the downstream queues,
/// one event type per stage this row feeds.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum OutboxEventType {
    DirectoryAggregation,
    DirectoryResolution,
    RelationshipResolution,
    Validation,
    Reconciliation,
    GraphIngestion,
}

impl OutboxEventType {
    pub fn queue_name(&self) -> &'static str {
        match self {
            OutboxEventType::DirectoryAggregation => "directory-aggregation-queue",
            OutboxEventType::DirectoryResolution => "directory-resolution-queue",
            OutboxEventType::RelationshipResolution => "relationship-resolution-queue",
            OutboxEventType::Validation => "validation-queue",
            OutboxEventType::Reconciliation => "reconciliation-queue",
            OutboxEventType::GraphIngestion => "graph-ingestion-queue",
        }
    }
}

/// `{id, runId, eventType, payload, status, attempts, createdAt,
/// publishedAt}`. `publishing` rows are claimed but not yet confirmed
/// delivered; only the stale-claim sweeper may move a row back from
/// `publishing` to `pending`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboxRow {
    pub id: OutboxId,
    pub run_id: RunId,
    pub event_type: OutboxEventType,
    /// Opaque bytes; producers never mutate a published row's payload.
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    /// Owner + expiry of the current claim, used by the stale-claim sweeper.
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    pub fn new(run_id: RunId, event_type: OutboxEventType, payload: serde_json::Value) -> Self {
        Self {
            id: OutboxId::new(),
            run_id,
            event_type,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            created_at: Utc::now(),
            published_at: None,
            claimed_by: None,
            claim_expires_at: None,
        }
    }

    /// The idempotency key consumers must dedupe on:
    /// `(runId, eventType, payload-derived key)`.
    pub fn idempotency_key(&self) -> String {
        let payload_hash = {
            use std::hash::{Hash, Hasher};
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            self.payload.to_string().hash(&mut hasher);
            hasher.finish()
        };
        format!("{}:{:?}:{:x}", self.run_id, self.event_type, payload_hash)
    }
}
