use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CheckpointId, RunId};

/// Canonical stage order for checkpoint progression.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CheckpointStage {
    FileLoaded,
    EntitiesExtracted,
    RelationshipsBuilt,
    Neo4jStored,
    PipelineComplete,
}

impl CheckpointStage {
    pub const ORDER: [CheckpointStage; 5] = [
        CheckpointStage::FileLoaded,
        CheckpointStage::EntitiesExtracted,
        CheckpointStage::RelationshipsBuilt,
        CheckpointStage::Neo4jStored,
        CheckpointStage::PipelineComplete,
    ];

    /// The stage immediately prior in canonical order, if any.
    pub fn predecessor(&self) -> Option<CheckpointStage> {
        let idx = Self::ORDER.iter().position(|s| s == self)?;
        idx.checked_sub(1).map(|i| Self::ORDER[i])
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum CheckpointStatus {
    Pending,
    Completed,
    Failed,
    Invalidated,
}

/// Result of stage-specific validation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub reasons: Vec<String>,
}

impl ValidationResult {
    pub fn ok() -> Self {
        Self {
            valid: true,
            reasons: Vec::new(),
        }
    }

    pub fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reasons: vec![reason.into()],
        }
    }

    pub fn merge(mut self, other: ValidationResult) -> Self {
        self.valid = self.valid && other.valid;
        self.reasons.extend(other.reasons);
        self
    }
}

/// `{id, runId, stage, entityId, status, metadata, validationResult,
/// createdAt, completedAt|failedAt}`. Unique on `(runId, stage, entityId)`.
/// Append-only except for `status`, `completedAt`, `failedAt`,
/// `validationResult`, and the `invalidated` flip driven by rollback.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub run_id: RunId,
    pub stage: CheckpointStage,
    pub entity_id: String,
    pub status: CheckpointStatus,
    pub metadata: Value,
    pub validation_result: Option<ValidationResult>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Checkpoint {
    pub fn new(run_id: RunId, stage: CheckpointStage, entity_id: String, metadata: Value) -> Self {
        Self {
            id: CheckpointId::new(),
            run_id,
            stage,
            entity_id,
            status: CheckpointStatus::Pending,
            metadata,
            validation_result: None,
            created_at: Utc::now(),
            completed_at: None,
            failed_at: None,
        }
    }
}

/// Benchmark thresholds a `PIPELINE_COMPLETE` checkpoint must satisfy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Benchmarks {
    pub min_nodes: u64,
    pub min_relationships: u64,
    pub max_duration_ms: u64,
}

impl Default for Benchmarks {
    fn default() -> Self {
        Self {
            min_nodes: 300,
            min_relationships: 1_600,
            max_duration_ms: 60_000,
        }
    }
}

/// Outcome of [`crate`]-level checkpoint rollback (`rollback`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RollbackOutcome {
    pub rolled_back_to: CheckpointId,
    pub invalidated_ids: Vec<CheckpointId>,
    pub next_stage: Option<CheckpointStage>,
}

/// `overhead(runId)` response.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct CheckpointOverhead {
    pub checkpoint_time_ms: u64,
    pub total_ms: u64,
    pub pct: f64,
}
