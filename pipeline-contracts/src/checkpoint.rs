use async_trait::async_trait;

use pipeline_model::{Checkpoint, CheckpointStage, RollbackOutcome, RunId, ValidationResult};

use crate::error::Result;

/// Checkpoint persistence and validation.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn record(&self, checkpoint: Checkpoint) -> Result<()>;

    async fn latest(&self, run_id: RunId, entity_id: &str) -> Result<Option<Checkpoint>>;

    async fn by_stage(&self, run_id: RunId, stage: CheckpointStage) -> Result<Vec<Checkpoint>>;

    /// Roll every checkpoint at or after `stage` for `entity_id` back to
    /// `invalidated`, returning what was undone (`rollback`).
    async fn rollback(
        &self,
        run_id: RunId,
        entity_id: &str,
        stage: CheckpointStage,
    ) -> Result<RollbackOutcome>;
}

/// Stage-specific validation rules a checkpoint manager consults before
/// accepting a checkpoint write. One implementor per
/// [`CheckpointStage`]; `pipeline-core` composes them behind a registry.
pub trait StageValidator: Send + Sync {
    fn stage(&self) -> CheckpointStage;

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult;
}
