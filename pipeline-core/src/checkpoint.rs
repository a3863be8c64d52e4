//! Checkpoint Manager (C9): per-entity progress ledger with stage-specific
//! validation, ordering enforcement, and rollback. The Postgres
//! implementation follows `persistence.rs`'s claim/transaction style; the
//! stage validators themselves are novel to this system.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::PgPool;
use uuid::Uuid;

use pipeline_contracts::error::{PipelineError, Result};
use pipeline_contracts::events::EventBus;
use pipeline_contracts::prelude::{CheckpointStore, PipelineEvent, StageValidator};
use pipeline_model::{
    Benchmarks, Checkpoint, CheckpointId, CheckpointOverhead, CheckpointStage, CheckpointStatus, RollbackOutcome,
    RunId, ValidationResult,
};

/// `FILE_LOADED`: path must be present, non-empty, and report a positive
/// size in the checkpoint metadata.
pub struct FileLoadedValidator;
impl StageValidator for FileLoadedValidator {
    fn stage(&self) -> CheckpointStage {
        CheckpointStage::FileLoaded
    }

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult {
        let path = metadata.get("filePath").and_then(|v| v.as_str());
        let size = metadata.get("sizeBytes").and_then(|v| v.as_u64());
        match (path, size) {
            (Some(p), Some(s)) if !p.is_empty() && s > 0 => ValidationResult::ok(),
            (None, _) | (Some(""), _) => ValidationResult::fail("filePath missing or empty"),
            _ => ValidationResult::fail("file size must be greater than zero"),
        }
    }
}

/// `ENTITIES_EXTRACTED`: at least one entity, each with `id`/`type`/`name`.
pub struct EntitiesExtractedValidator;
impl StageValidator for EntitiesExtractedValidator {
    fn stage(&self) -> CheckpointStage {
        CheckpointStage::EntitiesExtracted
    }

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult {
        let entities = metadata.get("entities").and_then(|v| v.as_array());
        let Some(entities) = entities else {
            return ValidationResult::fail("entities missing");
        };
        if entities.is_empty() {
            return ValidationResult::fail("entityCount must be greater than zero");
        }
        let mut reasons = Vec::new();
        for (i, e) in entities.iter().enumerate() {
            for field in ["id", "type", "name"] {
                if e.get(field).and_then(|v| v.as_str()).unwrap_or_default().is_empty() {
                    reasons.push(format!("entity[{i}] missing {field}"));
                }
            }
        }
        if reasons.is_empty() {
            ValidationResult::ok()
        } else {
            ValidationResult { valid: false, reasons }
        }
    }
}

/// `RELATIONSHIPS_BUILT`: every relationship has `from`/`to`/`type`, and
/// `type` is one of the five recognized kinds.
pub struct RelationshipsBuiltValidator;
impl StageValidator for RelationshipsBuiltValidator {
    fn stage(&self) -> CheckpointStage {
        CheckpointStage::RelationshipsBuilt
    }

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult {
        const KINDS: [&str; 5] = ["CALLS", "IMPORTS", "EXTENDS", "IMPLEMENTS", "USES"];
        let Some(rels) = metadata.get("relationships").and_then(|v| v.as_array()) else {
            return ValidationResult::fail("relationships missing");
        };
        let mut reasons = Vec::new();
        for (i, r) in rels.iter().enumerate() {
            let from = r.get("from").and_then(|v| v.as_str()).unwrap_or_default();
            let to = r.get("to").and_then(|v| v.as_str()).unwrap_or_default();
            let kind = r.get("type").and_then(|v| v.as_str()).unwrap_or_default();
            if from.is_empty() {
                reasons.push(format!("relationship[{i}] missing from"));
            }
            if to.is_empty() {
                reasons.push(format!("relationship[{i}] missing to"));
            }
            if !KINDS.contains(&kind) {
                reasons.push(format!("relationship[{i}] invalid type {kind:?}"));
            }
        }
        if reasons.is_empty() {
            ValidationResult::ok()
        } else {
            ValidationResult { valid: false, reasons }
        }
    }
}

/// `NEO4J_STORED`: the write must have created at least one node and one
/// relationship.
pub struct Neo4jStoredValidator;
impl StageValidator for Neo4jStoredValidator {
    fn stage(&self) -> CheckpointStage {
        CheckpointStage::Neo4jStored
    }

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult {
        let nodes = metadata.get("nodesCreated").and_then(|v| v.as_u64()).unwrap_or(0);
        let rels = metadata.get("relationshipsCreated").and_then(|v| v.as_u64()).unwrap_or(0);
        if nodes > 0 && rels > 0 {
            ValidationResult::ok()
        } else {
            ValidationResult::fail("nodesCreated and relationshipsCreated must both be greater than zero")
        }
    }
}

/// `PIPELINE_COMPLETE`: totals must clear the configured benchmarks
/// (defaults 300 nodes / 1600 relationships / 60s).
pub struct PipelineCompleteValidator {
    pub benchmarks: Benchmarks,
}

impl StageValidator for PipelineCompleteValidator {
    fn stage(&self) -> CheckpointStage {
        CheckpointStage::PipelineComplete
    }

    fn validate(&self, metadata: &serde_json::Value) -> ValidationResult {
        let total_nodes = metadata.get("totalNodes").and_then(|v| v.as_u64()).unwrap_or(0);
        let total_rels = metadata.get("totalRelationships").and_then(|v| v.as_u64()).unwrap_or(0);
        let duration_ms = metadata.get("durationMs").and_then(|v| v.as_u64()).unwrap_or(u64::MAX);

        let mut reasons = Vec::new();
        if total_nodes < self.benchmarks.min_nodes {
            reasons.push(format!("totalNodes {total_nodes} below minimum {}", self.benchmarks.min_nodes));
        }
        if total_rels < self.benchmarks.min_relationships {
            reasons.push(format!(
                "totalRelationships {total_rels} below minimum {}",
                self.benchmarks.min_relationships
            ));
        }
        if duration_ms > self.benchmarks.max_duration_ms {
            reasons.push(format!("duration {duration_ms}ms exceeds maximum {}ms", self.benchmarks.max_duration_ms));
        }
        if reasons.is_empty() {
            ValidationResult::ok()
        } else {
            ValidationResult { valid: false, reasons }
        }
    }
}

fn default_validators(benchmarks: Benchmarks) -> HashMap<CheckpointStage, Arc<dyn StageValidator>> {
    let mut map: HashMap<CheckpointStage, Arc<dyn StageValidator>> = HashMap::new();
    map.insert(CheckpointStage::FileLoaded, Arc::new(FileLoadedValidator));
    map.insert(CheckpointStage::EntitiesExtracted, Arc::new(EntitiesExtractedValidator));
    map.insert(CheckpointStage::RelationshipsBuilt, Arc::new(RelationshipsBuiltValidator));
    map.insert(CheckpointStage::Neo4jStored, Arc::new(Neo4jStoredValidator));
    map.insert(CheckpointStage::PipelineComplete, Arc::new(PipelineCompleteValidator { benchmarks }));
    map
}

/// In-memory checkpoint persistence, keyed by `(runId, entityId)` for
/// `latest` lookups and by stage for `byStage`. The cache IS the
/// store here; the Postgres implementation below keeps a parallel table.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    by_id: RwLock<HashMap<CheckpointId, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn record(&self, checkpoint: Checkpoint) -> Result<()> {
        self.by_id.write().insert(checkpoint.id, checkpoint);
        Ok(())
    }

    async fn latest(&self, run_id: RunId, entity_id: &str) -> Result<Option<Checkpoint>> {
        let guard = self.by_id.read();
        Ok(guard
            .values()
            .filter(|c| c.run_id == run_id && c.entity_id == entity_id && c.status != CheckpointStatus::Invalidated)
            .max_by_key(|c| c.created_at)
            .cloned())
    }

    async fn by_stage(&self, run_id: RunId, stage: CheckpointStage) -> Result<Vec<Checkpoint>> {
        let guard = self.by_id.read();
        Ok(guard.values().filter(|c| c.run_id == run_id && c.stage == stage).cloned().collect())
    }

    async fn rollback(&self, run_id: RunId, entity_id: &str, stage: CheckpointStage) -> Result<RollbackOutcome> {
        let mut guard = self.by_id.write();
        let target = guard
            .values()
            .find(|c| c.run_id == run_id && c.entity_id == entity_id && c.stage == stage)
            .cloned()
            .ok_or_else(|| PipelineError::CheckpointInvalid(vec![format!("no checkpoint at stage {stage:?} for {entity_id}")]))?;

        let mut invalidated_ids = Vec::new();
        for checkpoint in guard.values_mut() {
            if checkpoint.run_id == run_id
                && checkpoint.entity_id == entity_id
                && checkpoint.created_at > target.created_at
                && checkpoint.status != CheckpointStatus::Invalidated
            {
                checkpoint.status = CheckpointStatus::Invalidated;
                invalidated_ids.push(checkpoint.id);
            }
        }

        Ok(RollbackOutcome {
            rolled_back_to: target.id,
            invalidated_ids,
            next_stage: stage_after(stage),
        })
    }
}

fn stage_after(stage: CheckpointStage) -> Option<CheckpointStage> {
    let idx = CheckpointStage::ORDER.iter().position(|s| *s == stage)?;
    CheckpointStage::ORDER.get(idx + 1).copied()
}

/// Postgres-backed checkpoint persistence. Table shape:
/// `checkpoints(id, run_id, stage, entity_id, status, metadata jsonb,
/// validation_result jsonb, created_at, completed_at, failed_at)`, unique
/// on `(run_id, stage, entity_id)`.
pub struct PostgresCheckpointStore {
    pool: PgPool,
}

impl PostgresCheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn stage_str(stage: CheckpointStage) -> &'static str {
        match stage {
            CheckpointStage::FileLoaded => "file_loaded",
            CheckpointStage::EntitiesExtracted => "entities_extracted",
            CheckpointStage::RelationshipsBuilt => "relationships_built",
            CheckpointStage::Neo4jStored => "neo4j_stored",
            CheckpointStage::PipelineComplete => "pipeline_complete",
        }
    }

    fn stage_from_str(s: &str) -> CheckpointStage {
        match s {
            "file_loaded" => CheckpointStage::FileLoaded,
            "entities_extracted" => CheckpointStage::EntitiesExtracted,
            "relationships_built" => CheckpointStage::RelationshipsBuilt,
            "neo4j_stored" => CheckpointStage::Neo4jStored,
            _ => CheckpointStage::PipelineComplete,
        }
    }

    fn status_str(status: CheckpointStatus) -> &'static str {
        match status {
            CheckpointStatus::Pending => "pending",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
            CheckpointStatus::Invalidated => "invalidated",
        }
    }
}

#[async_trait]
impl CheckpointStore for PostgresCheckpointStore {
    async fn record(&self, checkpoint: Checkpoint) -> Result<()> {
        let validation_json = checkpoint.validation_result.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            INSERT INTO checkpoints (id, run_id, stage, entity_id, status, metadata, validation_result, created_at, completed_at, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (run_id, stage, entity_id)
            DO UPDATE SET status = EXCLUDED.status, metadata = EXCLUDED.metadata,
                          validation_result = EXCLUDED.validation_result,
                          completed_at = EXCLUDED.completed_at, failed_at = EXCLUDED.failed_at
            "#,
        )
        .bind(checkpoint.id.0)
        .bind(checkpoint.run_id.0)
        .bind(Self::stage_str(checkpoint.stage))
        .bind(&checkpoint.entity_id)
        .bind(Self::status_str(checkpoint.status))
        .bind(&checkpoint.metadata)
        .bind(validation_json)
        .bind(checkpoint.created_at)
        .bind(checkpoint.completed_at)
        .bind(checkpoint.failed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn latest(&self, run_id: RunId, entity_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT id, run_id, stage, entity_id, status, metadata, validation_result, created_at, completed_at, failed_at
            FROM checkpoints
            WHERE run_id = $1 AND entity_id = $2 AND status != 'invalidated'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(run_id.0)
        .bind(entity_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(CheckpointRow::into_model).transpose()
    }

    async fn by_stage(&self, run_id: RunId, stage: CheckpointStage) -> Result<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, CheckpointRow>(
            r#"
            SELECT id, run_id, stage, entity_id, status, metadata, validation_result, created_at, completed_at, failed_at
            FROM checkpoints
            WHERE run_id = $1 AND stage = $2
            "#,
        )
        .bind(run_id.0)
        .bind(Self::stage_str(stage))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CheckpointRow::into_model).collect()
    }

    async fn rollback(&self, run_id: RunId, entity_id: &str, stage: CheckpointStage) -> Result<RollbackOutcome> {
        let mut tx = self.pool.begin().await?;
        let target: Option<(Uuid, DateTime<Utc>)> = sqlx::query_as(
            "SELECT id, created_at FROM checkpoints WHERE run_id = $1 AND entity_id = $2 AND stage = $3",
        )
        .bind(run_id.0)
        .bind(entity_id)
        .bind(Self::stage_str(stage))
        .fetch_optional(&mut *tx)
        .await?;

        let (target_id, target_created_at) = target
            .ok_or_else(|| PipelineError::CheckpointInvalid(vec![format!("no checkpoint at stage {stage:?} for {entity_id}")]))?;

        let invalidated: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE checkpoints
            SET status = 'invalidated'
            WHERE run_id = $1 AND entity_id = $2 AND created_at > $3 AND status != 'invalidated'
            RETURNING id
            "#,
        )
        .bind(run_id.0)
        .bind(entity_id)
        .bind(target_created_at)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(RollbackOutcome {
            rolled_back_to: CheckpointId(target_id),
            invalidated_ids: invalidated.into_iter().map(CheckpointId).collect(),
            next_stage: stage_after(stage),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: Uuid,
    run_id: Uuid,
    stage: String,
    entity_id: String,
    status: String,
    metadata: serde_json::Value,
    validation_result: Option<serde_json::Value>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
}

impl CheckpointRow {
    fn into_model(self) -> Result<Checkpoint> {
        let status = match self.status.as_str() {
            "pending" => CheckpointStatus::Pending,
            "completed" => CheckpointStatus::Completed,
            "failed" => CheckpointStatus::Failed,
            _ => CheckpointStatus::Invalidated,
        };
        Ok(Checkpoint {
            id: CheckpointId(self.id),
            run_id: RunId(self.run_id),
            stage: PostgresCheckpointStore::stage_from_str(&self.stage),
            entity_id: self.entity_id,
            status,
            metadata: self.metadata,
            validation_result: self.validation_result.map(serde_json::from_value).transpose()?,
            created_at: self.created_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
        })
    }
}

/// Public entry point composing validators, ordering, and overhead tracking
/// over a [`CheckpointStore`]. `CheckpointStore` itself only
/// covers persistence; the manager adds the business rules.
pub struct CheckpointManager {
    store: Arc<dyn CheckpointStore>,
    validators: HashMap<CheckpointStage, Arc<dyn StageValidator>>,
    events: Arc<dyn EventBus>,
    overhead: RwLock<HashMap<RunId, (u64, u64)>>,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn CheckpointStore>, events: Arc<dyn EventBus>, benchmarks: Benchmarks) -> Self {
        Self {
            store,
            validators: default_validators(benchmarks),
            events,
            overhead: RwLock::new(HashMap::new()),
        }
    }

    /// Creates, validates, and records a checkpoint in one step, enforcing
    /// the canonical stage order ("A worker must not start stage
    /// `k`... unless the prior stage... is `completed`").
    pub async fn create(&self, run_id: RunId, stage: CheckpointStage, entity_id: String, metadata: serde_json::Value) -> Result<Checkpoint> {
        if let Some(predecessor) = stage.predecessor() {
            let prior = self.store.latest(run_id, &entity_id).await?;
            let satisfied = prior
                .as_ref()
                .map(|c| c.stage == predecessor && c.status == CheckpointStatus::Completed)
                .unwrap_or(false);
            if !satisfied {
                return Err(PipelineError::CheckpointInvalid(vec![format!(
                    "prerequisite stage {predecessor:?} not completed for {entity_id}"
                )]));
            }
        }

        let started = std::time::Instant::now();
        let mut checkpoint = Checkpoint::new(run_id, stage, entity_id, metadata);
        let result = self.validate(&checkpoint);
        checkpoint.validation_result = Some(result.clone());
        checkpoint.status = if result.valid { CheckpointStatus::Completed } else { CheckpointStatus::Failed };
        if result.valid {
            checkpoint.completed_at = Some(Utc::now());
        } else {
            checkpoint.failed_at = Some(Utc::now());
        }

        self.store.record(checkpoint.clone()).await?;
        self.record_overhead_sample(run_id, started.elapsed().as_millis() as u64);
        self.events.publish(PipelineEvent::CheckpointRecorded {
            run_id,
            entity_id: checkpoint.entity_id.clone(),
            stage,
        });
        Ok(checkpoint)
    }

    pub fn validate(&self, checkpoint: &Checkpoint) -> ValidationResult {
        match self.validators.get(&checkpoint.stage) {
            Some(validator) => validator.validate(&checkpoint.metadata),
            None => ValidationResult::fail(format!("no validator registered for {:?}", checkpoint.stage)),
        }
    }

    pub async fn get_by_run_stage(&self, run_id: RunId, stage: CheckpointStage) -> Result<Vec<Checkpoint>> {
        self.store.by_stage(run_id, stage).await
    }

    pub async fn get_latest(&self, run_id: RunId, entity_id: &str) -> Result<Option<Checkpoint>> {
        self.store.latest(run_id, entity_id).await
    }

    pub async fn rollback(&self, run_id: RunId, entity_id: &str, stage: CheckpointStage) -> Result<RollbackOutcome> {
        let outcome = self.store.rollback(run_id, entity_id, stage).await?;
        self.events.publish(PipelineEvent::CheckpointInvalidated {
            run_id,
            entity_id: entity_id.to_string(),
            stage,
        });
        Ok(outcome)
    }

    fn record_overhead_sample(&self, run_id: RunId, checkpoint_ms: u64) {
        let mut guard = self.overhead.write();
        let entry = guard.entry(run_id).or_insert((0, 0));
        entry.0 += checkpoint_ms;
    }

    /// Attributes `total_ms` of pipeline wall-clock to `run_id` so
    /// [`CheckpointManager::overhead`] can report what fraction of it went
    /// to checkpointing.
    pub fn record_run_duration(&self, run_id: RunId, total_ms: u64) {
        let mut guard = self.overhead.write();
        let entry = guard.entry(run_id).or_insert((0, 0));
        entry.1 = total_ms;
    }

    pub fn overhead(&self, run_id: RunId) -> CheckpointOverhead {
        let guard = self.overhead.read();
        let (checkpoint_ms, total_ms) = guard.get(&run_id).copied().unwrap_or((0, 0));
        let pct = if total_ms == 0 { 0.0 } else { checkpoint_ms as f64 / total_ms as f64 * 100.0 };
        CheckpointOverhead {
            checkpoint_time_ms: checkpoint_ms,
            total_ms,
            pct,
        }
    }
}

/// Interval between sweeps that age out old checkpoint overhead counters
/// (`cleanup`); `pipeline-runner` drives this, not the manager
/// itself, since cleanup needs direct store access the trait doesn't expose.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    struct NoopBus(broadcast::Sender<pipeline_contracts::events::PipelineEventEnvelope>);
    impl EventBus for NoopBus {
        fn publish(&self, _event: PipelineEvent) {}
        fn subscribe(&self) -> broadcast::Receiver<pipeline_contracts::events::PipelineEventEnvelope> {
            self.0.subscribe()
        }
    }

    fn manager() -> CheckpointManager {
        let (tx, _) = broadcast::channel(8);
        CheckpointManager::new(Arc::new(InMemoryCheckpointStore::new()), Arc::new(NoopBus(tx)), Benchmarks::default())
    }

    #[tokio::test]
    async fn create_rejects_skipped_predecessor() {
        let manager = manager();
        let run_id = RunId::new();
        let err = manager
            .create(run_id, CheckpointStage::EntitiesExtracted, "e1".into(), serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::CheckpointInvalid(_)));
    }

    #[tokio::test]
    async fn create_chain_succeeds_in_order() {
        let manager = manager();
        let run_id = RunId::new();
        manager
            .create(
                run_id,
                CheckpointStage::FileLoaded,
                "e1".into(),
                serde_json::json!({"filePath": "a.rs", "sizeBytes": 10}),
            )
            .await
            .unwrap();
        let cp = manager
            .create(
                run_id,
                CheckpointStage::EntitiesExtracted,
                "e1".into(),
                serde_json::json!({"entities": [{"id": "1", "type": "fn", "name": "f"}]}),
            )
            .await
            .unwrap();
        assert_eq!(cp.status, CheckpointStatus::Completed);
    }

    #[tokio::test]
    async fn rollback_invalidates_later_checkpoints() {
        let manager = manager();
        let run_id = RunId::new();
        manager
            .create(run_id, CheckpointStage::FileLoaded, "e1".into(), serde_json::json!({"filePath": "a.rs", "sizeBytes": 10}))
            .await
            .unwrap();
        let entities_cp = manager
            .create(
                run_id,
                CheckpointStage::EntitiesExtracted,
                "e1".into(),
                serde_json::json!({"entities": [{"id": "1", "type": "fn", "name": "f"}]}),
            )
            .await
            .unwrap();

        let outcome = manager.rollback(run_id, "e1", CheckpointStage::FileLoaded).await.unwrap();
        assert!(outcome.invalidated_ids.contains(&entities_cp.id));
        assert_eq!(outcome.next_stage, Some(CheckpointStage::EntitiesExtracted));
    }
}
