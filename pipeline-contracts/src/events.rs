use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pipeline_model::{BreakerState, CheckpointStage, JobId, RunId, StageName};

/// Everything the coordinator, worker pool, and observability surface emit.
/// One flat enum rather than separate `JobEventPublisher`/`ScanEventPublisher`
/// marker traits — this workspace has a single event stream instead of
/// per-subsystem publisher traits, so the generalization collapses them
/// into one [`EventBus`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum PipelineEvent {
    JobEnqueued {
        run_id: RunId,
        job_id: JobId,
        stage: StageName,
    },
    JobStarted {
        run_id: RunId,
        job_id: JobId,
        stage: StageName,
    },
    JobCompleted {
        run_id: RunId,
        job_id: JobId,
        stage: StageName,
        duration_ms: u64,
    },
    JobFailed {
        run_id: RunId,
        job_id: JobId,
        stage: StageName,
        attempt: u16,
        error: String,
    },
    BreakerStateChanged {
        stage: StageName,
        from: BreakerState,
        to: BreakerState,
    },
    ConcurrencyChanged {
        stage: StageName,
        old: usize,
        new: usize,
        reason: String,
    },
    StageDrained {
        run_id: RunId,
        stage: StageName,
    },
    CheckpointRecorded {
        run_id: RunId,
        entity_id: String,
        stage: CheckpointStage,
    },
    CheckpointInvalidated {
        run_id: RunId,
        entity_id: String,
        stage: CheckpointStage,
    },
    OutboxPublished {
        run_id: RunId,
        outbox_id: pipeline_model::OutboxId,
    },
    OutboxFailed {
        run_id: RunId,
        outbox_id: pipeline_model::OutboxId,
        error: String,
    },
    SystemAlert {
        stage: StageName,
        metric: String,
        level: String,
        value: f64,
    },
    PipelineCompleted {
        run_id: RunId,
    },
    PipelineFailed {
        run_id: RunId,
        reason: String,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            PipelineEvent::JobEnqueued { run_id, .. }
            | PipelineEvent::JobStarted { run_id, .. }
            | PipelineEvent::JobCompleted { run_id, .. }
            | PipelineEvent::JobFailed { run_id, .. }
            | PipelineEvent::StageDrained { run_id, .. }
            | PipelineEvent::CheckpointRecorded { run_id, .. }
            | PipelineEvent::CheckpointInvalidated { run_id, .. }
            | PipelineEvent::OutboxPublished { run_id, .. }
            | PipelineEvent::OutboxFailed { run_id, .. }
            | PipelineEvent::PipelineCompleted { run_id }
            | PipelineEvent::PipelineFailed { run_id, .. } => *run_id,
            PipelineEvent::BreakerStateChanged { .. }
            | PipelineEvent::ConcurrencyChanged { .. }
            | PipelineEvent::SystemAlert { .. } => RunId::default(),
        }
    }
}

/// Envelope stamped with emission time, kept distinct from the event
/// payload so the bus's transport doesn't force a timestamp into every
/// variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineEventEnvelope {
    pub event: PipelineEvent,
    pub emitted_at: DateTime<Utc>,
}

/// Fan-out publish/subscribe surface over [`PipelineEvent`].
/// `pipeline-core` implements this over `tokio::sync::broadcast`; tests use
/// an in-memory `Vec`-backed fake.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: PipelineEvent);

    fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEventEnvelope>;
}
