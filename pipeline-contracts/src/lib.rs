//! Trait surfaces that describe interactions between the worker-pool core
//! and its persistence, monitoring, and event backends.

pub mod checkpoint;
pub mod error;
pub mod events;
pub mod monitor;
pub mod outbox;
pub mod queue;

/// Frequently used trait combinators for `pipeline-core` and `pipeline-runner`.
pub mod prelude {
    pub use super::checkpoint::{CheckpointStore, StageValidator};
    pub use super::error::{PipelineError, Result};
    pub use super::events::{EventBus, PipelineEvent, PipelineEventEnvelope};
    pub use super::monitor::{DependencyProbe, SystemMonitor, SystemProbe};
    pub use super::outbox::OutboxStore;
    pub use super::queue::{JobQueue, Lease};
}
