//! Worker-pool manager, queue, outbox, checkpoint, and monitoring core
//! (C1-C11). `pipeline-contracts` defines the trait seams; this crate
//! provides the implementations `pipeline-runner` wires together.

pub mod checkpoint;
pub mod circuit_breaker;
pub mod coordinator;
pub mod correlation;
pub mod events;
pub mod health_monitor;
pub mod managed_worker;
pub mod outbox;
pub mod queue;
pub mod rate_limiter;
pub mod system_monitor;
pub mod timeout_registry;
pub mod worker_pool;

/// Re-exports covering the common construction path: build a
/// [`worker_pool::WorkerPoolManager`] from a [`circuit_breaker::CircuitBreakerRegistry`]
/// and [`rate_limiter::RateLimiter`], register stages, then compose
/// [`managed_worker::ManagedWorker`]s over a [`queue::JobQueue`] and drive
/// them from a [`coordinator::PipelineCoordinator`].
pub mod prelude {
    pub use crate::checkpoint::{CheckpointManager, InMemoryCheckpointStore, PostgresCheckpointStore};
    pub use crate::circuit_breaker::{BreakerPermit, CircuitBreakerRegistry};
    pub use crate::coordinator::{DrainPolicy, InitialJobSpec, PipelineCoordinator};
    pub use crate::correlation::CorrelationCache;
    pub use crate::events::BroadcastEventBus;
    pub use crate::health_monitor::{HealthMonitor, HealthMonitorThresholds};
    pub use crate::managed_worker::{ManagedWorker, StageHandler};
    pub use crate::outbox::{InMemoryOutboxStore, OutboxPublisher, PostgresOutboxStore};
    pub use crate::queue::{InMemoryJobQueue, PostgresJobQueue};
    pub use crate::rate_limiter::{AcquireOutcome, RateLimiter};
    pub use crate::system_monitor::{MonitorThresholds, SystemMonitor};
    pub use crate::timeout_registry::{TimeoutCategory, TimeoutRegistry};
    pub use crate::worker_pool::{AdaptiveScalingPolicy, PoolStatus, WorkerPoolManager};
}
