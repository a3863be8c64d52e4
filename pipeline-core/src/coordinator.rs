//! Pipeline Coordinator (C10): boots the stack in dependency order, runs
//! the initial job producer, detects drain, triggers the final graph build,
//! and shuts everything down in reverse dependency order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use pipeline_contracts::error::Result;
use pipeline_contracts::events::EventBus;
use pipeline_contracts::prelude::{JobQueue, OutboxStore, PipelineEvent};
use pipeline_model::{EntityKey, EnqueueOptions, Job, RunId, StageName};

use crate::checkpoint::CheckpointManager;
use crate::managed_worker::ManagedWorker;
use crate::outbox::OutboxPublisher;
use crate::worker_pool::WorkerPoolManager;

/// Drain-detection knobs: poll every `check_interval` for
/// `required_idle_checks` consecutive empty rounds before declaring drain.
#[derive(Clone, Copy, Debug)]
pub struct DrainPolicy {
    pub check_interval: Duration,
    pub required_idle_checks: u32,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(5),
            required_idle_checks: 3,
        }
    }
}

/// A file or directory seed handed to the initial producer that enqueues
/// the first jobs for a target directory.
#[derive(Clone, Debug)]
pub struct InitialJobSpec {
    pub entity_key: EntityKey,
    pub payload: serde_json::Value,
}

/// Callback invoked once drain is declared, synchronously, before shutdown
/// begins: runs the final graph build and prints its report.
pub type FinalBuildFn = Arc<dyn Fn(RunId) -> futures::future::BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct PipelineCoordinator {
    pool: Arc<WorkerPoolManager>,
    queues: HashMap<StageName, Arc<dyn JobQueue>>,
    workers: Vec<Arc<ManagedWorker>>,
    checkpoints: Arc<CheckpointManager>,
    outbox: Arc<dyn OutboxStore>,
    events: Arc<dyn EventBus>,
    drain_policy: DrainPolicy,
    shutdown_timeout: Duration,
    final_build: Option<FinalBuildFn>,
}

impl PipelineCoordinator {
    pub fn new(
        pool: Arc<WorkerPoolManager>,
        queues: HashMap<StageName, Arc<dyn JobQueue>>,
        workers: Vec<Arc<ManagedWorker>>,
        checkpoints: Arc<CheckpointManager>,
        outbox: Arc<dyn OutboxStore>,
        events: Arc<dyn EventBus>,
        drain_policy: DrainPolicy,
        shutdown_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            queues,
            workers,
            checkpoints,
            outbox,
            events,
            drain_policy,
            shutdown_timeout,
            final_build: None,
        }
    }

    pub fn with_final_build(mut self, f: FinalBuildFn) -> Self {
        self.final_build = Some(f);
        self
    }

    /// Enqueues the initial file-analysis jobs for `run_id`. The entry
    /// stage is always `FileAnalysis`; downstream stages are populated by
    /// C8 as outbox rows are published.
    pub async fn seed_initial_jobs(&self, run_id: RunId, specs: Vec<InitialJobSpec>) -> Result<usize> {
        let queue = self
            .queues
            .get(&StageName::FileAnalysis)
            .expect("FileAnalysis queue must be registered");
        let mut count = 0;
        for spec in specs {
            let job = Job::new(run_id, StageName::FileAnalysis, spec.entity_key, spec.payload);
            let job_id = job.id;
            queue.enqueue(run_id, job, EnqueueOptions::default()).await?;
            self.events.publish(PipelineEvent::JobEnqueued {
                run_id,
                job_id,
                stage: StageName::FileAnalysis,
            });
            count += 1;
        }
        Ok(count)
    }

    /// Spawns one task per managed worker plus the outbox publisher loop
    /// (boot order "C6" then "C8", already the last two steps of
    /// the documented boot sequence).
    pub fn spawn_workers(&self) -> Vec<JoinHandle<()>> {
        self.workers
            .iter()
            .map(|worker| {
                let worker = worker.clone();
                tokio::spawn(async move { worker.run().await })
            })
            .collect()
    }

    /// Polls every registered queue's counts until all have been empty for
    /// `requiredIdleChecks` consecutive polls, then returns.
    pub async fn await_drain(&self) -> Result<()> {
        let mut idle_streak = 0u32;
        loop {
            let mut all_drained = true;
            for queue in self.queues.values() {
                let counts = queue.job_counts().await?;
                if !counts.is_drained() {
                    all_drained = false;
                    break;
                }
            }
            if all_drained {
                idle_streak += 1;
                if idle_streak >= self.drain_policy.required_idle_checks {
                    return Ok(());
                }
            } else {
                idle_streak = 0;
            }
            tokio::time::sleep(self.drain_policy.check_interval).await;
        }
    }

    /// Drains, runs the final build, then shuts down workers, pool, outbox
    /// publishing, and queues in that order ("C6→C5→C8→C7→
    /// databases"). The outbox/queue layers have no explicit "stop" verb of
    /// their own in this design; their shutdown is simply ceasing to poll
    /// them, which happens once the worker and pool layers above are torn
    /// down.
    pub async fn run_to_drain_and_shutdown(&self, run_id: RunId) -> Result<()> {
        self.await_drain().await?;
        info!(run_id = %run_id, "pipeline drained, running final build");

        if let Some(final_build) = &self.final_build {
            final_build(run_id).await?;
        }

        for worker in &self.workers {
            worker.shutdown(self.shutdown_timeout).await;
        }
        self.pool.shutdown(self.shutdown_timeout).await;

        self.outbox.reclaim_stale_claims().await.ok();

        self.events.publish(PipelineEvent::PipelineCompleted { run_id });
        let overhead = self.checkpoints.overhead(run_id);
        info!(
            run_id = %run_id,
            checkpoint_ms = overhead.checkpoint_time_ms,
            pct = overhead.pct,
            "pipeline completed"
        );
        Ok(())
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn pool(&self) -> &Arc<WorkerPoolManager> {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use crate::outbox::InMemoryOutboxStore;
    use crate::queue::InMemoryJobQueue;
    use pipeline_model::Benchmarks;

    fn pool_for_test(events: Arc<dyn EventBus>) -> Arc<WorkerPoolManager> {
        use crate::circuit_breaker::CircuitBreakerRegistry;
        use crate::rate_limiter::RateLimiter;
        use crate::system_monitor::{MonitorThresholds, SystemMonitor};
        use crate::worker_pool::AdaptiveScalingPolicy;
        use pipeline_contracts::monitor::SystemMonitor as SystemMonitorTrait;
        use pipeline_model::{BreakerPolicy, RateLimitPolicy, RetryPolicy, StageDescriptor, StagePriority};

        let descriptor = StageDescriptor {
            name: StageName::FileAnalysis,
            min: 1,
            base: 2,
            max: 4,
            priority: StagePriority::clamped(5),
            rate_limit: RateLimitPolicy {
                capacity: 100.0,
                refill_per_second: 10.0,
                burst_capacity: 20.0,
                burst_window: Duration::from_secs(1),
            },
            breaker_policy: BreakerPolicy {
                failure_threshold: 5,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(10),
                half_open_max_calls: 1,
            },
            job_timeout: Duration::from_secs(5),
            retries: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_secs(1),
            },
        };

        let breakers = Arc::new(CircuitBreakerRegistry::new(HashMap::new(), events.clone()));
        let limiter = Arc::new(RateLimiter::new(HashMap::new()));
        let monitor: Arc<dyn SystemMonitorTrait> =
            Arc::new(SystemMonitor::new(MonitorThresholds::default(), events.clone()));
        let pool = Arc::new(WorkerPoolManager::new(
            10,
            breakers,
            limiter,
            monitor,
            events,
            AdaptiveScalingPolicy::default(),
            Duration::from_secs(2),
        ));
        pool.register_stage(descriptor).unwrap();
        pool
    }

    #[tokio::test]
    async fn seed_then_drain_on_empty_queue_returns_immediately() {
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new());
        let pool = pool_for_test(events.clone());
        let queue: Arc<dyn JobQueue> = Arc::new(InMemoryJobQueue::new(StageName::FileAnalysis, Duration::from_secs(30)));
        let mut queues = HashMap::new();
        queues.insert(StageName::FileAnalysis, queue.clone());

        let checkpoints = Arc::new(CheckpointManager::new(
            Arc::new(crate::checkpoint::InMemoryCheckpointStore::new()),
            events.clone(),
            Benchmarks::default(),
        ));
        let outbox: Arc<dyn OutboxStore> = Arc::new(InMemoryOutboxStore::new());

        let coordinator = PipelineCoordinator::new(
            pool,
            queues,
            Vec::new(),
            checkpoints,
            outbox,
            events,
            DrainPolicy {
                check_interval: Duration::from_millis(5),
                required_idle_checks: 2,
            },
            Duration::from_secs(1),
        );

        let run_id = RunId::new();
        coordinator.run_to_drain_and_shutdown(run_id).await.unwrap();
    }
}
