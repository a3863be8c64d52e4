//! Managed Worker (C6): binds one stage name to one job-queue consumer,
//! acquiring a slot through the pool manager per job.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use pipeline_contracts::error::{PipelineError, Result};
use pipeline_contracts::events::EventBus;
use pipeline_contracts::prelude::{JobQueue, Lease, PipelineEvent};
use pipeline_model::{Job, StageName};

use crate::worker_pool::WorkerPoolManager;

/// Domain logic for one stage, composed over by the checkpoint/outbox
/// middleware rather than bolted on via monkey-patching ("Runtime
/// monkey-patching... replace with a decorator or middleware interface").
#[async_trait::async_trait]
pub trait StageHandler: Send + Sync {
    async fn handle(&self, job: &Job, cancel: tokio_util::sync::CancellationToken) -> Result<()>;
}

/// One worker per stage: pulls leases from its queue, runs them through the
/// pool manager, and acks/nacks based on the outcome.
pub struct ManagedWorker {
    stage: StageName,
    queue: Arc<dyn JobQueue>,
    pool: Arc<WorkerPoolManager>,
    handler: Arc<dyn StageHandler>,
    events: Arc<dyn EventBus>,
    shutting_down: AtomicBool,
    poll_interval: Duration,
    reserve_batch: usize,
}

impl ManagedWorker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        pool: Arc<WorkerPoolManager>,
        handler: Arc<dyn StageHandler>,
        events: Arc<dyn EventBus>,
        poll_interval: Duration,
        reserve_batch: usize,
    ) -> Self {
        Self {
            stage: queue.stage(),
            queue,
            pool,
            handler,
            events,
            shutting_down: AtomicBool::new(false),
            poll_interval,
            reserve_batch,
        }
    }

    /// Drives the worker's poll loop until `shutdown` is requested. Intended
    /// to run as its own task; `pipeline-runner` spawns one per registered
    /// stage.
    pub async fn run(&self) {
        loop {
            if self.shutting_down.load(Ordering::SeqCst) {
                return;
            }
            match self.queue.reserve(self.reserve_batch).await {
                Ok(leases) if leases.is_empty() => {
                    tokio::time::sleep(self.poll_interval).await;
                }
                Ok(leases) => {
                    for lease in leases {
                        self.process(lease).await;
                    }
                }
                Err(err) => {
                    tracing::warn!(stage = %self.stage, error = %err, "reserve failed");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn process(&self, lease: Lease) {
        let job = lease.job.clone();
        self.events.publish(PipelineEvent::JobStarted {
            run_id: job.run_id,
            job_id: job.id,
            stage: self.stage,
        });

        let started = Instant::now();
        let handler = self.handler.clone();
        let job_for_op = job.clone();
        let result = self
            .pool
            .execute_with_management(self.stage, move |cancel| {
                let handler = handler.clone();
                let job = job_for_op.clone();
                async move { handler.handle(&job, cancel).await }
            })
            .await;

        match result {
            Ok(()) => {
                self.events.publish(PipelineEvent::JobCompleted {
                    run_id: job.run_id,
                    job_id: job.id,
                    stage: self.stage,
                    duration_ms: started.elapsed().as_millis() as u64,
                });
                if let Err(err) = self.queue.ack(lease).await {
                    tracing::error!(stage = %self.stage, job_id = %job.id, error = %err, "ack failed");
                }
            }
            Err(err) => {
                let fast_fail = matches!(err, PipelineError::CircuitOpen(_) | PipelineError::Cancelled(_));
                self.events.publish(PipelineEvent::JobFailed {
                    run_id: job.run_id,
                    job_id: job.id,
                    stage: self.stage,
                    attempt: job.attempts,
                    error: err.to_string(),
                });
                let requeue = !fast_fail;
                if let Err(nack_err) = self.queue.nack(lease, requeue).await {
                    tracing::error!(stage = %self.stage, job_id = %job.id, error = %nack_err, "nack failed");
                }
            }
        }
    }

    /// Drains in-flight jobs up to `timeout` ("Shutdown drains
    /// in-flight jobs up to `worker.shutdown` timeout").
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.pool.shutdown(timeout).await;
    }

    pub fn stage(&self) -> StageName {
        self.stage
    }
}
