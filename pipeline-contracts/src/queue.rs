use async_trait::async_trait;

use pipeline_model::{EnqueueOptions, Job, JobCounts, JobId, LeaseId, RunId, StageName};

use crate::error::Result;

/// A claimed job handed to a worker, paired with the lease that must be
/// renewed or released (`reserve`/`ack`/`nack`).
#[derive(Clone, Debug)]
pub struct Lease {
    pub id: LeaseId,
    pub job: Job,
}

/// The queue surface a worker pool drives: enqueue, reserve-with-lease,
/// ack/nack, and count introspection.
///
/// A single stage's queue is one implementor; `pipeline-core`'s worker pool
/// is generic over this trait so the Postgres-backed implementation and an
/// in-memory test fake are interchangeable.
#[async_trait]
pub trait JobQueue: Send + Sync {
    fn stage(&self) -> StageName;

    async fn enqueue(
        &self,
        run_id: RunId,
        job: Job,
        options: EnqueueOptions,
    ) -> Result<JobId>;

    /// Claim up to `max` ready jobs, granting each a lease that expires after
    /// `lease_duration` unless renewed or acked.
    async fn reserve(&self, max: usize) -> Result<Vec<Lease>>;

    async fn renew_lease(&self, lease: &Lease) -> Result<()>;

    async fn ack(&self, lease: Lease) -> Result<()>;

    /// Release a job back to the queue (or to failed, once retries are
    /// exhausted) after a worker reports an error (`nack`).
    async fn nack(&self, lease: Lease, requeue: bool) -> Result<()>;

    async fn job_counts(&self) -> Result<JobCounts>;

    /// Sweep leases past their expiry back to ready.
    async fn reclaim_expired_leases(&self) -> Result<u64>;
}
