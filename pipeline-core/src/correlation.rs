//! Correlation id propagation cache, ported directly from
//! `scan::orchestration::correlation::CorrelationCache` with `JobId` swapped
//! for this workspace's `pipeline_model::JobId`. Threads a correlation id
//! across job retries and outbox events, the way every job log line in the
//! source system carries one.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use pipeline_model::JobId;

#[derive(Clone, Default, Debug)]
pub struct CorrelationCache {
    inner: Arc<Mutex<HashMap<JobId, Uuid>>>,
}

impl CorrelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn remember(&self, job_id: JobId, correlation_id: Uuid) {
        let mut guard = self.inner.lock().await;
        guard.insert(job_id, correlation_id);
    }

    pub async fn remember_if_absent(&self, job_id: JobId, correlation_id: Uuid) {
        let mut guard = self.inner.lock().await;
        guard.entry(job_id).or_insert(correlation_id);
    }

    pub async fn fetch(&self, job_id: &JobId) -> Option<Uuid> {
        let guard = self.inner.lock().await;
        guard.get(job_id).copied()
    }

    pub async fn take(&self, job_id: &JobId) -> Option<Uuid> {
        let mut guard = self.inner.lock().await;
        guard.remove(job_id)
    }

    pub async fn fetch_or_generate(&self, job_id: JobId) -> Uuid {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.get(&job_id) {
            return *existing;
        }

        let fresh = Uuid::now_v7();
        warn!(job_id = %job_id.0, "missing correlation id; generating new one");
        guard.insert(job_id, fresh);
        fresh
    }

    pub async fn take_or_generate(&self, job_id: JobId) -> Uuid {
        let mut guard = self.inner.lock().await;
        if let Some(existing) = guard.remove(&job_id) {
            return existing;
        }

        let fresh = Uuid::now_v7();
        warn!(job_id = %job_id.0, "missing correlation id during cleanup; generating new one");
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fetch_or_generate_is_stable_across_calls() {
        let cache = CorrelationCache::new();
        let job_id = JobId::new();
        let first = cache.fetch_or_generate(job_id).await;
        let second = cache.fetch_or_generate(job_id).await;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn take_removes_the_entry() {
        let cache = CorrelationCache::new();
        let job_id = JobId::new();
        cache.remember(job_id, Uuid::now_v7()).await;
        assert!(cache.take(&job_id).await.is_some());
        assert!(cache.fetch(&job_id).await.is_none());
    }
}
