use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{JobId, RunId};
use crate::stage::StageName;

/// What a job is "about" — a file path, a directory path, a POI id, or a
/// batch id. Opaque beyond its identity; analyzers interpret it.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum EntityKey {
    FilePath(String),
    DirectoryPath(String),
    PoiId(String),
    BatchId(String),
}

impl EntityKey {
    pub fn as_str(&self) -> &str {
        match self {
            EntityKey::FilePath(s)
            | EntityKey::DirectoryPath(s)
            | EntityKey::PoiId(s)
            | EntityKey::BatchId(s) => s,
        }
    }
}

/// Scheduler-visible lifecycle of a job. A job moves exactly once into
/// `Active`, then exactly once into `Completed` or `Failed`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

/// A unit of work addressed by a stable id, carrying a `runId`, stage name,
/// entity key, and an opaque typed payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub run_id: RunId,
    pub stage: StageName,
    pub entity_key: EntityKey,
    /// Opaque to the pool; analyzers own the shape.
    pub payload: Value,
    pub status: JobStatus,
    pub attempts: u16,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(run_id: RunId, stage: StageName, entity_key: EntityKey, payload: Value) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            run_id,
            stage,
            entity_key,
            payload,
            status: JobStatus::Waiting,
            attempts: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_active(&mut self) {
        self.status = JobStatus::Active;
        self.attempts += 1;
        self.updated_at = Utc::now();
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.updated_at = Utc::now();
    }

    pub fn mark_failed(&mut self) {
        self.status = JobStatus::Failed;
        self.updated_at = Utc::now();
    }
}

/// Options accepted by [`crate`]-level queue `add` operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnqueueOptions {
    pub attempts: u16,
    pub backoff: BackoffPolicy,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: BackoffPolicy::default(),
            remove_on_complete: true,
            remove_on_fail: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub exponential: bool,
    pub initial_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            exponential: true,
            initial_delay_ms: 1_000,
        }
    }
}

/// Snapshot returned by `getJobCounts`.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct JobCounts {
    pub active: u64,
    pub waiting: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

impl JobCounts {
    /// Drain condition used by the coordinator.
    pub fn is_drained(&self) -> bool {
        self.active == 0 && self.waiting == 0 && self.delayed == 0
    }
}
