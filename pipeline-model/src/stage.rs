use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The known stages of the analysis pipeline.
///
/// Order here is purely enumerative; canonical checkpoint ordering lives in
/// [`crate::checkpoint::CheckpointStage`], not here — a job's *stage* and an
/// entity's *checkpoint* are related but distinct axes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum StageName {
    FileAnalysis,
    DirectoryAggregation,
    DirectoryResolution,
    RelationshipResolution,
    Validation,
    Reconciliation,
    GraphIngestion,
}

impl StageName {
    pub const ALL: [StageName; 7] = [
        StageName::FileAnalysis,
        StageName::DirectoryAggregation,
        StageName::DirectoryResolution,
        StageName::RelationshipResolution,
        StageName::Validation,
        StageName::Reconciliation,
        StageName::GraphIngestion,
    ];

    /// The logical queue name this stage consumes from.
    pub fn queue_name(&self) -> &'static str {
        match self {
            StageName::FileAnalysis => "file-analysis-queue",
            StageName::DirectoryAggregation => "directory-aggregation-queue",
            StageName::DirectoryResolution => "directory-resolution-queue",
            StageName::RelationshipResolution => "relationship-resolution-queue",
            StageName::Validation => "validation-queue",
            StageName::Reconciliation => "reconciliation-queue",
            StageName::GraphIngestion => "graph-ingestion-queue",
        }
    }

    /// The `MAX_<STAGE>_WORKERS` environment variable fragment.
    pub fn env_fragment(&self) -> &'static str {
        match self {
            StageName::FileAnalysis => "FILE_ANALYSIS",
            StageName::DirectoryAggregation => "DIRECTORY_AGGREGATION",
            StageName::DirectoryResolution => "DIRECTORY_RESOLUTION",
            StageName::RelationshipResolution => "RELATIONSHIP_RESOLUTION",
            StageName::Validation => "VALIDATION",
            StageName::Reconciliation => "RECONCILIATION",
            StageName::GraphIngestion => "GRAPH_INGESTION",
        }
    }

    /// Whether this stage is LLM-heavy, which lowers the default breaker
    /// failure threshold ("3 for LLM-heavy stages").
    pub fn is_llm_heavy(&self) -> bool {
        matches!(
            self,
            StageName::FileAnalysis
                | StageName::RelationshipResolution
                | StageName::Reconciliation
        )
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.queue_name().trim_end_matches("-queue"))
    }
}

/// Priority band; lower numeric value wins ties under low-concurrency mode
/// distributed-override scheduling.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StagePriority(pub u8);

impl StagePriority {
    pub const MIN: StagePriority = StagePriority(1);
    pub const MAX: StagePriority = StagePriority(10);

    pub fn clamped(value: u8) -> Self {
        StagePriority(value.clamp(Self::MIN.0, Self::MAX.0))
    }
}

/// Static policy for one stage: concurrency band, priority, rate limit,
/// breaker policy, job timeout, and retry budget.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageDescriptor {
    pub name: StageName,
    pub min: usize,
    pub base: usize,
    pub max: usize,
    pub priority: StagePriority,
    pub rate_limit: RateLimitPolicy,
    pub breaker_policy: BreakerPolicy,
    #[serde(with = "humantime_duration")]
    pub job_timeout: Duration,
    pub retries: RetryPolicy,
}

impl StageDescriptor {
    pub fn validate(&self) -> Result<(), String> {
        if self.min > self.base || self.base > self.max {
            return Err(format!(
                "stage {}: requires min <= base <= max, got {} <= {} <= {}",
                self.name, self.min, self.base, self.max
            ));
        }
        Ok(())
    }
}

/// Token-bucket configuration for a single stage.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub capacity: f64,
    pub refill_per_second: f64,
    pub burst_capacity: f64,
    #[serde(with = "humantime_duration")]
    pub burst_window: Duration,
}

/// Breaker tuning knobs.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct BreakerPolicy {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    #[serde(with = "humantime_duration")]
    pub reset_timeout: Duration,
    pub half_open_max_calls: u32,
}

/// Retry policy shared by a stage's jobs (step (g)).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u16,
    #[serde(with = "humantime_duration")]
    pub base_delay: Duration,
    #[serde(with = "humantime_duration")]
    pub max_delay: Duration,
}

/// `serde` helper so config structs carrying `Duration` still serialize as
/// human-readable strings (`"30s"`) rather than nested `{secs, nanos}`,
/// matching the `humantime`/`humantime-serde` usage in `ferrex-config`
/// and `ferrexctl`.
mod humantime_duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
