use thiserror::Error;

/// The single error type crossing contract boundaries in this workspace.
/// `pipeline-core` converts subsystem failures into this type;
/// `pipeline-runner` is the only place that turns it into an exit code.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("queue {stage}: {message}")]
    Queue { stage: String, message: String },

    #[error("lease {0} expired or already acked")]
    LeaseExpired(String),

    #[error("checkpoint validation failed: {0:?}")]
    CheckpointInvalid(Vec<String>),

    #[error("rate limit exceeded for stage {0}")]
    RateLimited(String),

    #[error("circuit open for stage {0}")]
    CircuitOpen(String),

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("dependency {0} unreachable: {1}")]
    DependencyUnreachable(String, String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
