use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageName;

/// The three circuit-breaker states.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl Default for BreakerState {
    fn default() -> Self {
        BreakerState::Closed
    }
}

/// Why a transition happened; carried into logs and the manual-override
/// audit trail.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum TransitionReason {
    FailureThresholdExceeded { consecutive_failures: u32 },
    ResetTimeoutElapsed,
    ProbeSucceeded,
    ProbeFailed,
    SuccessThresholdReached { consecutive_successes: u32 },
    ManualOverride { operator: String, reason: String },
}

/// One recorded state change, kept in a bounded per-stage history (/// supplement: manual override audit trail).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub stage: StageName,
    pub from: BreakerState,
    pub to: BreakerState,
    pub reason: TransitionReason,
    pub at: DateTime<Utc>,
}

impl BreakerTransition {
    pub fn new(stage: StageName, from: BreakerState, to: BreakerState, reason: TransitionReason) -> Self {
        Self {
            stage,
            from,
            to,
            reason,
            at: Utc::now(),
        }
    }
}

/// Point-in-time breaker status returned by `getState`/`getStats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub stage: StageName,
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_calls_in_flight: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_transition: Option<BreakerTransition>,
}
