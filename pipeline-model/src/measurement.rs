use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stage::StageName;

/// A single resource/latency observation recorded by the system monitor.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MeasurementSample {
    pub stage: StageName,
    pub cpu_pct: f64,
    pub memory_pct: f64,
    pub event_loop_lag_ms: f64,
    pub avg_job_duration_ms: f64,
    pub error_rate: f64,
    pub taken_at: DateTime<Utc>,
}

/// Direction of a trend computed over a rolling sample window (/// "Trend").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum TrendDirection {
    Improving,
    Stable,
    Degrading,
}

/// Slope-based trend summary over the monitor's ring buffer (/// `trend(stage)`).
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Trend {
    pub direction: TrendDirection,
    /// Linear-regression slope of `error_rate` over the window, per sample.
    pub slope: f64,
    pub window_len: usize,
}

impl Trend {
    pub const STABLE_SLOPE_EPSILON: f64 = 0.001;

    pub fn from_slope(slope: f64, window_len: usize) -> Self {
        let direction = if slope.abs() < Self::STABLE_SLOPE_EPSILON {
            TrendDirection::Stable
        } else if slope < 0.0 {
            TrendDirection::Improving
        } else {
            TrendDirection::Degrading
        };
        Self {
            direction,
            slope,
            window_len,
        }
    }
}
