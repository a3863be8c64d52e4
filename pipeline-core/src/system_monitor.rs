//! System Monitor (C4): samples CPU/memory/load, computes trends, and
//! raises alerts and scaling hints for the worker pool.
//! The ring buffer is written by a single sampler task and read by
//! multiple consumers via copy-on-read snapshots.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use pipeline_contracts::events::EventBus;
use pipeline_contracts::monitor::{SystemMonitor as SystemMonitorTrait, SystemProbe};
use pipeline_contracts::prelude::PipelineEvent;
use pipeline_model::{MeasurementSample, StageName, Trend, TrendDirection};

const DEFAULT_HISTORY_SIZE: usize = 100;
const DEFAULT_TREND_WINDOW: usize = 20;

/// Warning/critical alert levels.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Clone, Debug)]
pub struct SystemAlert {
    pub stage: StageName,
    pub level: AlertLevel,
    pub metric: &'static str,
    pub value: f64,
}

struct StageHistory {
    samples: VecDeque<MeasurementSample>,
    last_alert_at: HashMap<&'static str, chrono::DateTime<Utc>>,
}

impl StageHistory {
    fn new() -> Self {
        Self {
            samples: VecDeque::new(),
            last_alert_at: HashMap::new(),
        }
    }
}

/// Alerting thresholds and cooldown ("alert storms are
/// suppressed by a configurable cooldown").
#[derive(Clone, Copy, Debug)]
pub struct MonitorThresholds {
    pub cpu_warning: f64,
    pub cpu_critical: f64,
    pub memory_warning: f64,
    pub memory_critical: f64,
    pub alert_cooldown: Duration,
    pub history_size: usize,
    pub trend_window: usize,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            cpu_warning: 70.0,
            cpu_critical: 85.0,
            memory_warning: 75.0,
            memory_critical: 90.0,
            alert_cooldown: Duration::from_secs(60),
            history_size: DEFAULT_HISTORY_SIZE,
            trend_window: DEFAULT_TREND_WINDOW,
        }
    }
}

/// In-process system monitor implementing [`SystemMonitorTrait`].
/// `probe` supplies the live OS readings; `record` is also driven
/// directly by a sampling loop in `pipeline-runner`.
pub struct SystemMonitor {
    thresholds: MonitorThresholds,
    history: RwLock<HashMap<StageName, StageHistory>>,
    events: Arc<dyn EventBus>,
}

impl SystemMonitor {
    pub fn new(thresholds: MonitorThresholds, events: Arc<dyn EventBus>) -> Self {
        Self {
            thresholds,
            history: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Sample every registered stage from `probe` and record the result.
    pub fn sample_and_record(&self, stage: StageName, probe: &dyn SystemProbe, avg_job_duration_ms: f64, error_rate: f64) {
        let sample = MeasurementSample {
            stage,
            cpu_pct: probe.cpu_pct(),
            memory_pct: probe.memory_pct(),
            event_loop_lag_ms: probe.event_loop_lag_ms(),
            avg_job_duration_ms,
            error_rate,
            taken_at: Utc::now(),
        };
        self.record_sync(sample);
    }

    fn record_sync(&self, sample: MeasurementSample) {
        let mut guard = self.history.write();
        let entry = guard.entry(sample.stage).or_insert_with(StageHistory::new);
        entry.samples.push_back(sample);
        if entry.samples.len() > self.thresholds.history_size {
            entry.samples.pop_front();
        }
        self.check_alerts(sample.stage, &sample, entry);
    }

    fn check_alerts(&self, stage: StageName, sample: &MeasurementSample, entry: &mut StageHistory) {
        let checks: [(&'static str, f64, f64, f64); 2] = [
            ("cpu", sample.cpu_pct, self.thresholds.cpu_warning, self.thresholds.cpu_critical),
            (
                "memory",
                sample.memory_pct,
                self.thresholds.memory_warning,
                self.thresholds.memory_critical,
            ),
        ];

        for (metric, value, warning, critical) in checks {
            let level = if value >= critical {
                Some(AlertLevel::Critical)
            } else if value >= warning {
                Some(AlertLevel::Warning)
            } else {
                None
            };
            let Some(level) = level else { continue };

            let now = Utc::now();
            let suppressed = entry
                .last_alert_at
                .get(metric)
                .map(|last| now.signed_duration_since(*last).to_std().unwrap_or_default() < self.thresholds.alert_cooldown)
                .unwrap_or(false);
            if suppressed {
                continue;
            }
            entry.last_alert_at.insert(metric, now);
            self.events.publish(PipelineEvent::SystemAlert {
                stage,
                metric: metric.to_string(),
                level: format!("{level:?}"),
                value,
            });
        }
    }

    /// Linear-regression slope of `error_rate` over the last `trend_window`
    /// samples ("trend via linear regression").
    fn compute_trend(samples: &VecDeque<MeasurementSample>, window: usize) -> Option<Trend> {
        let len = samples.len().min(window);
        if len < 2 {
            return None;
        }
        let slice: Vec<&MeasurementSample> = samples.iter().rev().take(len).collect();
        let xs: Vec<f64> = (0..len).map(|i| i as f64).collect();
        let ys: Vec<f64> = slice.iter().rev().map(|s| s.error_rate).collect();

        let n = len as f64;
        let sum_x: f64 = xs.iter().sum();
        let sum_y: f64 = ys.iter().sum();
        let sum_xy: f64 = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
        let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
        let denom = n * sum_xx - sum_x * sum_x;
        let slope = if denom.abs() < f64::EPSILON {
            0.0
        } else {
            (n * sum_xy - sum_x * sum_y) / denom
        };
        Some(Trend::from_slope(slope, len))
    }
}

impl std::fmt::Debug for AlertLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertLevel::Warning => write!(f, "warning"),
            AlertLevel::Critical => write!(f, "critical"),
        }
    }
}

#[async_trait]
impl SystemMonitorTrait for SystemMonitor {
    async fn record(&self, sample: MeasurementSample) {
        self.record_sync(sample);
    }

    async fn current(&self, stage: StageName) -> Option<MeasurementSample> {
        self.history.read().get(&stage).and_then(|h| h.samples.back().copied())
    }

    async fn trend(&self, stage: StageName) -> Option<Trend> {
        let guard = self.history.read();
        let entry = guard.get(&stage)?;
        Self::compute_trend(&entry.samples, self.thresholds.trend_window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast;

    struct NoopBus(broadcast::Sender<pipeline_contracts::events::PipelineEventEnvelope>);
    impl EventBus for NoopBus {
        fn publish(&self, _event: PipelineEvent) {}
        fn subscribe(&self) -> broadcast::Receiver<pipeline_contracts::events::PipelineEventEnvelope> {
            self.0.subscribe()
        }
    }

    fn sample(stage: StageName, cpu: f64, error_rate: f64) -> MeasurementSample {
        MeasurementSample {
            stage,
            cpu_pct: cpu,
            memory_pct: 10.0,
            event_loop_lag_ms: 1.0,
            avg_job_duration_ms: 100.0,
            error_rate,
            taken_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn ring_buffer_respects_history_size() {
        let (tx, _) = broadcast::channel(4);
        let monitor = SystemMonitor::new(
            MonitorThresholds {
                history_size: 3,
                ..MonitorThresholds::default()
            },
            Arc::new(NoopBus(tx)),
        );
        for i in 0..10 {
            monitor.record(sample(StageName::FileAnalysis, 10.0 + i as f64, 0.0)).await;
        }
        let snap = monitor.current(StageName::FileAnalysis).await.unwrap();
        assert_eq!(snap.cpu_pct, 19.0);
    }

    #[tokio::test]
    async fn increasing_error_rate_trend_is_degrading() {
        let (tx, _) = broadcast::channel(4);
        let monitor = SystemMonitor::new(MonitorThresholds::default(), Arc::new(NoopBus(tx)));
        for i in 0..25 {
            monitor
                .record(sample(StageName::Validation, 10.0, i as f64 * 0.01))
                .await;
        }
        let trend = monitor.trend(StageName::Validation).await.unwrap();
        assert_eq!(trend.direction, TrendDirection::Degrading);
    }
}
