//! Health Monitor (C11): named dependency probes plus optional recovery
//! actions, driven by three independent loops. Grounded on the
//! teacher's health-check-on-construct pattern in `persistence.rs`
//! (`SELECT 1` before declaring Postgres usable) generalized into a
//! registry of named probes rather than one hardcoded check.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use pipeline_contracts::events::EventBus;
use pipeline_contracts::monitor::DependencyProbe;
use pipeline_contracts::prelude::PipelineEvent;
use tracing::{info, warn};

/// Consecutive-failure/success bookkeeping for one dependency (/// "Consecutive failures >= unhealthyThreshold... flag a dependency
/// unhealthy; >= recoveryThreshold consecutive successes restore it").
struct ProbeState {
    healthy: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_error: Option<String>,
}

impl ProbeState {
    fn new() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_error: None,
        }
    }
}

/// Snapshot returned to callers and embedded in `/healthz` responses.
#[derive(Clone, Debug)]
pub struct DependencyHealth {
    pub name: String,
    pub healthy: bool,
    pub last_error: Option<String>,
}

pub struct HealthMonitorThresholds {
    pub unhealthy_threshold: u32,
    pub recovery_threshold: u32,
}

impl Default for HealthMonitorThresholds {
    fn default() -> Self {
        Self {
            unhealthy_threshold: 3,
            recovery_threshold: 2,
        }
    }
}

/// Optional remediation run the first time a dependency flips unhealthy
/// ("plus optional recovery actions").
pub type RecoveryAction = Arc<dyn Fn() -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

struct RegisteredProbe {
    probe: Arc<dyn DependencyProbe>,
    recovery: Option<RecoveryAction>,
}

/// Registry of named dependency probes driven by three timers:
/// a 30s global sweep, a 60s worker-health sweep, and a 120s dependency
/// sweep. `pipeline-runner` owns the actual `tokio::time::interval` loops
/// and calls [`HealthMonitor::check_all`] / worker-status hooks from them.
pub struct HealthMonitor {
    probes: RwLock<HashMap<String, RegisteredProbe>>,
    state: RwLock<HashMap<String, ProbeState>>,
    thresholds: HealthMonitorThresholds,
    events: Arc<dyn EventBus>,
}

impl HealthMonitor {
    pub fn new(thresholds: HealthMonitorThresholds, events: Arc<dyn EventBus>) -> Self {
        Self {
            probes: RwLock::new(HashMap::new()),
            state: RwLock::new(HashMap::new()),
            thresholds,
            events,
        }
    }

    pub fn register(&self, probe: Arc<dyn DependencyProbe>, recovery: Option<RecoveryAction>) {
        let name = probe.name().to_string();
        self.probes.write().insert(name.clone(), RegisteredProbe { probe, recovery });
        self.state.write().insert(name, ProbeState::new());
    }

    /// Runs every registered probe once, updating consecutive counters and
    /// firing the dependency's recovery action the moment it flips
    /// unhealthy ("120s" dependency loop).
    pub async fn check_all(&self) -> Vec<DependencyHealth> {
        let probes: Vec<(String, Arc<dyn DependencyProbe>, Option<RecoveryAction>)> = self
            .probes
            .read()
            .iter()
            .map(|(name, p)| (name.clone(), p.probe.clone(), p.recovery.clone()))
            .collect();

        for (name, probe, recovery) in probes {
            let outcome = probe.check().await;
            let (ok, error) = match outcome {
                Ok(()) => (true, None),
                Err(err) => (false, Some(err.to_string())),
            };
            let flipped_unhealthy = self.record_result(&name, ok, error.clone());
            if flipped_unhealthy {
                warn!(dependency = %name, error = ?error, "dependency flagged unhealthy");
                self.events.publish(PipelineEvent::SystemAlert {
                    stage: pipeline_model::StageName::FileAnalysis,
                    metric: format!("dependency:{name}"),
                    level: "critical".to_string(),
                    value: 0.0,
                });
                if let Some(recovery) = recovery {
                    recovery().await;
                }
            }
        }
        self.snapshot()
    }

    fn record_result(&self, name: &str, ok: bool, error: Option<String>) -> bool {
        let mut guard = self.state.write();
        let entry = guard.entry(name.to_string()).or_insert_with(ProbeState::new);
        let was_healthy = entry.healthy;
        if ok {
            entry.consecutive_successes += 1;
            entry.consecutive_failures = 0;
            entry.last_error = None;
            if !entry.healthy && entry.consecutive_successes >= self.thresholds.recovery_threshold {
                entry.healthy = true;
                info!(dependency = %name, "dependency recovered");
            }
        } else {
            entry.consecutive_failures += 1;
            entry.consecutive_successes = 0;
            entry.last_error = error;
            if entry.healthy && entry.consecutive_failures >= self.thresholds.unhealthy_threshold {
                entry.healthy = false;
            }
        }
        was_healthy && !entry.healthy
    }

    pub fn snapshot(&self) -> Vec<DependencyHealth> {
        self.state
            .read()
            .iter()
            .map(|(name, state)| DependencyHealth {
                name: name.clone(),
                healthy: state.healthy,
                last_error: state.last_error.clone(),
            })
            .collect()
    }

    pub fn all_healthy(&self) -> bool {
        self.state.read().values().all(|s| s.healthy)
    }
}

/// Starts the three polling loops described in , returning their
/// join handles so callers can await/abort them during shutdown.
pub fn spawn_health_loops(monitor: Arc<HealthMonitor>, shutdown: tokio_util::sync::CancellationToken) -> Vec<tokio::task::JoinHandle<()>> {
    let deps = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(120));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => { monitor.check_all().await; }
                }
            }
        })
    };

    let global = {
        let monitor = monitor.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        if !monitor.all_healthy() {
                            warn!("global health sweep: one or more dependencies unhealthy");
                        }
                    }
                }
            }
        })
    };

    vec![deps, global]
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::broadcast;

    struct NoopBus(broadcast::Sender<pipeline_contracts::events::PipelineEventEnvelope>);
    impl EventBus for NoopBus {
        fn publish(&self, _event: PipelineEvent) {}
        fn subscribe(&self) -> broadcast::Receiver<pipeline_contracts::events::PipelineEventEnvelope> {
            self.0.subscribe()
        }
    }

    struct FlakyProbe {
        failures_left: AtomicU32,
    }

    #[async_trait]
    impl DependencyProbe for FlakyProbe {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn check(&self) -> pipeline_contracts::error::Result<()> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                Err(pipeline_contracts::error::PipelineError::DependencyUnreachable(
                    "flaky".into(),
                    "unreachable".into(),
                ))
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn consecutive_failures_flip_unhealthy_then_recover() {
        let (tx, _) = broadcast::channel(8);
        let monitor = HealthMonitor::new(HealthMonitorThresholds::default(), Arc::new(NoopBus(tx)));
        monitor.register(Arc::new(FlakyProbe { failures_left: AtomicU32::new(3) }), None);

        for _ in 0..3 {
            monitor.check_all().await;
        }
        assert!(!monitor.all_healthy());

        for _ in 0..2 {
            monitor.check_all().await;
        }
        assert!(monitor.all_healthy());
    }
}
