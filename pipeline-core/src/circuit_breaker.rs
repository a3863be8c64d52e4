//! Circuit Breaker (C3): three-state fault isolator per stage, with a
//! registry exposing aggregate status. Grounded on the state
//! history/transition-reason shape already modeled in
//! `pipeline_model::breaker`, generalizing the source system's per-module
//! ad-hoc failure counters into one reusable component.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use pipeline_contracts::error::{PipelineError, Result};
use pipeline_contracts::events::EventBus;
use pipeline_contracts::prelude::PipelineEvent;
use pipeline_model::{BreakerSnapshot, BreakerState, BreakerTransition, StageBreakerPolicy, StageName, TransitionReason};

const HISTORY_CAP: usize = 10;

struct Internal {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    half_open_in_flight: u32,
    opened_at: Option<chrono::DateTime<Utc>>,
    next_attempt_at: Option<Instant>,
    history: VecDeque<BreakerTransition>,
}

impl Internal {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            half_open_in_flight: 0,
            opened_at: None,
            next_attempt_at: None,
            history: VecDeque::new(),
        }
    }

    fn push_transition(&mut self, stage: StageName, to: BreakerState, reason: TransitionReason) {
        let from = self.state;
        self.history
            .push_back(BreakerTransition::new(stage, from, to, reason));
        if self.history.len() > HISTORY_CAP {
            self.history.pop_front();
        }
        self.state = to;
    }
}

struct StageBreaker {
    policy: StageBreakerPolicy,
    inner: Mutex<Internal>,
}

/// Handed back by [`CircuitBreakerRegistry::admit`]; the caller must report
/// [`BreakerPermit::success`] or [`BreakerPermit::failure`] exactly once
/// ("emits `stateChange`, `failure`, `success` events").
pub struct BreakerPermit {
    stage: StageName,
    was_half_open_probe: bool,
}

/// Per-stage breaker state plus aggregate status reporting (,
/// registry responsibility from §2 table).
pub struct CircuitBreakerRegistry {
    breakers: HashMap<StageName, StageBreaker>,
    events: Arc<dyn EventBus>,
}

impl CircuitBreakerRegistry {
    pub fn new(policies: HashMap<StageName, StageBreakerPolicy>, events: Arc<dyn EventBus>) -> Self {
        let breakers = policies
            .into_iter()
            .map(|(stage, policy)| {
                (
                    stage,
                    StageBreaker {
                        policy,
                        inner: Mutex::new(Internal::new()),
                    },
                )
            })
            .collect();
        Self { breakers, events }
    }

    /// Admit a call: closed always admits; open admits only past
    /// `nextAttemptAt` and then only as a half-open probe bounded by
    /// `halfOpenMaxCalls`; half-open admits up to that same bound and
    /// refuses additional probes once it is reached.
    pub fn admit(&self, stage: StageName) -> Result<BreakerPermit> {
        let Some(breaker) = self.breakers.get(&stage) else {
            return Ok(BreakerPermit {
                stage,
                was_half_open_probe: false,
            });
        };

        let mut inner = breaker.inner.lock();
        match inner.state {
            BreakerState::Closed => Ok(BreakerPermit {
                stage,
                was_half_open_probe: false,
            }),
            BreakerState::HalfOpen => {
                if inner.half_open_in_flight >= breaker.policy.half_open_max_calls {
                    return Err(PipelineError::CircuitOpen(stage.to_string()));
                }
                inner.half_open_in_flight += 1;
                Ok(BreakerPermit {
                    stage,
                    was_half_open_probe: true,
                })
            }
            BreakerState::Open => {
                let now = Instant::now();
                let ready = inner.next_attempt_at.map(|at| now >= at).unwrap_or(false);
                if !ready {
                    return Err(PipelineError::CircuitOpen(stage.to_string()));
                }
                inner.push_transition(stage, BreakerState::HalfOpen, TransitionReason::ResetTimeoutElapsed);
                self.publish(stage, BreakerState::Open, BreakerState::HalfOpen);
                inner.half_open_in_flight = 1;
                inner.consecutive_successes = 0;
                Ok(BreakerPermit {
                    stage,
                    was_half_open_probe: true,
                })
            }
        }
    }

    pub fn record_success(&self, permit: BreakerPermit) {
        let Some(breaker) = self.breakers.get(&permit.stage) else {
            return;
        };
        let mut inner = breaker.inner.lock();
        if permit.was_half_open_probe && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
        inner.consecutive_failures = 0;

        match inner.state {
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= breaker.policy.success_threshold {
                    let from = inner.state;
                    inner.push_transition(
                        permit.stage,
                        BreakerState::Closed,
                        TransitionReason::SuccessThresholdReached {
                            consecutive_successes: inner.consecutive_successes,
                        },
                    );
                    inner.opened_at = None;
                    inner.half_open_in_flight = 0;
                    drop(inner);
                    self.publish(permit.stage, from, BreakerState::Closed);
                }
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self, permit: BreakerPermit) {
        let Some(breaker) = self.breakers.get(&permit.stage) else {
            return;
        };
        let mut inner = breaker.inner.lock();
        if permit.was_half_open_probe && inner.half_open_in_flight > 0 {
            inner.half_open_in_flight -= 1;
        }
        inner.consecutive_successes = 0;

        match inner.state {
            BreakerState::HalfOpen => {
                let from = inner.state;
                inner.push_transition(permit.stage, BreakerState::Open, TransitionReason::ProbeFailed);
                inner.opened_at = Some(Utc::now());
                inner.next_attempt_at = Some(Instant::now() + breaker.policy.reset_timeout);
                inner.half_open_in_flight = 0;
                drop(inner);
                self.publish(permit.stage, from, BreakerState::Open);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= breaker.policy.failure_threshold {
                    let from = inner.state;
                    inner.push_transition(
                        permit.stage,
                        BreakerState::Open,
                        TransitionReason::FailureThresholdExceeded {
                            consecutive_failures: inner.consecutive_failures,
                        },
                    );
                    inner.opened_at = Some(Utc::now());
                    inner.next_attempt_at = Some(Instant::now() + breaker.policy.reset_timeout);
                    drop(inner);
                    self.publish(permit.stage, from, BreakerState::Open);
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Manual override (`forceOpen`/`forceClose`).
    pub fn force_open(&self, stage: StageName, operator: &str, reason: &str) {
        let Some(breaker) = self.breakers.get(&stage) else {
            return;
        };
        let mut inner = breaker.inner.lock();
        let from = inner.state;
        inner.push_transition(
            stage,
            BreakerState::Open,
            TransitionReason::ManualOverride {
                operator: operator.to_string(),
                reason: reason.to_string(),
            },
        );
        inner.opened_at = Some(Utc::now());
        inner.next_attempt_at = Some(Instant::now() + breaker.policy.reset_timeout);
        drop(inner);
        self.publish(stage, from, BreakerState::Open);
    }

    pub fn force_close(&self, stage: StageName, operator: &str, reason: &str) {
        let Some(breaker) = self.breakers.get(&stage) else {
            return;
        };
        let mut inner = breaker.inner.lock();
        let from = inner.state;
        inner.push_transition(
            stage,
            BreakerState::Closed,
            TransitionReason::ManualOverride {
                operator: operator.to_string(),
                reason: reason.to_string(),
            },
        );
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.half_open_in_flight = 0;
        inner.opened_at = None;
        drop(inner);
        self.publish(stage, from, BreakerState::Closed);
    }

    pub fn snapshot(&self, stage: StageName) -> Option<BreakerSnapshot> {
        let breaker = self.breakers.get(&stage)?;
        let inner = breaker.inner.lock();
        Some(BreakerSnapshot {
            stage,
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            half_open_calls_in_flight: inner.half_open_in_flight,
            opened_at: inner.opened_at,
            last_transition: inner.history.back().cloned(),
        })
    }

    /// Aggregate status across every registered stage ("registry
    /// exposes aggregate status").
    pub fn all_snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers.keys().filter_map(|stage| self.snapshot(*stage)).collect()
    }

    fn publish(&self, stage: StageName, from: BreakerState, to: BreakerState) {
        self.events.publish(PipelineEvent::BreakerStateChanged { stage, from, to });
    }
}

impl BreakerPermit {
    pub fn stage(&self) -> StageName {
        self.stage
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_contracts::events::PipelineEventEnvelope;
    use std::sync::Mutex as StdMutex;
    use tokio::sync::broadcast;

    struct RecordingBus {
        tx: broadcast::Sender<PipelineEventEnvelope>,
        seen: StdMutex<Vec<PipelineEvent>>,
    }

    impl RecordingBus {
        fn new() -> Self {
            let (tx, _) = broadcast::channel(16);
            Self {
                tx,
                seen: StdMutex::new(Vec::new()),
            }
        }
    }

    impl EventBus for RecordingBus {
        fn publish(&self, event: PipelineEvent) {
            self.seen.lock().unwrap().push(event.clone());
            let _ = self.tx.send(PipelineEventEnvelope {
                event,
                emitted_at: Utc::now(),
            });
        }

        fn subscribe(&self) -> broadcast::Receiver<PipelineEventEnvelope> {
            self.tx.subscribe()
        }
    }

    fn policy(failure_threshold: u32) -> StageBreakerPolicy {
        StageBreakerPolicy {
            failure_threshold,
            success_threshold: 2,
            reset_timeout: Duration::from_millis(20),
            half_open_max_calls: 1,
        }
    }

    #[test]
    fn opens_after_consecutive_failures_then_fails_fast() {
        let events: Arc<dyn EventBus> = Arc::new(RecordingBus::new());
        let mut policies = HashMap::new();
        policies.insert(StageName::FileAnalysis, policy(3));
        let registry = CircuitBreakerRegistry::new(policies, events);

        for _ in 0..3 {
            let permit = registry.admit(StageName::FileAnalysis).unwrap();
            registry.record_failure(permit);
        }

        let err = registry.admit(StageName::FileAnalysis).unwrap_err();
        assert!(matches!(err, PipelineError::CircuitOpen(_)));
        assert_eq!(
            registry.snapshot(StageName::FileAnalysis).unwrap().state,
            BreakerState::Open
        );
    }

    #[tokio::test]
    async fn half_open_probe_then_close_after_success_threshold() {
        let events: Arc<dyn EventBus> = Arc::new(RecordingBus::new());
        let mut policies = HashMap::new();
        policies.insert(StageName::Validation, policy(1));
        let registry = CircuitBreakerRegistry::new(policies, events);

        let permit = registry.admit(StageName::Validation).unwrap();
        registry.record_failure(permit);
        assert_eq!(
            registry.snapshot(StageName::Validation).unwrap().state,
            BreakerState::Open
        );

        tokio::time::sleep(Duration::from_millis(30)).await;

        let probe = registry.admit(StageName::Validation).unwrap();
        registry.record_success(probe);
        let probe2 = registry.admit(StageName::Validation).unwrap();
        registry.record_success(probe2);

        assert_eq!(
            registry.snapshot(StageName::Validation).unwrap().state,
            BreakerState::Closed
        );
    }
}
