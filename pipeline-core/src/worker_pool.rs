//! Worker-Pool Manager (C5): the central contract binding C1-C4 together.
//! Global + per-stage concurrency are `tokio::sync::Semaphore` pairs, the
//! single authoritative shared counters for admission control. Priority-
//! weighted distribution under a forced low-concurrency override follows
//! `WeightedFairScheduler::build_priority_ring`
//! (`ferrex-core::scan::orchestration::scheduler`), generalized from
//! per-library ready-count rotation to one-time slot distribution across
//! stages.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use pipeline_contracts::error::{PipelineError, Result};
use pipeline_contracts::events::EventBus;
use pipeline_contracts::monitor::SystemMonitor as SystemMonitorTrait;
use pipeline_contracts::prelude::PipelineEvent;
use pipeline_model::{RunId, StageDescriptor, StageName, StagePriority, TrendDirection};

use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::rate_limiter::RateLimiter;

const ABSOLUTE_MAX_GLOBAL: usize = 150;

/// CPU/memory/load thresholds and cadence driving adaptive scaling.
#[derive(Clone, Copy, Debug)]
pub struct AdaptiveScalingPolicy {
    pub cpu_critical: f64,
    pub memory_critical: f64,
    pub load_critical: f64,
    pub cpu_scale_up_below: f64,
    pub scale_down_factor: f64,
    pub scale_up_factor: f64,
    pub adaptive_interval: Duration,
    pub cooldown: Duration,
    pub enabled: bool,
}

impl Default for AdaptiveScalingPolicy {
    fn default() -> Self {
        Self {
            cpu_critical: 85.0,
            memory_critical: 90.0,
            load_critical: 90.0,
            cpu_scale_up_below: 30.0,
            scale_down_factor: 0.7,
            scale_up_factor: 1.3,
            adaptive_interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            enabled: true,
        }
    }
}

struct StageSlots {
    descriptor: StageDescriptor,
    semaphore: Arc<Semaphore>,
    cur: AtomicUsize,
    in_flight: AtomicUsize,
    cooldown_until: Mutex<Option<tokio::time::Instant>>,
}

/// Snapshot of one stage's slot occupancy (`getStatus`).
#[derive(Clone, Debug)]
pub struct StageStatus {
    pub stage: StageName,
    pub cur: usize,
    pub min: usize,
    pub max: usize,
    pub in_flight: usize,
    pub available: usize,
}

/// Full pool snapshot (`getStatus`).
#[derive(Clone, Debug)]
pub struct PoolStatus {
    pub global_cap: usize,
    pub global_available: usize,
    pub stages: Vec<StageStatus>,
}

/// The central worker-pool contract. Owns the global and
/// per-stage semaphores, routes every execution through the rate limiter
/// and circuit breaker, and drives adaptive scaling from the system
/// monitor.
pub struct WorkerPoolManager {
    global_cap: AtomicUsize,
    global_semaphore: Arc<Semaphore>,
    stages: DashMap<StageName, Arc<StageSlots>>,
    breakers: Arc<CircuitBreakerRegistry>,
    limiter: Arc<RateLimiter>,
    monitor: Arc<dyn SystemMonitorTrait>,
    events: Arc<dyn EventBus>,
    shutdown: CancellationToken,
    forced_total: AtomicI64,
    scaling: AdaptiveScalingPolicy,
    slot_acquisition_timeout: Duration,
}

impl WorkerPoolManager {
    pub fn new(
        global_cap: usize,
        breakers: Arc<CircuitBreakerRegistry>,
        limiter: Arc<RateLimiter>,
        monitor: Arc<dyn SystemMonitorTrait>,
        events: Arc<dyn EventBus>,
        scaling: AdaptiveScalingPolicy,
        slot_acquisition_timeout: Duration,
    ) -> Self {
        let clamped = global_cap.min(ABSOLUTE_MAX_GLOBAL).max(1);
        Self {
            global_cap: AtomicUsize::new(clamped),
            global_semaphore: Arc::new(Semaphore::new(clamped)),
            stages: DashMap::new(),
            breakers,
            limiter,
            monitor,
            events,
            shutdown: CancellationToken::new(),
            forced_total: AtomicI64::new(-1),
            scaling,
            slot_acquisition_timeout,
        }
    }

    /// Idempotent; rejects if total `base` allocations would exceed the
    /// current global cap (`registerStage`).
    pub fn register_stage(&self, descriptor: StageDescriptor) -> Result<()> {
        descriptor
            .validate()
            .map_err(PipelineError::Config)?;

        if self.stages.contains_key(&descriptor.name) {
            return Ok(());
        }

        let projected_base: usize = self
            .stages
            .iter()
            .map(|entry| entry.value().descriptor.base)
            .sum::<usize>()
            + descriptor.base;
        if projected_base > self.global_cap.load(Ordering::SeqCst) {
            return Err(PipelineError::Config(format!(
                "registering stage {} would push total base allocation to {}, exceeding global cap",
                descriptor.name, projected_base
            )));
        }

        let slots = Arc::new(StageSlots {
            semaphore: Arc::new(Semaphore::new(descriptor.base)),
            cur: AtomicUsize::new(descriptor.base),
            in_flight: AtomicUsize::new(0),
            cooldown_until: Mutex::new(None),
            descriptor,
        });
        self.stages.insert(slots.descriptor.name, slots);
        Ok(())
    }

    /// The central contract: breaker admits, rate limiter acquires, global
    /// and stage slots acquire, `op` runs under a cancellable deadline, the
    /// result is recorded, and failures retry with exponential backoff
    /// (`executeWithManagement`).
    pub async fn execute_with_management<F, Fut, T>(&self, stage: StageName, op: F) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.shutdown.is_cancelled() {
            return Err(PipelineError::Cancelled("pool is shutting down".into()));
        }

        let slots = self
            .stages
            .get(&stage)
            .ok_or_else(|| PipelineError::Config(format!("stage {stage} is not registered")))?
            .clone();

        let retry = slots.descriptor.retries;
        let mut attempt: u16 = 0;
        loop {
            let result = self.attempt_once(stage, &slots, &op).await;
            match result {
                Ok(value) => return Ok(value),
                Err(err) if Self::is_retryable(&err) && attempt + 1 < retry.max_attempts => {
                    attempt += 1;
                    let delay = Self::backoff_delay(retry.base_delay, attempt, retry.max_delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.shutdown.cancelled() => {
                            return Err(PipelineError::Cancelled("shutdown during retry backoff".into()));
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_once<F, Fut, T>(&self, stage: StageName, slots: &Arc<StageSlots>, op: &F) -> Result<T>
    where
        F: Fn(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.breakers.admit(stage)?;

        if !self
            .limiter
            .acquire(stage, 1.0, self.slot_acquisition_timeout)
            .await
        {
            self.breakers.record_failure(permit);
            return Err(PipelineError::RateLimited(stage.to_string()));
        }

        let global_guard = tokio::time::timeout(
            self.slot_acquisition_timeout,
            self.global_semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::Timeout(self.slot_acquisition_timeout))
        .and_then(|res| res.map_err(|_| PipelineError::Internal("global semaphore closed".into())));

        let global_guard = match global_guard {
            Ok(guard) => guard,
            Err(err) => {
                self.breakers.record_failure(permit);
                return Err(err);
            }
        };

        let stage_guard = tokio::time::timeout(
            self.slot_acquisition_timeout,
            slots.semaphore.clone().acquire_owned(),
        )
        .await
        .map_err(|_| PipelineError::Timeout(self.slot_acquisition_timeout))
        .and_then(|res| res.map_err(|_| PipelineError::Internal("stage semaphore closed".into())));

        let stage_guard = match stage_guard {
            Ok(guard) => guard,
            Err(err) => {
                drop(global_guard);
                self.breakers.record_failure(permit);
                return Err(err);
            }
        };

        slots.in_flight.fetch_add(1, Ordering::SeqCst);
        let job_timeout = slots.descriptor.job_timeout;
        let cancel = self.shutdown.child_token();

        let outcome = tokio::time::timeout(job_timeout, op(cancel.clone())).await;
        slots.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(stage_guard);
        drop(global_guard);

        match outcome {
            Ok(Ok(value)) => {
                self.breakers.record_success(permit);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.breakers.record_failure(permit);
                Err(err)
            }
            Err(_) => {
                cancel.cancel();
                self.breakers.record_failure(permit);
                Err(PipelineError::Timeout(job_timeout))
            }
        }
    }

    fn is_retryable(err: &PipelineError) -> bool {
        matches!(
            err,
            PipelineError::Timeout(_) | PipelineError::RateLimited(_) | PipelineError::Internal(_)
        )
    }

    fn backoff_delay(base: Duration, attempt: u16, max: Duration) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1) as u32);
        base.saturating_mul(factor).min(max).min(Duration::from_secs(60))
    }

    /// Clamped to `[min_s, max_s]`; fails if the new total would exceed `G`
    /// (`updateConcurrency`).
    pub fn update_concurrency(&self, stage: StageName, new_value: usize, reason: &str) -> Result<()> {
        let slots = self
            .stages
            .get(&stage)
            .ok_or_else(|| PipelineError::Config(format!("stage {stage} is not registered")))?;

        let clamped = new_value.clamp(slots.descriptor.min, slots.descriptor.max);
        let others: usize = self
            .stages
            .iter()
            .filter(|entry| *entry.key() != stage)
            .map(|entry| entry.value().cur.load(Ordering::SeqCst))
            .sum();
        if others + clamped > self.global_cap.load(Ordering::SeqCst) {
            return Err(PipelineError::Config(format!(
                "setting {stage} to {clamped} would push global total past {}",
                self.global_cap.load(Ordering::SeqCst)
            )));
        }

        let current = slots.cur.swap(clamped, Ordering::SeqCst);
        if clamped > current {
            slots.semaphore.add_permits(clamped - current);
        } else if clamped < current {
            slots.semaphore.forget_permits(current - clamped);
        }
        if clamped != current {
            self.events.publish(PipelineEvent::ConcurrencyChanged {
                stage,
                old: current,
                new: clamped,
                reason: reason.to_string(),
            });
        }
        Ok(())
    }

    /// Consult the system monitor and apply the four adaptive-scaling rules
    /// top-down, first match wins, then suppress further changes to that
    /// stage for `cooldown`.
    pub async fn run_adaptive_tick(&self) {
        if !self.scaling.enabled || self.forced_total.load(Ordering::SeqCst) >= 0 {
            return;
        }

        let stages: Vec<Arc<StageSlots>> = self.stages.iter().map(|e| e.value().clone()).collect();
        for slots in stages {
            let stage = slots.descriptor.name;
            {
                let guard = slots.cooldown_until.lock();
                if let Some(until) = *guard {
                    if tokio::time::Instant::now() < until {
                        continue;
                    }
                }
            }

            let Some(sample) = self.monitor.current(stage).await else {
                continue;
            };
            let trend = self.monitor.trend(stage).await;
            let cur = slots.cur.load(Ordering::SeqCst) as f64;
            let min_s = slots.descriptor.min;
            let max_s = slots.descriptor.max;

            let new_cur = if sample.cpu_pct > self.scaling.cpu_critical {
                Some(((cur * self.scaling.scale_down_factor).floor() as usize).max(min_s))
            } else if sample.memory_pct > self.scaling.memory_critical {
                Some(((cur * self.scaling.scale_down_factor).floor() as usize).max(min_s))
            } else if sample.cpu_pct < self.scaling.cpu_scale_up_below
                && trend
                    .map(|t| matches!(t.direction, TrendDirection::Improving))
                    .unwrap_or(false)
            {
                Some((cur * self.scaling.scale_up_factor).ceil().min(max_s as f64) as usize)
            } else {
                None
            };

            if let Some(target) = new_cur {
                if target != cur as usize && self.update_concurrency(stage, target, "adaptive-scaling").is_ok() {
                    *slots.cooldown_until.lock() =
                        Some(tokio::time::Instant::now() + self.scaling.cooldown);
                }
            }
        }
    }

    /// Distribute a "forced total concurrency" `F` across known stages,
    /// bypassing adaptive scaling. If `F < stages.len()`, the top-`F` stages
    /// by priority get one slot each; otherwise `floor(F/N)` each with the
    /// remainder going to higher-priority stages.
    pub fn apply_forced_concurrency(&self, forced: usize) -> Result<()> {
        let forced = forced.min(ABSOLUTE_MAX_GLOBAL);
        self.forced_total.store(forced as i64, Ordering::SeqCst);

        let mut entries: Vec<(StageName, StagePriority)> = self
            .stages
            .iter()
            .map(|e| (e.value().descriptor.name, e.value().descriptor.priority))
            .collect();
        entries.sort_by(|a, b| b.1.cmp(&a.1));

        let n = entries.len();
        if n == 0 {
            return Ok(());
        }

        let allocations: HashMap<StageName, usize> = if forced < n {
            entries
                .iter()
                .enumerate()
                .map(|(i, (stage, _))| (*stage, if i < forced { 1 } else { 0 }))
                .collect()
        } else {
            let base = forced / n;
            let remainder = forced % n;
            entries
                .iter()
                .enumerate()
                .map(|(i, (stage, _))| (*stage, base + if i < remainder { 1 } else { 0 }))
                .collect()
        };

        for (stage, target) in allocations {
            if let Some(slots) = self.stages.get(&stage) {
                let current = slots.cur.load(Ordering::SeqCst);
                if target > current {
                    slots.semaphore.add_permits(target - current);
                } else if target < current {
                    slots.semaphore.forget_permits(current - target);
                }
                slots.cur.store(target, Ordering::SeqCst);
                if target != current {
                    self.events.publish(PipelineEvent::ConcurrencyChanged {
                        stage,
                        old: current,
                        new: target,
                        reason: "forced-concurrency".to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn clear_forced_concurrency(&self) {
        self.forced_total.store(-1, Ordering::SeqCst);
    }

    pub fn status(&self) -> PoolStatus {
        let stages = self
            .stages
            .iter()
            .map(|entry| {
                let slots = entry.value();
                StageStatus {
                    stage: slots.descriptor.name,
                    cur: slots.cur.load(Ordering::SeqCst),
                    min: slots.descriptor.min,
                    max: slots.descriptor.max,
                    in_flight: slots.in_flight.load(Ordering::SeqCst),
                    available: slots.semaphore.available_permits(),
                }
            })
            .collect();
        PoolStatus {
            global_cap: self.global_cap.load(Ordering::SeqCst),
            global_available: self.global_semaphore.available_permits(),
            stages,
        }
    }

    /// Stop accepting new executions, wait up to `timeout` for in-flight
    /// work, then cancel the rest (`shutdown`).
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let in_flight: usize = self
                .stages
                .iter()
                .map(|e| e.value().in_flight.load(Ordering::SeqCst))
                .sum();
            if in_flight == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn run_id_scope(&self) -> RunId {
        RunId::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BroadcastEventBus;
    use crate::system_monitor::{MonitorThresholds, SystemMonitor};
    use pipeline_model::{BreakerPolicy as StageBreakerPolicy, RateLimitPolicy, RetryPolicy};
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;

    fn descriptor(name: StageName, base: usize, max: usize) -> StageDescriptor {
        StageDescriptor {
            name,
            min: 1,
            base,
            max,
            priority: StagePriority::clamped(5),
            rate_limit: RateLimitPolicy {
                capacity: 100.0,
                refill_per_second: 100.0,
                burst_capacity: 10.0,
                burst_window: Duration::from_secs(1),
            },
            breaker_policy: StageBreakerPolicy {
                failure_threshold: 5,
                success_threshold: 2,
                reset_timeout: Duration::from_secs(30),
                half_open_max_calls: 3,
            },
            job_timeout: Duration::from_secs(5),
            retries: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
        }
    }

    fn make_pool(global_cap: usize) -> WorkerPoolManager {
        let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new());
        let breakers = Arc::new(CircuitBreakerRegistry::new(HashMap::new(), events.clone()));
        let limiter = Arc::new(RateLimiter::new(HashMap::new()));
        let monitor: Arc<dyn SystemMonitorTrait> =
            Arc::new(SystemMonitor::new(MonitorThresholds::default(), events.clone()));
        WorkerPoolManager::new(
            global_cap,
            breakers,
            limiter,
            monitor,
            events,
            AdaptiveScalingPolicy::default(),
            Duration::from_secs(2),
        )
    }

    #[tokio::test]
    async fn execute_with_management_runs_the_operation() {
        let pool = make_pool(10);
        pool.register_stage(descriptor(StageName::FileAnalysis, 2, 5)).unwrap();

        let result: Result<u32> = pool
            .execute_with_management(StageName::FileAnalysis, |_cancel| async { Ok(42u32) })
            .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn update_concurrency_rejects_exceeding_global_cap() {
        let pool = make_pool(4);
        pool.register_stage(descriptor(StageName::FileAnalysis, 2, 5)).unwrap();
        pool.register_stage(descriptor(StageName::Validation, 2, 5)).unwrap();

        assert!(pool.update_concurrency(StageName::FileAnalysis, 5, "test").is_err());
    }

    #[tokio::test]
    async fn forced_concurrency_below_stage_count_gives_top_priority_one_slot_each() {
        let pool = make_pool(10);
        pool.register_stage(descriptor(StageName::FileAnalysis, 2, 5)).unwrap();
        pool.register_stage(descriptor(StageName::Validation, 2, 5)).unwrap();
        pool.register_stage(descriptor(StageName::Reconciliation, 2, 5)).unwrap();

        pool.apply_forced_concurrency(2).unwrap();
        let status = pool.status();
        let total: usize = status.stages.iter().map(|s| s.cur).sum();
        assert_eq!(total, 2);
    }

    #[tokio::test]
    async fn retryable_failure_is_retried_up_to_max_attempts() {
        let pool = make_pool(10);
        pool.register_stage(descriptor(StageName::FileAnalysis, 2, 5)).unwrap();

        let attempts = Arc::new(StdAtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let result: Result<()> = pool
            .execute_with_management(StageName::FileAnalysis, move |_cancel| {
                let attempts = attempts_clone.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(PipelineError::Internal("boom".into()))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
