//! Rate Limiter (C2): per-stage token bucket with burst capacity.
//! Distinct from `ferrex-model::rate_limit`'s HTTP sliding-window limiter
//! — this is a cooperative token bucket keyed by pipeline stage rather
//! than by IP/user, styled instead on the `backoff::exponential` helper in
//! `ferrex-core::auth::rate_limit`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use pipeline_model::{RateLimitPolicy, StageName};

/// Outcome of a non-blocking [`RateLimiter::try_acquire`] (/// `tryAcquire`).
#[derive(Clone, Copy, Debug)]
pub enum AcquireOutcome {
    Granted,
    Denied { retry_after: Duration },
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    burst_tokens: f64,
    last_burst_refill: Instant,
}

impl BucketState {
    fn new(policy: &RateLimitPolicy, now: Instant) -> Self {
        Self {
            tokens: policy.capacity,
            last_refill: now,
            burst_tokens: policy.burst_capacity,
            last_burst_refill: now,
        }
    }

    fn refill(&mut self, policy: &RateLimitPolicy, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * policy.refill_per_second).min(policy.capacity);
        self.last_refill = now;

        if now.saturating_duration_since(self.last_burst_refill) >= policy.burst_window {
            self.burst_tokens = policy.burst_capacity;
            self.last_burst_refill = now;
        }
    }

    /// Subtract `n` tokens from the primary bucket, falling back to the
    /// burst bucket when the primary is insufficient ("Token
    /// bucket").
    fn try_take(&mut self, n: f64) -> bool {
        if self.tokens >= n {
            self.tokens -= n;
            return true;
        }
        if self.burst_tokens >= n {
            self.burst_tokens -= n;
            return true;
        }
        false
    }

    fn time_to_n_tokens(&self, n: f64, refill_per_second: f64) -> Duration {
        if refill_per_second <= 0.0 {
            return Duration::from_secs(u64::MAX / 2);
        }
        let deficit = (n - self.tokens).max(0.0);
        Duration::from_secs_f64(deficit / refill_per_second)
    }
}

/// Single stage's bucket, guarded by a `tokio::sync::Mutex` so waiters are
/// served in FIFO enqueue order.
struct StageBucket {
    policy: RateLimitPolicy,
    state: Mutex<BucketState>,
}

/// Per-stage token-bucket rate limiter. One instance shared
/// across all callers for a given stage.
pub struct RateLimiter {
    buckets: HashMap<StageName, StageBucket>,
}

impl RateLimiter {
    pub fn new(policies: HashMap<StageName, RateLimitPolicy>) -> Self {
        let now = Instant::now();
        let buckets = policies
            .into_iter()
            .map(|(stage, policy)| {
                let state = Mutex::new(BucketState::new(&policy, now));
                (stage, StageBucket { policy, state })
            })
            .collect();
        Self { buckets }
    }

    /// Non-blocking acquire (`tryAcquire`).
    pub async fn try_acquire(&self, stage: StageName, n: f64) -> AcquireOutcome {
        let Some(bucket) = self.buckets.get(&stage) else {
            return AcquireOutcome::Granted;
        };
        let mut state = bucket.state.lock().await;
        let now = Instant::now();
        state.refill(&bucket.policy, now);
        if state.try_take(n) {
            AcquireOutcome::Granted
        } else {
            AcquireOutcome::Denied {
                retry_after: state.time_to_n_tokens(n, bucket.policy.refill_per_second),
            }
        }
    }

    /// Cooperative acquire that suspends until tokens are available or
    /// `deadline` elapses (`acquire(n, deadline)`).
    pub async fn acquire(&self, stage: StageName, n: f64, deadline: Duration) -> bool {
        let Some(bucket) = self.buckets.get(&stage) else {
            return true;
        };
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = bucket.state.lock().await;
                let now = Instant::now();
                state.refill(&bucket.policy, now);
                if state.try_take(n) {
                    return true;
                }
                state.time_to_n_tokens(n, bucket.policy.refill_per_second)
            };

            let elapsed = start.elapsed();
            if elapsed >= deadline {
                return false;
            }
            let remaining = deadline - elapsed;
            tokio::time::sleep(wait.min(remaining)).await;
            if start.elapsed() >= deadline {
                return false;
            }
        }
    }

    pub async fn balance(&self, stage: StageName) -> Option<f64> {
        let bucket = self.buckets.get(&stage)?;
        let mut state = bucket.state.lock().await;
        state.refill(&bucket.policy, Instant::now());
        Some(state.tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: f64, refill: f64) -> RateLimitPolicy {
        RateLimitPolicy {
            capacity,
            refill_per_second: refill,
            burst_capacity: 0.0,
            burst_window: Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn try_acquire_drains_and_refills() {
        let mut policies = HashMap::new();
        policies.insert(StageName::FileAnalysis, policy(2.0, 10.0));
        let limiter = RateLimiter::new(policies);

        assert!(matches!(
            limiter.try_acquire(StageName::FileAnalysis, 1.0).await,
            AcquireOutcome::Granted
        ));
        assert!(matches!(
            limiter.try_acquire(StageName::FileAnalysis, 1.0).await,
            AcquireOutcome::Granted
        ));
        assert!(matches!(
            limiter.try_acquire(StageName::FileAnalysis, 1.0).await,
            AcquireOutcome::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn acquire_times_out_when_deadline_too_short() {
        let mut policies = HashMap::new();
        policies.insert(StageName::Validation, policy(1.0, 0.1));
        let limiter = RateLimiter::new(policies);

        assert!(limiter.acquire(StageName::Validation, 1.0, Duration::from_millis(50)).await);
        let granted = limiter
            .acquire(StageName::Validation, 1.0, Duration::from_millis(10))
            .await;
        assert!(!granted);
    }

    #[tokio::test]
    async fn unknown_stage_is_never_limited() {
        let limiter = RateLimiter::new(HashMap::new());
        assert!(matches!(
            limiter.try_acquire(StageName::GraphIngestion, 1.0).await,
            AcquireOutcome::Granted
        ));
    }
}
