//! Timeout Registry (C1): a validated, runtime-updatable `category -> type ->
//! milliseconds` map, grounded on `ferrexctl::validation`'s
//! range-checked guard rails and `ferrex-server`'s config-composition style.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use pipeline_config::Profile;

/// The eight timeout categories this registry recognizes.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum TimeoutCategory {
    Pipeline,
    Worker,
    Queue,
    Database,
    CircuitBreaker,
    Llm,
    Monitoring,
    Reliability,
}

impl TimeoutCategory {
    fn from_str_loose(raw: &str) -> Option<Self> {
        Some(match raw.to_ascii_lowercase().as_str() {
            "pipeline" => TimeoutCategory::Pipeline,
            "worker" => TimeoutCategory::Worker,
            "queue" => TimeoutCategory::Queue,
            "database" => TimeoutCategory::Database,
            "circuitbreaker" | "circuit_breaker" => TimeoutCategory::CircuitBreaker,
            "llm" => TimeoutCategory::Llm,
            "monitoring" => TimeoutCategory::Monitoring,
            "reliability" => TimeoutCategory::Reliability,
            _ => return None,
        })
    }

    fn as_str(&self) -> &'static str {
        match self {
            TimeoutCategory::Pipeline => "pipeline",
            TimeoutCategory::Worker => "worker",
            TimeoutCategory::Queue => "queue",
            TimeoutCategory::Database => "database",
            TimeoutCategory::CircuitBreaker => "circuit_breaker",
            TimeoutCategory::Llm => "llm",
            TimeoutCategory::Monitoring => "monitoring",
            TimeoutCategory::Reliability => "reliability",
        }
    }
}

type Key = (TimeoutCategory, String);

#[derive(Clone, Copy, Debug)]
struct Range {
    min_ms: u64,
    max_ms: u64,
    default_ms: u64,
    testing_ms: u64,
    debugging_ms: u64,
}

/// Builtin `(category, type) -> range` table. Values outside of a known
/// range on load or update fail with [`TimeoutRegistryError::OutOfRange`];
/// an entry not in this table falls back to a generic `[1, 600_000]` range.
fn builtin_ranges() -> HashMap<Key, Range> {
    use TimeoutCategory::*;
    let mut m = HashMap::new();
    let mut add = |cat: TimeoutCategory, ty: &str, min: u64, max: u64, def: u64, test: u64, debug: u64| {
        m.insert(
            (cat, ty.to_string()),
            Range {
                min_ms: min,
                max_ms: max,
                default_ms: def,
                testing_ms: test,
                debugging_ms: debug,
            },
        );
    };

    add(Pipeline, "drain_check", 100, 60_000, 5_000, 200, 15_000);
    add(Pipeline, "shutdown", 1_000, 300_000, 30_000, 2_000, 60_000);
    add(Worker, "slot_acquisition", 100, 120_000, 10_000, 500, 30_000);
    add(Worker, "job", 1_000, 600_000, 60_000, 5_000, 180_000);
    add(Worker, "shutdown", 500, 120_000, 15_000, 1_000, 45_000);
    add(Queue, "reserve", 100, 60_000, 5_000, 500, 15_000);
    add(Queue, "lease", 1_000, 600_000, 30_000, 3_000, 90_000);
    add(Database, "connect", 500, 60_000, 10_000, 1_000, 20_000);
    add(Database, "query", 100, 60_000, 5_000, 1_000, 15_000);
    add(CircuitBreaker, "reset", 1_000, 300_000, 60_000, 2_000, 120_000);
    add(CircuitBreaker, "probe", 100, 60_000, 5_000, 500, 15_000);
    add(Llm, "request", 1_000, 600_000, 120_000, 5_000, 300_000);
    add(Monitoring, "sample", 100, 60_000, 5_000, 500, 10_000);
    add(Monitoring, "adaptive_interval", 1_000, 300_000, 30_000, 2_000, 60_000);
    add(Reliability, "outbox_poll", 100, 60_000, 2_000, 200, 10_000);
    add(Reliability, "stale_claim", 1_000, 600_000, 60_000, 5_000, 120_000);

    m
}

const FALLBACK_MIN_MS: u64 = 1;
const FALLBACK_MAX_MS: u64 = 600_000;

#[derive(Debug, Error)]
pub enum TimeoutRegistryError {
    #[error("timeout {category}.{kind} = {value}ms is outside the valid range [{min}, {max}]")]
    OutOfRange {
        category: String,
        kind: String,
        value: u64,
        min: u64,
        max: u64,
    },
    #[error("unknown timeout category: {0}")]
    UnknownCategory(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimeoutChange {
    pub category: String,
    pub kind: String,
    pub old_ms: Option<u64>,
    pub new_ms: u64,
    pub at: DateTime<Utc>,
}

struct Inner {
    values: Arc<HashMap<Key, u64>>,
    log: Vec<TimeoutChange>,
}

/// Holds the two-level `category -> type -> milliseconds` map.
/// Reads clone the current `Arc` snapshot without taking a write lock;
/// writes are serialized through the same [`parking_lot::RwLock`] and append
/// to a bounded change-log.
pub struct TimeoutRegistry {
    ranges: HashMap<Key, Range>,
    profile_defaults: RwLock<Arc<HashMap<Key, u64>>>,
    state: RwLock<Inner>,
}

impl TimeoutRegistry {
    /// Load defaults for `profile`.
    pub fn new(profile: Profile) -> Self {
        let ranges = builtin_ranges();
        let defaults: HashMap<Key, u64> = ranges
            .iter()
            .map(|(key, range)| {
                let ms = match profile {
                    Profile::Default => range.default_ms,
                    Profile::Testing => range.testing_ms,
                    Profile::Debugging => range.debugging_ms,
                };
                (key.clone(), ms)
            })
            .collect();
        let defaults = Arc::new(defaults);
        Self {
            ranges,
            profile_defaults: RwLock::new(defaults.clone()),
            state: RwLock::new(Inner {
                values: defaults,
                log: Vec::new(),
            }),
        }
    }

    /// Apply `<CATEGORY>_<TYPE>_TIMEOUT_MS` overrides gathered from
    /// environment or config file ("loaded from environment... then
    /// explicit overrides").
    pub fn apply_overrides(
        &self,
        overrides: &pipeline_config::model::TimeoutOverrides,
    ) -> Result<(), TimeoutRegistryError> {
        for (category_raw, types) in &overrides.by_category {
            let category = TimeoutCategory::from_str_loose(category_raw)
                .ok_or_else(|| TimeoutRegistryError::UnknownCategory(category_raw.clone()))?;
            for (kind, millis) in types {
                self.set(category, kind, *millis)?;
            }
        }
        Ok(())
    }

    /// Lock-free read of the current value, falling back to the generic
    /// `[1, 600_000]` default of 30s if never set.
    pub fn get(&self, category: TimeoutCategory, kind: &str) -> Duration {
        let snapshot = self.state.read().values.clone();
        let ms = snapshot
            .get(&(category, kind.to_string()))
            .copied()
            .unwrap_or(30_000);
        Duration::from_millis(ms)
    }

    /// Validated write; serialized behind the registry lock, recorded to the
    /// change-log ("writes are serialized and record a
    /// change-log").
    pub fn set(
        &self,
        category: TimeoutCategory,
        kind: &str,
        millis: u64,
    ) -> Result<(), TimeoutRegistryError> {
        let key: Key = (category, kind.to_string());
        let (min, max) = self
            .ranges
            .get(&key)
            .map(|r| (r.min_ms, r.max_ms))
            .unwrap_or((FALLBACK_MIN_MS, FALLBACK_MAX_MS));

        if millis < min || millis > max {
            return Err(TimeoutRegistryError::OutOfRange {
                category: category.as_str().to_string(),
                kind: kind.to_string(),
                value: millis,
                min,
                max,
            });
        }

        let mut state = self.state.write();
        let old_ms = state.values.get(&key).copied();
        let mut updated = (*state.values).clone();
        updated.insert(key.clone(), millis);
        state.values = Arc::new(updated);
        state.log.push(TimeoutChange {
            category: category.as_str().to_string(),
            kind: kind.to_string(),
            old_ms,
            new_ms: millis,
            at: Utc::now(),
        });
        if state.log.len() > 500 {
            let overflow = state.log.len() - 500;
            state.log.drain(0..overflow);
        }
        Ok(())
    }

    /// Restore the values loaded when the registry was constructed. Reset-
    /// to-defaults restores the original load, discarding runtime overrides.
    pub fn reset_to_defaults(&self) {
        let defaults = self.profile_defaults.read().clone();
        let mut state = self.state.write();
        state.values = defaults;
    }

    pub fn change_log(&self) -> Vec<TimeoutChange> {
        self.state.read().log.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_range_value_is_rejected() {
        let registry = TimeoutRegistry::new(Profile::Default);
        let err = registry
            .set(TimeoutCategory::Worker, "job", 1)
            .unwrap_err();
        assert!(matches!(err, TimeoutRegistryError::OutOfRange { .. }));
    }

    #[test]
    fn testing_profile_is_shorter_than_debugging() {
        let testing = TimeoutRegistry::new(Profile::Testing);
        let debugging = TimeoutRegistry::new(Profile::Debugging);
        assert!(
            testing.get(TimeoutCategory::Worker, "job")
                < debugging.get(TimeoutCategory::Worker, "job")
        );
    }

    #[test]
    fn reset_restores_initial_profile_defaults() {
        let registry = TimeoutRegistry::new(Profile::Default);
        let original = registry.get(TimeoutCategory::Worker, "job");
        registry.set(TimeoutCategory::Worker, "job", 90_000).unwrap();
        assert_ne!(registry.get(TimeoutCategory::Worker, "job"), original);
        registry.reset_to_defaults();
        assert_eq!(registry.get(TimeoutCategory::Worker, "job"), original);
    }

    #[test]
    fn unknown_key_falls_back_to_generic_range() {
        let registry = TimeoutRegistry::new(Profile::Default);
        registry.set(TimeoutCategory::Pipeline, "custom_hook", 42).unwrap();
        assert_eq!(
            registry.get(TimeoutCategory::Pipeline, "custom_hook"),
            Duration::from_millis(42)
        );
    }
}
