use thiserror::Error;

use crate::model::Config;

/// Range and consistency violations that abort startup: validation occurs
/// at boot, and any out-of-range value aborts startup naming the offending
/// field. Generalizes `ConfigGuardRailError` from security guard-rails to
/// numeric-range guard-rails.
#[derive(Debug, Error)]
pub enum ConfigGuardRailError {
    #[error("{field} must be > 0, got {value}")]
    NotPositive { field: &'static str, value: i64 },
    #[error("{field} must be <= {max}, got {value}")]
    AboveMax {
        field: &'static str,
        value: i64,
        max: i64,
    },
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRangeInt {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },
}

#[derive(Debug, Clone)]
pub struct ConfigWarning {
    pub message: String,
    pub hint: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct ConfigWarnings {
    pub items: Vec<ConfigWarning>,
}

impl ConfigWarnings {
    pub fn push<S: Into<String>>(&mut self, message: S) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: None,
        });
    }

    pub fn push_with_hint<S: Into<String>, H: Into<String>>(&mut self, message: S, hint: H) {
        self.items.push(ConfigWarning {
            message: message.into(),
            hint: Some(hint.into()),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn extend(&mut self, other: ConfigWarnings) {
        self.items.extend(other.items);
    }
}

/// Enforces every numeric range named in , returning non-fatal
/// findings as [`ConfigWarnings`] and fatal ones as `Err`.
pub fn apply_guard_rails(config: &Config) -> Result<ConfigWarnings, ConfigGuardRailError> {
    let mut warnings = ConfigWarnings::default();

    if let Some(force) = config.concurrency.force_max_concurrency {
        if force == 0 {
            return Err(ConfigGuardRailError::NotPositive {
                field: "FORCE_MAX_CONCURRENCY",
                value: 0,
            });
        }
        if force > 150 {
            return Err(ConfigGuardRailError::AboveMax {
                field: "FORCE_MAX_CONCURRENCY",
                value: force as i64,
                max: 150,
            });
        }
    }

    if config.concurrency.max_global_concurrency == 0 {
        return Err(ConfigGuardRailError::NotPositive {
            field: "MAX_GLOBAL_CONCURRENCY",
            value: 0,
        });
    }

    check_range(
        "CPU_THRESHOLD",
        config.resource_thresholds.cpu_threshold,
        50.0,
        100.0,
    )?;
    check_range(
        "MEMORY_THRESHOLD",
        config.resource_thresholds.memory_threshold,
        50.0,
        100.0,
    )?;

    if config.batch.max_batch_size == 0 || config.batch.max_batch_size > 100_000 {
        return Err(ConfigGuardRailError::OutOfRangeInt {
            field: "MAX_BATCH_SIZE",
            value: config.batch.max_batch_size as i64,
            min: 1,
            max: 100_000,
        });
    }

    check_range(
        "PIPELINE_MAX_FAILURE_RATE",
        config.failure_policy.max_failure_rate,
        0.0,
        1.0,
    )?;

    let idle_checks = config.failure_policy.required_idle_checks as i64;
    if !(1..=10).contains(&idle_checks) {
        return Err(ConfigGuardRailError::OutOfRangeInt {
            field: "PIPELINE_REQUIRED_IDLE_CHECKS",
            value: idle_checks,
            min: 1,
            max: 10,
        });
    }

    for (category, types) in &config.timeouts.by_category {
        for (kind, millis) in types {
            if *millis == 0 {
                warnings.push_with_hint(
                    format!("{category}_{kind}_TIMEOUT_MS is 0"),
                    "a zero timeout disables the suspension point entirely; confirm this is intended",
                );
            }
        }
    }

    if config.database.redis.is_none() {
        warnings.push_with_hint(
            "REDIS_URL not configured; checkpoint cache hints are disabled",
            "set REDIS_URL to enable the optional cache layer",
        );
    }

    if config.database.neo4j.uri.is_none() {
        warnings.push_with_hint(
            "NEO4J_URI not configured; graph ingestion stage cannot reach its store",
            "set NEO4J_URI, NEO4J_USER, NEO4J_PASSWORD before running the graph-ingestion stage",
        );
    }

    if config.llm.deepseek_api_key.is_none() {
        warnings.push_with_hint(
            "DEEPSEEK_API_KEY not configured; LLM-heavy stages will fail on first call",
            "set DEEPSEEK_API_KEY or route those stages through a different provider",
        );
    }

    Ok(warnings)
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<(), ConfigGuardRailError> {
    if value < min || value > max {
        return Err(ConfigGuardRailError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}
