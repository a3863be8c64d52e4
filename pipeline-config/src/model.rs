use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use pipeline_model::StageName;
use serde::{Deserialize, Serialize};

/// Timeout preset selected by `NODE_ENV`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Profile {
    Default,
    Testing,
    Debugging,
}

impl Profile {
    pub fn from_node_env(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "test" | "testing" => Profile::Testing,
            "debug" | "debugging" => Profile::Debugging,
            _ => Profile::Default,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// `FORCE_MAX_CONCURRENCY`: bypasses adaptive allocation entirely when set.
    pub force_max_concurrency: Option<usize>,
    /// `MAX_GLOBAL_CONCURRENCY`: fallback ceiling when force is unset.
    pub max_global_concurrency: usize,
    /// `MAX_<STAGE>_WORKERS` per stage.
    pub per_stage_max_workers: HashMap<StageName, usize>,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            force_max_concurrency: None,
            max_global_concurrency: 50,
            per_stage_max_workers: HashMap::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct ResourceThresholds {
    pub cpu_threshold: f64,
    pub memory_threshold: f64,
}

impl Default for ResourceThresholds {
    fn default() -> Self {
        Self {
            cpu_threshold: 80.0,
            memory_threshold: 85.0,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    pub max_batch_size: u32,
    #[serde(with = "crate::humantime_duration")]
    pub batch_processing_interval: Duration,
    pub api_rate_limit: Option<u32>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 1_000,
            batch_processing_interval: Duration::from_millis(500),
            api_rate_limit: None,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CacheConfig {
    pub prefix: Option<String>,
    #[serde(with = "crate::humantime_duration_opt", default)]
    pub ttl: Option<Duration>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub uri: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    pub password: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_db_path: Option<PathBuf>,
    pub neo4j: Neo4jConfig,
    pub redis: Option<RedisConfig>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct LlmConfig {
    pub deepseek_api_key: Option<String>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct FailurePolicyConfig {
    pub max_failure_rate: f64,
    pub required_idle_checks: u8,
}

impl Default for FailurePolicyConfig {
    fn default() -> Self {
        Self {
            max_failure_rate: 0.5,
            required_idle_checks: 3,
        }
    }
}

/// Two-level `category -> type -> milliseconds` timeout overrides, fed to
/// `pipeline_core`'s timeout registry at startup.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TimeoutOverrides {
    pub by_category: HashMap<String, HashMap<String, u64>>,
}

impl TimeoutOverrides {
    pub fn insert(&mut self, category: &str, kind: &str, millis: u64) {
        self.by_category
            .entry(category.to_ascii_lowercase())
            .or_default()
            .insert(kind.to_ascii_lowercase(), millis);
    }

    pub fn merge(&mut self, other: TimeoutOverrides) {
        for (category, types) in other.by_category {
            let entry = self.by_category.entry(category).or_default();
            for (kind, millis) in types {
                entry.insert(kind, millis);
            }
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// Fully composed, validated configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub profile: Profile,
    pub concurrency: ConcurrencyConfig,
    pub resource_thresholds: ResourceThresholds,
    pub batch: BatchConfig,
    pub cache: CacheConfig,
    pub timeouts: TimeoutOverrides,
    pub database: DatabaseConfig,
    pub llm: LlmConfig,
    pub failure_policy: FailurePolicyConfig,
    pub metadata: ConfigMetadata,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            profile: Profile::Default,
            concurrency: ConcurrencyConfig::default(),
            resource_thresholds: ResourceThresholds::default(),
            batch: BatchConfig::default(),
            cache: CacheConfig::default(),
            timeouts: TimeoutOverrides::default(),
            database: DatabaseConfig::default(),
            llm: LlmConfig::default(),
            failure_policy: FailurePolicyConfig::default(),
            metadata: ConfigMetadata::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_env_maps_to_profile() {
        assert_eq!(Profile::from_node_env("test"), Profile::Testing);
        assert_eq!(Profile::from_node_env("DEBUG"), Profile::Debugging);
        assert_eq!(Profile::from_node_env("production"), Profile::Default);
        assert_eq!(Profile::from_node_env("development"), Profile::Default);
    }

    #[test]
    fn timeout_overrides_merge_prefers_incoming() {
        let mut base = TimeoutOverrides::default();
        base.insert("worker", "poll", 100);

        let mut incoming = TimeoutOverrides::default();
        incoming.insert("worker", "poll", 250);
        incoming.insert("queue", "reserve", 50);

        base.merge(incoming);

        assert_eq!(base.by_category["worker"]["poll"], 250);
        assert_eq!(base.by_category["queue"]["reserve"], 50);
    }
}
