use std::collections::HashMap;
use std::path::PathBuf;

use pipeline_model::StageName;
use serde::{Deserialize, Serialize};

/// Raw configuration as defined in an optional `pipeline.toml`. Every field
/// is optional; the loader falls back to environment, then defaults.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub struct FileConfig {
    #[serde(default)]
    pub concurrency: FileConcurrencyConfig,
    #[serde(default)]
    pub resources: FileResourceConfig,
    #[serde(default)]
    pub batch: FileBatchConfig,
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub llm: FileLlmConfig,
    #[serde(default)]
    pub failure_policy: FileFailurePolicyConfig,
    pub node_env: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileConcurrencyConfig {
    pub force_max_concurrency: Option<usize>,
    pub max_global_concurrency: Option<usize>,
    #[serde(default)]
    pub per_stage_max_workers: HashMap<String, usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileResourceConfig {
    pub cpu_threshold: Option<f64>,
    pub memory_threshold: Option<f64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBatchConfig {
    pub max_batch_size: Option<u32>,
    pub batch_processing_interval_ms: Option<u64>,
    pub api_rate_limit: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileCacheConfig {
    pub prefix: Option<String>,
    pub ttl_seconds: Option<u64>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    pub sqlite_db_path: Option<PathBuf>,
    pub neo4j_uri: Option<String>,
    pub neo4j_user: Option<String>,
    pub neo4j_password: Option<String>,
    pub neo4j_database: Option<String>,
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileLlmConfig {
    pub deepseek_api_key: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileFailurePolicyConfig {
    pub max_failure_rate: Option<f64>,
    pub required_idle_checks: Option<u8>,
}

/// Environment-derived configuration values ("exhaustive contract").
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub node_env: Option<String>,
    pub force_max_concurrency: Option<usize>,
    pub max_global_concurrency: Option<usize>,
    pub per_stage_max_workers: HashMap<StageName, usize>,
    pub cpu_threshold: Option<f64>,
    pub memory_threshold: Option<f64>,
    pub max_batch_size: Option<u32>,
    pub batch_processing_interval_ms: Option<u64>,
    pub api_rate_limit: Option<u32>,
    pub cache_prefix: Option<String>,
    pub cache_ttl_seconds: Option<u64>,
    pub timeout_overrides: crate::model::TimeoutOverrides,
    pub sqlite_db_path: Option<PathBuf>,
    pub neo4j_uri: Option<String>,
    pub neo4j_user: Option<String>,
    pub neo4j_password: Option<String>,
    pub neo4j_database: Option<String>,
    pub redis_url: Option<String>,
    pub redis_password: Option<String>,
    pub deepseek_api_key: Option<String>,
    pub max_failure_rate: Option<f64>,
    pub required_idle_checks: Option<u8>,
    pub config_path: Option<PathBuf>,
}

/// Timeout categories recognized in `<CATEGORY>_<TYPE>_TIMEOUT_MS`.
const TIMEOUT_CATEGORIES: &[&str] = &[
    "PIPELINE",
    "WORKER",
    "QUEUE",
    "DATABASE",
    "CIRCUITBREAKER",
    "LLM",
    "MONITORING",
    "RELIABILITY",
];

impl EnvConfig {
    pub fn gather() -> Self {
        let mut env = Self {
            node_env: std::env::var("NODE_ENV").ok(),
            force_max_concurrency: parse_var("FORCE_MAX_CONCURRENCY"),
            max_global_concurrency: parse_var("MAX_GLOBAL_CONCURRENCY"),
            cpu_threshold: parse_var("CPU_THRESHOLD"),
            memory_threshold: parse_var("MEMORY_THRESHOLD"),
            max_batch_size: parse_var("MAX_BATCH_SIZE"),
            batch_processing_interval_ms: parse_var("BATCH_PROCESSING_INTERVAL"),
            api_rate_limit: parse_var("API_RATE_LIMIT"),
            cache_prefix: std::env::var("CACHE_PREFIX").ok(),
            cache_ttl_seconds: parse_var("CACHE_TTL_SECONDS"),
            sqlite_db_path: std::env::var("SQLITE_DB_PATH").ok().map(PathBuf::from),
            neo4j_uri: std::env::var("NEO4J_URI").ok(),
            neo4j_user: std::env::var("NEO4J_USER").ok(),
            neo4j_password: std::env::var("NEO4J_PASSWORD").ok(),
            neo4j_database: std::env::var("NEO4J_DATABASE").ok(),
            redis_url: std::env::var("REDIS_URL").ok(),
            redis_password: std::env::var("REDIS_PASSWORD").ok(),
            deepseek_api_key: std::env::var("DEEPSEEK_API_KEY").ok(),
            max_failure_rate: parse_var("PIPELINE_MAX_FAILURE_RATE"),
            required_idle_checks: parse_var("PIPELINE_REQUIRED_IDLE_CHECKS"),
            config_path: std::env::var("PIPELINE_CONFIG_PATH").ok().map(PathBuf::from),
            ..Self::default()
        };

        for stage in StageName::ALL {
            let key = format!("MAX_{}_WORKERS", stage.env_fragment());
            if let Some(value) = parse_var::<usize>(&key) {
                env.per_stage_max_workers.insert(stage, value);
            }
        }

        env.timeout_overrides = gather_timeout_overrides();

        env
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|raw| raw.parse().ok())
}

/// Scans the process environment for `<CATEGORY>_<TYPE>_TIMEOUT_MS` names
///, matching against the known category prefixes.
fn gather_timeout_overrides() -> crate::model::TimeoutOverrides {
    let mut overrides = crate::model::TimeoutOverrides::default();

    for (key, value) in std::env::vars() {
        let Some(body) = key.strip_suffix("_TIMEOUT_MS") else {
            continue;
        };
        let Some((category, kind)) = TIMEOUT_CATEGORIES.iter().find_map(|category| {
            body.strip_prefix(category)
                .and_then(|rest| rest.strip_prefix('_'))
                .map(|kind| (*category, kind))
        }) else {
            continue;
        };
        if let Ok(millis) = value.parse::<u64>() {
            overrides.insert(category, kind, millis);
        }
    }

    overrides
}
