use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::Lazy;
use thiserror::Error;

use crate::model::{
    BatchConfig, CacheConfig, Config, ConcurrencyConfig, ConfigMetadata, DatabaseConfig,
    FailurePolicyConfig, LlmConfig, Neo4jConfig, Profile, RedisConfig, ResourceThresholds,
};
use crate::sources::{EnvConfig, FileConfig};
use crate::validation::{self, ConfigGuardRailError, ConfigWarnings};
use pipeline_model::StageName;

static DEFAULT_CONFIG_LOCATIONS: Lazy<Vec<PathBuf>> = Lazy::new(|| {
    vec![
        PathBuf::from("pipeline.toml"),
        PathBuf::from("config/pipeline.toml"),
    ]
});

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<ConfigLoad, ConfigError> {
        let env_file_loaded = match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                other => Err(other),
            })?,
            None => dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                other => Err(other),
            })?,
        };

        let env = EnvConfig::gather();
        let (file_config, config_path, config_present) = self.load_file_config(&env)?;
        tracing::debug!(config_present, env_file_loaded, "configuration sources resolved");

        let (config, mut warnings) =
            self.compose(file_config, env, config_path, env_file_loaded, config_present)?;

        if !config_present {
            warnings.push_with_hint(
                "No pipeline.toml detected; falling back to environment variables",
                "set PIPELINE_CONFIG_PATH or create pipeline.toml in the working directory",
            );
        }

        Ok(ConfigLoad { config, warnings })
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>, bool), ConfigError> {
        let explicit = self.options.config_path.clone().or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) => Some(path),
            None => DEFAULT_CONFIG_LOCATIONS
                .iter()
                .find(|candidate| candidate.exists())
                .cloned(),
        };

        let Some(path) = path else {
            return Ok((None, None, false));
        };

        if !path.exists() {
            return Err(ConfigError::MissingConfig { path });
        }

        let contents = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let file_config: FileConfig = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;

        Ok((Some(file_config), Some(path), true))
    }

    fn compose(
        &self,
        file_config: Option<FileConfig>,
        env: EnvConfig,
        config_path: Option<PathBuf>,
        env_file_loaded: bool,
        _config_present: bool,
    ) -> Result<(Config, ConfigWarnings), ConfigError> {
        let file = file_config.unwrap_or_default();

        let profile = env
            .node_env
            .clone()
            .or(file.node_env.clone())
            .map(|raw| Profile::from_node_env(&raw))
            .unwrap_or(Profile::Default);

        let mut per_stage_max_workers = env.per_stage_max_workers.clone();
        for (name, value) in &file.concurrency.per_stage_max_workers {
            if let Some(stage) = StageName::ALL.into_iter().find(|s| s.env_fragment().eq_ignore_ascii_case(name)) {
                per_stage_max_workers.entry(stage).or_insert(*value);
            }
        }

        let concurrency = ConcurrencyConfig {
            force_max_concurrency: env
                .force_max_concurrency
                .or(file.concurrency.force_max_concurrency),
            max_global_concurrency: env
                .max_global_concurrency
                .or(file.concurrency.max_global_concurrency)
                .unwrap_or(50),
            per_stage_max_workers,
        };

        let resource_thresholds = ResourceThresholds {
            cpu_threshold: env
                .cpu_threshold
                .or(file.resources.cpu_threshold)
                .unwrap_or(80.0),
            memory_threshold: env
                .memory_threshold
                .or(file.resources.memory_threshold)
                .unwrap_or(85.0),
        };

        let batch = BatchConfig {
            max_batch_size: env.max_batch_size.or(file.batch.max_batch_size).unwrap_or(1_000),
            batch_processing_interval: Duration::from_millis(
                env.batch_processing_interval_ms
                    .or(file.batch.batch_processing_interval_ms)
                    .unwrap_or(500),
            ),
            api_rate_limit: env.api_rate_limit.or(file.batch.api_rate_limit),
        };

        let cache = CacheConfig {
            prefix: env.cache_prefix.clone().or(file.cache.prefix.clone()),
            ttl: env
                .cache_ttl_seconds
                .or(file.cache.ttl_seconds)
                .map(Duration::from_secs)
                .or(Some(Duration::from_secs(3_600))),
        };

        let timeouts = env.timeout_overrides.clone();

        let database = DatabaseConfig {
            sqlite_db_path: env.sqlite_db_path.clone().or(file.database.sqlite_db_path.clone()),
            neo4j: Neo4jConfig {
                uri: env.neo4j_uri.clone().or(file.database.neo4j_uri.clone()),
                user: env.neo4j_user.clone().or(file.database.neo4j_user.clone()),
                password: env
                    .neo4j_password
                    .clone()
                    .or(file.database.neo4j_password.clone()),
                database: env
                    .neo4j_database
                    .clone()
                    .or(file.database.neo4j_database.clone()),
            },
            redis: env
                .redis_url
                .clone()
                .or(file.database.redis_url.clone())
                .map(|url| RedisConfig {
                    url,
                    password: env
                        .redis_password
                        .clone()
                        .or(file.database.redis_password.clone()),
                }),
        };

        let llm = LlmConfig {
            deepseek_api_key: env
                .deepseek_api_key
                .clone()
                .or(file.llm.deepseek_api_key.clone()),
        };

        let failure_policy = FailurePolicyConfig {
            max_failure_rate: env
                .max_failure_rate
                .or(file.failure_policy.max_failure_rate)
                .unwrap_or(0.5),
            required_idle_checks: env
                .required_idle_checks
                .or(file.failure_policy.required_idle_checks)
                .unwrap_or(3),
        };

        let metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };

        let config = Config {
            profile,
            concurrency,
            resource_thresholds,
            batch,
            cache,
            timeouts,
            database,
            llm,
            failure_policy,
            metadata,
        };

        let warnings = validation::apply_guard_rails(&config)?;

        Ok((config, warnings))
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file missing: {path:?}")]
    MissingConfig { path: PathBuf },
    #[error("failed to read configuration {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration {path:?}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    GuardRail(#[from] ConfigGuardRailError),
    #[error(transparent)]
    EnvFile(#[from] dotenvy::Error),
}

#[derive(Debug)]
pub struct ConfigLoad {
    pub config: Config,
    pub warnings: ConfigWarnings,
}
