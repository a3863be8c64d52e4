//! Boots the timeout registry, rate limiter, circuit breakers, system
//! monitor, worker pool, queues, outbox publisher, checkpoint manager, and
//! health monitor from the resolved configuration, seeds the initial
//! `FileAnalysis` jobs for a target directory, drives the run to drain, and
//! exits 0 on success or 1 on fatal/failure-rate-triggered shutdown.
//! Bootstrap shape (CLI parse, config load, tracing init, construct
//! services, serve until told to stop) mirrors `ferrex-server`'s
//! `main.rs`, with the HTTP surface kept to a thin `/healthz`+`/status`
//! pair rather than a full API.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::State, routing::get, Json, Router};
use clap::Parser;
use serde_json::json;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use walkdir::WalkDir;

use pipeline_config::{Config, ConfigLoader, ConfigLoaderOptions};
use pipeline_contracts::error::PipelineError;
use pipeline_contracts::events::EventBus;
use pipeline_contracts::monitor::DependencyProbe;
use pipeline_contracts::prelude::{JobQueue, OutboxStore};
use pipeline_core::checkpoint::CheckpointManager;
use pipeline_core::circuit_breaker::CircuitBreakerRegistry;
use pipeline_core::coordinator::{DrainPolicy, InitialJobSpec, PipelineCoordinator};
use pipeline_core::events::BroadcastEventBus;
use pipeline_core::health_monitor::{spawn_health_loops, HealthMonitor, HealthMonitorThresholds};
use pipeline_core::managed_worker::{ManagedWorker, StageHandler};
use pipeline_core::outbox::{OutboxPublisher, PostgresOutboxStore};
use pipeline_core::queue::PostgresJobQueue;
use pipeline_core::rate_limiter::RateLimiter;
use pipeline_core::system_monitor::{MonitorThresholds, SystemMonitor};
use pipeline_core::timeout_registry::TimeoutRegistry;
use pipeline_core::worker_pool::{AdaptiveScalingPolicy, WorkerPoolManager};
use pipeline_model::{
    Benchmarks, EntityKey, OutboxEventType, RateLimitPolicy, RetryPolicy, RunId, StageBreakerPolicy,
    StageDescriptor, StageName, StagePriority,
};

/// Command-line surface: `--run-id`, `--target-dir`, `--config`,
/// `--dry-run`.
#[derive(Parser, Debug)]
#[command(name = "pipeline-runner")]
#[command(about = "Adaptive worker-pool and job-orchestration core for the analysis pipeline")]
struct Args {
    /// Resume or label this invocation with a specific run id; a fresh one
    /// is generated when omitted.
    #[arg(long)]
    run_id: Option<uuid::Uuid>,

    /// Directory to seed `FileAnalysis` jobs from.
    #[arg(long)]
    target_dir: PathBuf,

    /// Explicit path to `pipeline.toml`, overriding the default search path.
    #[arg(long, env = "PIPELINE_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Walk `target_dir` and report what would be enqueued without
    /// connecting to the database or starting any workers.
    #[arg(long)]
    dry_run: bool,

    /// Postgres connection string backing the queues, outbox, and
    /// checkpoints (not part of `pipeline_config::Config` since that crate
    /// models only sqlite/neo4j/redis backends; see DESIGN.md).
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Address the `/healthz`+`/status` observability surface binds to.
    #[arg(long, env = "RUNNER_HTTP_ADDR", default_value = "0.0.0.0:8089")]
    http_addr: SocketAddr,
}

#[derive(Clone)]
struct ObserveState {
    pool: Arc<WorkerPoolManager>,
    health: Arc<HealthMonitor>,
}

async fn healthz_handler(State(state): State<ObserveState>) -> Json<serde_json::Value> {
    let deps = state.health.snapshot();
    Json(json!({
        "healthy": state.health.all_healthy(),
        "dependencies": deps.iter().map(|d| json!({
            "name": d.name,
            "healthy": d.healthy,
            "last_error": d.last_error,
        })).collect::<Vec<_>>(),
    }))
}

async fn status_handler(State(state): State<ObserveState>) -> Json<serde_json::Value> {
    let status = state.pool.status();
    Json(json!({
        "global_cap": status.global_cap,
        "global_available": status.global_available,
        "stages": status.stages.iter().map(|s| json!({
            "stage": s.stage.to_string(),
            "cur": s.cur,
            "min": s.min,
            "max": s.max,
            "in_flight": s.in_flight,
            "available": s.available,
        })).collect::<Vec<_>>(),
    }))
}

/// Default per-stage concurrency/rate/breaker policy, tuned tighter for
/// LLM-heavy stages (lower failure threshold, longer job timeout, higher
/// priority).
fn default_stage_descriptor(stage: StageName, config: &Config) -> StageDescriptor {
    let max_workers = config
        .concurrency
        .per_stage_max_workers
        .get(&stage)
        .copied()
        .unwrap_or(8);
    let base = (max_workers / 2).max(1);
    StageDescriptor {
        name: stage,
        min: 1,
        base,
        max: max_workers.max(base),
        priority: StagePriority::clamped(if stage.is_llm_heavy() { 7 } else { 5 }),
        rate_limit: RateLimitPolicy {
            capacity: 50.0,
            refill_per_second: 10.0,
            burst_capacity: 10.0,
            burst_window: Duration::from_secs(1),
        },
        breaker_policy: StageBreakerPolicy {
            failure_threshold: if stage.is_llm_heavy() { 3 } else { 5 },
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        },
        job_timeout: Duration::from_secs(if stage.is_llm_heavy() { 120 } else { 30 }),
        retries: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(10),
        },
    }
}

/// Fans an outbox row out to the downstream stage's queue named by its
/// event type. `FileAnalysis` has no inbound event type; it is only ever
/// the producer's entry stage.
fn event_type_to_stage(event_type: OutboxEventType) -> StageName {
    match event_type {
        OutboxEventType::DirectoryAggregation => StageName::DirectoryAggregation,
        OutboxEventType::DirectoryResolution => StageName::DirectoryResolution,
        OutboxEventType::RelationshipResolution => StageName::RelationshipResolution,
        OutboxEventType::Validation => StageName::Validation,
        OutboxEventType::Reconciliation => StageName::Reconciliation,
        OutboxEventType::GraphIngestion => StageName::GraphIngestion,
    }
}

/// Placeholder stage handler: records that a job ran. Analyzer logic for
/// each stage is out of scope here; this is the seam `pipeline-runner`
/// would hand off to a real analyzer implementation.
struct NoopStageHandler {
    stage: StageName,
}

#[async_trait::async_trait]
impl StageHandler for NoopStageHandler {
    async fn handle(
        &self,
        job: &pipeline_model::Job,
        _cancel: CancellationToken,
    ) -> pipeline_contracts::error::Result<()> {
        tracing::debug!(stage = %self.stage, job_id = %job.id, entity = job.entity_key.as_str(), "handled job (no-op analyzer)");
        Ok(())
    }
}

struct PostgresDependencyProbe {
    pool: sqlx::PgPool,
}

#[async_trait::async_trait]
impl DependencyProbe for PostgresDependencyProbe {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn check(&self) -> pipeline_contracts::error::Result<()> {
        sqlx::query_scalar::<_, i32>("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| PipelineError::DependencyUnreachable("postgres".into(), e.to_string()))
    }
}

/// Walks `target_dir` and returns one `InitialJobSpec` per regular file.
/// Traversal style follows `ferrex-core::scanner`'s `scan_directory`,
/// generalized from video-extension filtering to "every file is a unit
/// of work".
fn seed_specs_from_directory(target_dir: &PathBuf) -> Vec<InitialJobSpec> {
    let mut specs = Vec::new();
    for entry in WalkDir::new(target_dir).follow_links(false) {
        let entry = match entry {
            Ok(e) => e,
            Err(err) => {
                warn!(error = %err, "directory walk error");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path().display().to_string();
        specs.push(InitialJobSpec {
            entity_key: EntityKey::FilePath(path.clone()),
            payload: json!({ "path": path }),
        });
    }
    specs
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pipeline_runner=info,pipeline_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();

    let config = match ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config.clone(),
        env_file: None,
    })
    .load()
    {
        Ok(loaded) => {
            for warning in &loaded.warnings.items {
                warn!(hint = ?warning.hint, "{}", warning.message);
            }
            loaded.config
        }
        Err(err) => {
            error!(error = %err, "configuration failed to load");
            std::process::exit(1);
        }
    };

    if args.dry_run {
        let specs = seed_specs_from_directory(&args.target_dir);
        info!(count = specs.len(), "dry run: would enqueue this many FileAnalysis jobs");
        return;
    }

    let Some(database_url) = args.database_url.clone() else {
        error!("DATABASE_URL not set; pass --database-url or set the environment variable");
        std::process::exit(1);
    };

    match run(args, config, database_url).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            error!(error = %err, "pipeline run failed fatally");
            std::process::exit(1);
        }
    }
}

async fn run(args: Args, config: Config, database_url: String) -> anyhow::Result<()> {
    let run_id = args.run_id.map(RunId).unwrap_or_else(RunId::new);
    info!(run_id = %run_id, "booting pipeline-runner");

    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await?;

    let timeouts = Arc::new(TimeoutRegistry::new(config.profile));
    timeouts.apply_overrides(&config.timeouts)?;

    let events: Arc<dyn EventBus> = Arc::new(BroadcastEventBus::new());

    let breaker_policies: HashMap<StageName, pipeline_model::StageBreakerPolicy> = StageName::ALL
        .into_iter()
        .map(|s| (s, default_stage_descriptor(s, &config).breaker_policy))
        .collect();
    let breakers = Arc::new(CircuitBreakerRegistry::new(breaker_policies, events.clone()));

    let limit_policies: HashMap<StageName, RateLimitPolicy> = StageName::ALL
        .into_iter()
        .map(|s| (s, default_stage_descriptor(s, &config).rate_limit))
        .collect();
    let limiter = Arc::new(RateLimiter::new(limit_policies));

    let monitor_thresholds = MonitorThresholds {
        cpu_warning: config.resource_thresholds.cpu_threshold * 0.85,
        cpu_critical: config.resource_thresholds.cpu_threshold,
        memory_warning: config.resource_thresholds.memory_threshold * 0.85,
        memory_critical: config.resource_thresholds.memory_threshold,
        ..MonitorThresholds::default()
    };
    let monitor: Arc<dyn pipeline_contracts::monitor::SystemMonitor> =
        Arc::new(SystemMonitor::new(monitor_thresholds, events.clone()));

    let global_cap = config
        .concurrency
        .force_max_concurrency
        .unwrap_or(config.concurrency.max_global_concurrency);

    let pool_manager = Arc::new(WorkerPoolManager::new(
        global_cap,
        breakers,
        limiter,
        monitor,
        events.clone(),
        AdaptiveScalingPolicy::default(),
        timeouts.get(pipeline_core::timeout_registry::TimeoutCategory::Worker, "slot_acquisition"),
    ));

    for stage in StageName::ALL {
        pool_manager.register_stage(default_stage_descriptor(stage, &config))?;
    }
    if let Some(forced) = config.concurrency.force_max_concurrency {
        pool_manager.apply_forced_concurrency(forced)?;
    }

    let mut queues: HashMap<StageName, Arc<dyn JobQueue>> = HashMap::new();
    for stage in StageName::ALL {
        let queue = PostgresJobQueue::new(pool.clone(), stage, Duration::from_secs(600)).await?;
        queues.insert(stage, Arc::new(queue));
    }

    let workers: Vec<Arc<ManagedWorker>> = StageName::ALL
        .into_iter()
        .map(|stage| {
            Arc::new(ManagedWorker::new(
                queues[&stage].clone(),
                pool_manager.clone(),
                Arc::new(NoopStageHandler { stage }),
                events.clone(),
                Duration::from_millis(500),
                10,
            ))
        })
        .collect();

    let checkpoint_store = Arc::new(pipeline_core::checkpoint::PostgresCheckpointStore::new(pool.clone()));
    let checkpoints = Arc::new(CheckpointManager::new(checkpoint_store, events.clone(), Benchmarks::default()));

    let outbox_store: Arc<dyn OutboxStore> = Arc::new(PostgresOutboxStore::new(pool.clone(), Duration::from_secs(120)));
    let publish_queues = queues.clone();
    let publisher = OutboxPublisher::new(outbox_store.clone(), "pipeline-runner", 50, 5, move |row| {
        let stage = event_type_to_stage(row.event_type);
        let queue = publish_queues
            .get(&stage)
            .ok_or_else(|| PipelineError::Config(format!("no queue registered for stage {stage}")))?;
        let job = pipeline_model::Job::new(
            row.run_id,
            stage,
            EntityKey::BatchId(row.id.to_string()),
            row.payload.clone(),
        );
        let queue = queue.clone();
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(queue.enqueue(row.run_id, job, Default::default()))
        })?;
        Ok(())
    });

    let health = Arc::new(HealthMonitor::new(HealthMonitorThresholds::default(), events.clone()));
    health.register(Arc::new(PostgresDependencyProbe { pool: pool.clone() }), None);
    let shutdown_token = CancellationToken::new();
    let health_loops = spawn_health_loops(health.clone(), shutdown_token.clone());

    let observe_state = ObserveState {
        pool: pool_manager.clone(),
        health: health.clone(),
    };
    let http_router = Router::new()
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(observe_state);
    let http_addr = args.http_addr;
    let http_task = tokio::spawn(async move {
        match tokio::net::TcpListener::bind(http_addr).await {
            Ok(listener) => {
                if let Err(err) = axum::serve(listener, http_router).await {
                    warn!(error = %err, "observability server stopped");
                }
            }
            Err(err) => warn!(error = %err, "failed to bind observability server"),
        }
    });

    let coordinator = PipelineCoordinator::new(
        pool_manager.clone(),
        queues.clone(),
        workers,
        checkpoints,
        outbox_store.clone(),
        events.clone(),
        DrainPolicy::default(),
        timeouts.get(pipeline_core::timeout_registry::TimeoutCategory::Worker, "shutdown"),
    );

    let specs = seed_specs_from_directory(&args.target_dir);
    let seeded = coordinator.seed_initial_jobs(run_id, specs).await?;
    info!(run_id = %run_id, seeded, "initial jobs enqueued");

    let worker_handles = coordinator.spawn_workers();
    let outbox_shutdown = shutdown_token.clone();
    let outbox_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            tokio::select! {
                _ = outbox_shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = publisher.run_once().await {
                        warn!(error = %err, "outbox publish cycle failed");
                    }
                }
            }
        }
    });

    let started = std::time::Instant::now();
    let run_result = coordinator.run_to_drain_and_shutdown(run_id).await;
    coordinator
        .checkpoints()
        .record_run_duration(run_id, started.elapsed().as_millis() as u64);

    shutdown_token.cancel();
    outbox_task.abort();
    http_task.abort();
    for handle in health_loops {
        handle.abort();
    }
    for handle in worker_handles {
        handle.abort();
    }

    run_result.map_err(anyhow::Error::from)
}
