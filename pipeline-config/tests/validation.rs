use pipeline_config::model::{
    BatchConfig, Config, FailurePolicyConfig, ResourceThresholds,
};
use pipeline_config::validation::apply_guard_rails;

fn base_config() -> Config {
    Config::default()
}

#[test]
fn accepts_defaults() {
    let config = base_config();
    let warnings = apply_guard_rails(&config).expect("defaults must pass guard rails");
    assert!(!warnings.is_empty(), "missing redis/neo4j/llm should warn, not fail");
}

#[test]
fn rejects_cpu_threshold_out_of_range() {
    let mut config = base_config();
    config.resource_thresholds = ResourceThresholds {
        cpu_threshold: 10.0,
        memory_threshold: 80.0,
    };
    assert!(apply_guard_rails(&config).is_err());
}

#[test]
fn rejects_batch_size_above_max() {
    let mut config = base_config();
    config.batch = BatchConfig {
        max_batch_size: 200_000,
        ..BatchConfig::default()
    };
    assert!(apply_guard_rails(&config).is_err());
}

#[test]
fn rejects_failure_rate_out_of_unit_interval() {
    let mut config = base_config();
    config.failure_policy = FailurePolicyConfig {
        max_failure_rate: 1.5,
        required_idle_checks: 3,
    };
    assert!(apply_guard_rails(&config).is_err());
}

#[test]
fn rejects_idle_checks_out_of_range() {
    let mut config = base_config();
    config.failure_policy = FailurePolicyConfig {
        max_failure_rate: 0.5,
        required_idle_checks: 0,
    };
    assert!(apply_guard_rails(&config).is_err());
}
