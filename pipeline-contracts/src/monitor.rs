use async_trait::async_trait;

use pipeline_model::{MeasurementSample, StageName, Trend};

use crate::error::Result;

/// System-level resource probe consulted by the monitor's sampling loop
///. Kept separate from [`DependencyProbe`] because resource
/// sampling is local and synchronous-feeling while dependency checks cross
/// the network.
pub trait SystemProbe: Send + Sync {
    fn cpu_pct(&self) -> f64;

    fn memory_pct(&self) -> f64;

    fn event_loop_lag_ms(&self) -> f64;
}

/// An external dependency the health monitor polls ("Dependency
/// probe"): Postgres, Redis, Neo4j, or an LLM provider's health endpoint.
#[async_trait]
pub trait DependencyProbe: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<()>;
}

/// Read side of the system monitor: current measurement and trend for a
/// stage (`trend(stage)`).
#[async_trait]
pub trait SystemMonitor: Send + Sync {
    async fn record(&self, sample: MeasurementSample);

    async fn current(&self, stage: StageName) -> Option<MeasurementSample>;

    async fn trend(&self, stage: StageName) -> Option<Trend>;
}
