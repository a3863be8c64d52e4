//! Default [`EventBus`] implementation over `tokio::sync::broadcast`,
//! replacing the cyclic `WorkerPoolManager`/`SystemMonitor`/`HealthMonitor`
//! object references of `ferrex-core::scan::orchestration::events` with
//! one-way notifications.

use chrono::Utc;
use tokio::sync::broadcast;

use pipeline_contracts::events::{EventBus, PipelineEvent, PipelineEventEnvelope};

const DEFAULT_CHANNEL_CAPACITY: usize = 1_024;

pub struct BroadcastEventBus {
    tx: broadcast::Sender<PipelineEventEnvelope>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: PipelineEvent) {
        let envelope = PipelineEventEnvelope {
            event,
            emitted_at: Utc::now(),
        };
        // No receivers is the common case between bursts; a dropped event
        // here is a stat, not a bug, since the bus is a side-channel, not
        // the system of record.
        let _ = self.tx.send(envelope);
    }

    fn subscribe(&self) -> broadcast::Receiver<PipelineEventEnvelope> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_model::{JobId, RunId, StageName};

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = BroadcastEventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(PipelineEvent::JobEnqueued {
            run_id: RunId::new(),
            job_id: JobId::new(),
            stage: StageName::FileAnalysis,
        });
        let received = rx.recv().await.unwrap();
        assert!(matches!(received.event, PipelineEvent::JobEnqueued { .. }));
    }
}
