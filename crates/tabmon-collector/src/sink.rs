use async_trait::async_trait;
use tabmon_common::types::{EventRecord, MetricRecord};

/// Destination for derived metric values.
#[async_trait]
pub trait MetricSink: Send + Sync {
    async fn write(&self, record: MetricRecord) -> anyhow::Result<()>;
}

/// Destination for per-task success and failure events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: EventRecord) -> anyhow::Result<()>;
}
