use anyhow::Context;
use async_trait::async_trait;
use std::path::Path;
use tabmon_collector::sink::{EventSink, MetricSink};
use tabmon_common::types::{EventRecord, MetricRecord, Severity};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub struct LogMetricSink;

#[async_trait]
impl MetricSink for LogMetricSink {
    async fn write(&self, record: MetricRecord) -> anyhow::Result<()> {
        tracing::info!(
            path = %record.path,
            value = record.value,
            kind = %record.kind,
            timestamp = %record.timestamp,
            "Metric"
        );
        Ok(())
    }
}

pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn send(&self, event: EventRecord) -> anyhow::Result<()> {
        match event.severity {
            Severity::Clear | Severity::Debug | Severity::Info => tracing::info!(
                device = %event.device,
                component = %event.component,
                severity = %event.severity,
                key = %event.event_key,
                "{}", event.summary
            ),
            Severity::Warning => tracing::warn!(
                device = %event.device,
                component = %event.component,
                key = %event.event_key,
                "{}", event.summary
            ),
            Severity::Error | Severity::Critical => tracing::error!(
                device = %event.device,
                component = %event.component,
                severity = %event.severity,
                key = %event.event_key,
                "{}", event.summary
            ),
        }
        Ok(())
    }
}

/// Appends every metric as one JSON object per line.
pub struct JsonLinesMetricSink {
    file: Mutex<tokio::fs::File>,
}

impl JsonLinesMetricSink {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .with_context(|| format!("failed to open metrics file {}", path.display()))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl MetricSink for JsonLinesMetricSink {
    async fn write(&self, record: MetricRecord) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tabmon_common::types::MetricKind;

    fn record(path: &str, value: f64) -> MetricRecord {
        MetricRecord {
            path: path.to_string(),
            value,
            kind: MetricKind::Counter,
            create_hint: None,
            timestamp: Utc::now(),
            min: Some(0.0),
            max: None,
        }
    }

    #[tokio::test]
    async fn json_lines_sink_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");

        let sink = JsonLinesMetricSink::open(&path).await.unwrap();
        sink.write(record("db01/sessions", 12.0)).await.unwrap();
        sink.write(record("db01/locks", 3.0)).await.unwrap();
        drop(sink);

        let reopened = JsonLinesMetricSink::open(&path).await.unwrap();
        reopened.write(record("db01/waits", 1.5)).await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let records: Vec<MetricRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].path, "db01/sessions");
        assert_eq!(records[1].value, 3.0);
        assert_eq!(records[2].kind, MetricKind::Counter);
    }

    #[tokio::test]
    async fn log_sinks_accept_everything() {
        assert!(LogMetricSink.write(record("x", 1.0)).await.is_ok());
        let event = EventRecord {
            device: "d".into(),
            component: String::new(),
            event_class: "/Status/DataSource".into(),
            event_key: "k".into(),
            severity: Severity::Critical,
            summary: "wbem connection failed".into(),
            timestamp: Utc::now(),
        };
        assert!(LogEventSink.send(event).await.is_ok());
    }
}
