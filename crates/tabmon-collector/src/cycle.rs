use crate::derive::datapoint_value;
use crate::error::TaskError;
use crate::registry::ExecutorRegistry;
use crate::sink::{EventSink, MetricSink};
use crate::task::Task;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::sync::Arc;
use tabmon_common::row::Row;
use tabmon_common::types::{EventRecord, MetricRecord, Severity};

/// Outcome counters of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tasks_ok: usize,
    pub tasks_failed: usize,
    pub metrics_written: usize,
}

/// Runs collection cycles: submit, derive, emit.
pub struct Collector {
    registry: Arc<ExecutorRegistry>,
    metrics: Arc<dyn MetricSink>,
    events: Arc<dyn EventSink>,
}

impl Collector {
    pub fn new(
        registry: Arc<ExecutorRegistry>,
        metrics: Arc<dyn MetricSink>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            registry,
            metrics,
            events,
        }
    }

    /// Submits every task at once and handles each result as it is
    /// delivered. A failing task or sink never stops the others.
    pub async fn run_cycle(&self, tasks: Vec<Arc<Task>>) -> CycleReport {
        let started = Utc::now();
        let outcomes = join_all(tasks.iter().map(|task| async move {
            let result = self.registry.submit(task.clone()).await;
            self.handle(task, result, started).await
        }))
        .await;

        let mut report = CycleReport::default();
        for written in outcomes {
            match written {
                Some(n) => {
                    report.tasks_ok += 1;
                    report.metrics_written += n;
                }
                None => report.tasks_failed += 1,
            }
        }
        report
    }

    /// Returns the number of metrics written, or `None` if the task failed.
    async fn handle(
        &self,
        task: &Task,
        result: Result<Vec<Row>, TaskError>,
        started: DateTime<Utc>,
    ) -> Option<usize> {
        match result {
            Ok(rows) => {
                let written = self.emit_metrics(task, &rows, started).await;
                self.emit_event(task, Severity::Clear, format!("{} rows collected", rows.len()))
                    .await;
                Some(written)
            }
            Err(e) => {
                tracing::warn!(
                    device = %task.device,
                    component = %task.component,
                    backend = %task.backend,
                    error = %e,
                    "Task failed"
                );
                self.emit_event(task, task.severity, failure_summary(task, &e))
                    .await;
                None
            }
        }
    }

    async fn emit_metrics(&self, task: &Task, rows: &[Row], started: DateTime<Utc>) -> usize {
        let now = started.timestamp() as f64;
        let mut written = 0;
        for dp in &task.datapoints {
            let Some(value) = datapoint_value(dp, rows, now) else {
                tracing::debug!(path = %dp.path, "No value for data point this cycle");
                continue;
            };
            if dp.min.is_some_and(|min| value < min) || dp.max.is_some_and(|max| value > max) {
                tracing::debug!(path = %dp.path, value, min = ?dp.min, max = ?dp.max, "Value outside data point bounds");
            }
            let record = MetricRecord {
                path: dp.path.clone(),
                value,
                kind: dp.kind,
                create_hint: dp.create_hint.clone(),
                timestamp: started,
                min: dp.min,
                max: dp.max,
            };
            match self.metrics.write(record).await {
                Ok(()) => written += 1,
                Err(e) => tracing::warn!(path = %dp.path, error = %e, "Failed to write metric"),
            }
        }
        written
    }

    async fn emit_event(&self, task: &Task, severity: Severity, summary: String) {
        let event = EventRecord {
            device: task.device.clone(),
            component: task.component.clone(),
            event_class: task.event_class.clone(),
            event_key: task.event_key(),
            severity,
            summary,
            timestamp: Utc::now(),
        };
        if let Err(e) = self.events.send(event).await {
            tracing::warn!(device = %task.device, error = %e, "Failed to send event");
        }
    }
}

fn failure_summary(task: &Task, error: &TaskError) -> String {
    if error.is_timeout() {
        format!(
            "{} query timed out after {}s",
            task.backend,
            task.timeout.as_secs_f64()
        )
    } else {
        format!("{} {}: {}", task.backend, error.kind, error.message)
    }
}
