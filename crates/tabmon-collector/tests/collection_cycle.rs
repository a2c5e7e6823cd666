use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tabmon_adapter::error::{AdapterError, Result as AdapterResult};
use tabmon_adapter::{BackendAdapter, Connection};
use tabmon_collector::cycle::{Collector, CycleReport};
use tabmon_collector::sink::{EventSink, MetricSink};
use tabmon_collector::{DataPoint, ExecutorRegistry, Task};
use tabmon_common::row::Row;
use tabmon_common::types::{EventRecord, MetricRecord, Severity};
use tabmon_common::value::Value;

struct Inventory;

struct InventoryConnection;

#[async_trait]
impl BackendAdapter for Inventory {
    fn name(&self) -> &str {
        "inventory"
    }

    async fn connect(&self, descriptor: &str) -> AdapterResult<Box<dyn Connection>> {
        if descriptor == "offline" {
            return Err(AdapterError::connect("inventory", "no route to host"));
        }
        Ok(Box::new(InventoryConnection))
    }
}

#[async_trait]
impl Connection for InventoryConnection {
    async fn execute(&self, query: &str, _timeout: Duration) -> AdapterResult<Vec<Row>> {
        if query.contains("hang") {
            std::future::pending::<()>().await;
        }
        Ok(vec![
            Row::from_pairs([
                ("Name", Value::string("C:")),
                ("Size", Value::Number(4096.0)),
                ("Free", Value::Number(1024.0)),
            ]),
            Row::from_pairs([
                ("Name", Value::string("D:")),
                ("Size", Value::Number(2048.0)),
                ("Free", Value::Number(2048.0)),
            ]),
        ])
    }

    async fn close(&self) {}
}

#[derive(Default)]
struct Recorder {
    metrics: Mutex<Vec<MetricRecord>>,
    events: Mutex<Vec<EventRecord>>,
}

#[async_trait]
impl MetricSink for Recorder {
    async fn write(&self, record: MetricRecord) -> anyhow::Result<()> {
        self.metrics.lock().unwrap().push(record);
        Ok(())
    }
}

#[async_trait]
impl EventSink for Recorder {
    async fn send(&self, event: EventRecord) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

fn disk_task(descriptor: &str, drive: &str) -> Arc<Task> {
    Arc::new(
        Task::builder(
            "inventory",
            descriptor,
            format!("select Size, Free from Win32_LogicalDisk where Name = '{drive}'"),
        )
        .device("srv01")
        .component(drive)
        .datapoint(DataPoint::new("free", "Free").with_path(format!("srv01/{drive}/free")))
        .datapoint(DataPoint::new("size_kb", "Size").with_expression("1024,/").with_path(format!("srv01/{drive}/size_kb")))
        .datapoint(DataPoint::new("missing", "Missing"))
        .timeout(Duration::from_secs(2))
        .severity(Severity::Error)
        .build(),
    )
}

fn collector(recorder: &Arc<Recorder>) -> (Collector, Arc<ExecutorRegistry>) {
    let mut registry = ExecutorRegistry::new();
    registry.register(Arc::new(Inventory), 1);
    let registry = Arc::new(registry);
    let collector = Collector::new(registry.clone(), recorder.clone(), recorder.clone());
    (collector, registry)
}

#[tokio::test(start_paused = true)]
async fn cycle_writes_metrics_and_clear_events() {
    let recorder = Arc::new(Recorder::default());
    let (collector, registry) = collector(&recorder);

    let report = collector
        .run_cycle(vec![disk_task("srv01", "C:"), disk_task("srv01", "D:")])
        .await;

    assert_eq!(
        report,
        CycleReport {
            tasks_ok: 2,
            tasks_failed: 0,
            metrics_written: 4,
        }
    );

    let metrics = recorder.metrics.lock().unwrap().clone();
    let value = |path: &str| metrics.iter().find(|m| m.path == path).map(|m| m.value);
    assert_eq!(value("srv01/C:/free"), Some(1024.0));
    assert_eq!(value("srv01/D:/free"), Some(2048.0));
    assert_eq!(value("srv01/C:/size_kb"), Some(4096.0 * 1024.0));
    assert!(metrics.iter().all(|m| m.path != "missing"));

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.severity == Severity::Clear));

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failures_become_events_with_the_task_severity() {
    let recorder = Arc::new(Recorder::default());
    let (collector, registry) = collector(&recorder);

    let hanging = Arc::new(
        Task::builder("inventory", "srv02", "select hang from Win32_Process")
            .device("srv02")
            .timeout(Duration::from_secs(1))
            .severity(Severity::Critical)
            .build(),
    );
    let unknown_backend = Arc::new(Task::builder("snmp", "srv03", "select x from y").device("srv03").build());

    let report = collector
        .run_cycle(vec![disk_task("offline", "C:"), hanging, unknown_backend])
        .await;

    assert_eq!(report.tasks_ok, 0);
    assert_eq!(report.tasks_failed, 3);
    assert!(recorder.metrics.lock().unwrap().is_empty());

    let events = recorder.events.lock().unwrap().clone();
    let event = |device: &str| events.iter().find(|e| e.device == device).cloned().unwrap();

    let offline = event("srv01");
    assert_eq!(offline.severity, Severity::Error);
    assert!(offline.summary.contains("connection failed"), "{}", offline.summary);
    assert!(offline.summary.contains("no route to host"), "{}", offline.summary);

    let timed_out = event("srv02");
    assert_eq!(timed_out.severity, Severity::Critical);
    assert!(timed_out.summary.contains("timed out"), "{}", timed_out.summary);

    let unknown = event("srv03");
    assert_eq!(unknown.severity, Severity::Warning);
    assert!(unknown.summary.contains("no executor"), "{}", unknown.summary);

    registry.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failure_and_clear_share_an_event_key() {
    let recorder = Arc::new(Recorder::default());
    let (collector, registry) = collector(&recorder);

    collector.run_cycle(vec![disk_task("offline", "C:")]).await;
    collector.run_cycle(vec![disk_task("srv01", "C:")]).await;

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].severity, Severity::Error);
    assert_eq!(events[1].severity, Severity::Clear);
    assert_eq!(events[0].event_key, events[1].event_key);

    registry.shutdown().await;
}
