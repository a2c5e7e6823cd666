mod config;
mod sinks;

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tabmon_collector::cycle::Collector;
use tabmon_collector::sink::MetricSink;
use tabmon_collector::{ExecutorRegistry, Task};
use tokio::signal;
use tokio::time::{interval, MissedTickBehavior};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tabmon=info".parse()?))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/agent.toml".to_string());

    let config = config::AgentConfig::load(&config_path)?;
    tracing::info!(
        collector_id = %config.collector_id,
        tasks = config.tasks.len(),
        "tabmon-agent starting"
    );

    let registry = Arc::new(ExecutorRegistry::with_default_backends(&config.executors)?);
    let metrics: Arc<dyn MetricSink> = match &config.metrics_path {
        Some(path) => Arc::new(sinks::JsonLinesMetricSink::open(path).await?),
        None => Arc::new(sinks::LogMetricSink),
    };
    let collector = Arc::new(Collector::new(
        registry.clone(),
        metrics,
        Arc::new(sinks::LogEventSink),
    ));

    // One loop per distinct cycle interval.
    let mut groups: BTreeMap<Duration, Vec<Arc<Task>>> = BTreeMap::new();
    for task in config.build_tasks() {
        groups.entry(task.cycle).or_default().push(Arc::new(task));
    }

    let mut loops = Vec::new();
    for (cycle, tasks) in groups {
        let collector = collector.clone();
        loops.push(tokio::spawn(async move {
            let mut tick = interval(cycle);
            tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_secs = cycle.as_secs(), tasks = tasks.len(), "Starting collection loop");
            loop {
                tick.tick().await;
                let report = collector.run_cycle(tasks.clone()).await;
                tracing::info!(
                    interval_secs = cycle.as_secs(),
                    ok = report.tasks_ok,
                    failed = report.tasks_failed,
                    metrics = report.metrics_written,
                    "Collection cycle finished"
                );
            }
        }));
    }

    signal::ctrl_c().await?;
    tracing::info!("Shutting down gracefully");
    for handle in &loops {
        handle.abort();
    }
    registry.shutdown().await;

    Ok(())
}
