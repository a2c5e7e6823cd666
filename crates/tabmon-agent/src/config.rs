use anyhow::{bail, Context};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tabmon_collector::task::DEFAULT_EVENT_CLASS;
use tabmon_collector::{DataPoint, Expected, Task};
use tabmon_common::types::{MetricKind, Severity};
use tabmon_common::value::format_number;

#[derive(Debug, Deserialize)]
pub struct AgentConfig {
    pub collector_id: String,
    /// JSON-lines file receiving every metric; metrics are only logged when unset.
    pub metrics_path: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,
    #[serde(default = "default_cycle_secs")]
    pub default_cycle_secs: u64,
    /// Backend name to `max_parallel`.
    #[serde(default)]
    pub executors: HashMap<String, usize>,
    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

#[derive(Debug, Deserialize)]
pub struct TaskConfig {
    pub device: String,
    #[serde(default)]
    pub component: String,
    pub backend: String,
    pub descriptor: String,
    pub query: String,
    pub timeout_secs: Option<u64>,
    pub cycle_secs: Option<u64>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default = "default_event_class")]
    pub event_class: String,
    #[serde(default)]
    pub keybindings: BTreeMap<String, KeybindingValue>,
    #[serde(default)]
    pub datapoints: Vec<DataPointConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum KeybindingValue {
    Text(String),
    Number(f64),
    Flag(bool),
    List(Vec<String>),
}

impl From<&KeybindingValue> for Expected {
    fn from(value: &KeybindingValue) -> Self {
        match value {
            KeybindingValue::Text(s) => Expected::Scalar(s.clone()),
            KeybindingValue::Number(n) => Expected::Scalar(format_number(*n)),
            KeybindingValue::Flag(b) => Expected::Scalar(b.to_string()),
            KeybindingValue::List(items) => Expected::List(items.clone()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DataPointConfig {
    pub id: String,
    pub alias: String,
    pub expression: Option<String>,
    pub path: Option<String>,
    #[serde(default)]
    pub kind: MetricKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub create_hint: Option<String>,
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_cycle_secs() -> u64 {
    300
}

fn default_severity() -> Severity {
    Severity::Warning
}

fn default_event_class() -> String {
    DEFAULT_EVENT_CLASS.to_string()
}

impl AgentConfig {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {path}"))?;
        let config: Self =
            toml::from_str(&content).with_context(|| format!("failed to parse config file {path}"))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.default_cycle_secs == 0 {
            bail!("default_cycle_secs must be positive");
        }
        if self.default_timeout_secs == 0 {
            bail!("default_timeout_secs must be positive");
        }
        for name in self.executors.keys() {
            if tabmon_adapter::canonical_name(name).is_none() {
                bail!("[executors] names unknown backend `{name}`");
            }
        }
        for (index, task) in self.tasks.iter().enumerate() {
            if tabmon_adapter::canonical_name(&task.backend).is_none() {
                bail!("task #{index} ({}) uses unknown backend `{}`", task.device, task.backend);
            }
            if task.cycle_secs == Some(0) {
                bail!("task #{index} ({}) has a zero cycle", task.device);
            }
            if task.timeout_secs == Some(0) {
                bail!("task #{index} ({}) has a zero timeout", task.device);
            }
        }
        Ok(())
    }

    /// Builds the collection tasks, applying the configured defaults.
    pub fn build_tasks(&self) -> Vec<Task> {
        self.tasks.iter().map(|t| self.build_task(t)).collect()
    }

    fn build_task(&self, config: &TaskConfig) -> Task {
        let mut builder = Task::builder(&config.backend, &config.descriptor, &config.query)
            .device(&config.device)
            .component(&config.component)
            .timeout(Duration::from_secs(
                config.timeout_secs.unwrap_or(self.default_timeout_secs),
            ))
            .cycle(Duration::from_secs(
                config.cycle_secs.unwrap_or(self.default_cycle_secs),
            ))
            .severity(config.severity)
            .event_class(&config.event_class);

        for (key, value) in &config.keybindings {
            builder = builder.keybinding(key, Expected::from(value));
        }

        for dp in &config.datapoints {
            let path = dp.path.clone().unwrap_or_else(|| {
                [config.device.as_str(), config.component.as_str(), dp.id.as_str()]
                    .iter()
                    .filter(|part| !part.is_empty())
                    .copied()
                    .collect::<Vec<_>>()
                    .join("/")
            });
            let mut datapoint = DataPoint::new(&dp.id, &dp.alias).with_path(path);
            datapoint.expression = dp.expression.clone();
            datapoint.kind = dp.kind;
            datapoint.min = dp.min;
            datapoint.max = dp.max;
            datapoint.create_hint = dp.create_hint.clone();
            builder = builder.datapoint(datapoint);
        }

        builder.build()
    }
}
