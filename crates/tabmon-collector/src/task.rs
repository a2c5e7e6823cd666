//! The unit of work submitted to an executor: one monitored entity asking
//! one query, plus everything needed to turn the answer into metrics.

use std::collections::BTreeSet;
use std::time::Duration;
use tabmon_adapter::query::{Filter, SelectQuery};
use tabmon_common::types::{MetricKind, Severity};
use tabmon_common::value::normalize_text;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_CYCLE: Duration = Duration::from_secs(300);
pub const DEFAULT_EVENT_CLASS: &str = "/Status/DataSource";

/// Expected value of a keybinding.
#[derive(Debug, Clone, PartialEq)]
pub enum Expected {
    Scalar(String),
    /// Compared as the space-joined normalised elements, the same way an
    /// array column is normalised.
    List(Vec<String>),
}

impl Expected {
    pub fn normalized(&self) -> String {
        match self {
            Expected::Scalar(s) => normalize_text(s),
            Expected::List(items) => items
                .iter()
                .map(|s| normalize_text(s))
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl From<&str> for Expected {
    fn from(s: &str) -> Self {
        Expected::Scalar(s.to_string())
    }
}

impl From<String> for Expected {
    fn from(s: String) -> Self {
        Expected::Scalar(s)
    }
}

impl From<Vec<String>> for Expected {
    fn from(items: Vec<String>) -> Self {
        Expected::List(items)
    }
}

/// One value to extract from a task's rows.
#[derive(Debug, Clone, PartialEq)]
pub struct DataPoint {
    /// Identifier; its suffix (`_sum`, `_max`, ...) selects the aggregation.
    pub id: String,
    /// Column to read.
    pub alias: String,
    /// Comma-separated reverse-Polish expression, see [`crate::derive`].
    pub expression: Option<String>,
    pub path: String,
    pub kind: MetricKind,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub create_hint: Option<String>,
}

impl DataPoint {
    pub fn new(id: impl Into<String>, alias: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            path: id.clone(),
            id,
            alias: alias.into(),
            expression: None,
            kind: MetricKind::Gauge,
            min: None,
            max: None,
            create_hint: None,
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Identity of a physical query on one connection: the prepared text and
/// the set of requested columns.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    query: String,
    columns: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Task {
    pub device: String,
    pub component: String,
    /// Backend family name, e.g. `wbem`.
    pub backend: String,
    /// Connection descriptor; tasks with equal descriptors share a connection.
    pub descriptor: String,
    pub raw_query: String,
    /// Query text actually sent. For instance-data backends the equality
    /// bindings are stripped and keybinding columns added.
    pub prepared_query: String,
    pub keybindings: Vec<(String, Expected)>,
    pub datapoints: Vec<DataPoint>,
    pub timeout: Duration,
    pub cycle: Duration,
    pub severity: Severity,
    pub event_class: String,
}

impl Task {
    pub fn builder(
        backend: impl Into<String>,
        descriptor: impl Into<String>,
        query: impl Into<String>,
    ) -> TaskBuilder {
        TaskBuilder {
            device: String::new(),
            component: String::new(),
            backend: backend.into(),
            descriptor: descriptor.into(),
            query: query.into(),
            keybindings: Vec::new(),
            datapoints: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            cycle: DEFAULT_CYCLE,
            severity: Severity::Warning,
            event_class: DEFAULT_EVENT_CLASS.to_string(),
        }
    }

    pub fn fingerprint(&self) -> Fingerprint {
        let columns = self
            .datapoints
            .iter()
            .map(|dp| dp.alias.as_str())
            .chain(self.keybindings.iter().map(|(k, _)| k.as_str()))
            .map(|c| c.trim().to_lowercase())
            .collect();
        Fingerprint {
            query: self.prepared_query.clone(),
            columns,
        }
    }

    /// Key shared by this task's failure and clearing events. Tasks that
    /// run the same query for different instances get distinct keys.
    pub fn event_key(&self) -> String {
        let bindings: Vec<String> = self
            .keybindings
            .iter()
            .map(|(k, v)| format!("{}={}", k.trim().to_lowercase(), v.normalized()))
            .collect();
        format!(
            "{}|{}|{}|{}",
            self.backend,
            self.component,
            self.raw_query,
            bindings.join(",")
        )
    }
}

pub struct TaskBuilder {
    device: String,
    component: String,
    backend: String,
    descriptor: String,
    query: String,
    keybindings: Vec<(String, Expected)>,
    datapoints: Vec<DataPoint>,
    timeout: Duration,
    cycle: Duration,
    severity: Severity,
    event_class: String,
}

impl TaskBuilder {
    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = device.into();
        self
    }

    pub fn component(mut self, component: impl Into<String>) -> Self {
        self.component = component.into();
        self
    }

    pub fn keybinding(mut self, key: impl Into<String>, expected: impl Into<Expected>) -> Self {
        self.keybindings.push((key.into(), expected.into()));
        self
    }

    pub fn datapoint(mut self, datapoint: DataPoint) -> Self {
        self.datapoints.push(datapoint);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cycle(mut self, cycle: Duration) -> Self {
        self.cycle = cycle;
        self
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn event_class(mut self, event_class: impl Into<String>) -> Self {
        self.event_class = event_class.into();
        self
    }

    pub fn build(self) -> Task {
        let prepared = if tabmon_adapter::canonical_name(&self.backend) == Some("sql") {
            Prepared {
                text: self.query.trim().to_string(),
                lifted: Vec::new(),
            }
        } else {
            prepare(&self.query, &self.keybindings)
        };

        let mut keybindings = self.keybindings;
        for (key, value) in prepared.lifted {
            if !keybindings.iter().any(|(k, _)| k.eq_ignore_ascii_case(&key)) {
                keybindings.push((key, Expected::Scalar(value)));
            }
        }

        Task {
            device: self.device,
            component: self.component,
            backend: self.backend,
            descriptor: self.descriptor,
            raw_query: self.query,
            prepared_query: prepared.text,
            keybindings,
            datapoints: self.datapoints,
            timeout: self.timeout,
            cycle: self.cycle,
            severity: self.severity,
            event_class: self.event_class,
        }
    }
}

/// Result of [`prepare`].
#[derive(Debug, Clone, PartialEq)]
pub struct Prepared {
    pub text: String,
    /// `key = literal` terms lifted out of the where-clause.
    pub lifted: Vec<(String, String)>,
}

/// Rewrites a raw instance-data query for execution. Relational queries
/// are sent as written and never pass through here.
///
/// A where-clause of plain equalities is lifted out (the rows are narrowed
/// per task after the shared execution) and every keybinding column is
/// added to an explicit column list. Any other where-clause stays in the
/// text. Text outside the query grammar is passed through trimmed.
pub fn prepare(raw: &str, keybindings: &[(String, Expected)]) -> Prepared {
    let Ok(mut query) = SelectQuery::parse(raw) else {
        return Prepared {
            text: raw.trim().to_string(),
            lifted: Vec::new(),
        };
    };

    let lifted = match std::mem::take(&mut query.filter) {
        Filter::Bindings(bindings) => bindings,
        other => {
            query.filter = other;
            Vec::new()
        }
    };
    for key in keybindings.iter().map(|(k, _)| k).chain(lifted.iter().map(|(k, _)| k)) {
        query.add_column(key);
    }

    Prepared {
        text: query.render(),
        lifted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_where_clause_is_lifted_into_keybindings() {
        let task = Task::builder("wbem", "host=cim01", "SELECT Name, Used FROM CIM_FileSystem WHERE Name = '/var'")
            .build();
        assert_eq!(task.prepared_query, "select Name, Used from CIM_FileSystem");
        assert_eq!(task.keybindings, vec![("Name".to_string(), Expected::from("/var"))]);
    }

    #[test]
    fn keybinding_columns_are_injected() {
        let task = Task::builder("wbem", "host=cim01", "select Used from CIM_FileSystem")
            .keybinding("Name", "/var")
            .build();
        assert_eq!(task.prepared_query, "select Used, Name from CIM_FileSystem");
    }

    #[test]
    fn configured_keybindings_win_over_lifted_ones() {
        let task = Task::builder("wbem", "h", "select * from X where Name = 'a' and Id = 3")
            .keybinding("name", "b")
            .build();
        assert_eq!(task.prepared_query, "select * from X");
        assert_eq!(
            task.keybindings,
            vec![
                ("name".to_string(), Expected::from("b")),
                ("Id".to_string(), Expected::from("3")),
            ]
        );
    }

    #[test]
    fn complex_conditions_stay_in_the_text() {
        let prepared = prepare("select a from t where a > 3 or b like 'x%'", &[]);
        assert!(prepared.lifted.is_empty());
        assert!(prepared.text.contains("where"), "{}", prepared.text);
    }

    #[test]
    fn unparseable_text_passes_through() {
        let prepared = prepare("  exec sp_who2  ", &[("spid".to_string(), Expected::from("1"))]);
        assert_eq!(prepared.text, "exec sp_who2");
        assert!(prepared.lifted.is_empty());
    }

    #[test]
    fn fingerprints_ignore_keybinding_values() {
        let a = Task::builder("wmi", "d", "select id, v from t where id = 'A'")
            .datapoint(DataPoint::new("v", "v"))
            .build();
        let b = Task::builder("wmi", "d", "select id, v from t where id = 'B'")
            .datapoint(DataPoint::new("v", "V"))
            .build();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let c = Task::builder("wmi", "d", "select id, v from t where id = 'B'")
            .datapoint(DataPoint::new("w", "w"))
            .build();
        assert_ne!(a.fingerprint(), c.fingerprint());
    }

    #[test]
    fn relational_queries_are_sent_as_written() {
        let task = Task::builder("sql", "d", " select count(*) as n from orders where status = 'open' ")
            .keybinding("region", "eu")
            .build();
        assert_eq!(task.prepared_query, "select count(*) as n from orders where status = 'open'");
        assert_eq!(task.keybindings, vec![("region".to_string(), Expected::from("eu"))]);
    }

    #[test]
    fn event_keys_separate_instances_of_the_same_query() {
        let disk = |component: &str, drive: &str| {
            Task::builder("wmi", "host=srv01", "select FreeSpace from Win32_LogicalDisk")
                .component(component)
                .keybinding("DeviceID", drive)
                .build()
        };
        let c = disk("C:", "C:");
        let d = disk("D:", "D:");
        assert_ne!(c.event_key(), d.event_key());
        assert_eq!(c.event_key(), disk("C:", "C:").event_key());

        let unnamed = |drive: &str| {
            Task::builder("wmi", "host=srv01", "select FreeSpace from Win32_LogicalDisk")
                .keybinding("DeviceID", drive)
                .build()
        };
        assert_ne!(unnamed("C:").event_key(), unnamed("D:").event_key());
    }

    #[test]
    fn list_expectations_normalize_like_arrays() {
        let expected = Expected::from(vec![" Up ".to_string(), "2.0".to_string()]);
        assert_eq!(expected.normalized(), "up 2");
    }
}
