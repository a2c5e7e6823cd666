use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event severity level, ordered from lowest to highest.
///
/// `Clear` is sent when a previously failing task succeeds again.
///
/// # Examples
///
/// ```
/// use tabmon_common::types::Severity;
///
/// let sev: Severity = "warning".parse().unwrap();
/// assert_eq!(sev, Severity::Warning);
/// assert_eq!(sev.to_string(), "warning");
/// assert!(Severity::Critical > Severity::Clear);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Clear,
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Clear => write!(f, "clear"),
            Severity::Debug => write!(f, "debug"),
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "clear" => Ok(Severity::Clear),
            "debug" => Ok(Severity::Debug),
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            "critical" => Ok(Severity::Critical),
            _ => Err(format!("unknown severity: {s}")),
        }
    }
}

/// How the time-series store should interpret a metric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    #[default]
    Gauge,
    Counter,
    Derive,
    Absolute,
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricKind::Gauge => write!(f, "GAUGE"),
            MetricKind::Counter => write!(f, "COUNTER"),
            MetricKind::Derive => write!(f, "DERIVE"),
            MetricKind::Absolute => write!(f, "ABSOLUTE"),
        }
    }
}

/// One derived value handed to the metric sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    /// Output path of the data point, e.g. `db01/orders/rows_sum`.
    pub path: String,
    pub value: f64,
    pub kind: MetricKind,
    /// Storage creation hint passed through untouched (e.g. an RRD create command).
    pub create_hint: Option<String>,
    /// Start of the collection cycle that produced the value.
    pub timestamp: DateTime<Utc>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A success or failure notification for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub device: String,
    pub component: String,
    /// Event classification, e.g. `/Status/DataSource`.
    pub event_class: String,
    /// Deduplication key; the same for the failure and the clearing event.
    pub event_key: String,
    pub severity: Severity,
    pub summary: String,
    pub timestamp: DateTime<Utc>,
}
