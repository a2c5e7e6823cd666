use std::time::Duration;
use tabmon_adapter::error::AdapterError;

/// Which part of a task's execution failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskErrorKind {
    /// The connection could not be opened or broke; every task on the
    /// same descriptor shares this failure.
    Connect,
    /// The backend rejected or could not answer this query.
    Query,
    /// The per-task timer fired before the backend answered.
    Timeout,
}

impl std::fmt::Display for TaskErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskErrorKind::Connect => write!(f, "connection failed"),
            TaskErrorKind::Query => write!(f, "query failed"),
            TaskErrorKind::Timeout => write!(f, "timed out"),
        }
    }
}

/// Failure delivered to a task. Cloneable so one physical failure can be
/// handed to every task that shared the execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct TaskError {
    pub kind: TaskErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: TaskErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            TaskErrorKind::Timeout,
            format!("no response within {}s", after.as_secs_f64()),
        )
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == TaskErrorKind::Timeout
    }
}

impl From<&AdapterError> for TaskError {
    fn from(e: &AdapterError) -> Self {
        let kind = if e.is_timeout() {
            TaskErrorKind::Timeout
        } else if e.is_connect() {
            TaskErrorKind::Connect
        } else {
            TaskErrorKind::Query
        };
        let message = match e {
            AdapterError::Connect { message, .. }
            | AdapterError::Query { message, .. }
            | AdapterError::Protocol { message, .. } => message.clone(),
            other => other.to_string(),
        };
        TaskError::new(kind, message)
    }
}

impl From<AdapterError> for TaskError {
    fn from(e: AdapterError) -> Self {
        TaskError::from(&e)
    }
}
