use std::time::Duration;

/// Errors raised by backend adapters.
///
/// [`AdapterError::is_connect`] tells the executor whether the failure
/// belongs to the connection (every task on that descriptor fails) or only
/// to the query that was running.
///
/// # Examples
///
/// ```rust
/// use tabmon_adapter::error::AdapterError;
///
/// let err = AdapterError::connect("wbem", "401 Unauthorized");
/// assert!(err.is_connect());
/// assert!(err.to_string().contains("401"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Backend unreachable or credentials rejected.
    #[error("{backend} connection failed: {message}")]
    Connect { backend: String, message: String },

    /// Malformed query or an operation the backend rejected.
    #[error("{backend} query failed: {message}")]
    Query { backend: String, message: String },

    /// The backend did not answer within the allowed time.
    #[error("{backend} operation timed out after {after:?}")]
    Timeout { backend: String, after: Duration },

    /// Query text outside the supported grammar.
    #[error("parse error: {0}")]
    Parse(String),

    /// The backend answered with something the adapter cannot decode.
    #[error("{backend} protocol error: {message}")]
    Protocol { backend: String, message: String },

    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("XML error: {0}")]
    Xml(#[from] quick_xml::Error),
}

impl AdapterError {
    pub fn connect(backend: &str, message: impl Into<String>) -> Self {
        AdapterError::Connect {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn query(backend: &str, message: impl Into<String>) -> Self {
        AdapterError::Query {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    pub fn protocol(backend: &str, message: impl Into<String>) -> Self {
        AdapterError::Protocol {
            backend: backend.to_string(),
            message: message.into(),
        }
    }

    /// Whether the connection itself is unusable.
    pub fn is_connect(&self) -> bool {
        match self {
            AdapterError::Connect { .. } | AdapterError::Io(_) => true,
            AdapterError::Http(e) => e.is_connect(),
            AdapterError::Sql(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Configuration(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
            ),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            AdapterError::Timeout { .. } => true,
            AdapterError::Http(e) => e.is_timeout(),
            _ => false,
        }
    }
}

/// Convenience type alias so callers can write `error::Result<T>`.
pub type Result<T> = std::result::Result<T, AdapterError>;
