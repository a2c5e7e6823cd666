//! Backend adapters for tabmon.
//!
//! Each [`BackendAdapter`] speaks one wire protocol and exposes the same
//! open / execute / close contract over a [`Connection`]. The adapters
//! share the [`query`] grammar, the [`cursor`] pagination state machine and
//! the value model from `tabmon-common`; only the wire handling differs.
//!
//! | Backend name | Module | Protocol |
//! |---|---|---|
//! | `sql` | [`sql`] | PostgreSQL / MySQL / SQLite through `sqlx` |
//! | `wbem` | [`wbem`] | CIM-XML over HTTP(S) |
//! | `wmi` | [`wmi`] | DCOM through the `wmic` client |
//! | `wsman` | [`wsman`] | WS-Management SOAP |

pub mod cursor;
pub mod error;
pub mod query;
pub mod sql;
pub mod wbem;
pub mod wmi;
pub mod wsman;
pub mod xml;

#[cfg(test)]
mod test_server;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tabmon_common::row::Row;

/// A backend family able to open connections from descriptor strings.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend name (e.g. `"wbem"`), used for logging and registry lookup.
    fn name(&self) -> &str;

    /// Opens a session described by `descriptor`.
    ///
    /// # Errors
    ///
    /// Returns [`error::AdapterError::Connect`] if the backend is
    /// unreachable, the credentials are rejected or the descriptor lacks a
    /// required argument.
    async fn connect(&self, descriptor: &str) -> error::Result<Box<dyn Connection>>;
}

/// An open backend session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Runs `query` and returns every normalised row.
    ///
    /// `timeout` is forwarded to protocols that carry an operation timeout;
    /// the caller enforces the deadline independently and drops the future
    /// when it expires.
    async fn execute(&self, query: &str, timeout: Duration) -> error::Result<Vec<Row>>;

    /// Ends the session. Errors are logged, not returned.
    async fn close(&self);
}

/// Canonical backend name for `name` or one of its aliases.
pub fn canonical_name(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "sql" => Some("sql"),
        "wbem" | "cim" => Some("wbem"),
        "wmi" => Some("wmi"),
        "wsman" | "winrm" => Some("wsman"),
        _ => None,
    }
}

/// Build the adapter registered under `name`.
///
/// # Errors
///
/// Returns [`error::AdapterError::Parse`] if `name` is not a known backend.
pub fn build_adapter(name: &str) -> error::Result<Arc<dyn BackendAdapter>> {
    match canonical_name(name) {
        Some("sql") => Ok(Arc::new(sql::SqlAdapter)),
        Some("wbem") => Ok(Arc::new(wbem::WbemAdapter)),
        Some("wmi") => Ok(Arc::new(wmi::WmiAdapter)),
        Some("wsman") => Ok(Arc::new(wsman::WsManAdapter)),
        _ => Err(error::AdapterError::Parse(format!(
            "unsupported backend: {name}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_adapter_resolves_names_and_aliases() {
        assert_eq!(build_adapter("SQL").unwrap().name(), "sql");
        assert_eq!(build_adapter("cim").unwrap().name(), "wbem");
        assert_eq!(build_adapter("winrm").unwrap().name(), "wsman");
        assert_eq!(build_adapter("wmi").unwrap().name(), "wmi");
        assert!(build_adapter("snmp").is_err());
        assert_eq!(canonical_name(" WinRM "), Some("wsman"));
    }
}
