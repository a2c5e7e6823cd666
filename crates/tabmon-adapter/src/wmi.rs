//! WMI over DCOM through the `wmic` command-line client.
//!
//! Credentials go to a private temporary file passed with
//! `--authentication-file` so they never appear on the command line. The
//! query is evaluated by the remote WMI service; output is read with an
//! ASCII unit separator as the column delimiter.
//!
//! Descriptor keywords: `host` (or first positional), `user`, `password`,
//! `domain`, `namespace` (`root\cimv2`), `wmic_path` (`wmic`).

use crate::cursor::{Batch, Cursor, Paginated};
use crate::error::{AdapterError, Result};
use crate::query::SelectQuery;
use crate::{BackendAdapter, Connection};
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tabmon_common::descriptor::ConnectionArgs;
use tabmon_common::row::Row;
use tabmon_common::value::Value;
use tempfile::NamedTempFile;
use tokio::process::Command;

const BACKEND: &str = "wmi";
const DELIMITER: char = '\u{1f}';

/// `wmic` failures that mean the host or the credentials are unusable.
const CONNECT_STATUSES: &[&str] = &[
    "NT_STATUS_ACCESS_DENIED",
    "NT_STATUS_LOGON_FAILURE",
    "NT_STATUS_HOST_UNREACHABLE",
    "NT_STATUS_CONNECTION_REFUSED",
    "NT_STATUS_IO_TIMEOUT",
    "NT_STATUS_NETWORK_UNREACHABLE",
];

pub struct WmiAdapter;

#[async_trait]
impl BackendAdapter for WmiAdapter {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self, descriptor: &str) -> Result<Box<dyn Connection>> {
        let args = ConnectionArgs::parse_lenient(descriptor);
        let host = args
            .text("host")
            .or_else(|| args.positional_text(0))
            .ok_or_else(|| AdapterError::connect(BACKEND, "descriptor has no host"))?;

        let mut credentials = NamedTempFile::new()?;
        writeln!(credentials, "username = {}", args.text("user").unwrap_or_default())?;
        writeln!(credentials, "password = {}", args.text("password").unwrap_or_default())?;
        if let Some(domain) = args.text("domain") {
            writeln!(credentials, "domain = {domain}")?;
        }
        credentials.flush()?;

        tracing::info!(backend = BACKEND, target = %args.redacted(), "Prepared wmic session");
        Ok(Box::new(WmiConnection {
            host,
            namespace: args
                .text("namespace")
                .unwrap_or_else(|| "root\\cimv2".to_string()),
            binary: args.text("wmic_path").unwrap_or_else(|| "wmic".to_string()),
            credentials,
        }))
    }
}

struct WmiConnection {
    host: String,
    namespace: String,
    binary: String,
    credentials: NamedTempFile,
}

#[async_trait]
impl Connection for WmiConnection {
    async fn execute(&self, query: &str, _timeout: Duration) -> Result<Vec<Row>> {
        let parsed = SelectQuery::parse(query)?;
        let invocation = WmicInvocation { conn: self, query };
        let mut rows = Cursor::new(&invocation).fetch_all().await?;
        for row in &mut rows {
            row.retain_columns(&parsed.columns);
        }
        Ok(rows)
    }

    async fn close(&self) {}
}

/// One `wmic` run; the client returns every instance at once.
struct WmicInvocation<'a> {
    conn: &'a WmiConnection,
    query: &'a str,
}

#[async_trait]
impl Paginated for WmicInvocation<'_> {
    async fn enumerate(&self) -> Result<Batch> {
        let conn = self.conn;
        let output = Command::new(&conn.binary)
            .arg("--authentication-file")
            .arg(conn.credentials.path())
            .arg(format!("--namespace={}", conn.namespace))
            .arg(format!("--delimiter={DELIMITER}"))
            .arg(format!("//{}", conn.host))
            .arg(self.query)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AdapterError::connect(BACKEND, format!("failed to run {}: {e}", conn.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(&stderr, output.status.code()));
        }
        Ok(Batch::last(parse_output(&String::from_utf8_lossy(&output.stdout))))
    }
}

fn classify_failure(stderr: &str, code: Option<i32>) -> AdapterError {
    let message = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map_or_else(|| format!("wmic exited with status {code:?}"), str::to_string);
    if CONNECT_STATUSES.iter().any(|status| stderr.contains(status)) {
        AdapterError::connect(BACKEND, message)
    } else {
        AdapterError::query(BACKEND, message)
    }
}

/// Parses `wmic` output. A `CLASS:` line starts a new section whose next
/// line is the header; values spanning several lines are joined until the
/// row has as many fields as the header.
fn parse_output(stdout: &str) -> Vec<Row> {
    let mut rows = Vec::new();
    let mut header: Option<Vec<String>> = None;
    let mut pending = String::new();

    for line in stdout.lines() {
        if line.starts_with("CLASS:") {
            header = None;
            pending.clear();
            continue;
        }
        let Some(columns) = &header else {
            if !line.trim().is_empty() {
                header = Some(line.split(DELIMITER).map(|c| c.trim().to_string()).collect());
            }
            continue;
        };
        if pending.is_empty() {
            if line.is_empty() {
                continue;
            }
            pending.push_str(line);
        } else {
            pending.push('\n');
            pending.push_str(line);
        }
        if pending.split(DELIMITER).count() >= columns.len() {
            let fields = pending.split(DELIMITER).map(parse_field);
            rows.push(Row::from_pairs(columns.iter().map(String::as_str).zip(fields)));
            pending.clear();
        }
    }
    rows
}

fn parse_field(text: &str) -> Value {
    let text = text.trim();
    if text == "(null)" {
        return Value::Null;
    }
    if let Some(inner) = text.strip_prefix('(').and_then(|t| t.strip_suffix(')')) {
        if inner.contains(',') {
            return Value::Array(inner.split(',').map(Value::infer).collect());
        }
    }
    Value::infer(text)
}
