//! CIM/WBEM backend speaking CIM-XML over HTTP(S).
//!
//! Instances are enumerated with the pull operations
//! (`OpenEnumerateInstances` / `PullInstancesWithPath` /
//! `CloseEnumeration`). Servers that answer `CIM_ERR_NOT_SUPPORTED` are
//! remembered and served with a single `EnumerateInstances` instead.
//! Where-clause bindings are applied client-side.
//!
//! Descriptor keywords: `host` (or first positional), `port`, `scheme`
//! (`https`), `user`, `password`, `namespace` (`root/cimv2`),
//! `max_objects` (100), `verify` (true).

use crate::cursor::{Batch, Cursor, Paginated};
use crate::error::{AdapterError, Result};
use crate::query::{Filter, SelectQuery};
use crate::xml::{escape, Element};
use crate::{BackendAdapter, Connection};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tabmon_common::descriptor::ConnectionArgs;
use tabmon_common::row::Row;
use tabmon_common::value::Value;

const BACKEND: &str = "wbem";
const CIM_ERR_NOT_SUPPORTED: u32 = 7;
const DEFAULT_NAMESPACE: &str = "root/cimv2";
const DEFAULT_MAX_OBJECTS: u32 = 100;

pub struct WbemAdapter;

#[async_trait]
impl BackendAdapter for WbemAdapter {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self, descriptor: &str) -> Result<Box<dyn Connection>> {
        let args = ConnectionArgs::parse_lenient(descriptor);
        let host = args
            .text("host")
            .or_else(|| args.positional_text(0))
            .ok_or_else(|| AdapterError::connect(BACKEND, "descriptor has no host"))?;
        let scheme = args.text("scheme").unwrap_or_else(|| "https".to_string());
        let default_port = if scheme == "http" { 5988.0 } else { 5989.0 };
        let port = args.number("port").unwrap_or(default_port) as u16;
        let verify = args.flag("verify").unwrap_or(true);

        let client = Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(!verify)
            .build()
            .map_err(|e| AdapterError::connect(BACKEND, format!("failed to build HTTP client: {e}")))?;

        tracing::info!(backend = BACKEND, target = %args.redacted(), "Prepared CIM-XML session");
        Ok(Box::new(WbemConnection {
            endpoint: Arc::new(Endpoint {
                client,
                url: format!("{scheme}://{host}:{port}/cimom"),
                namespace: args
                    .text("namespace")
                    .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string()),
                user: args.text("user"),
                password: args.text("password"),
                message_id: AtomicU64::new(1000),
            }),
            max_objects: args
                .number("max_objects")
                .map_or(DEFAULT_MAX_OBJECTS, |n| n.max(1.0) as u32),
            pull_supported: AtomicBool::new(true),
        }))
    }
}

struct WbemConnection {
    endpoint: Arc<Endpoint>,
    max_objects: u32,
    pull_supported: AtomicBool,
}

/// The CIMOM address and credentials. Shared with background releases.
struct Endpoint {
    client: Client,
    url: String,
    namespace: String,
    user: Option<String>,
    password: Option<String>,
    message_id: AtomicU64,
}

/// A decoded CIM-XML method response.
#[derive(Debug)]
enum CimReply {
    Instances(Batch),
    Failed { code: u32, description: String },
}

impl Endpoint {
    async fn call(&self, method: &str, params: &[String], timeout: Duration) -> Result<CimReply> {
        let id = self.message_id.fetch_add(1, Ordering::Relaxed);
        let body = build_request(id, method, &self.namespace, params);

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/xml; charset=\"utf-8\"")
            .header("CIMProtocolVersion", "1.0")
            .header("CIMOperation", "MethodCall")
            .header("CIMMethod", method)
            .header("CIMObject", self.namespace.replace('/', "%2F"))
            .timeout(timeout)
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::connect(BACKEND, format!("authentication rejected ({status})")));
        }
        let cim_error = response
            .headers()
            .get("CIMError")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let text = response.text().await?;
        if !status.is_success() {
            return Err(AdapterError::query(
                BACKEND,
                format!(
                    "{method} returned HTTP {status}{}",
                    cim_error.map(|e| format!(" ({e})")).unwrap_or_default()
                ),
            ));
        }
        parse_response(&text)
    }
}

#[async_trait]
impl Connection for WbemConnection {
    async fn execute(&self, query: &str, timeout: Duration) -> Result<Vec<Row>> {
        let mut query = SelectQuery::parse(query)?;
        if let Filter::Opaque(condition) = &query.filter {
            return Err(AdapterError::query(
                BACKEND,
                format!("only `key = value` conditions are supported, got `{condition}`"),
            ));
        }
        let projection = query.columns.clone();
        let bindings = query.bindings().to_vec();
        for (key, _) in &bindings {
            query.add_column(key);
        }

        let enumeration = InstanceEnumeration {
            conn: self,
            query: &query,
            timeout,
        };
        let mut rows = Cursor::new(&enumeration).fetch_all().await?;
        rows.retain(|row| row.matches(bindings.iter().map(|(k, v)| (k.as_str(), v.as_str()))));
        for row in &mut rows {
            row.retain_columns(&projection);
        }
        Ok(rows)
    }

    async fn close(&self) {}
}

struct InstanceEnumeration<'a> {
    conn: &'a WbemConnection,
    query: &'a SelectQuery,
    timeout: Duration,
}

impl InstanceEnumeration<'_> {
    fn class_params(&self) -> Vec<String> {
        let mut params = vec![format!(
            "<IPARAMVALUE NAME=\"ClassName\"><CLASSNAME NAME=\"{}\"/></IPARAMVALUE>",
            escape(&self.query.class)
        )];
        if !self.query.selects_all() {
            let values: String = self
                .query
                .columns
                .iter()
                .map(|c| format!("<VALUE>{}</VALUE>", escape(c)))
                .collect();
            params.push(format!(
                "<IPARAMVALUE NAME=\"PropertyList\"><VALUE.ARRAY>{values}</VALUE.ARRAY></IPARAMVALUE>"
            ));
        }
        params
    }

    async fn enumerate_all(&self) -> Result<Batch> {
        let mut params = self.class_params();
        params.push(simple_param("DeepInheritance", "TRUE"));
        params.push(simple_param("LocalOnly", "FALSE"));
        params.push(simple_param("IncludeQualifiers", "FALSE"));
        match self.conn.endpoint.call("EnumerateInstances", &params, self.timeout).await? {
            CimReply::Instances(batch) => Ok(Batch::last(batch.rows)),
            CimReply::Failed { code, description } => Err(cim_failure(code, &description)),
        }
    }
}

#[async_trait]
impl Paginated for InstanceEnumeration<'_> {
    async fn enumerate(&self) -> Result<Batch> {
        if !self.conn.pull_supported.load(Ordering::Relaxed) {
            return self.enumerate_all().await;
        }
        let mut params = self.class_params();
        params.push(simple_param("MaxObjectCount", &self.conn.max_objects.to_string()));
        params.push(simple_param("OperationTimeout", &self.timeout.as_secs().to_string()));
        match self.conn.endpoint.call("OpenEnumerateInstances", &params, self.timeout).await? {
            CimReply::Instances(batch) => Ok(batch),
            CimReply::Failed { code, .. } if code == CIM_ERR_NOT_SUPPORTED => {
                tracing::info!(backend = BACKEND, "Server lacks pull operations, falling back to EnumerateInstances");
                self.conn.pull_supported.store(false, Ordering::Relaxed);
                self.enumerate_all().await
            }
            CimReply::Failed { code, description } => Err(cim_failure(code, &description)),
        }
    }

    async fn pull(&self, token: &str) -> Result<Batch> {
        let params = [
            context_param(token),
            simple_param("MaxObjectCount", &self.conn.max_objects.to_string()),
        ];
        match self.conn.endpoint.call("PullInstancesWithPath", &params, self.timeout).await? {
            CimReply::Instances(batch) => Ok(batch),
            CimReply::Failed { code, description } => Err(cim_failure(code, &description)),
        }
    }

    async fn release(&self, token: &str) -> Result<()> {
        close_enumeration(&self.conn.endpoint, token, self.timeout).await
    }

    fn release_detached(&self, token: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(backend = BACKEND, "No runtime to close enumeration");
            return;
        };
        let endpoint = Arc::clone(&self.conn.endpoint);
        let timeout = self.timeout;
        runtime.spawn(async move {
            if let Err(e) = close_enumeration(&endpoint, &token, timeout).await {
                tracing::warn!(backend = BACKEND, error = %e, "Failed to close enumeration");
            }
        });
    }
}

async fn close_enumeration(endpoint: &Endpoint, token: &str, timeout: Duration) -> Result<()> {
    match endpoint
        .call("CloseEnumeration", &[context_param(token)], timeout)
        .await?
    {
        CimReply::Instances(_) => Ok(()),
        CimReply::Failed { code, description } => Err(cim_failure(code, &description)),
    }
}

fn cim_failure(code: u32, description: &str) -> AdapterError {
    AdapterError::query(BACKEND, format!("CIM error {code}: {description}"))
}

fn simple_param(name: &str, value: &str) -> String {
    format!(
        "<IPARAMVALUE NAME=\"{name}\"><VALUE>{}</VALUE></IPARAMVALUE>",
        escape(value)
    )
}

fn context_param(token: &str) -> String {
    simple_param("EnumerationContext", token)
}

fn build_request(id: u64, method: &str, namespace: &str, params: &[String]) -> String {
    let namespace_path: String = namespace
        .split('/')
        .filter(|part| !part.is_empty())
        .map(|part| format!("<NAMESPACE NAME=\"{}\"/>", escape(part)))
        .collect();
    format!(
        concat!(
            "<?xml version=\"1.0\" encoding=\"utf-8\" ?>",
            "<CIM CIMVERSION=\"2.0\" DTDVERSION=\"2.0\">",
            "<MESSAGE ID=\"{id}\" PROTOCOLVERSION=\"1.0\"><SIMPLEREQ>",
            "<IMETHODCALL NAME=\"{method}\">",
            "<LOCALNAMESPACEPATH>{ns}</LOCALNAMESPACEPATH>{params}",
            "</IMETHODCALL></SIMPLEREQ></MESSAGE></CIM>"
        ),
        id = id,
        method = method,
        ns = namespace_path,
        params = params.concat(),
    )
}

fn parse_response(body: &str) -> Result<CimReply> {
    let doc = Element::parse(body)?;
    let response = doc
        .find("IMETHODRESPONSE")
        .ok_or_else(|| AdapterError::protocol(BACKEND, "response has no IMETHODRESPONSE"))?;

    if let Some(error) = response.child("ERROR") {
        return Ok(CimReply::Failed {
            code: error.attr("CODE").and_then(|c| c.parse().ok()).unwrap_or(1),
            description: error.attr("DESCRIPTION").unwrap_or_default().to_string(),
        });
    }

    let mut instances = Vec::new();
    if let Some(ret) = response.child("IRETURNVALUE") {
        ret.find_all("INSTANCE", &mut instances);
    }
    let rows = instances.into_iter().map(instance_to_row).collect();

    let end_of_sequence = param_value(response, "EndOfSequence")
        .and_then(tabmon_common::value::parse_bool)
        .unwrap_or(true);
    let token = if end_of_sequence {
        None
    } else {
        let context = param_value(response, "EnumerationContext").ok_or_else(|| {
            AdapterError::protocol(BACKEND, "open enumeration without EnumerationContext")
        })?;
        Some(context.to_string())
    };
    Ok(CimReply::Instances(Batch { rows, token }))
}

fn param_value<'a>(response: &'a Element, name: &str) -> Option<&'a str> {
    response
        .children_named("PARAMVALUE")
        .find(|p| p.attr("NAME").is_some_and(|n| n.eq_ignore_ascii_case(name)))
        .and_then(|p| p.child("VALUE"))
        .map(Element::text)
}

fn instance_to_row(instance: &Element) -> Row {
    let mut row = Row::new();
    for property in &instance.children {
        let Some(name) = property.attr("NAME") else {
            continue;
        };
        let type_name = property.attr("TYPE").unwrap_or("string");
        let value = match property.name.as_str() {
            "PROPERTY" => property
                .child("VALUE")
                .map_or(Value::Null, |v| Value::from_cim(type_name, v.text())),
            "PROPERTY.ARRAY" => property.child("VALUE.ARRAY").map_or(Value::Null, |array| {
                Value::Array(
                    array
                        .children_named("VALUE")
                        .map(|v| Value::from_cim(type_name, v.text()))
                        .collect(),
                )
            }),
            "PROPERTY.REFERENCE" => property
                .find("INSTANCENAME")
                .map_or(Value::Null, |path| Value::String(render_instance_name(path))),
            _ => continue,
        };
        row.insert(name, value);
    }
    row
}

/// Renders an instance path as `Class.key="value",...`.
fn render_instance_name(path: &Element) -> String {
    let keys: Vec<String> = path
        .children_named("KEYBINDING")
        .map(|kb| {
            let value = kb.child("KEYVALUE").map(Element::text).unwrap_or_default();
            format!("{}=\"{}\"", kb.attr("NAME").unwrap_or_default(), value)
        })
        .collect();
    format!("{}.{}", path.attr("CLASSNAME").unwrap_or_default(), keys.join(","))
}
