//! WS-Management (WinRM) backend: SOAP 1.2 `Enumerate` / `Pull` /
//! `Release` against the WMI resource URIs.
//!
//! With the default `wql` dialect the query text is sent as a WQL filter
//! against `<prefix>/<namespace>/*` and the server evaluates it. The
//! `class` dialect enumerates `<prefix>/<namespace>/<class>` and applies
//! where-clause bindings locally.
//!
//! Descriptor keywords: `host` (or first positional), `port`, `scheme`
//! (`http`), `user`, `password`, `namespace` (`root/cimv2`), `resource_uri`,
//! `dialect`, `max_elements` (100), `verify` (true).

use crate::cursor::{Batch, Cursor, Paginated};
use crate::error::{AdapterError, Result};
use crate::query::{Filter, SelectQuery};
use crate::xml::{escape, Element};
use crate::{BackendAdapter, Connection};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tabmon_common::descriptor::ConnectionArgs;
use tabmon_common::row::Row;
use tabmon_common::value::Value;

const BACKEND: &str = "wsman";
const DEFAULT_RESOURCE_PREFIX: &str = "http://schemas.microsoft.com/wbem/wsman/1/wmi";
const WQL_DIALECT: &str = "http://schemas.microsoft.com/wbem/wsman/1/WQL";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";
const ENUMERATION: &str = "http://schemas.xmlsoap.org/ws/2004/09/enumeration";
const MAX_ENVELOPE_SIZE: u32 = 512_000;

pub struct WsManAdapter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dialect {
    Wql,
    Class,
}

#[async_trait]
impl BackendAdapter for WsManAdapter {
    fn name(&self) -> &str {
        BACKEND
    }

    async fn connect(&self, descriptor: &str) -> Result<Box<dyn Connection>> {
        let args = ConnectionArgs::parse_lenient(descriptor);
        let host = args
            .text("host")
            .or_else(|| args.positional_text(0))
            .ok_or_else(|| AdapterError::connect(BACKEND, "descriptor has no host"))?;
        let scheme = args.text("scheme").unwrap_or_else(|| "http".to_string());
        let default_port = if scheme == "https" { 5986.0 } else { 5985.0 };
        let port = args.number("port").unwrap_or(default_port) as u16;
        let dialect = match args.text("dialect").as_deref() {
            None | Some("wql") => Dialect::Wql,
            Some("class") => Dialect::Class,
            Some(other) => {
                return Err(AdapterError::connect(BACKEND, format!("unknown dialect `{other}`")));
            }
        };

        let client = Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(!args.flag("verify").unwrap_or(true))
            .build()
            .map_err(|e| AdapterError::connect(BACKEND, format!("failed to build HTTP client: {e}")))?;

        let namespace = args
            .text("namespace")
            .unwrap_or_else(|| "root/cimv2".to_string());
        let prefix = args
            .text("resource_uri")
            .unwrap_or_else(|| DEFAULT_RESOURCE_PREFIX.to_string());

        tracing::info!(backend = BACKEND, target = %args.redacted(), "Prepared WS-Management session");
        Ok(Box::new(WsManConnection {
            endpoint: Arc::new(Endpoint {
                client,
                url: format!("{scheme}://{host}:{port}/wsman"),
                user: args.text("user"),
                password: args.text("password"),
            }),
            resource_base: format!("{}/{}", prefix.trim_end_matches('/'), namespace.trim_matches('/')),
            dialect,
            max_elements: args
                .number("max_elements")
                .map_or(100, |n| n.max(1.0) as u32),
        }))
    }
}

struct WsManConnection {
    endpoint: Arc<Endpoint>,
    resource_base: String,
    dialect: Dialect,
    max_elements: u32,
}

/// Where and how envelopes are posted. Shared with background releases.
struct Endpoint {
    client: Client,
    url: String,
    user: Option<String>,
    password: Option<String>,
}

impl Endpoint {
    async fn send(&self, envelope: String, timeout: Duration) -> Result<Element> {
        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/soap+xml;charset=UTF-8")
            .timeout(timeout)
            .body(envelope);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AdapterError::connect(BACKEND, format!("authentication rejected ({status})")));
        }
        let text = response.text().await?;
        // WinRM reports faults with HTTP 500 and a SOAP body.
        if text.trim().is_empty() {
            if status.is_success() {
                return Err(AdapterError::protocol(BACKEND, "empty response"));
            }
            return Err(AdapterError::query(BACKEND, format!("HTTP {status}")));
        }
        let envelope = Element::parse(&text)?;
        if let Some(fault) = envelope.find("Fault") {
            return Err(AdapterError::query(BACKEND, fault_reason(fault)));
        }
        envelope
            .child("Body")
            .cloned()
            .ok_or_else(|| AdapterError::protocol(BACKEND, "response has no SOAP body"))
    }
}

#[async_trait]
impl Connection for WsManConnection {
    async fn execute(&self, query: &str, timeout: Duration) -> Result<Vec<Row>> {
        let parsed = SelectQuery::parse(query)?;
        let (resource_uri, filter, bindings) = match self.dialect {
            Dialect::Wql => (
                format!("{}/*", self.resource_base),
                Some(query.trim().to_string()),
                Vec::new(),
            ),
            Dialect::Class => {
                if let Filter::Opaque(condition) = &parsed.filter {
                    return Err(AdapterError::query(
                        BACKEND,
                        format!("class dialect only supports `key = value` conditions, got `{condition}`"),
                    ));
                }
                (
                    format!("{}/{}", self.resource_base, parsed.class),
                    None,
                    parsed.bindings().to_vec(),
                )
            }
        };

        let enumeration = Enumeration {
            conn: self,
            resource_uri,
            filter,
            timeout,
        };
        let mut rows = Cursor::new(&enumeration).fetch_all().await?;
        rows.retain(|row| row.matches(bindings.iter().map(|(k, v)| (k.as_str(), v.as_str()))));
        for row in &mut rows {
            row.retain_columns(&parsed.columns);
        }
        Ok(rows)
    }

    async fn close(&self) {}
}

struct Enumeration<'a> {
    conn: &'a WsManConnection,
    resource_uri: String,
    filter: Option<String>,
    timeout: Duration,
}

impl Enumeration<'_> {
    fn envelope(&self, action: &str, body: &str) -> String {
        build_envelope(&self.conn.endpoint.url, &self.resource_uri, action, self.timeout, body)
    }

    fn release_envelope(&self, token: &str) -> String {
        let body = format!(
            "<n:Release><n:EnumerationContext>{}</n:EnumerationContext></n:Release>",
            escape(token)
        );
        self.envelope(&format!("{ENUMERATION}/Release"), &body)
    }
}

#[async_trait]
impl Paginated for Enumeration<'_> {
    async fn enumerate(&self) -> Result<Batch> {
        let filter = self
            .filter
            .as_deref()
            .map(|wql| format!("<w:Filter Dialect=\"{WQL_DIALECT}\">{}</w:Filter>", escape(wql)))
            .unwrap_or_default();
        let body = format!(
            "<n:Enumerate><w:OptimizeEnumeration/><w:MaxElements>{}</w:MaxElements>{filter}</n:Enumerate>",
            self.conn.max_elements
        );
        let envelope = self.envelope(&format!("{ENUMERATION}/Enumerate"), &body);
        let response = self.conn.endpoint.send(envelope, self.timeout).await?;
        parse_enumeration(&response, "EnumerateResponse")
    }

    async fn pull(&self, token: &str) -> Result<Batch> {
        let body = format!(
            "<n:Pull><n:EnumerationContext>{}</n:EnumerationContext><n:MaxElements>{}</n:MaxElements></n:Pull>",
            escape(token),
            self.conn.max_elements
        );
        let envelope = self.envelope(&format!("{ENUMERATION}/Pull"), &body);
        let response = self.conn.endpoint.send(envelope, self.timeout).await?;
        parse_enumeration(&response, "PullResponse")
    }

    async fn release(&self, token: &str) -> Result<()> {
        let envelope = self.release_envelope(token);
        self.conn.endpoint.send(envelope, self.timeout).await.map(|_| ())
    }

    fn release_detached(&self, token: String) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(backend = BACKEND, "No runtime to release enumeration context");
            return;
        };
        let envelope = self.release_envelope(&token);
        let endpoint = Arc::clone(&self.conn.endpoint);
        let timeout = self.timeout;
        runtime.spawn(async move {
            if let Err(e) = endpoint.send(envelope, timeout).await {
                tracing::warn!(backend = BACKEND, error = %e, "Failed to release enumeration context");
            }
        });
    }
}

fn build_envelope(to: &str, resource_uri: &str, action: &str, timeout: Duration, body: &str) -> String {
    format!(
        concat!(
            "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\"",
            " xmlns:a=\"http://schemas.xmlsoap.org/ws/2004/08/addressing\"",
            " xmlns:n=\"{enumeration}\"",
            " xmlns:w=\"http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd\">",
            "<s:Header>",
            "<a:To>{to}</a:To>",
            "<w:ResourceURI s:mustUnderstand=\"true\">{resource}</w:ResourceURI>",
            "<a:ReplyTo><a:Address s:mustUnderstand=\"true\">{anonymous}</a:Address></a:ReplyTo>",
            "<a:Action s:mustUnderstand=\"true\">{action}</a:Action>",
            "<w:MaxEnvelopeSize s:mustUnderstand=\"true\">{max_size}</w:MaxEnvelopeSize>",
            "<a:MessageID>uuid:{id}</a:MessageID>",
            "<w:OperationTimeout>PT{secs}.000S</w:OperationTimeout>",
            "</s:Header><s:Body>{body}</s:Body></s:Envelope>"
        ),
        enumeration = ENUMERATION,
        to = escape(to),
        resource = escape(resource_uri),
        anonymous = ANONYMOUS,
        action = action,
        max_size = MAX_ENVELOPE_SIZE,
        id = uuid::Uuid::new_v4(),
        secs = timeout.as_secs().max(1),
        body = body,
    )
}

fn fault_reason(fault: &Element) -> String {
    if let Some(text) = fault.find("Reason").and_then(|r| r.find("Text")) {
        if !text.text().is_empty() {
            return text.text().to_string();
        }
    }
    fault
        .find("Subcode")
        .and_then(|s| s.child("Value"))
        .or_else(|| fault.find("Value"))
        .map_or_else(|| "SOAP fault".to_string(), |v| v.text().to_string())
}

fn parse_enumeration(body: &Element, response_name: &str) -> Result<Batch> {
    let response = body.child(response_name).ok_or_else(|| {
        AdapterError::protocol(BACKEND, format!("expected {response_name} in SOAP body"))
    })?;

    let rows = response
        .child("Items")
        .map(|items| items.children.iter().map(item_to_row).collect())
        .unwrap_or_default();

    let token = if response.child("EndOfSequence").is_some() {
        None
    } else {
        response
            .child("EnumerationContext")
            .map(Element::text)
            .filter(|ctx| !ctx.is_empty())
            .map(str::to_string)
    };
    Ok(Batch { rows, token })
}

/// Converts one enumerated instance. Repeated property elements form an
/// array; `xsi:nil` marks a null.
fn item_to_row(item: &Element) -> Row {
    let mut row = Row::new();
    let mut seen: Vec<&str> = Vec::new();
    for property in &item.children {
        let name = property.name.as_str();
        if seen.contains(&name) {
            continue;
        }
        seen.push(name);
        let values: Vec<Value> = item.children_named(name).map(property_value).collect();
        let value = if values.len() == 1 {
            values.into_iter().next().unwrap_or_default()
        } else {
            Value::Array(values)
        };
        row.insert(name, value);
    }
    row
}

fn property_value(property: &Element) -> Value {
    if property.attr("nil").is_some_and(|n| n == "true") {
        return Value::Null;
    }
    if let Some(datetime) = property.child("Datetime") {
        return DateTime::parse_from_rfc3339(datetime.text())
            .map(|ts| Value::DateTime(ts.with_timezone(&Utc)))
            .unwrap_or_else(|_| Value::infer(datetime.text()));
    }
    if let Some(interval) = property.child("Interval") {
        return Value::string(interval.text());
    }
    Value::infer(property.text())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body(xml: &str) -> Element {
        let envelope = Element::parse(&format!(
            r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:n="{ENUMERATION}" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="urn:p" xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance"><s:Header/><s:Body>{xml}</s:Body></s:Envelope>"#
        ))
        .unwrap();
        envelope.child("Body").cloned().unwrap()
    }

    #[test]
    fn optimized_enumerate_returns_items_and_context() {
        let body = body(
            r#"<n:EnumerateResponse>
                <n:EnumerationContext>uuid:ctx-1</n:EnumerationContext>
                <w:Items>
                  <p:Win32_LogicalDisk>
                    <p:DeviceID>C:</p:DeviceID>
                    <p:FreeSpace>1024</p:FreeSpace>
                    <p:VolumeName xsi:nil="true"/>
                    <p:InstallDate><cim:Datetime xmlns:cim="urn:cim">2024-05-01T10:00:00Z</cim:Datetime></p:InstallDate>
                    <p:Capabilities>3</p:Capabilities>
                    <p:Capabilities>4</p:Capabilities>
                  </p:Win32_LogicalDisk>
                </w:Items>
              </n:EnumerateResponse>"#,
        );
        let batch = parse_enumeration(&body, "EnumerateResponse").unwrap();
        assert_eq!(batch.token.as_deref(), Some("uuid:ctx-1"));
        assert_eq!(batch.rows.len(), 1);

        let row = &batch.rows[0];
        assert_eq!(row.get("deviceid"), Some(&Value::string("C:")));
        assert_eq!(row.get("freespace"), Some(&Value::Number(1024.0)));
        assert_eq!(row.get("volumename"), Some(&Value::Null));
        assert!(matches!(row.get("installdate"), Some(Value::DateTime(_))));
        assert_eq!(
            row.get("capabilities"),
            Some(&Value::Array(vec![Value::Number(3.0), Value::Number(4.0)]))
        );
    }

    #[test]
    fn end_of_sequence_clears_the_token() {
        let body = body(
            r#"<n:PullResponse>
                <n:Items><p:X><p:Name>a</p:Name></p:X><p:X><p:Name>b</p:Name></p:X></n:Items>
                <n:EndOfSequence/>
              </n:PullResponse>"#,
        );
        let batch = parse_enumeration(&body, "PullResponse").unwrap();
        assert_eq!(batch.rows.len(), 2);
        assert!(batch.token.is_none());
    }

    #[test]
    fn unexpected_body_is_a_protocol_error() {
        let body = body("<n:ReleaseResponse/>");
        assert!(matches!(
            parse_enumeration(&body, "PullResponse"),
            Err(AdapterError::Protocol { .. })
        ));
    }

    #[test]
    fn fault_reason_prefers_text() {
        let doc = Element::parse(
            r#"<s:Fault xmlns:s="urn:s"><s:Code><s:Value>s:Sender</s:Value><s:Subcode><s:Value>w:InvalidSelectors</s:Value></s:Subcode></s:Code><s:Reason><s:Text xml:lang="en-US">The selectors are invalid.</s:Text></s:Reason></s:Fault>"#,
        )
        .unwrap();
        assert_eq!(fault_reason(&doc), "The selectors are invalid.");

        let bare = Element::parse(
            r#"<Fault><Code><Value>Sender</Value><Subcode><Value>w:TimedOut</Value></Subcode></Code></Fault>"#,
        )
        .unwrap();
        assert_eq!(fault_reason(&bare), "w:TimedOut");
    }

    #[test]
    fn envelope_carries_addressing_headers() {
        let xml = build_envelope(
            "http://srv:5985/wsman",
            "http://schemas.microsoft.com/wbem/wsman/1/wmi/root/cimv2/*",
            "http://schemas.xmlsoap.org/ws/2004/09/enumeration/Enumerate",
            Duration::from_secs(30),
            "<n:Enumerate/>",
        );
        let doc = Element::parse(&xml).unwrap();
        assert_eq!(doc.find("To").unwrap().text(), "http://srv:5985/wsman");
        assert_eq!(doc.find("OperationTimeout").unwrap().text(), "PT30.000S");
        assert!(doc.find("MessageID").unwrap().text().starts_with("uuid:"));
        assert!(doc.find("Enumerate").is_some());
    }

    #[tokio::test]
    async fn unknown_dialect_is_rejected() {
        let err = WsManAdapter
            .connect("host=srv, dialect=xpath")
            .await
            .err()
            .unwrap();
        assert!(err.is_connect());
    }

    mod over_http {
        use super::*;
        use crate::test_server::{serve, Reply};
        use reqwest::StatusCode;

        const LONG: Duration = Duration::from_secs(30);

        fn soap(body: &str) -> String {
            format!(
                r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:n="{ENUMERATION}" xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" xmlns:p="urn:p"><s:Header/><s:Body>{body}</s:Body></s:Envelope>"#
            )
        }

        fn disk(id: &str, free: u64) -> String {
            format!("<p:Win32_LogicalDisk><p:DeviceID>{id}</p:DeviceID><p:FreeSpace>{free}</p:FreeSpace><p:Size>100</p:Size></p:Win32_LogicalDisk>")
        }

        fn enumerate_response(items: &[String], context: &str) -> Reply {
            Reply::ok(soap(&format!(
                "<n:EnumerateResponse><n:EnumerationContext>{context}</n:EnumerationContext><w:Items>{}</w:Items></n:EnumerateResponse>",
                items.concat()
            )))
        }

        fn last_pull(items: &[String]) -> Reply {
            Reply::ok(soap(&format!(
                "<n:PullResponse><n:Items>{}</n:Items><n:EndOfSequence/></n:PullResponse>",
                items.concat()
            )))
        }

        async fn connect(port: u16, extra: &str) -> Box<dyn Connection> {
            WsManAdapter
                .connect(&format!("host=127.0.0.1, port={port}{extra}"))
                .await
                .unwrap()
        }

        #[tokio::test]
        async fn wql_enumeration_pulls_until_end_of_sequence() {
            let (port, script) = serve(
                "/wsman",
                vec![
                    enumerate_response(&[disk("C:", 10)], "uuid:ctx-1"),
                    last_pull(&[disk("D:", 20)]),
                ],
            )
            .await;
            let conn = connect(port, "").await;

            let rows = conn
                .execute("select DeviceID, FreeSpace from Win32_LogicalDisk where Size > 10", LONG)
                .await
                .unwrap();

            assert_eq!(rows.len(), 2);
            assert_eq!(rows[1].get("deviceid"), Some(&Value::string("D:")));
            assert_eq!(rows[1].get("freespace"), Some(&Value::Number(20.0)));
            assert!(!rows[0].contains("size"));

            let received = script.received();
            assert_eq!(received.len(), 2);
            assert!(received[0].body.contains("/enumeration/Enumerate</a:Action>"));
            assert!(received[0].body.contains("root/cimv2/*</w:ResourceURI>"));
            assert!(received[0].body.contains("where Size &gt; 10</w:Filter>"));
            assert!(received[1].body.contains("<n:EnumerationContext>uuid:ctx-1</n:EnumerationContext>"));
        }

        #[tokio::test]
        async fn class_dialect_filters_bindings_locally() {
            let (port, script) = serve(
                "/wsman",
                vec![Reply::ok(soap(&format!(
                    "<n:EnumerateResponse><w:Items>{}{}</w:Items><w:EndOfSequence/></n:EnumerateResponse>",
                    disk("C:", 10),
                    disk("D:", 20)
                )))],
            )
            .await;
            let conn = connect(port, ", dialect=class").await;

            let rows = conn
                .execute("select FreeSpace from Win32_LogicalDisk where DeviceID = 'd:'", LONG)
                .await
                .unwrap();

            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].get("freespace"), Some(&Value::Number(20.0)));
            assert_eq!(rows[0].len(), 1);

            let body = &script.received()[0].body;
            assert!(body.contains("root/cimv2/Win32_LogicalDisk</w:ResourceURI>"));
            assert!(!body.contains("<w:Filter"));
        }

        #[tokio::test]
        async fn soap_fault_is_a_query_error() {
            let fault = soap(
                "<s:Fault><s:Code><s:Value>s:Sender</s:Value></s:Code><s:Reason><s:Text>Invalid query</s:Text></s:Reason></s:Fault>",
            );
            let (port, _script) =
                serve("/wsman", vec![Reply::status(StatusCode::INTERNAL_SERVER_ERROR, fault)]).await;
            let conn = connect(port, "").await;

            let err = conn.execute("select * from Win32_Nothing", LONG).await.unwrap_err();
            assert!(!err.is_connect());
            assert!(err.to_string().contains("Invalid query"), "{err}");
        }

        #[tokio::test]
        async fn rejected_credentials_are_a_connect_error() {
            let (port, _script) =
                serve("/wsman", vec![Reply::status(StatusCode::UNAUTHORIZED, "")]).await;
            let conn = connect(port, ", user=monitor, password=secret").await;
            let err = conn.execute("select * from Win32_Service", LONG).await.unwrap_err();
            assert!(err.is_connect(), "{err}");
        }

        #[tokio::test]
        async fn cancelled_pull_releases_the_context_in_background() {
            let (port, script) = serve(
                "/wsman",
                vec![
                    enumerate_response(&[disk("C:", 10)], "uuid:ctx-2"),
                    last_pull(&[]).delayed(Duration::from_secs(10)),
                    Reply::ok(soap("<n:ReleaseResponse/>")),
                ],
            )
            .await;
            let conn = connect(port, "").await;

            let outcome = tokio::time::timeout(
                Duration::from_millis(300),
                conn.execute("select * from Win32_LogicalDisk", LONG),
            )
            .await;
            assert!(outcome.is_err());

            let received = script.wait_for(3).await;
            assert!(received[2].body.contains("/enumeration/Release</a:Action>"));
            assert!(received[2].body.contains("uuid:ctx-2"));
        }
    }
}
