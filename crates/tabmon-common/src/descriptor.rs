//! Connection descriptor grammar shared by every backend adapter.
//!
//! A descriptor is a comma-separated list of positional and `name=value`
//! arguments:
//!
//! ```text
//! 'https', host='cim01', port=5989, verify=false, namespace="root/cimv2"
//! ```
//!
//! Quoted literals are strings, bare `true`/`false` are booleans, anything
//! else is a number when it parses as one and a bare token otherwise.

use std::collections::BTreeMap;

/// A single parsed argument.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Bool(bool),
    Number(f64),
    Bare(String),
}

impl ArgValue {
    /// Text form of the argument, whatever its kind.
    pub fn as_text(&self) -> String {
        match self {
            ArgValue::Str(s) | ArgValue::Bare(s) => s.clone(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Number(n) => crate::value::format_number(*n),
        }
    }
}

/// Errors raised while parsing a connection descriptor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum DescriptorError {
    #[error("unterminated string literal starting at byte {0}")]
    UnterminatedString(usize),
    #[error("argument name is empty in `{0}`")]
    EmptyName(String),
    #[error("positional argument `{0}` follows a keyword argument")]
    PositionalAfterKeyword(String),
    #[error("unexpected characters after string literal in `{0}`")]
    TrailingCharacters(String),
}

/// Parsed connection descriptor arguments.
///
/// Keyword names are matched case-insensitively.
///
/// # Examples
///
/// ```
/// use tabmon_common::descriptor::ConnectionArgs;
///
/// let args = ConnectionArgs::parse("'pg', host='db01', port=5432, tls=true").unwrap();
/// assert_eq!(args.positional_text(0).as_deref(), Some("pg"));
/// assert_eq!(args.text("HOST").as_deref(), Some("db01"));
/// assert_eq!(args.number("port"), Some(5432.0));
/// assert_eq!(args.flag("tls"), Some(true));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConnectionArgs {
    positional: Vec<ArgValue>,
    keyword: BTreeMap<String, ArgValue>,
}

const SECRET_KEYS: &[&str] = &["password", "passwd", "pwd", "secret", "token"];

impl ConnectionArgs {
    pub fn parse(descriptor: &str) -> Result<Self, DescriptorError> {
        let mut args = ConnectionArgs::default();
        for (offset, piece) in split_top_level(descriptor)? {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            match split_keyword(piece) {
                Some((name, raw)) => {
                    let name = name.trim();
                    if name.is_empty() {
                        return Err(DescriptorError::EmptyName(piece.to_string()));
                    }
                    let value = parse_value(raw.trim(), offset)?;
                    args.keyword.insert(name.to_lowercase(), value);
                }
                None => {
                    if !args.keyword.is_empty() {
                        return Err(DescriptorError::PositionalAfterKeyword(piece.to_string()));
                    }
                    args.positional.push(parse_value(piece, offset)?);
                }
            }
        }
        Ok(args)
    }

    /// Parses a descriptor, falling back to empty arguments on malformed
    /// input so that a bad descriptor fails at connect time rather than
    /// aborting a whole collection cycle.
    pub fn parse_lenient(descriptor: &str) -> Self {
        match Self::parse(descriptor) {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed connection descriptor, using empty arguments");
                Self::default()
            }
        }
    }

    pub fn positional(&self, index: usize) -> Option<&ArgValue> {
        self.positional.get(index)
    }

    pub fn positional_text(&self, index: usize) -> Option<String> {
        self.positional(index).map(ArgValue::as_text)
    }

    pub fn get(&self, name: &str) -> Option<&ArgValue> {
        self.keyword.get(&name.to_lowercase())
    }

    pub fn text(&self, name: &str) -> Option<String> {
        self.get(name).map(ArgValue::as_text)
    }

    pub fn number(&self, name: &str) -> Option<f64> {
        match self.get(name)? {
            ArgValue::Number(n) => Some(*n),
            ArgValue::Str(s) | ArgValue::Bare(s) => s.trim().parse().ok(),
            ArgValue::Bool(_) => None,
        }
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            ArgValue::Bool(b) => Some(*b),
            ArgValue::Str(s) | ArgValue::Bare(s) => crate::value::parse_bool(s),
            ArgValue::Number(n) => Some(*n != 0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty() && self.keyword.is_empty()
    }

    /// Descriptor rendering safe for logs: secret-like keyword values and
    /// URL passwords are masked.
    pub fn redacted(&self) -> String {
        let mut parts: Vec<String> = self
            .positional
            .iter()
            .map(|v| mask_url_password(&v.as_text()))
            .collect();
        for (name, value) in &self.keyword {
            if SECRET_KEYS.iter().any(|k| name.contains(k)) {
                parts.push(format!("{name}=***"));
            } else {
                parts.push(format!("{name}={}", mask_url_password(&value.as_text())));
            }
        }
        parts.join(", ")
    }
}

/// Redacts a raw descriptor string for logging.
pub fn redact(descriptor: &str) -> String {
    match ConnectionArgs::parse(descriptor) {
        Ok(args) => args.redacted(),
        Err(_) => "<unparseable descriptor>".to_string(),
    }
}

fn mask_url_password(text: &str) -> String {
    let Some(scheme_end) = text.find("://") else {
        return text.to_string();
    };
    let rest = &text[scheme_end + 3..];
    let Some(at) = rest.find('@') else {
        return text.to_string();
    };
    match rest[..at].find(':') {
        Some(colon) => format!(
            "{}://{}:***{}",
            &text[..scheme_end],
            &rest[..colon],
            &rest[at..]
        ),
        None => text.to_string(),
    }
}

/// Splits on commas that are outside quotes, returning each piece with its
/// byte offset in the descriptor.
fn split_top_level(descriptor: &str) -> Result<Vec<(usize, &str)>, DescriptorError> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut quote: Option<(char, usize)> = None;
    let mut escaped = false;

    for (i, c) in descriptor.char_indices() {
        if let Some((q, _)) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some((c, i)),
            ',' => {
                pieces.push((start, &descriptor[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    if let Some((_, at)) = quote {
        return Err(DescriptorError::UnterminatedString(at));
    }
    pieces.push((start, &descriptor[start..]));
    Ok(pieces)
}

/// Returns `(name, value)` when the piece is `name=value` with the `=`
/// outside any quotes.
fn split_keyword(piece: &str) -> Option<(&str, &str)> {
    if piece.starts_with('\'') || piece.starts_with('"') {
        return None;
    }
    let eq = piece.find('=')?;
    let name = &piece[..eq];
    if name.contains('\'') || name.contains('"') {
        return None;
    }
    // URLs such as `sqlite://x?mode=ro` are positional values, not keywords.
    if !name
        .trim()
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return None;
    }
    Some((name, &piece[eq + 1..]))
}

fn parse_value(raw: &str, offset: usize) -> Result<ArgValue, DescriptorError> {
    let first = raw.chars().next();
    if let Some(q @ ('\'' | '"')) = first {
        let mut out = String::new();
        let mut escaped = false;
        let mut closed_at = None;
        for (i, c) in raw.char_indices().skip(1) {
            if escaped {
                out.push(c);
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                closed_at = Some(i);
                break;
            } else {
                out.push(c);
            }
        }
        let end = closed_at.ok_or(DescriptorError::UnterminatedString(offset))?;
        if !raw[end + 1..].trim().is_empty() {
            return Err(DescriptorError::TrailingCharacters(raw.to_string()));
        }
        return Ok(ArgValue::Str(out));
    }
    if raw == "true" {
        return Ok(ArgValue::Bool(true));
    }
    if raw == "false" {
        return Ok(ArgValue::Bool(false));
    }
    if let Ok(n) = raw.parse::<f64>() {
        if n.is_finite() {
            return Ok(ArgValue::Number(n));
        }
    }
    Ok(ArgValue::Bare(raw.to_string()))
}
