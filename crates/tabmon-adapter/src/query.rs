//! The constrained query grammar understood by the instance-data backends:
//!
//! ```text
//! select <column>[, <column>...] | * from <class> [where <condition>]
//! ```
//!
//! A condition made only of `key = literal` terms joined by `and` is parsed
//! into explicit key/value bindings. Any other condition is kept verbatim
//! as an opaque filter for backends that can evaluate it natively.

use crate::error::{AdapterError, Result};

/// The where-clause of a [`SelectQuery`].
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    #[default]
    None,
    /// `key = literal [and key = literal ...]`, in source order.
    Bindings(Vec<(String, String)>),
    /// Any condition that is not a plain conjunction of equalities.
    Opaque(String),
}

/// A parsed `select ... from ... [where ...]` query.
///
/// # Examples
///
/// ```
/// use tabmon_adapter::query::{Filter, SelectQuery};
///
/// let q = SelectQuery::parse("SELECT Name, FreeSpace FROM Win32_LogicalDisk WHERE DeviceID = 'C:'").unwrap();
/// assert_eq!(q.columns, vec!["Name", "FreeSpace"]);
/// assert_eq!(q.class, "Win32_LogicalDisk");
/// assert_eq!(q.filter, Filter::Bindings(vec![("DeviceID".into(), "C:".into())]));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct SelectQuery {
    /// Selected columns in source order; empty means `*`.
    pub columns: Vec<String>,
    pub class: String,
    pub filter: Filter,
}

impl SelectQuery {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim().trim_end_matches(';').trim();
        if !starts_with_keyword(text, "select") {
            return Err(AdapterError::Parse(format!("query must start with SELECT: {text}")));
        }
        let from = find_keyword(text, "from", 6)
            .ok_or_else(|| AdapterError::Parse(format!("query has no FROM clause: {text}")))?;

        let column_text = text[6..from].trim();
        if column_text.is_empty() {
            return Err(AdapterError::Parse(format!("query selects no columns: {text}")));
        }
        let columns: Vec<String> = if column_text == "*" {
            Vec::new()
        } else {
            split_top_level(column_text, ',')
                .into_iter()
                .map(|c| c.trim().to_string())
                .collect()
        };
        if columns.iter().any(|c| c.is_empty() || c == "*") {
            return Err(AdapterError::Parse(format!("malformed column list: {column_text}")));
        }

        let rest = text[from + 4..].trim_start();
        let class_end = rest
            .find(char::is_whitespace)
            .unwrap_or(rest.len());
        let class = &rest[..class_end];
        if class.is_empty() || class.contains(['(', ')', ',', '\'', '"']) {
            return Err(AdapterError::Parse(format!("malformed class name in: {text}")));
        }

        let tail = rest[class_end..].trim();
        let filter = if tail.is_empty() {
            Filter::None
        } else if starts_with_keyword(tail, "where") {
            let condition = tail[5..].trim();
            if condition.is_empty() {
                return Err(AdapterError::Parse(format!("empty WHERE clause in: {text}")));
            }
            match parse_bindings(condition) {
                Some(bindings) => Filter::Bindings(bindings),
                None => Filter::Opaque(condition.to_string()),
            }
        } else {
            return Err(AdapterError::Parse(format!("unsupported clause `{tail}`")));
        };

        Ok(Self {
            columns,
            class: class.to_string(),
            filter,
        })
    }

    pub fn selects_all(&self) -> bool {
        self.columns.is_empty()
    }

    /// Key/value bindings of the where-clause, empty for other filters.
    pub fn bindings(&self) -> &[(String, String)] {
        match &self.filter {
            Filter::Bindings(b) => b,
            _ => &[],
        }
    }

    /// Appends a column unless it is already selected (case-insensitively)
    /// or the query selects everything.
    pub fn add_column(&mut self, name: &str) {
        if self.selects_all() || self.columns.iter().any(|c| c.eq_ignore_ascii_case(name)) {
            return;
        }
        self.columns.push(name.to_string());
    }

    /// Canonical text of the query with single spaces and quoted literals.
    pub fn render(&self) -> String {
        let columns = if self.selects_all() {
            "*".to_string()
        } else {
            self.columns.join(", ")
        };
        let mut out = format!("select {columns} from {}", self.class);
        match &self.filter {
            Filter::None => {}
            Filter::Bindings(bindings) => {
                let terms: Vec<String> = bindings
                    .iter()
                    .map(|(k, v)| format!("{k} = '{}'", v.replace('\'', "''")))
                    .collect();
                out.push_str(" where ");
                out.push_str(&terms.join(" and "));
            }
            Filter::Opaque(condition) => {
                out.push_str(" where ");
                out.push_str(condition);
            }
        }
        out
    }
}

impl std::fmt::Display for SelectQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

fn starts_with_keyword(text: &str, keyword: &str) -> bool {
    text.len() >= keyword.len()
        && text.is_char_boundary(keyword.len())
        && text[..keyword.len()].eq_ignore_ascii_case(keyword)
        && text[keyword.len()..]
            .chars()
            .next()
            .map_or(true, char::is_whitespace)
}

/// Finds `keyword` as a whole word outside quotes and parentheses,
/// starting the search at byte `from`.
fn find_keyword(text: &str, keyword: &str, from: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut i = from;
    while i < bytes.len() {
        let b = bytes[i];
        if let Some(q) = quote {
            if b == q {
                quote = None;
            }
            i += 1;
            continue;
        }
        match b {
            b'\'' | b'"' => quote = Some(b),
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => {
                let end = i + keyword.len();
                let before_ok = i == 0 || bytes[i - 1].is_ascii_whitespace();
                let after_ok = end == bytes.len() || bytes.get(end).is_some_and(u8::is_ascii_whitespace);
                if before_ok
                    && after_ok
                    && end <= bytes.len()
                    && bytes[i..end].eq_ignore_ascii_case(keyword.as_bytes())
                {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Splits on `sep` outside quotes and parentheses.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote: Option<char> = None;
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_bindings(condition: &str) -> Option<Vec<(String, String)>> {
    let mut terms = Vec::new();
    let mut rest = condition;
    loop {
        match find_keyword(rest, "and", 0) {
            Some(at) => {
                terms.push(&rest[..at]);
                rest = &rest[at + 3..];
            }
            None => {
                terms.push(rest);
                break;
            }
        }
    }
    terms.into_iter().map(parse_equality).collect()
}

fn parse_equality(term: &str) -> Option<(String, String)> {
    let term = term.trim();
    let eq = term.find('=')?;
    let (key, value) = (term[..eq].trim(), term[eq + 1..].trim());
    if key.ends_with(['<', '>', '!']) || value.starts_with('=') {
        return None;
    }
    let mut chars = key.chars();
    let head_ok = chars.next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !head_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.') {
        return None;
    }
    Some((key.to_string(), parse_literal(value)?))
}

fn parse_literal(text: &str) -> Option<String> {
    let quote = text.chars().next()?;
    if quote == '\'' || quote == '"' {
        let inner = text.get(1..)?;
        let mut out = String::new();
        let mut chars = inner.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\\' {
                out.push(chars.next()?.1);
            } else if c == quote {
                if chars.peek().is_some_and(|(_, n)| *n == quote) {
                    chars.next();
                    out.push(quote);
                } else {
                    return inner[i + 1..].trim().is_empty().then_some(out);
                }
            } else {
                out.push(c);
            }
        }
        return None;
    }
    if text.contains(|c: char| c.is_whitespace() || matches!(c, '(' | ')' | '\'' | '"')) {
        return None;
    }
    Some(text.to_string())
}
