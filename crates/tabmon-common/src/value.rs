//! Portable value model and the coercion rules adapters use to fill it.
//!
//! Every backend speaks its own type system. Adapters collapse those into
//! the small closed set of [`Value`] kinds so that row filtering and metric
//! derivation never need to know where a row came from.

use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// A normalised scalar or array value taken from a result row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Boolean(bool),
    Number(f64),
    DateTime(DateTime<Utc>),
    String(String),
    /// Elements are always scalars; adapters never nest arrays.
    Array(Vec<Value>),
}

impl Value {
    /// Builds a string value, trimming surrounding whitespace.
    pub fn string(text: impl AsRef<str>) -> Self {
        Value::String(text.as_ref().trim().to_string())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of the value used by metric derivation.
    ///
    /// Booleans count as `1`/`0`, timestamps as Unix seconds and strings are
    /// parsed when they hold a number. Nulls and arrays have no numeric view.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            Value::DateTime(ts) => Some(ts.timestamp_millis() as f64 / 1000.0),
            Value::String(s) => parse_number(s),
            Value::Null | Value::Array(_) => None,
        }
    }

    /// Case-insensitive string form used when comparing row values with
    /// expected keybinding values.
    ///
    /// Arrays are flattened by joining their normalised elements with a
    /// single space, which is also how list-valued keybindings are rendered.
    ///
    /// # Examples
    ///
    /// ```
    /// use tabmon_common::value::Value;
    ///
    /// assert_eq!(Value::string("  Running ").normalized(), "running");
    /// assert_eq!(Value::Number(3.0).normalized(), "3");
    /// assert_eq!(Value::Null.normalized(), "");
    /// ```
    pub fn normalized(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Boolean(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::DateTime(ts) => ts.to_rfc3339(),
            Value::String(s) => normalize_text(s),
            Value::Array(items) => items
                .iter()
                .map(Value::normalized)
                .collect::<Vec<_>>()
                .join(" "),
        }
    }

    /// Coerces untyped wire text (WMI tables, WS-Management XML).
    ///
    /// Empty text is `Null`; `true`/`false` become booleans; DMTF datetimes
    /// and intervals are decoded; canonical numbers become `Number`; anything
    /// else stays a trimmed string. Numbers with leading zeros stay strings
    /// so identifiers like `0001` survive untouched.
    pub fn infer(text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Value::Null;
        }
        if let Some(b) = parse_bool(text) {
            return Value::Boolean(b);
        }
        if let Some(value) = parse_dmtf(text) {
            return value;
        }
        if is_canonical_number(text) {
            if let Some(n) = parse_number(text) {
                return Value::Number(n);
            }
        }
        Value::String(text.to_string())
    }

    /// Coerces text tagged with a CIM type name (`string`, `uint32`,
    /// `datetime`, ...). Values that cannot be coerced become `Null`.
    pub fn from_cim(type_name: &str, text: &str) -> Self {
        let text = text.trim();
        if text.is_empty() {
            return Value::Null;
        }
        match type_name.to_ascii_lowercase().as_str() {
            "string" | "char16" | "reference" => Value::String(text.to_string()),
            "boolean" => parse_bool(text).map_or(Value::Null, Value::Boolean),
            "datetime" => parse_dmtf(text)
                .or_else(|| parse_rfc3339(text).map(Value::DateTime))
                .unwrap_or(Value::Null),
            "uint8" | "uint16" | "uint32" | "uint64" | "sint8" | "sint16" | "sint32" | "sint64"
            | "real32" | "real64" => parse_cim_number(text).map_or(Value::Null, Value::Number),
            _ => Value::infer(text),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::DateTime(ts) => write!(f, "{}", ts.to_rfc3339()),
            Value::String(s) => write!(f, "{s}"),
            Value::Array(items) => {
                let parts: Vec<String> = items.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" "))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(s)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::string(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Parses `true`/`false` case-insensitively.
pub fn parse_bool(text: &str) -> Option<bool> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("true") {
        Some(true)
    } else if text.eq_ignore_ascii_case("false") {
        Some(false)
    } else {
        None
    }
}

/// Normalises free text for comparison: trimmed, lowercased, and numbers
/// rendered in their canonical form so `"1.0"` and `1` compare equal.
pub fn normalize_text(text: &str) -> String {
    let trimmed = text.trim();
    if looks_numeric(trimmed) {
        if let Some(n) = parse_number(trimmed) {
            return format_number(n);
        }
    }
    trimmed.to_lowercase()
}

/// Renders integral values without a fractional part.
pub fn format_number(n: f64) -> String {
    if n.is_finite() && n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

fn looks_numeric(text: &str) -> bool {
    !text.is_empty()
        && text.chars().any(|c| c.is_ascii_digit())
        && text
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
}

fn parse_number(text: &str) -> Option<f64> {
    let text = text.trim();
    if !looks_numeric(text) {
        return None;
    }
    text.parse::<f64>().ok().filter(|n| n.is_finite())
}

fn parse_cim_number(text: &str) -> Option<f64> {
    let hex = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"));
    match hex {
        Some(digits) => u64::from_str_radix(digits, 16).ok().map(|n| n as f64),
        None => parse_number(text),
    }
}

fn is_canonical_number(text: &str) -> bool {
    let digits = text.strip_prefix('-').unwrap_or(text);
    let mut chars = digits.chars();
    match (chars.next(), chars.next()) {
        (Some('0'), Some(c)) => c == '.',
        (Some(_), _) => true,
        (None, _) => false,
    }
}

fn parse_rfc3339(text: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Parses the fixed-width DMTF datetime `yyyymmddHHMMSS.mmmmmmsUUU`, where
/// `s` is `+`/`-` and `UUU` the offset from UTC in minutes, into a UTC
/// timestamp. The interval form `ddddddddHHMMSS.mmmmmm:000` becomes a
/// `Number` of seconds.
///
/// Returns `None` for anything else, including wildcarded (`*`) fields.
///
/// # Examples
///
/// ```
/// use tabmon_common::value::{parse_dmtf, Value};
///
/// let Some(Value::DateTime(ts)) = parse_dmtf("20240102030405.000000+060") else {
///     panic!("expected a timestamp");
/// };
/// assert_eq!(ts.to_rfc3339(), "2024-01-02T02:04:05+00:00");
///
/// assert_eq!(parse_dmtf("00000001000010.000000:000"), Some(Value::Number(86410.0)));
/// ```
pub fn parse_dmtf(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    if bytes.len() != 25 || bytes[14] != b'.' {
        return None;
    }
    let field = |from: usize, to: usize| -> Option<i64> {
        let part = text.get(from..to)?;
        if !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        part.parse().ok()
    };
    let micros = field(15, 21)?;

    match bytes[21] {
        b':' => {
            let days = field(0, 8)?;
            let seconds = days * 86_400 + field(8, 10)? * 3600 + field(10, 12)? * 60 + field(12, 14)?;
            Some(Value::Number(seconds as f64 + micros as f64 / 1_000_000.0))
        }
        sign @ (b'+' | b'-') => {
            let offset_minutes = field(22, 25)?;
            let offset_secs = i32::try_from(offset_minutes * 60).ok()?;
            let offset = if sign == b'+' {
                FixedOffset::east_opt(offset_secs)?
            } else {
                FixedOffset::west_opt(offset_secs)?
            };
            let date = NaiveDate::from_ymd_opt(
                i32::try_from(field(0, 4)?).ok()?,
                u32::try_from(field(4, 6)?).ok()?,
                u32::try_from(field(6, 8)?).ok()?,
            )?;
            let naive = date.and_hms_micro_opt(
                u32::try_from(field(8, 10)?).ok()?,
                u32::try_from(field(10, 12)?).ok()?,
                u32::try_from(field(12, 14)?).ok()?,
                u32::try_from(micros).ok()?,
            )?;
            let local = offset.from_local_datetime(&naive).single()?;
            Some(Value::DateTime(local.with_timezone(&Utc)))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infer_keeps_leading_zero_identifiers_as_strings() {
        assert_eq!(Value::infer("0001"), Value::String("0001".into()));
        assert_eq!(Value::infer("0.5"), Value::Number(0.5));
        assert_eq!(Value::infer("-12"), Value::Number(-12.0));
        assert_eq!(Value::infer("0"), Value::Number(0.0));
    }

    #[test]
    fn infer_parses_booleans_case_insensitively() {
        assert_eq!(Value::infer("TRUE"), Value::Boolean(true));
        assert_eq!(Value::infer(" False "), Value::Boolean(false));
        assert_eq!(Value::infer("yes"), Value::String("yes".into()));
    }

    #[test]
    fn infer_treats_blank_text_as_null() {
        assert_eq!(Value::infer("   "), Value::Null);
    }

    #[test]
    fn infer_does_not_turn_words_into_numbers() {
        assert_eq!(Value::infer("inf"), Value::String("inf".into()));
        assert_eq!(Value::infer("NaN"), Value::String("NaN".into()));
    }

    #[test]
    fn cim_numeric_types_become_numbers() {
        assert_eq!(Value::from_cim("uint64", " 42 "), Value::Number(42.0));
        assert_eq!(Value::from_cim("real32", "1.5"), Value::Number(1.5));
        assert_eq!(Value::from_cim("uint32", "0x1F"), Value::Number(31.0));
        assert_eq!(Value::from_cim("sint16", "abc"), Value::Null);
    }

    #[test]
    fn cim_strings_are_trimmed_and_empty_is_null() {
        assert_eq!(Value::from_cim("string", "  disk0 "), Value::String("disk0".into()));
        assert_eq!(Value::from_cim("string", ""), Value::Null);
    }

    #[test]
    fn dmtf_negative_offset_moves_forward_to_utc() {
        let Some(Value::DateTime(ts)) = parse_dmtf("20240102030405.500000-120") else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.to_rfc3339(), "2024-01-02T05:04:05.500+00:00");
    }

    #[test]
    fn dmtf_rejects_wildcards_and_bad_lengths() {
        assert_eq!(parse_dmtf("********030405.000000+000"), None);
        assert_eq!(parse_dmtf("20240102"), None);
    }

    #[test]
    fn cim_datetime_accepts_explicit_offset_form() {
        let value = Value::from_cim("datetime", "2024-05-01T10:00:00+02:00");
        let Value::DateTime(ts) = value else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.to_rfc3339(), "2024-05-01T08:00:00+00:00");
    }

    #[test]
    fn normalized_numbers_compare_across_representations() {
        assert_eq!(normalize_text("1.0"), Value::Number(1.0).normalized());
        assert_eq!(normalize_text(" 7 "), "7");
        assert_eq!(normalize_text("C:"), "c:");
    }

    #[test]
    fn as_f64_covers_scalar_kinds() {
        assert_eq!(Value::Boolean(true).as_f64(), Some(1.0));
        assert_eq!(Value::string("12.5").as_f64(), Some(12.5));
        assert_eq!(Value::string("n/a").as_f64(), None);
        assert_eq!(Value::Null.as_f64(), None);
        assert_eq!(Value::Array(vec![Value::Number(1.0)]).as_f64(), None);
    }

    #[test]
    fn array_normalization_joins_elements() {
        let value = Value::Array(vec![Value::string("A"), Value::Number(2.0)]);
        assert_eq!(value.normalized(), "a 2");
    }
}
