//! Metric derivation: inverse reverse-Polish expressions and multi-row
//! aggregation.
//!
//! A data point's expression describes how the displayed value was
//! computed from the raw sample, so it is evaluated with every operator
//! inverted (`+` subtracts, `*` divides, ...) to recover the raw value.
//! Evaluation never fails: anything malformed yields the input unchanged.

use crate::task::DataPoint;
use tabmon_common::row::Row;

/// Evaluates `expression` against `value` with the current time for `now`.
///
/// ```
/// use tabmon_collector::derive::derive;
///
/// assert_eq!(derive("100,/", 0.25), 25.0);
/// assert_eq!(derive("bogus token", 5.0), 5.0);
/// ```
pub fn derive(expression: &str, value: f64) -> f64 {
    derive_at(expression, value, chrono::Utc::now().timestamp() as f64)
}

pub fn derive_at(expression: &str, value: f64, now: f64) -> f64 {
    evaluate(expression, value, now).unwrap_or(value)
}

fn evaluate(expression: &str, value: f64, now: f64) -> Option<f64> {
    // Read right to left: the last forward step is undone first, each
    // operator pairing with the operand written before it.
    let mut pending: Vec<&str> = Vec::new();
    let mut acc = value;
    for token in expression.split(',').map(str::trim).rev() {
        if token.is_empty() {
            return None;
        }
        let operand = if token.eq_ignore_ascii_case("now") {
            Some(now)
        } else {
            token.parse::<f64>().ok()
        };
        match operand {
            Some(n) => acc = apply_inverse(pending.pop()?, acc, n)?,
            None if is_operator(token) => pending.push(token),
            None => return None,
        }
    }

    (pending.is_empty() && acc.is_finite()).then_some(acc)
}

fn is_operator(token: &str) -> bool {
    matches!(token, "+" | "-" | "*" | "/")
}

fn apply_inverse(op: &str, a: f64, b: f64) -> Option<f64> {
    match op {
        "+" => Some(a - b),
        "-" => Some(a + b),
        "*" => Some(a / b),
        "/" => Some(a * b),
        _ => None,
    }
}

/// How the values of one data point are combined across rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Count,
    Sum,
    Avg,
    Max,
    Min,
    First,
    Last,
}

impl Aggregation {
    /// Selects the aggregation from a data point id suffix; `_avg` when
    /// there is none.
    pub fn from_id(id: &str) -> Self {
        let id = id.to_ascii_lowercase();
        let suffixes = [
            ("_count", Aggregation::Count),
            ("_sum", Aggregation::Sum),
            ("_avg", Aggregation::Avg),
            ("_max", Aggregation::Max),
            ("_min", Aggregation::Min),
            ("_first", Aggregation::First),
            ("_last", Aggregation::Last),
        ];
        suffixes
            .into_iter()
            .find(|(suffix, _)| id.ends_with(suffix))
            .map_or(Aggregation::Avg, |(_, agg)| agg)
    }

    /// Combines `values`. No values yields `None`; a single value is
    /// returned as is.
    pub fn apply(self, values: &[f64]) -> Option<f64> {
        match values {
            [] => None,
            [only] => Some(*only),
            _ => Some(match self {
                Aggregation::Count => values.len() as f64,
                Aggregation::Sum => values.iter().sum(),
                Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
                Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
                Aggregation::First => values[0],
                Aggregation::Last => values[values.len() - 1],
            }),
        }
    }
}

/// Computes a data point's value from a task's reconciled rows, or `None`
/// when no row carries a numeric value for its alias.
pub fn datapoint_value(datapoint: &DataPoint, rows: &[Row], now: f64) -> Option<f64> {
    let values: Vec<f64> = rows
        .iter()
        .filter_map(|row| row.get(&datapoint.alias)?.as_f64())
        .map(|v| match &datapoint.expression {
            Some(expr) => derive_at(expr, v, now),
            None => v,
        })
        .collect();
    Aggregation::from_id(&datapoint.id).apply(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabmon_common::value::Value;

    #[test]
    fn operators_are_inverted() {
        assert_eq!(derive_at("10,+", 15.0, 0.0), 5.0);
        assert_eq!(derive_at("10,-", 15.0, 0.0), 25.0);
        assert_eq!(derive_at("4,*", 20.0, 0.0), 5.0);
        assert_eq!(derive_at("1024,/", 2.0, 0.0), 2048.0);
    }

    #[test]
    fn now_is_replaced_by_the_clock() {
        assert_eq!(derive_at("now,+", 1_000.0, 1_700_000_000.0), 1_000.0 - 1_700_000_000.0);
        assert_eq!(derive_at("now,-", 5.0, 100.0), 105.0);
    }

    #[test]
    fn chained_tokens_undo_the_last_step_first() {
        // Forward: (raw + 32) / 1.8
        let raw = 58.0;
        let displayed = (raw + 32.0) / 1.8;
        let recovered = derive_at("32,+,1.8,/", displayed, 0.0);
        assert!((recovered - raw).abs() < 1e-9, "recovered {recovered}");

        // Forward: raw * 1024 - now
        let recovered = derive_at("1024,*,now,-", 5.0 * 1024.0 - 100.0, 100.0);
        assert!((recovered - 5.0).abs() < 1e-9, "recovered {recovered}");
    }

    #[test]
    fn malformed_expressions_leave_the_value_alone() {
        assert_eq!(derive("bogus token", 5.0), 5.0);
        assert_eq!(derive_at("", 5.0, 0.0), 5.0);
        assert_eq!(derive_at("+", 5.0, 0.0), 5.0);
        assert_eq!(derive_at("1,2", 5.0, 0.0), 5.0);
        assert_eq!(derive_at("0,*", 5.0, 0.0), 5.0);
        assert_eq!(derive_at("2,%", 5.0, 0.0), 5.0);
    }

    #[test]
    fn aggregation_follows_id_suffix() {
        assert_eq!(Aggregation::from_id("rows_sum").apply(&[]), None);
        assert_eq!(Aggregation::from_id("rows_sum").apply(&[3.0, 4.0]), Some(7.0));
        assert_eq!(Aggregation::from_id("size").apply(&[2.0, 4.0]), Some(3.0));
        assert_eq!(Aggregation::from_id("n_COUNT").apply(&[1.0, 2.0, 3.0]), Some(3.0));
        assert_eq!(Aggregation::from_id("x_max").apply(&[1.0, 9.0, 3.0]), Some(9.0));
        assert_eq!(Aggregation::from_id("x_min").apply(&[4.0, 9.0, 3.0]), Some(3.0));
        assert_eq!(Aggregation::from_id("x_first").apply(&[4.0, 9.0]), Some(4.0));
        assert_eq!(Aggregation::from_id("x_last").apply(&[4.0, 9.0]), Some(9.0));
    }

    #[test]
    fn single_value_passes_through_unaggregated() {
        assert_eq!(Aggregation::Count.apply(&[42.0]), Some(42.0));
    }

    #[test]
    fn datapoint_value_derives_then_aggregates() {
        let rows = vec![
            Row::from_pairs([("Used", Value::Number(1024.0))]),
            Row::from_pairs([("Used", Value::string("3072"))]),
            Row::from_pairs([("Used", Value::Null)]),
            Row::from_pairs([("Other", Value::Number(1.0))]),
        ];
        let dp = DataPoint::new("used_sum", "used").with_expression("1024,*");
        assert_eq!(datapoint_value(&dp, &rows, 0.0), Some(4.0));

        let missing = DataPoint::new("free", "free");
        assert_eq!(datapoint_value(&missing, &rows, 0.0), None);
    }
}
