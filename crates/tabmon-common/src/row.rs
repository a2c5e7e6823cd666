use crate::value::{normalize_text, Value};

/// One normalised result row: an ordered mapping from lowercased column
/// alias to value.
///
/// # Examples
///
/// ```
/// use tabmon_common::row::Row;
/// use tabmon_common::value::Value;
///
/// let row = Row::from_pairs([("Name", Value::string("C:")), ("FreeSpace", Value::Number(10.0))]);
/// assert_eq!(row.get("name"), Some(&Value::string("C:")));
/// assert_eq!(row.get("FREESPACE"), Some(&Value::Number(10.0)));
/// ```
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row {
    columns: Vec<(String, Value)>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: AsRef<str>,
        I: IntoIterator<Item = (K, Value)>,
    {
        let mut row = Row::new();
        for (name, value) in pairs {
            row.insert(name.as_ref(), value);
        }
        row
    }

    /// Sets a column, replacing an existing column with the same
    /// case-insensitive name in place.
    pub fn insert(&mut self, name: &str, value: Value) {
        let key = name.trim().to_lowercase();
        match self.columns.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.columns.push((key, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        let key = name.trim().to_lowercase();
        self.columns.iter().find(|(k, _)| *k == key).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Drops every column not named in `keep`. An empty `keep` list keeps
    /// everything.
    pub fn retain_columns(&mut self, keep: &[String]) {
        if keep.is_empty() {
            return;
        }
        let keep: Vec<String> = keep.iter().map(|c| c.trim().to_lowercase()).collect();
        self.columns.retain(|(k, _)| keep.contains(k));
    }

    /// Whether the row satisfies a keybinding filter.
    ///
    /// For every filter key that is present as a column, the normalised
    /// column value must equal the normalised expected value. Keys the row
    /// does not carry are ignored, so an empty filter matches every row.
    pub fn matches<'a, I>(&self, filter: I) -> bool
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        filter.into_iter().all(|(key, expected)| match self.get(key) {
            Some(value) => value.normalized() == normalize_text(expected),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_case_insensitive_duplicates() {
        let mut row = Row::new();
        row.insert("Status", Value::string("OK"));
        row.insert("STATUS", Value::string("Degraded"));
        assert_eq!(row.len(), 1);
        assert_eq!(row.get("status"), Some(&Value::string("Degraded")));
    }

    #[test]
    fn column_order_is_preserved() {
        let row = Row::from_pairs([("b", Value::Null), ("a", Value::Null), ("c", Value::Null)]);
        let names: Vec<&str> = row.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
    }

    #[test]
    fn matches_ignores_keys_missing_from_row() {
        let row = Row::from_pairs([("id", Value::string("A"))]);
        assert!(row.matches([("id", "a"), ("other", "x")]));
        assert!(!row.matches([("id", "b")]));
        assert!(row.matches(std::iter::empty::<(&str, &str)>()));
    }

    #[test]
    fn matches_compares_numbers_as_normalized_strings() {
        let row = Row::from_pairs([("DeviceID", Value::Number(3.0))]);
        assert!(row.matches([("deviceid", "3.0")]));
        assert!(row.matches([("deviceid", " 3 ")]));
    }

    #[test]
    fn retain_columns_projects_row() {
        let mut row = Row::from_pairs([("a", Value::Null), ("b", Value::Null)]);
        row.retain_columns(&["B".to_string()]);
        assert!(row.contains("b"));
        assert!(!row.contains("a"));
    }
}
