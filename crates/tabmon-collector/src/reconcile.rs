use crate::task::Expected;
use tabmon_common::row::Row;

/// Narrows a shared result set to the rows a task's keybindings select.
///
/// A row is kept when every keybinding column it carries equals the
/// expected value after normalisation; keys missing from the row are
/// ignored and an empty keybinding set keeps every row.
pub fn reconcile(rows: &[Row], keybindings: &[(String, Expected)]) -> Vec<Row> {
    if keybindings.is_empty() {
        return rows.to_vec();
    }
    let filter: Vec<(&str, String)> = keybindings
        .iter()
        .map(|(key, expected)| (key.as_str(), expected.normalized()))
        .collect();
    rows.iter()
        .filter(|row| row.matches(filter.iter().map(|(k, v)| (*k, v.as_str()))))
        .cloned()
        .collect()
}
