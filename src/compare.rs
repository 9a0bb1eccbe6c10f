use crate::model::{real_to_json, Row};
use serde_json::Value;

/// Order-insensitive row-set equality.
///
/// Rows are encoded as JSON with their key order intact, so a match needs
/// the same column names and the same value types (`2` never equals `"2"`).
/// Whole floats count as integers, so `2.0` equals `2`.
pub fn rows_match(actual: &[Row], expected: &[Row]) -> bool {
    if actual.len() != expected.len() {
        return false;
    }
    canonical(actual) == canonical(expected)
}

fn canonical(rows: &[Row]) -> Vec<String> {
    let mut encoded: Vec<String> = rows
        .iter()
        .map(|row| {
            let row: Row = row
                .iter()
                .map(|(k, v)| (k.clone(), normalize(v)))
                .collect();
            serde_json::to_string(&row).unwrap_or_default()
        })
        .collect();
    encoded.sort();
    encoded
}

fn normalize(value: &Value) -> Value {
    match value {
        Value::Number(n) if !n.is_i64() && !n.is_u64() => {
            n.as_f64().map(real_to_json).unwrap_or(Value::Null)
        }
        other => other.clone(),
    }
}
