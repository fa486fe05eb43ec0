//! Raw feed records into one uniform table.

use std::collections::{BTreeSet, HashMap};

use sdp_core::{RawRecord, Table, Value};
use serde_json::Value as JsonValue;

/// Placeholder the form tool writes for skipped questions.
pub const MISSING_SENTINEL: &str = "---";

/// Respondent identity and device/phone identifiers.
pub const DEFAULT_DENYLIST: [&str; 8] = [
    "respondent_name",
    "phone_number",
    "alternative_phone_number",
    "alternate_phone_number",
    "phonenumber",
    "deviceid",
    "subscriberid",
    "simserial",
];

/// Sensitive field names that must never leave the normalizer.
///
/// Matching is case-insensitive on each `/`-separated segment of a column name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denylist {
    names: BTreeSet<String>,
}

impl Default for Denylist {
    fn default() -> Self {
        Self::new(DEFAULT_DENYLIST)
    }
}

impl Denylist {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            names: names
                .into_iter()
                .map(|n| n.as_ref().trim().to_ascii_lowercase())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }

    pub fn with_extra<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.names.extend(
            extra
                .into_iter()
                .map(|n| n.as_ref().trim().to_ascii_lowercase())
                .filter(|n| !n.is_empty()),
        );
        self
    }

    /// A column is denied when any segment of its group path is denied, so a
    /// denied group takes every nested field with it.
    pub fn is_denied(&self, column: &str) -> bool {
        column
            .split('/')
            .any(|segment| self.names.contains(&segment.to_ascii_lowercase()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

/// Union of all record keys (first-seen order), missing keys as null,
/// denylisted columns dropped.
pub fn normalize(records: &[RawRecord], denylist: &Denylist) -> Table {
    let flattened = records
        .iter()
        .map(|record| flatten_record(record, denylist))
        .collect::<Vec<_>>();

    let mut columns = Vec::new();
    let mut index = HashMap::new();
    for record in &flattened {
        for (name, _) in record {
            if !index.contains_key(name) && !denylist.is_denied(name) {
                index.insert(name.clone(), columns.len());
                columns.push(name.clone());
            }
        }
    }

    let width = columns.len();
    let mut table = Table::new(columns);
    for record in flattened {
        let mut row = vec![Value::Null; width];
        for (name, value) in record {
            if let Some(&idx) = index.get(&name) {
                row[idx] = value;
            }
        }
        // Width is fixed above, so the row always fits.
        let _ = table.push_row(row);
    }
    table
}

/// Nested objects become `parent/child` columns. Denied subtrees are skipped.
fn flatten_record(record: &RawRecord, denylist: &Denylist) -> Vec<(String, Value)> {
    let mut out = Vec::with_capacity(record.len());
    for (key, value) in record {
        flatten_into(key.clone(), value, denylist, &mut out);
    }
    out
}

fn flatten_into(
    name: String,
    value: &JsonValue,
    denylist: &Denylist,
    out: &mut Vec<(String, Value)>,
) {
    if denylist.is_denied(&name) {
        return;
    }
    match value {
        JsonValue::Object(fields) if !fields.is_empty() => {
            for (child, child_value) in fields {
                flatten_into(format!("{name}/{child}"), child_value, denylist, out);
            }
        }
        other => out.push((name, cell_from_json(other))),
    }
}

/// Convert one raw field value into a cell.
pub fn cell_from_json(value: &JsonValue) -> Value {
    match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(v) => Value::Bool(*v),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::Int(i),
            None => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        },
        JsonValue::String(s) if s.trim() == MISSING_SENTINEL => Value::Null,
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Array(items) => match items.as_slice() {
            [] => Value::Null,
            [single] if !single.is_array() && !single.is_object() => cell_from_json(single),
            _ => Value::Text(value.to_string()),
        },
        JsonValue::Object(_) => Value::Text(value.to_string()),
    }
}
