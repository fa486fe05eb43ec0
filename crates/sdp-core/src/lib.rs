//! Core table model, column contract and error types for the survey pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "sdp-core";

/// One record exactly as the submissions feed returned it.
pub type RawRecord = BTreeMap<String, serde_json::Value>;

/// Column names every processed table carries.
pub mod columns {
    pub const COMPLETED_TIME: &str = "completed_time";
    pub const STARTED_TIME: &str = "started_time";
    pub const DATE: &str = "date";
    pub const WEEK: &str = "week";
    pub const MONTH: &str = "month";
    pub const HOUR_STARTED: &str = "hour_started";
    pub const DAY_OF_WEEK: &str = "day_of_week";
    pub const IS_WEEKEND: &str = "is_weekend";
    pub const DURATION_MINUTES: &str = "duration_minutes";
    pub const IS_NIGHT_SURVEY: &str = "is_night_survey";
    pub const IS_SHORT_SURVEY: &str = "is_short_survey";
    pub const IS_LONG_SURVEY: &str = "is_long_survey";
    pub const CONSENT: &str = "consent";

    pub const PLANTED_PREFIX: &str = "planted_";
    pub const SURVIVED_PREFIX: &str = "survived_";

    /// Columns computed by the deriver, in the order they are appended.
    pub const DERIVED: [&str; 10] = [
        DATE,
        WEEK,
        MONTH,
        HOUR_STARTED,
        DAY_OF_WEEK,
        IS_WEEKEND,
        DURATION_MINUTES,
        IS_NIGHT_SURVEY,
        IS_SHORT_SURVEY,
        IS_LONG_SURVEY,
    ];

    /// Field name without its form-group path (`grp_farm/planted_coffee` -> `planted_coffee`).
    pub fn leaf_name(column: &str) -> &str {
        column.rsplit('/').next().unwrap_or(column)
    }
}

/// A single table cell.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Numeric view of `Int`/`Float` cells; every other variant is `None`.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Value::Date(v) => Some(*v),
            _ => None,
        }
    }

    /// Store integral numbers as `Int` so counts keep their type across coercion.
    pub fn from_f64(v: f64) -> Value {
        if !v.is_finite() {
            Value::Null
        } else if v.fract() == 0.0 && v.abs() < 9.0e15 {
            Value::Int(v as i64)
        } else {
            Value::Float(v)
        }
    }

    /// Text rendering used by CSV output and distinct-value counting. `Null` has none.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(v) => Some(v.to_string()),
            Value::Int(v) => Some(v.to_string()),
            Value::Float(v) => Some(v.to_string()),
            Value::Text(v) => Some(v.clone()),
            Value::Timestamp(v) => Some(v.format(TIMESTAMP_FORMAT).to_string()),
            Value::Date(v) => Some(v.format(DATE_FORMAT).to_string()),
        }
    }

    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Null => ColumnType::Null,
            Value::Bool(_) => ColumnType::Bool,
            Value::Int(_) => ColumnType::Int,
            Value::Float(_) => ColumnType::Float,
            Value::Text(_) => ColumnType::Text,
            Value::Timestamp(_) => ColumnType::Timestamp,
            Value::Date(_) => ColumnType::Date,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => f.write_str(&text),
            None => f.write_str("NA"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_none(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int(v) => serializer.serialize_i64(*v),
            Value::Float(v) => serializer.serialize_f64(*v),
            Value::Text(v) => serializer.serialize_str(v),
            Value::Timestamp(v) => serializer.collect_str(&v.format(TIMESTAMP_FORMAT)),
            Value::Date(v) => serializer.collect_str(&v.format(DATE_FORMAT)),
        }
    }
}

/// Storage type of a whole column, inferred from its non-null cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Null,
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
    Date,
}

impl ColumnType {
    /// Widen two observed types: null yields to anything, ints widen to floats,
    /// any other disagreement falls back to text.
    pub fn merge(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (Null, t) | (t, Null) => t,
            (a, b) if a == b => a,
            (Int, Float) | (Float, Int) => Float,
            _ => Text,
        }
    }

    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> ColumnType {
        values
            .into_iter()
            .fold(ColumnType::Null, |acc, v| acc.merge(v.column_type()))
    }
}

/// Row-major table with a fixed, ordered column set.
///
/// Readers never mutate a shared table; filters build a new one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl Table {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn from_rows(columns: Vec<String>, rows: Vec<Vec<Value>>) -> anyhow::Result<Self> {
        let mut table = Self::new(columns);
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_index(name).is_some()
    }

    /// Cell lookup by column name; `None` when the column does not exist.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    pub fn column_values(&self, idx: usize) -> impl Iterator<Item = &Value> + '_ {
        self.rows.iter().map(move |r| &r[idx])
    }

    pub fn column_type(&self, idx: usize) -> ColumnType {
        ColumnType::infer(self.column_values(idx))
    }

    pub fn push_row(&mut self, row: Vec<Value>) -> anyhow::Result<()> {
        anyhow::ensure!(
            row.len() == self.columns.len(),
            "row has {} cells but table has {} columns",
            row.len(),
            self.columns.len()
        );
        self.rows.push(row);
        Ok(())
    }

    /// Add `name` as a new trailing column, or overwrite it in place if it exists.
    pub fn set_column(&mut self, name: &str, values: Vec<Value>) -> anyhow::Result<()> {
        anyhow::ensure!(
            values.len() == self.rows.len(),
            "column {name} has {} values but table has {} rows",
            values.len(),
            self.rows.len()
        );
        match self.column_index(name) {
            Some(idx) => {
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (row, value) in self.rows.iter_mut().zip(values) {
                    row.push(value);
                }
            }
        }
        Ok(())
    }

    /// Add or overwrite `name` with one value per row computed by `f(row_index, row)`.
    pub fn upsert_column_with(&mut self, name: &str, mut f: impl FnMut(usize, &[Value]) -> Value) {
        match self.column_index(name) {
            Some(idx) => {
                for (i, row) in self.rows.iter_mut().enumerate() {
                    let value = f(i, row);
                    row[idx] = value;
                }
            }
            None => {
                self.columns.push(name.to_string());
                for (i, row) in self.rows.iter_mut().enumerate() {
                    let value = f(i, row);
                    row.push(value);
                }
            }
        }
    }

    /// Rewrite every cell of an existing column through `f`.
    pub fn map_column(&mut self, idx: usize, mut f: impl FnMut(&Value) -> Value) {
        for row in &mut self.rows {
            row[idx] = f(&row[idx]);
        }
    }

    /// Copy of the rows matching `keep`, with the same column set.
    pub fn filter_rows(&self, mut keep: impl FnMut(&[Value]) -> bool) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| keep(row.as_slice()))
                .cloned()
                .collect(),
        }
    }
}

/// Serializes as a JSON array of row objects, the shape report pages consume.
impl Serialize for Table {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.rows.len()))?;
        for row in &self.rows {
            seq.serialize_element(&RowRef {
                columns: &self.columns,
                row,
            })?;
        }
        seq.end()
    }
}

struct RowRef<'a> {
    columns: &'a [String],
    row: &'a [Value],
}

impl Serialize for RowRef<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.columns.len()))?;
        for (name, value) in self.columns.iter().zip(self.row) {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Survival totals for one tracked plant species.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeciesSummary {
    pub species: String,
    pub planted: f64,
    pub survived: f64,
    pub survival_rate: f64,
    pub loss_count: f64,
    pub loss_rate: f64,
}

/// Headline figures recorded alongside every persisted snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub run_id: Uuid,
    pub last_updated: DateTime<Utc>,
    pub raw_rows: usize,
    pub processed_rows: usize,
    pub completed_rows: usize,
    pub distinct_sites: usize,
    pub distinct_enumerators: usize,
    pub avg_duration_minutes: Option<f64>,
    pub quality_rate: Option<f64>,
    pub date_min: Option<NaiveDate>,
    pub date_max: Option<NaiveDate>,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("submissions feed rejected the credentials (http {status})")]
    AuthenticationFailure { status: u16 },
    #[error("transient network failure: {message}")]
    TransientNetworkFailure { message: String },
    #[error("submissions feed returned http {status} after {records_fetched} records")]
    UpstreamServerError { status: u16, records_fetched: usize },
    #[error("malformed feed response: {message}")]
    MalformedFeed { message: String },
    #[error("feed request could not be made: {message}")]
    InvalidRequest { message: String },
    #[error("no data available: {reason}")]
    NoDataAvailable { reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn no_data(reason: impl Into<String>) -> Self {
        PipelineError::NoDataAvailable {
            reason: reason.into(),
        }
    }

    /// Whether a caller-driven retry of the whole fetch cycle can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::TransientNetworkFailure { .. } => true,
            PipelineError::UpstreamServerError { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, PipelineError::NoDataAvailable { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        Table::from_rows(
            vec!["site".into(), "count".into()],
            vec![
                vec![Value::Text("A".into()), Value::Int(2)],
                vec![Value::Text("B".into()), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn leaf_name_strips_group_path() {
        assert_eq!(columns::leaf_name("grp_farm/planted_coffee"), "planted_coffee");
        assert_eq!(columns::leaf_name("consent"), "consent");
    }

    #[test]
    fn column_type_widening() {
        let vals = [Value::Null, Value::Int(1), Value::Float(2.5)];
        assert_eq!(ColumnType::infer(vals.iter()), ColumnType::Float);
        let vals = [Value::Int(1), Value::Text("x".into())];
        assert_eq!(ColumnType::infer(vals.iter()), ColumnType::Text);
        assert_eq!(ColumnType::infer([Value::Null].iter()), ColumnType::Null);
    }

    #[test]
    fn set_column_appends_then_replaces() {
        let mut table = sample();
        table
            .set_column("flag", vec![Value::Bool(true), Value::Bool(false)])
            .unwrap();
        assert_eq!(table.width(), 3);
        table
            .set_column("count", vec![Value::Int(9), Value::Int(8)])
            .unwrap();
        assert_eq!(table.width(), 3);
        assert_eq!(table.get(1, "count"), Some(&Value::Int(8)));
        assert!(table.set_column("bad", vec![Value::Null]).is_err());
    }

    #[test]
    fn filter_rows_leaves_source_untouched() {
        let table = sample();
        let only_a = table.filter_rows(|row| row[0] == Value::Text("A".into()));
        assert_eq!(only_a.len(), 1);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn table_serializes_as_row_objects() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{"site": "A", "count": 2}, {"site": "B", "count": null}])
        );
    }

    #[test]
    fn from_f64_keeps_integral_counts() {
        assert_eq!(Value::from_f64(3.0), Value::Int(3));
        assert_eq!(Value::from_f64(2.5), Value::Float(2.5));
        assert_eq!(Value::from_f64(f64::NAN), Value::Null);
    }

    #[test]
    fn only_transport_and_server_failures_are_retryable() {
        assert!(PipelineError::TransientNetworkFailure {
            message: "reset".into()
        }
        .is_retryable());
        assert!(PipelineError::UpstreamServerError {
            status: 503,
            records_fetched: 0
        }
        .is_retryable());
        assert!(!PipelineError::InvalidRequest {
            message: "builder error".into()
        }
        .is_retryable());
        assert!(!PipelineError::AuthenticationFailure { status: 401 }.is_retryable());
        assert!(!PipelineError::MalformedFeed {
            message: "eof".into()
        }
        .is_retryable());
    }
}
