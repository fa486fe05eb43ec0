//! Type coercion and derived analytic columns.

use std::collections::BTreeMap;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Weekday};
use sdp_core::columns::{self, leaf_name};
use sdp_core::{Table, Value};
use tracing::{debug, warn};

pub const NIGHT_START_HOUR: u32 = 19;
pub const NIGHT_END_HOUR: u32 = 6;
pub const SHORT_SURVEY_MINUTES: f64 = 5.0;
pub const LONG_SURVEY_MINUTES: f64 = 60.0;

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Counts of values that could not be coerced and were nulled, per column.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeriveReport {
    pub rows: usize,
    pub malformed: BTreeMap<String, usize>,
}

impl DeriveReport {
    pub fn malformed_total(&self) -> usize {
        self.malformed.values().sum()
    }

    fn record(&mut self, column: &str) {
        *self.malformed.entry(column.to_string()).or_default() += 1;
    }
}

/// Wall-clock time as written in the feed. An explicit offset is dropped, not applied.
pub fn parse_timestamp_str(input: &str) -> Option<NaiveDateTime> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f%z") {
        return Some(dt.naive_local());
    }
    for format in NAIVE_FORMATS {
        if let Ok(ts) = NaiveDateTime::parse_from_str(s, format) {
            return Some(ts);
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

pub fn parse_timestamp(value: &Value) -> Option<NaiveDateTime> {
    match value {
        Value::Timestamp(ts) => Some(*ts),
        Value::Date(d) => d.and_hms_opt(0, 0, 0),
        Value::Text(s) => parse_timestamp_str(s),
        _ => None,
    }
}

pub fn parse_number(value: &Value) -> Option<f64> {
    match value {
        Value::Int(_) | Value::Float(_) => value.as_f64().filter(|v| v.is_finite()),
        Value::Text(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - TimeDelta::days(date.weekday().num_days_from_monday() as i64)
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

pub fn day_abbrev(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Mon",
        Weekday::Tue => "Tue",
        Weekday::Wed => "Wed",
        Weekday::Thu => "Thu",
        Weekday::Fri => "Fri",
        Weekday::Sat => "Sat",
        Weekday::Sun => "Sun",
    }
}

/// Derived fields for one submission.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedFields {
    pub date: Option<NaiveDate>,
    pub week: Option<NaiveDate>,
    pub month: Option<NaiveDate>,
    pub hour_started: Option<u32>,
    pub day_of_week: Option<Weekday>,
    pub is_weekend: bool,
    pub duration_minutes: Option<f64>,
    pub is_night_survey: bool,
    pub is_short_survey: bool,
    pub is_long_survey: bool,
}

impl DerivedFields {
    pub fn compute(started: Option<NaiveDateTime>, completed: Option<NaiveDateTime>) -> Self {
        let date = completed.map(|ts| ts.date());
        let day_of_week = date.map(|d| d.weekday());
        let hour_started = started.map(|ts| ts.hour());
        let duration_minutes = match (started, completed) {
            (Some(start), Some(end)) => {
                Some(end.signed_duration_since(start).num_milliseconds() as f64 / 60_000.0)
            }
            _ => None,
        };

        Self {
            date,
            week: date.map(week_start),
            month: date.map(month_start),
            hour_started,
            day_of_week,
            is_weekend: matches!(day_of_week, Some(Weekday::Sat | Weekday::Sun)),
            duration_minutes,
            is_night_survey: hour_started
                .is_some_and(|h| h >= NIGHT_START_HOUR || h < NIGHT_END_HOUR),
            is_short_survey: duration_minutes.is_some_and(|d| d <= SHORT_SURVEY_MINUTES),
            is_long_survey: duration_minutes.is_some_and(|d| d >= LONG_SURVEY_MINUTES),
        }
    }

    /// Cells in the order of [`columns::DERIVED`].
    pub fn into_values(self) -> [Value; 10] {
        [
            self.date.map(Value::Date).unwrap_or_default(),
            self.week.map(Value::Date).unwrap_or_default(),
            self.month.map(Value::Date).unwrap_or_default(),
            self.hour_started
                .map(|h| Value::Int(h as i64))
                .unwrap_or_default(),
            self.day_of_week
                .map(|d| Value::Text(day_abbrev(d).to_string()))
                .unwrap_or_default(),
            Value::Bool(self.is_weekend),
            self.duration_minutes.map(Value::Float).unwrap_or_default(),
            Value::Bool(self.is_night_survey),
            Value::Bool(self.is_short_survey),
            Value::Bool(self.is_long_survey),
        ]
    }
}

fn is_species_column(name: &str) -> bool {
    let leaf = leaf_name(name);
    leaf.starts_with(columns::PLANTED_PREFIX) || leaf.starts_with(columns::SURVIVED_PREFIX)
}

fn coerce_column(
    table: &mut Table,
    name: &str,
    report: &mut DeriveReport,
    convert: impl Fn(&Value) -> Option<Value>,
) {
    let Some(idx) = table.column_index(name) else {
        table.upsert_column_with(name, |_, _| Value::Null);
        return;
    };
    let mut malformed = 0usize;
    table.map_column(idx, |value| {
        if value.is_null() {
            return Value::Null;
        }
        convert(value).unwrap_or_else(|| {
            malformed += 1;
            Value::Null
        })
    });
    for _ in 0..malformed {
        report.record(name);
    }
}

/// Coerce raw columns and append every derived column.
///
/// Total and deterministic: unparsable inputs become null and are counted in the
/// report, and running it again on its own output changes nothing.
pub fn derive(mut table: Table) -> (Table, DeriveReport) {
    let mut report = DeriveReport {
        rows: table.len(),
        ..Default::default()
    };

    for name in [columns::COMPLETED_TIME, columns::STARTED_TIME] {
        coerce_column(&mut table, name, &mut report, |v| {
            parse_timestamp(v).map(Value::Timestamp)
        });
    }
    coerce_column(&mut table, columns::CONSENT, &mut report, |v| {
        parse_number(v).map(Value::from_f64)
    });

    let species_columns = table
        .columns()
        .iter()
        .filter(|c| is_species_column(c))
        .cloned()
        .collect::<Vec<_>>();
    for name in &species_columns {
        coerce_column(&mut table, name, &mut report, |v| {
            parse_number(v).filter(|n| *n >= 0.0).map(Value::from_f64)
        });
    }

    let started_idx = table.column_index(columns::STARTED_TIME);
    let completed_idx = table.column_index(columns::COMPLETED_TIME);
    let derived = table
        .rows()
        .iter()
        .map(|row| {
            let started = started_idx.and_then(|i| row[i].as_timestamp());
            let completed = completed_idx.and_then(|i| row[i].as_timestamp());
            DerivedFields::compute(started, completed).into_values()
        })
        .collect::<Vec<_>>();

    for (k, name) in columns::DERIVED.iter().enumerate() {
        table.upsert_column_with(name, |row, _| derived[row][k].clone());
    }

    if report.malformed_total() > 0 {
        warn!(
            rows = report.rows,
            malformed = ?report.malformed,
            "nulled malformed values during derivation"
        );
    } else {
        debug!(rows = report.rows, "derived analytic fields");
    }
    (table, report)
}
