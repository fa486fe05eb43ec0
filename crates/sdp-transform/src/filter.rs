//! Row subsets handed to report pages. Each returns a new table.

use chrono::NaiveDate;
use sdp_core::columns;
use sdp_core::{Table, Value};

pub fn is_consented(value: &Value) -> bool {
    value.as_f64() == Some(1.0)
}

/// Rows whose `consent` is 1. Zero, null and anything else are excluded.
pub fn filter_completed(table: &Table) -> Table {
    match table.column_index(columns::CONSENT) {
        Some(idx) => table.filter_rows(|row| is_consented(&row[idx])),
        None => table.filter_rows(|_| false),
    }
}

/// Rows whose `date` falls within `[from, to]`; either bound may be open.
///
/// With no bounds the table is copied unchanged. With any bound, rows without a
/// date are dropped.
pub fn filter_date_range(table: &Table, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Table {
    if from.is_none() && to.is_none() {
        return table.clone();
    }
    let Some(idx) = table.column_index(columns::DATE) else {
        return table.filter_rows(|_| false);
    };
    table.filter_rows(|row| match row[idx].as_date() {
        Some(date) => from.map_or(true, |f| date >= f) && to.map_or(true, |t| date <= t),
        None => false,
    })
}
