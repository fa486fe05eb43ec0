//! Headline counts stored with each snapshot.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use sdp_core::columns;
use sdp_core::{SnapshotSummary, Table};
use uuid::Uuid;

use crate::filter::filter_completed;

/// Which raw columns identify the site and the enumerator of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryColumns {
    pub site: String,
    pub enumerator: String,
}

impl Default for SummaryColumns {
    fn default() -> Self {
        Self {
            site: "site".to_string(),
            enumerator: "enumerator".to_string(),
        }
    }
}

fn distinct_count(table: &Table, column: &str) -> usize {
    let Some(idx) = table.column_index(column) else {
        return 0;
    };
    table
        .column_values(idx)
        .filter_map(|v| v.to_text())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<HashSet<_>>()
        .len()
}

/// Counts over completed rows; the date range covers every processed row.
pub fn summarize(
    raw: &Table,
    processed: &Table,
    summary_columns: &SummaryColumns,
    run_id: Uuid,
    last_updated: DateTime<Utc>,
) -> SnapshotSummary {
    let completed = filter_completed(processed);

    let durations = completed
        .column_index(columns::DURATION_MINUTES)
        .map(|idx| {
            completed
                .rows()
                .iter()
                .filter_map(|row| row[idx].as_f64().map(|d| (row, d)))
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();

    let avg_duration_minutes = (!durations.is_empty())
        .then(|| durations.iter().map(|(_, d)| d).sum::<f64>() / durations.len() as f64);

    let flag = |name: &str| completed.column_index(name);
    let (short_idx, long_idx) = (flag(columns::IS_SHORT_SURVEY), flag(columns::IS_LONG_SURVEY));
    let quality_rate = (!durations.is_empty()).then(|| {
        let is_set = |row: &[sdp_core::Value], idx: Option<usize>| {
            idx.and_then(|i| row[i].as_bool()).unwrap_or(false)
        };
        let ok = durations
            .iter()
            .filter(|(row, _)| !is_set(row, short_idx) && !is_set(row, long_idx))
            .count();
        ok as f64 / durations.len() as f64 * 100.0
    });

    let dates = processed
        .column_index(columns::DATE)
        .map(|idx| processed.column_values(idx).filter_map(|v| v.as_date()).collect::<Vec<_>>())
        .unwrap_or_default();

    SnapshotSummary {
        run_id,
        last_updated,
        raw_rows: raw.len(),
        processed_rows: processed.len(),
        completed_rows: completed.len(),
        distinct_sites: distinct_count(&completed, &summary_columns.site),
        distinct_enumerators: distinct_count(&completed, &summary_columns.enumerator),
        avg_duration_minutes,
        quality_rate,
        date_min: dates.iter().min().copied(),
        date_max: dates.iter().max().copied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::derive::derive;
    use chrono::{NaiveDate, TimeZone};
    use sdp_core::Value;

    fn processed() -> Table {
        let text = |s: &str| Value::Text(s.to_string());
        let raw = Table::from_rows(
            vec![
                "site".into(),
                "enumerator".into(),
                "consent".into(),
                "started_time".into(),
                "completed_time".into(),
            ],
            vec![
                vec![text("Bonga"), text("enum01"), Value::Int(1), text("2024-03-02T19:50:00"), text("2024-03-02T20:15:00")],
                vec![text("Jimma"), text("enum01"), Value::Int(1), text("2024-03-04T08:00:00"), text("2024-03-04T08:03:00")],
                vec![text("Jimma "), text("enum02"), Value::Int(1), Value::Null, text("2024-03-05T10:00:00")],
                vec![text("Mizan"), text("enum03"), Value::Int(0), text("2024-03-01T08:00:00"), text("2024-03-01T09:00:00")],
            ],
        )
        .unwrap();
        derive(raw).0
    }

    #[test]
    fn summary_counts_completed_rows() {
        let processed = processed();
        let at = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).single().unwrap();
        let run_id = Uuid::new_v4();
        let s = summarize(&processed, &processed, &SummaryColumns::default(), run_id, at);

        assert_eq!(s.run_id, run_id);
        assert_eq!(s.raw_rows, 4);
        assert_eq!(s.processed_rows, 4);
        assert_eq!(s.completed_rows, 3);
        assert_eq!(s.distinct_sites, 2);
        assert_eq!(s.distinct_enumerators, 2);
        assert_eq!(s.avg_duration_minutes, Some(14.0));
        assert_eq!(s.quality_rate, Some(50.0));
        assert_eq!(s.date_min, NaiveDate::from_ymd_opt(2024, 3, 1));
        assert_eq!(s.date_max, NaiveDate::from_ymd_opt(2024, 3, 5));
    }

    #[test]
    fn empty_tables_have_no_rates() {
        let empty = Table::default();
        let s = summarize(&empty, &empty, &SummaryColumns::default(), Uuid::nil(), Utc::now());
        assert_eq!(s.completed_rows, 0);
        assert_eq!(s.avg_duration_minutes, None);
        assert_eq!(s.quality_rate, None);
        assert_eq!(s.date_min, None);
    }
}
