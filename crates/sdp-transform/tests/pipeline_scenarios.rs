use sdp_core::{RawRecord, Value};
use sdp_transform::{aggregate_species, filter_completed, prepare, Denylist};
use serde_json::{json, Value as JsonValue};

fn records(values: Vec<JsonValue>) -> Vec<RawRecord> {
    values
        .into_iter()
        .map(|v| match v {
            JsonValue::Object(map) => map.into_iter().collect(),
            other => panic!("not an object: {other}"),
        })
        .collect()
}

#[test]
fn evening_submission_derives_night_and_weekend_flags() {
    let feed = records(vec![json!({
        "__id": "uuid:1",
        "completed_time": "2024-03-02T20:15:00",
        "started_time": "2024-03-02T19:50:00",
        "consent": "1",
        "respondent_name": "Abebe",
    })]);
    let prepared = prepare(&feed, &Denylist::default());
    let p = &prepared.processed;

    assert!(!prepared.raw.has_column("respondent_name"));
    assert!(!p.has_column("respondent_name"));
    assert_eq!(p.get(0, "duration_minutes"), Some(&Value::Float(25.0)));
    assert_eq!(p.get(0, "hour_started"), Some(&Value::Int(19)));
    assert_eq!(p.get(0, "is_night_survey"), Some(&Value::Bool(true)));
    assert_eq!(p.get(0, "is_short_survey"), Some(&Value::Bool(false)));
    assert_eq!(p.get(0, "day_of_week"), Some(&Value::Text("Sat".into())));
    assert_eq!(p.get(0, "is_weekend"), Some(&Value::Bool(true)));
    assert_eq!(prepared.report.malformed_total(), 0);
}

#[test]
fn species_with_no_recorded_survivors_is_a_total_loss() {
    let feed = records(vec![
        json!({"consent": 1, "planted_coffee": 60, "survived_coffee": "---"}),
        json!({"consent": 1, "planted_coffee": "40", "survived_coffee": null}),
        json!({"consent": 0, "planted_coffee": 500, "survived_coffee": 500}),
    ]);
    let prepared = prepare(&feed, &Denylist::default());
    let completed = filter_completed(&prepared.processed);
    let species = aggregate_species(&completed);

    assert_eq!(species.len(), 1);
    assert_eq!(species[0].species, "coffee");
    assert_eq!(species[0].planted, 100.0);
    assert_eq!(species[0].survival_rate, 0.0);
    assert_eq!(species[0].loss_rate, 100.0);
}

#[test]
fn only_consented_rows_count_as_completed() {
    let feed = records(vec![
        json!({"__id": "a", "consent": 1}),
        json!({"__id": "b", "consent": 0}),
        json!({"__id": "c", "consent": null}),
        json!({"__id": "d", "consent": 1}),
    ]);
    let prepared = prepare(&feed, &Denylist::default());
    let completed = filter_completed(&prepared.processed);

    let ids = completed
        .rows()
        .iter()
        .map(|row| row[0].clone())
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![Value::Text("a".into()), Value::Text("d".into())]);
    assert_eq!(prepared.processed.len(), 4);
}
