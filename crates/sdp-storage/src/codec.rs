//! Parquet and CSV encodings of a [`Table`].
//!
//! Parquet keeps native column types. CSV is the portable copy; reading it back
//! needs the column types recorded in the snapshot metadata.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use arrow_array::{
    Array, ArrayRef, BooleanArray, Date32Array, Float64Array, Int64Array, RecordBatch,
    RecordBatchOptions, StringArray, TimestampMicrosecondArray,
};
use arrow_schema::{DataType, Field as ArrowField, Schema, TimeUnit};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use sdp_core::{ColumnType, Table, Value, DATE_FORMAT, TIMESTAMP_FORMAT};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ColumnType,
}

/// Column names and inferred storage types, in table order.
pub fn table_schema(table: &Table) -> Vec<ColumnSpec> {
    table
        .columns()
        .iter()
        .enumerate()
        .map(|(idx, name)| ColumnSpec {
            name: name.clone(),
            ty: table.column_type(idx),
        })
        .collect()
}

fn epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

fn arrow_type(ty: ColumnType) -> DataType {
    match ty {
        ColumnType::Bool => DataType::Boolean,
        ColumnType::Int => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Timestamp => DataType::Timestamp(TimeUnit::Microsecond, None),
        ColumnType::Date => DataType::Date32,
        ColumnType::Null | ColumnType::Text => DataType::Utf8,
    }
}

fn column_array(table: &Table, idx: usize, ty: ColumnType) -> ArrayRef {
    let values = table.column_values(idx);
    match ty {
        ColumnType::Bool => Arc::new(BooleanArray::from(
            values.map(Value::as_bool).collect::<Vec<_>>(),
        )),
        ColumnType::Int => Arc::new(Int64Array::from(
            values.map(Value::as_i64).collect::<Vec<_>>(),
        )),
        ColumnType::Float => Arc::new(Float64Array::from(
            values.map(Value::as_f64).collect::<Vec<_>>(),
        )),
        ColumnType::Timestamp => Arc::new(TimestampMicrosecondArray::from(
            values
                .map(|v| v.as_timestamp().map(|ts| ts.and_utc().timestamp_micros()))
                .collect::<Vec<_>>(),
        )),
        ColumnType::Date => Arc::new(Date32Array::from(
            values
                .map(|v| {
                    v.as_date()
                        .map(|d| d.signed_duration_since(epoch_date()).num_days() as i32)
                })
                .collect::<Vec<_>>(),
        )),
        ColumnType::Null | ColumnType::Text => Arc::new(StringArray::from(
            values.map(Value::to_text).collect::<Vec<_>>(),
        )),
    }
}

pub fn encode_parquet(table: &Table) -> Result<Vec<u8>> {
    let specs = table_schema(table);
    let schema = Arc::new(Schema::new(
        specs
            .iter()
            .map(|spec| ArrowField::new(spec.name.as_str(), arrow_type(spec.ty), true))
            .collect::<Vec<_>>(),
    ));
    let arrays = specs
        .iter()
        .enumerate()
        .map(|(idx, spec)| column_array(table, idx, spec.ty))
        .collect::<Vec<_>>();
    let options = RecordBatchOptions::new().with_row_count(Some(table.len()));
    let batch = RecordBatch::try_new_with_options(schema, arrays, &options)
        .context("building record batch")?;

    let mut buf = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buf, batch.schema(), None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buf)
}

fn cell_from_array(array: &dyn Array, row: usize) -> Result<Value> {
    if array.is_null(row) {
        return Ok(Value::Null);
    }
    let any = array.as_any();
    let value = match array.data_type() {
        DataType::Boolean => any
            .downcast_ref::<BooleanArray>()
            .map(|a| Value::Bool(a.value(row))),
        DataType::Int64 => any
            .downcast_ref::<Int64Array>()
            .map(|a| Value::Int(a.value(row))),
        DataType::Float64 => any
            .downcast_ref::<Float64Array>()
            .map(|a| Value::Float(a.value(row))),
        DataType::Utf8 => any
            .downcast_ref::<StringArray>()
            .map(|a| Value::Text(a.value(row).to_string())),
        DataType::Timestamp(TimeUnit::Microsecond, None) => any
            .downcast_ref::<TimestampMicrosecondArray>()
            .and_then(|a| {
                let micros = a.value(row);
                DateTime::from_timestamp(
                    micros.div_euclid(1_000_000),
                    (micros.rem_euclid(1_000_000) * 1_000) as u32,
                )
            })
            .map(|dt| Value::Timestamp(dt.naive_utc())),
        DataType::Date32 => any
            .downcast_ref::<Date32Array>()
            .and_then(|a| epoch_date().checked_add_signed(TimeDelta::days(a.value(row) as i64)))
            .map(Value::Date),
        other => bail!("unsupported parquet column type {other}"),
    };
    value.with_context(|| format!("decoding {} cell", array.data_type()))
}

pub fn read_parquet(path: &Path) -> Result<Table> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet footer {}", path.display()))?;
    let columns = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect::<Vec<_>>();
    let reader = builder
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut table = Table::new(columns);
    for batch in reader {
        let batch = batch.with_context(|| format!("reading batch from {}", path.display()))?;
        for row in 0..batch.num_rows() {
            let cells = batch
                .columns()
                .iter()
                .map(|col| cell_from_array(col.as_ref(), row))
                .collect::<Result<Vec<_>>>()?;
            table.push_row(cells)?;
        }
    }
    Ok(table)
}

pub fn encode_csv(table: &Table) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(table.columns())
        .context("writing csv header")?;
    for row in table.rows() {
        writer
            .write_record(row.iter().map(|v| v.to_text().unwrap_or_default()))
            .context("writing csv row")?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow::anyhow!("flushing csv writer: {}", err.error()))
}

fn parse_cell(raw: &str, ty: ColumnType) -> Value {
    if raw.is_empty() {
        return Value::Null;
    }
    let parsed = match ty {
        ColumnType::Null => return Value::Null,
        ColumnType::Text => return Value::Text(raw.to_string()),
        ColumnType::Bool => raw.parse::<bool>().ok().map(Value::Bool),
        ColumnType::Int => raw.parse::<i64>().ok().map(Value::Int),
        ColumnType::Float => raw.parse::<f64>().ok().map(Value::Float),
        ColumnType::Timestamp => NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
            .ok()
            .map(Value::Timestamp),
        ColumnType::Date => NaiveDate::parse_from_str(raw, DATE_FORMAT)
            .ok()
            .map(Value::Date),
    };
    parsed.unwrap_or_else(|| Value::Text(raw.to_string()))
}

/// Rebuild a typed table from CSV. Empty fields come back as `Null`.
pub fn read_csv(path: &Path, schema: &[ColumnSpec]) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let header = reader
        .headers()
        .with_context(|| format!("reading csv header {}", path.display()))?
        .iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    let expected = schema.iter().map(|s| s.name.clone()).collect::<Vec<_>>();
    if header != expected {
        bail!(
            "csv header of {} does not match snapshot metadata",
            path.display()
        );
    }

    let mut table = Table::new(header);
    for record in reader.records() {
        let record = record.with_context(|| format!("reading csv row {}", path.display()))?;
        let cells = record
            .iter()
            .zip(schema)
            .map(|(raw, spec)| parse_cell(raw, spec.ty))
            .collect::<Vec<_>>();
        table.push_row(cells)?;
    }
    Ok(table)
}
