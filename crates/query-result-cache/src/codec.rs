//! Tabular serialization formats
//!
//! [`Format`] is a closed enum validated once at construction; encode and
//! decode dispatch over it, so an unsupported format can never surface deep
//! in a write path.
//!
//! Parquet round-trips a [`Table`] exactly. CSV is lossy on type identity:
//! values are re-inferred on decode (bool, then integer, then float, then
//! RFC 3339 timestamp, then text) and an empty field decodes as `Null`, so
//! `Text("1")` comes back as `Int(1)` and `Text("")` as `Null`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;

use crate::error::{CacheError, Result};
use crate::types::{Table, Value};

/// Serialization format for cached artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Csv,
    Parquet,
}

impl Format {
    /// File extension carried as the cache key suffix. Must match the codec
    /// used for encode and decode.
    pub fn extension(&self) -> &'static str {
        match self {
            Format::Csv => "csv",
            Format::Parquet => "parquet",
        }
    }

    /// Serialize a table into artifact bytes.
    pub fn encode(&self, table: &Table) -> Result<Vec<u8>> {
        match self {
            Format::Csv => encode_csv(table),
            Format::Parquet => encode_parquet(table),
        }
    }

    /// Deserialize artifact bytes back into a table.
    pub fn decode(&self, bytes: &[u8]) -> Result<Table> {
        match self {
            Format::Csv => decode_csv(bytes),
            Format::Parquet => decode_parquet(bytes),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for Format {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "csv" => Ok(Format::Csv),
            "parquet" => Ok(Format::Parquet),
            other => Err(CacheError::InvalidFormat(other.to_string())),
        }
    }
}

fn write_failed(err: impl fmt::Display) -> CacheError {
    CacheError::CacheWriteFailed(err.to_string())
}

fn corrupt(err: impl fmt::Display) -> CacheError {
    CacheError::CacheCorrupt(err.to_string())
}

/// An artifact needs at least one column to carry a decodable schema, and
/// every row must match the column count. Violations are classified as
/// write failures so the executor degrades to uncached behavior.
fn check_encodable(table: &Table) -> Result<()> {
    if table.columns.is_empty() {
        return Err(write_failed("cannot encode a table with no columns"));
    }
    if let Some(row) = table.rows.iter().find(|r| r.len() != table.columns.len()) {
        return Err(write_failed(format!(
            "row has {} values but table has {} columns",
            row.len(),
            table.columns.len()
        )));
    }
    Ok(())
}

fn encode_csv(table: &Table) -> Result<Vec<u8>> {
    check_encodable(table)?;
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&table.columns).map_err(write_failed)?;
    for row in &table.rows {
        writer
            .write_record(row.iter().map(csv_field))
            .map_err(write_failed)?;
    }
    writer
        .into_inner()
        .map_err(|err| write_failed(err.error()))
}

fn csv_field(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Timestamp(ts) => ts.to_rfc3339_opts(SecondsFormat::Micros, true),
    }
}

fn decode_csv(bytes: &[u8]) -> Result<Table> {
    let mut reader = csv::Reader::from_reader(bytes);
    let columns = reader
        .headers()
        .map_err(corrupt)?
        .iter()
        .map(|h| h.to_string())
        .collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(corrupt)?;
        rows.push(record.iter().map(infer_csv_value).collect());
    }
    Ok(Table::new(columns, rows))
}

fn infer_csv_value(field: &str) -> Value {
    if field.is_empty() {
        return Value::Null;
    }
    match field {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = field.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = field.parse::<f64>() {
        return Value::Float(f);
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(field) {
        return Value::Timestamp(ts.with_timezone(&Utc));
    }
    Value::Text(field.to_string())
}

/// Arrow type for a column, taken from its first non-null value.
/// An all-null column is typed as Utf8.
fn infer_arrow_type(table: &Table, col: usize) -> DataType {
    for row in &table.rows {
        match &row[col] {
            Value::Null => continue,
            Value::Bool(_) => return DataType::Boolean,
            Value::Int(_) => return DataType::Int64,
            Value::Float(_) => return DataType::Float64,
            Value::Text(_) => return DataType::Utf8,
            Value::Timestamp(_) => {
                return DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
        }
    }
    DataType::Utf8
}

fn type_mismatch(column: &str) -> CacheError {
    write_failed(format!("mixed value types in column '{}'", column))
}

fn build_array(table: &Table, col: usize, data_type: &DataType) -> Result<ArrayRef> {
    let name = &table.columns[col];
    let array: ArrayRef = match data_type {
        DataType::Boolean => {
            let values: Result<Vec<Option<bool>>> = table
                .rows
                .iter()
                .map(|row| match &row[col] {
                    Value::Null => Ok(None),
                    Value::Bool(b) => Ok(Some(*b)),
                    _ => Err(type_mismatch(name)),
                })
                .collect();
            Arc::new(BooleanArray::from(values?))
        }
        DataType::Int64 => {
            let values: Result<Vec<Option<i64>>> = table
                .rows
                .iter()
                .map(|row| match &row[col] {
                    Value::Null => Ok(None),
                    Value::Int(i) => Ok(Some(*i)),
                    _ => Err(type_mismatch(name)),
                })
                .collect();
            Arc::new(Int64Array::from(values?))
        }
        DataType::Float64 => {
            let values: Result<Vec<Option<f64>>> = table
                .rows
                .iter()
                .map(|row| match &row[col] {
                    Value::Null => Ok(None),
                    Value::Float(f) => Ok(Some(*f)),
                    _ => Err(type_mismatch(name)),
                })
                .collect();
            Arc::new(Float64Array::from(values?))
        }
        DataType::Utf8 => {
            let values: Result<Vec<Option<String>>> = table
                .rows
                .iter()
                .map(|row| match &row[col] {
                    Value::Null => Ok(None),
                    Value::Text(s) => Ok(Some(s.clone())),
                    _ => Err(type_mismatch(name)),
                })
                .collect();
            Arc::new(StringArray::from(values?))
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let values: Result<Vec<Option<i64>>> = table
                .rows
                .iter()
                .map(|row| match &row[col] {
                    Value::Null => Ok(None),
                    Value::Timestamp(ts) => Ok(Some(ts.timestamp_micros())),
                    _ => Err(type_mismatch(name)),
                })
                .collect();
            Arc::new(TimestampMicrosecondArray::from(values?).with_timezone("UTC"))
        }
        other => {
            return Err(write_failed(format!(
                "unsupported arrow type {} for column '{}'",
                other, name
            )))
        }
    };
    Ok(array)
}

fn encode_parquet(table: &Table) -> Result<Vec<u8>> {
    check_encodable(table)?;
    let fields: Vec<Field> = table
        .columns
        .iter()
        .enumerate()
        .map(|(i, name)| Field::new(name, infer_arrow_type(table, i), true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Result<Vec<ArrayRef>> = (0..table.columns.len())
        .map(|i| build_array(table, i, schema.field(i).data_type()))
        .collect();
    let batch = RecordBatch::try_new(schema.clone(), arrays?).map_err(write_failed)?;

    let mut buf = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut buf, schema, None).map_err(write_failed)?;
    writer.write(&batch).map_err(write_failed)?;
    writer.close().map_err(write_failed)?;
    Ok(buf)
}

fn decode_parquet(bytes: &[u8]) -> Result<Table> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))
        .map_err(corrupt)?;
    let schema = builder.schema().clone();
    let columns: Vec<String> = schema.fields().iter().map(|f| f.name().clone()).collect();

    let reader = builder.build().map_err(corrupt)?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(corrupt)?;
        append_batch_rows(&batch, &mut rows)?;
    }
    Ok(Table::new(columns, rows))
}

fn append_batch_rows(batch: &RecordBatch, rows: &mut Vec<Vec<Value>>) -> Result<()> {
    for i in 0..batch.num_rows() {
        let mut row = Vec::with_capacity(batch.num_columns());
        for col in batch.columns() {
            row.push(read_arrow_value(col.as_ref(), i)?);
        }
        rows.push(row);
    }
    Ok(())
}

fn read_arrow_value(array: &dyn Array, i: usize) -> Result<Value> {
    if array.is_null(i) {
        return Ok(Value::Null);
    }
    let value = match array.data_type() {
        DataType::Boolean => {
            let arr = array
                .as_any()
                .downcast_ref::<BooleanArray>()
                .ok_or_else(|| corrupt("boolean column downcast failed"))?;
            Value::Bool(arr.value(i))
        }
        DataType::Int64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Int64Array>()
                .ok_or_else(|| corrupt("int64 column downcast failed"))?;
            Value::Int(arr.value(i))
        }
        DataType::Float64 => {
            let arr = array
                .as_any()
                .downcast_ref::<Float64Array>()
                .ok_or_else(|| corrupt("float64 column downcast failed"))?;
            Value::Float(arr.value(i))
        }
        DataType::Utf8 => {
            let arr = array
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| corrupt("utf8 column downcast failed"))?;
            Value::Text(arr.value(i).to_string())
        }
        DataType::Timestamp(TimeUnit::Microsecond, _) => {
            let arr = array
                .as_any()
                .downcast_ref::<TimestampMicrosecondArray>()
                .ok_or_else(|| corrupt("timestamp column downcast failed"))?;
            let ts = DateTime::from_timestamp_micros(arr.value(i))
                .ok_or_else(|| corrupt("timestamp out of range"))?;
            Value::Timestamp(ts)
        }
        other => return Err(corrupt(format!("unsupported column type {}", other))),
    };
    Ok(value)
}
