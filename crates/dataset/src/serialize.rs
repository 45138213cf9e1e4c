//! Storage serialization.
//!
//! Every metadata document passes through [`serialize_for_storage`] or
//! [`to_storage_json`] before it is written. Non-finite floats become `null`,
//! timestamps become `YYYY-MM-DD HH:MM:SS` strings, tables become arrays of
//! row objects and object keys are emitted in sorted order.

use crate::errors::{DatasetError, Result};
use crate::table::{Cell, Table};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{map::Map, ser::PrettyFormatter, Number, Serializer, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Layout used for every timestamp written to metadata.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a timestamp the way metadata documents store it.
pub fn format_timestamp(ts: &NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

/// Value kinds that may appear in a stored document.
#[derive(Debug, Clone)]
pub enum StorageValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    List(Vec<StorageValue>),
    Map(BTreeMap<String, StorageValue>),
    Table(Table),
    Json(Value),
}

impl From<f64> for StorageValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<i64> for StorageValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<u64> for StorageValue {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

impl From<usize> for StorageValue {
    fn from(value: usize) -> Self {
        Self::Unsigned(value as u64)
    }
}

impl From<bool> for StorageValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for StorageValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for StorageValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<NaiveDateTime> for StorageValue {
    fn from(value: NaiveDateTime) -> Self {
        Self::Timestamp(value)
    }
}

impl From<Table> for StorageValue {
    fn from(value: Table) -> Self {
        Self::Table(value)
    }
}

impl From<&Cell> for StorageValue {
    fn from(cell: &Cell) -> Self {
        match cell {
            Cell::Missing => Self::Null,
            Cell::Number(n) => Self::Float(*n),
            Cell::Timestamp(ts) => Self::Timestamp(*ts),
            Cell::Text(s) => Self::Text(s.clone()),
        }
    }
}

impl<T: Into<StorageValue>> From<Option<T>> for StorageValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Self::Null)
    }
}

impl<T: Into<StorageValue>> From<Vec<T>> for StorageValue {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

/// Convert a value into its JSON-safe form.
pub fn serialize_for_storage(value: impl Into<StorageValue>) -> Value {
    convert(value.into())
}

fn convert(value: StorageValue) -> Value {
    match value {
        StorageValue::Null => Value::Null,
        StorageValue::Bool(b) => Value::Bool(b),
        StorageValue::Integer(i) => Value::from(i),
        StorageValue::Unsigned(u) => Value::from(u),
        StorageValue::Float(f) => float_value(f),
        StorageValue::Text(s) => Value::String(s),
        StorageValue::Timestamp(ts) => Value::String(format_timestamp(&ts)),
        StorageValue::List(items) => Value::Array(items.into_iter().map(convert).collect()),
        StorageValue::Map(entries) => Value::Object(
            entries
                .into_iter()
                .map(|(key, val)| (key, convert(val)))
                .collect(),
        ),
        StorageValue::Table(table) => table_records(&table),
        StorageValue::Json(json) => canonicalize(json),
    }
}

/// Non-finite floats have no JSON form and are stored as `null`.
fn float_value(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn table_records(table: &Table) -> Value {
    let records = table
        .rows
        .iter()
        .map(|row| {
            let mut record = Map::with_capacity(table.columns.len());
            for (name, cell) in table.columns.iter().zip(row) {
                record.insert(name.clone(), convert(StorageValue::from(cell)));
            }
            Value::Object(record)
        })
        .collect();
    Value::Array(records)
}

/// Recursively sort JSON object keys to obtain a canonical representation.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));

            let mut sorted = Map::with_capacity(entries.len());
            for (key, val) in entries {
                sorted.insert(key, canonicalize(val));
            }

            Value::Object(sorted)
        }
        Value::Array(elements) => Value::Array(elements.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// Convert any serializable document into canonical, JSON-safe form.
pub fn to_storage_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(canonicalize(serde_json::to_value(value)?))
}

/// Render a document as canonical pretty-printed JSON.
pub fn storage_json_string<T: Serialize>(value: &T) -> Result<String> {
    let canonical = to_storage_json(value)?;
    let mut buffer = Vec::new();
    let formatter = PrettyFormatter::with_indent(b"  ");
    let mut serializer = Serializer::with_formatter(&mut buffer, formatter);
    canonical.serialize(&mut serializer)?;
    String::from_utf8(buffer).map_err(|err| DatasetError::Configuration(err.to_string()))
}

/// Write a document to `path`.
///
/// The content goes to a sibling temporary file first and is renamed into
/// place, so readers never observe a half-written document.
pub fn write_storage_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let rendered = storage_json_string(value)?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| DatasetError::io(parent, e))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = std::path::PathBuf::from(tmp_name);

    fs::write(&tmp_path, rendered.as_bytes()).map_err(|e| DatasetError::io(&tmp_path, e))?;
    fs::rename(&tmp_path, path).map_err(|e| DatasetError::io(path, e))?;
    Ok(())
}
