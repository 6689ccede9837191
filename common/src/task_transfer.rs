//! Bulk import and export of task instance documents as CSV or JSON.

use crate::task_store::{Fields, StoredDocument};
use anyhow::{Context, Result, bail};
use serde_json::{Number, Value};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Csv,
    Json,
}

impl TransferFormat {
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
        }
    }
}

impl FromStr for TransferFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            _ => bail!("Format must be 'csv' or 'json'"),
        }
    }
}

impl fmt::Display for TransferFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Type a raw CSV cell: blank is null, then bool, integer, float, else string.
#[must_use]
pub fn infer_cell_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match trimmed {
        "true" | "True" | "TRUE" => return Value::Bool(true),
        "false" | "False" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(i.into());
    }
    if let Some(n) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(n);
    }
    Value::String(raw.to_string())
}

/// Parse CSV text into one document per row.
///
/// # Errors
///
/// Returns an error if the CSV is malformed.
pub fn parse_csv_documents(text: &str) -> Result<Vec<Fields>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers: Vec<String> = reader
        .headers()
        .context("Failed to read CSV header")?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut docs = Vec::new();
    for record in reader.records() {
        let record = record.context("Failed to read CSV record")?;
        let fields = headers
            .iter()
            .enumerate()
            .filter(|(_, h)| !h.is_empty())
            .map(|(i, h)| (h.clone(), infer_cell_value(record.get(i).unwrap_or(""))))
            .collect();
        docs.push(fields);
    }
    Ok(docs)
}

/// Parse a JSON array of objects, or a single object.
///
/// # Errors
///
/// Returns an error if the text is not JSON or contains non-object items.
pub fn parse_json_documents(text: &str) -> Result<Vec<Fields>> {
    let value: Value = serde_json::from_str(text).context("Failed to parse JSON")?;
    let items = match value {
        Value::Array(items) => items,
        other => vec![other],
    };
    items
        .into_iter()
        .map(|item| match item {
            Value::Object(fields) => Ok(fields),
            other => bail!("Expected a JSON object, got {other}"),
        })
        .collect()
}

/// # Errors
///
/// Returns an error if the content cannot be parsed in the given format.
pub fn parse_documents(text: &str, format: TransferFormat) -> Result<Vec<Fields>> {
    match format {
        TransferFormat::Csv => parse_csv_documents(text),
        TransferFormat::Json => parse_json_documents(text),
    }
}

/// Assign document ids and default `available` to true.
///
/// The id comes from `task_instance_id` when present and not null, otherwise
/// a new UUID is generated.
#[must_use]
pub fn prepare_import(items: Vec<Fields>) -> Vec<(String, Fields)> {
    items
        .into_iter()
        .map(|mut fields| {
            let id = match fields.get("task_instance_id") {
                Some(Value::String(s)) if !s.is_empty() => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                _ => uuid::Uuid::new_v4().to_string(),
            };
            fields
                .entry("available")
                .or_insert(Value::Bool(true));
            (id, fields)
        })
        .collect()
}

/// Document fields for export, optionally with `doc_id`, `created_at` and `updated_at`.
#[must_use]
pub fn export_rows(docs: &[StoredDocument], include_metadata: bool) -> Vec<Fields> {
    docs.iter()
        .map(|doc| {
            let mut fields = doc.fields.clone();
            if include_metadata {
                let time = |t: &Option<String>| t.clone().map_or(Value::Null, Value::String);
                fields.insert("doc_id".to_string(), Value::String(doc.id.clone()));
                fields.insert("created_at".to_string(), time(&doc.create_time));
                fields.insert("updated_at".to_string(), time(&doc.update_time));
            }
            fields
        })
        .collect()
}

fn cell_text(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Render rows as CSV. Columns are the union of all keys in first-seen order.
///
/// # Errors
///
/// Returns an error if writing fails.
pub fn write_export_csv(rows: &[Fields]) -> Result<Vec<u8>> {
    let mut columns: Vec<&str> = Vec::new();
    for row in rows {
        for key in row.keys() {
            if !columns.contains(&key.as_str()) {
                columns.push(key);
            }
        }
    }

    let mut writer = csv::Writer::from_writer(Vec::new());
    if !columns.is_empty() {
        writer.write_record(&columns)?;
    }
    for row in rows {
        writer.write_record(columns.iter().map(|c| cell_text(row.get(*c))))?;
    }
    writer.into_inner().context("Failed to flush CSV")
}

/// # Errors
///
/// Returns an error if serialization fails.
pub fn write_export(rows: &[Fields], format: TransferFormat) -> Result<Vec<u8>> {
    match format {
        TransferFormat::Csv => write_export_csv(rows),
        TransferFormat::Json => Ok(serde_json::to_vec(rows)?),
    }
}
