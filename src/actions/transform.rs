//! Transform Action
//!
//! Re-encodes a row-oriented CSV file into a columnar file. Only `.csv`
//! inputs are recognized; anything else fails with
//! [`ActionError::UnsupportedInput`] before a single byte is written.
//!
//! The encoding itself is delegated to a [`ColumnarEncoder`]:
//! - [`CommandEncoder`]: an external converter command, e.g.
//!   `csv2parquet {src} {dest}`
//! - [`JsonColumnarEncoder`]: built-in column-major JSON with per-column
//!   type inference

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::{debug, info};
use serde_json::{json, Map, Number, Value};

use super::command::{
    commit_part, discard_part, ensure_parent_dir, part_path, run_shell, shell_quote,
};
use super::{require, TaskAction};
use crate::error::ActionError;

/// Input extensions the transform action recognizes.
pub const ACCEPTED_INPUTS: &[&str] = &["csv"];

/// Writes a columnar rendition of a CSV file.
pub trait ColumnarEncoder: Send + Sync {
    fn name(&self) -> &str;

    /// Encodes `src` into `dest`. `dest` is a staging path; the caller
    /// moves it into place.
    fn encode(&self, src: &Path, dest: &Path) -> Result<(), ActionError>;
}

/// Runs a converter command. `{src}` and `{dest}` are replaced with the
/// shell-quoted input and output paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEncoder {
    command: String,
}

impl CommandEncoder {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command_line(&self, src: &Path, dest: &Path) -> String {
        self.command
            .replace("{src}", &shell_quote(&src.to_string_lossy()))
            .replace("{dest}", &shell_quote(&dest.to_string_lossy()))
    }
}

impl ColumnarEncoder for CommandEncoder {
    fn name(&self) -> &str {
        "command"
    }

    fn encode(&self, src: &Path, dest: &Path) -> Result<(), ActionError> {
        run_shell(&self.command_line(src, dest))
    }
}

/// Column-major JSON:
///
/// ```json
/// {"format": "columnar-json", "version": 1, "row_count": 2,
///  "columns": [{"name": "LocationID", "type": "integer", "values": [1, 2]}]}
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonColumnarEncoder;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColumnType {
    Integer,
    Float,
    Boolean,
    String,
}

impl ColumnType {
    fn label(self) -> &'static str {
        match self {
            ColumnType::Integer => "integer",
            ColumnType::Float => "float",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
        }
    }
}

fn infer_type<'a>(values: impl Iterator<Item = &'a str>) -> ColumnType {
    let mut candidate = ColumnType::Integer;
    let mut seen_value = false;

    for value in values.filter(|v| !v.is_empty()) {
        seen_value = true;
        if candidate == ColumnType::Integer && value.parse::<i64>().is_err() {
            candidate = ColumnType::Float;
        }
        if candidate == ColumnType::Float && value.parse::<f64>().is_err() {
            candidate = ColumnType::Boolean;
        }
        if candidate == ColumnType::Boolean && parse_bool(value).is_none() {
            return ColumnType::String;
        }
    }

    if seen_value {
        candidate
    } else {
        ColumnType::String
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Some(true),
        "false" => Some(false),
        _ => None,
    }
}

fn typed_value(value: &str, column_type: ColumnType) -> Value {
    if value.is_empty() {
        return Value::Null;
    }
    match column_type {
        ColumnType::Integer => value.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
        ColumnType::Float => value
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ColumnType::Boolean => parse_bool(value).map(Value::Bool).unwrap_or(Value::Null),
        ColumnType::String => Value::String(value.to_string()),
    }
}

/// Splits CSV text into records. Handles quoted fields, doubled quotes,
/// embedded newlines and CRLF line endings.
fn parse_csv(text: &str) -> Result<Vec<Vec<String>>, String> {
    let mut records = Vec::new();
    let mut record: Vec<String> = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        if in_quotes {
            match ch {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(ch),
            }
            continue;
        }

        match ch {
            '"' if field.is_empty() => in_quotes = true,
            ',' => record.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
            }
            _ => field.push(ch),
        }
    }

    if in_quotes {
        return Err("unterminated quoted field".to_string());
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }

    records.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    Ok(records)
}

impl JsonColumnarEncoder {
    fn to_columnar(&self, src: &Path, text: &str) -> Result<Value, ActionError> {
        let unsupported = |reason: String| ActionError::UnsupportedInput {
            path: src.display().to_string(),
            reason,
        };

        let mut records = parse_csv(text).map_err(unsupported)?.into_iter();
        let header = records
            .next()
            .ok_or_else(|| unsupported("file has no header row".to_string()))?;
        let rows: Vec<Vec<String>> = records.collect();

        for (i, row) in rows.iter().enumerate() {
            if row.len() != header.len() {
                return Err(unsupported(format!(
                    "row {} has {} fields, expected {}",
                    i + 2,
                    row.len(),
                    header.len()
                )));
            }
        }

        let columns: Vec<Value> = header
            .iter()
            .enumerate()
            .map(|(col, name)| {
                let column_type = infer_type(rows.iter().map(|r| r[col].as_str()));
                let values: Vec<Value> = rows
                    .iter()
                    .map(|r| typed_value(&r[col], column_type))
                    .collect();
                let mut column = Map::new();
                column.insert("name".to_string(), Value::String(name.trim().to_string()));
                column.insert("type".to_string(), Value::String(column_type.label().to_string()));
                column.insert("values".to_string(), Value::Array(values));
                Value::Object(column)
            })
            .collect();

        Ok(json!({
            "format": "columnar-json",
            "version": 1,
            "row_count": rows.len(),
            "columns": columns,
        }))
    }
}

impl ColumnarEncoder for JsonColumnarEncoder {
    fn name(&self) -> &str {
        "columnar-json"
    }

    fn encode(&self, src: &Path, dest: &Path) -> Result<(), ActionError> {
        let text = fs::read_to_string(src).map_err(|e| match e.kind() {
            std::io::ErrorKind::InvalidData => ActionError::UnsupportedInput {
                path: src.display().to_string(),
                reason: "file is not valid UTF-8".to_string(),
            },
            _ => ActionError::transient(format!("cannot read {}: {}", src.display(), e)),
        })?;

        let document = self.to_columnar(src, &text)?;
        let bytes = serde_json::to_vec(&document).map_err(ActionError::transient)?;
        fs::write(dest, bytes)
            .map_err(|e| ActionError::transient(format!("cannot write {}: {}", dest.display(), e)))
    }
}

/// Converts a CSV `source` into a columnar `destination`.
#[derive(Clone)]
pub struct TransformAction {
    encoder: Arc<dyn ColumnarEncoder>,
}

impl TransformAction {
    pub fn new(encoder: Arc<dyn ColumnarEncoder>) -> Self {
        Self { encoder }
    }
}

/// Fails unless the extension of `path` is one of `accepted`, ignoring case.
pub fn check_input_format(path: &Path, accepted: &[&str]) -> Result<(), ActionError> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());
    match extension {
        Some(ext) if accepted.contains(&ext.as_str()) => Ok(()),
        other => Err(ActionError::UnsupportedInput {
            path: path.display().to_string(),
            reason: format!(
                "format '{}' is not one of: {}",
                other.unwrap_or_else(|| "none".to_string()),
                accepted.join(", ")
            ),
        }),
    }
}

impl TaskAction for TransformAction {
    fn name(&self) -> &str {
        "transform"
    }

    fn required_params(&self) -> &[&'static str] {
        &["source", "destination"]
    }

    fn accepted_inputs(&self) -> &[&'static str] {
        ACCEPTED_INPUTS
    }

    fn execute(&self, params: &BTreeMap<String, String>) -> Result<(), ActionError> {
        let source = Path::new(require(params, "source")?);
        let destination = Path::new(require(params, "destination")?);

        check_input_format(source, ACCEPTED_INPUTS)?;
        if !source.is_file() {
            return Err(ActionError::transient(format!(
                "input {} does not exist",
                source.display()
            )));
        }

        ensure_parent_dir(destination)?;
        let part = part_path(destination);
        discard_part(&part);

        debug!(
            "Encoding {} with {} encoder",
            source.display(),
            self.encoder.name()
        );
        if let Err(e) = self.encoder.encode(source, &part) {
            discard_part(&part);
            return Err(e);
        }
        commit_part(&part, destination)?;

        info!("Transformed {} -> {}", source.display(), destination.display());
        Ok(())
    }
}
