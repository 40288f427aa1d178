use std::fs;
use std::path::Path;

use serde_json::Value;
use strata_core::query_executor::StatementResult;
use strata_core::schema_cache::SchemaSnapshot;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("failed to write export file at {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize JSON export: {0}")]
    Json(#[from] serde_json::Error),
}

/// Writes one table definition per line, in schema order.
pub fn export_schema(path: &Path, snapshot: &SchemaSnapshot) -> Result<usize, ExportError> {
    let mut content = String::new();
    for table in &snapshot.tables {
        content.push_str(table.definition.trim_end_matches(';'));
        content.push_str(";\n");
    }

    write(path, content)?;
    Ok(snapshot.tables.len())
}

pub fn export_response(path: &Path, records: &[StatementResult]) -> Result<usize, ExportError> {
    let payload = serde_json::to_string_pretty(records)?;
    write(path, payload)?;
    Ok(records.len())
}

/// Flattens one statement's rows into CSV. Columns are the union of object
/// keys in first-seen order; a result that is not a list of objects becomes a
/// single `value` column.
pub fn export_result_to_csv(path: &Path, result: &Value) -> Result<usize, ExportError> {
    let rows = match result {
        Value::Array(rows) => rows.as_slice(),
        other => std::slice::from_ref(other),
    };

    let mut headers: Vec<String> = Vec::new();
    for row in rows {
        if let Value::Object(object) = row {
            for key in object.keys() {
                if !headers.iter().any(|header| header == key) {
                    headers.push(key.clone());
                }
            }
        }
    }
    let single_column = headers.is_empty();
    if single_column {
        headers.push("value".to_string());
    }

    let mut content = String::new();
    content.push_str(
        &headers
            .iter()
            .map(|header| csv_escape(header))
            .collect::<Vec<_>>()
            .join(","),
    );
    content.push('\n');

    for row in rows {
        let values = if single_column {
            vec![csv_escape(&cell_text(row))]
        } else {
            headers
                .iter()
                .map(|header| csv_escape(&row.get(header).map(cell_text).unwrap_or_default()))
                .collect()
        };
        content.push_str(&values.join(","));
        content.push('\n');
    }

    write(path, content)?;
    Ok(rows.len())
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn write(path: &Path, content: String) -> Result<(), ExportError> {
    fs::write(path, content).map_err(|source| ExportError::Write {
        path: path.display().to_string(),
        source,
    })
}

fn csv_escape(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
