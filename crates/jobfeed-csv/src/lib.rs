//! CSV input boundary: column-mapping configuration + record parsing.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::warn;

use jobfeed_core::{Record, SqlValue};

pub const CRATE_NAME: &str = "jobfeed-csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnKind {
    Text,
    Integer,
    Float,
}

/// One CSV-header -> destination-column mapping entry.
#[derive(Debug, Clone, Deserialize)]
pub struct ColumnSpec {
    /// Header name in the source CSV.
    pub csv: String,
    /// Destination column the value lands in.
    pub field: String,
    #[serde(default = "default_kind")]
    pub kind: ColumnKind,
}

fn default_kind() -> ColumnKind {
    ColumnKind::Text
}

/// Run configuration binding one CSV layout to the destination table. The
/// mapping is explicit configuration, never inferred from headers.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub table: String,
    #[serde(default = "default_id_column")]
    pub id_column: String,
    #[serde(default = "default_hash_column")]
    pub hash_column: String,
    #[serde(default)]
    pub partition_column: Option<String>,
    /// Ordered subset of destination columns that defines content identity.
    pub hash_fields: Vec<String>,
    pub columns: Vec<ColumnSpec>,
}

fn default_id_column() -> String {
    "id".to_string()
}

fn default_hash_column() -> String {
    "content_hash".to_string()
}

#[derive(Debug, Error)]
pub enum MappingError {
    #[error("unreadable mapping file {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid mapping file {path}: {source}")]
    Invalid {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("hash field `{0}` is not a mapped destination column")]
    UndefinedHashField(String),
}

impl MappingConfig {
    pub fn load(path: &Path) -> Result<Self, MappingError> {
        let text = std::fs::read_to_string(path).map_err(|source| MappingError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;
        let mapping: MappingConfig =
            serde_yaml::from_str(&text).map_err(|source| MappingError::Invalid {
                path: path.display().to_string(),
                source,
            })?;
        mapping.validate()?;
        Ok(mapping)
    }

    /// Every hash field must name a mapped destination column (or the
    /// partition column). An undefined hash field is a configuration error,
    /// rejected before any work starts.
    pub fn validate(&self) -> Result<(), MappingError> {
        for field in &self.hash_fields {
            let mapped = self.columns.iter().any(|c| &c.field == field)
                || self.partition_column.as_deref() == Some(field.as_str());
            if !mapped {
                return Err(MappingError::UndefinedHashField(field.clone()));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CsvImportError {
    #[error("unreadable csv {path}: {source}")]
    Unreadable {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("csv column `{0}` missing from header")]
    MissingColumn(String),
    #[error("csv row error: {0}")]
    Row(#[from] csv::Error),
}

/// Read the whole CSV into records using `mapping`. Tolerates a UTF-8 BOM
/// on the first header. Empty cells become null; unparseable numeric cells
/// degrade to null with a warning rather than aborting the import.
pub fn read_records(path: &Path, mapping: &MappingConfig) -> Result<Vec<Record>, CsvImportError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(|source| CsvImportError::Unreadable {
            path: path.display().to_string(),
            source,
        })?;

    let headers: Vec<String> = reader
        .headers()?
        .iter()
        .enumerate()
        .map(|(i, header)| {
            let header = if i == 0 {
                header.trim_start_matches('\u{feff}')
            } else {
                header
            };
            header.trim().to_string()
        })
        .collect();

    let mut plan = Vec::with_capacity(mapping.columns.len());
    for spec in &mapping.columns {
        let position = headers
            .iter()
            .position(|h| h == &spec.csv)
            .ok_or_else(|| CsvImportError::MissingColumn(spec.csv.clone()))?;
        plan.push((position, spec));
    }

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut record = Record::new();
        for (position, spec) in &plan {
            let raw = row.get(*position).unwrap_or("").trim();
            record.insert(spec.field.clone(), parse_value(raw, spec.kind, &spec.csv));
        }
        records.push(record);
    }
    Ok(records)
}

fn parse_value(raw: &str, kind: ColumnKind, column: &str) -> SqlValue {
    if raw.is_empty() {
        return SqlValue::Null;
    }
    match kind {
        ColumnKind::Text => SqlValue::Text(raw.to_string()),
        ColumnKind::Integer => match raw.replace(',', "").parse::<i64>() {
            Ok(value) => SqlValue::Integer(value),
            Err(_) => {
                warn!(column, raw, "unparseable integer cell treated as null");
                SqlValue::Null
            }
        },
        ColumnKind::Float => match raw.replace(',', "").parse::<f64>() {
            Ok(value) => SqlValue::Float(value),
            Err(_) => {
                warn!(column, raw, "unparseable float cell treated as null");
                SqlValue::Null
            }
        },
    }
}
