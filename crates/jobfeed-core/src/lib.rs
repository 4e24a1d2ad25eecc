//! Core domain model for job-market record synchronization.

use std::collections::BTreeMap;
use std::fmt;

pub const CRATE_NAME: &str = "jobfeed-core";

/// Separator joining hash-field values before digesting. The ASCII unit
/// separator cannot appear in CSV-sourced text.
pub const HASH_DELIMITER: char = '\u{1f}';

/// A destination-typed value carried through the pipeline. The JSON wire
/// encoding lives in `jobfeed-remote`; business logic only ever sees this.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
}

impl SqlValue {
    /// Normalized textual form used for content hashing. Null maps to the
    /// empty string so null and missing hash fields are equivalent.
    pub fn hash_text(&self) -> String {
        match self {
            SqlValue::Null => String::new(),
            SqlValue::Text(s) => s.clone(),
            SqlValue::Integer(i) => i.to_string(),
            SqlValue::Float(f) => f.to_string(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// One row read from the input CSV: an unordered mapping of canonical
/// column name to value, immutable once built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, SqlValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: impl Into<String>, value: SqlValue) {
        self.fields.insert(field.into(), value);
    }

    pub fn get(&self, field: &str) -> Option<&SqlValue> {
        self.fields.get(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn from_pairs<I, K>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, SqlValue)>,
        K: Into<String>,
    {
        let mut record = Self::new();
        for (field, value) in pairs {
            record.insert(field, value);
        }
        record
    }
}

/// Stable content identity: an MD5 digest over the configured hash fields,
/// truncated to 16 hex characters. Two records with equal hash-field values
/// are the same logical entity regardless of other column differences.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordHash(String);

impl RecordHash {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Digest `record` over `hash_fields`, in order. Missing and null fields
/// both contribute an empty string, so records that differ only in non-hash
/// columns share a hash. Pure; equal inputs hash equally across processes.
pub fn hash_record(record: &Record, hash_fields: &[String]) -> RecordHash {
    let delimiter = HASH_DELIMITER.to_string();
    let joined = hash_fields
        .iter()
        .map(|field| record.get(field).map(SqlValue::hash_text).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(&delimiter);
    let digest = md5::compute(joined.as_bytes());
    let hex = format!("{digest:x}");
    RecordHash(hex[..16].to_string())
}

/// A record annotated with its content hash and reserved surrogate ID.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyedRecord {
    pub id: i64,
    pub hash: RecordHash,
    pub record: Record,
}

/// Assign sequential surrogate IDs starting at `first_id`, preserving input
/// order. IDs within one run are unique by construction.
pub fn assign_ids(unseen: Vec<(RecordHash, Record)>, first_id: i64) -> Vec<KeyedRecord> {
    unseen
        .into_iter()
        .enumerate()
        .map(|(offset, (hash, record))| KeyedRecord {
            id: first_id + offset as i64,
            hash,
            record,
        })
        .collect()
}

/// One bounded upload unit, pre-split into per-statement row chunks.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedBatch<T> {
    pub index: usize,
    pub statements: Vec<Vec<T>>,
}

impl<T> PlannedBatch<T> {
    pub fn row_count(&self) -> usize {
        self.statements.iter().map(Vec::len).sum()
    }
}

/// Partition `rows` in original order into batches of `batch_size`, each
/// further split into statements of at most `stmt_limit` rows. The trailing
/// batch and statement may be shorter.
pub fn plan_batches<T>(rows: Vec<T>, batch_size: usize, stmt_limit: usize) -> Vec<PlannedBatch<T>> {
    assert!(batch_size > 0 && stmt_limit > 0, "planner bounds must be positive");

    let mut batches = Vec::new();
    let mut rows = rows.into_iter().peekable();
    let mut index = 0usize;
    while rows.peek().is_some() {
        let chunk: Vec<T> = rows.by_ref().take(batch_size).collect();
        let mut chunk = chunk.into_iter().peekable();
        let mut statements = Vec::new();
        while chunk.peek().is_some() {
            statements.push(chunk.by_ref().take(stmt_limit).collect());
        }
        batches.push(PlannedBatch { index, statements });
        index += 1;
    }
    batches
}
