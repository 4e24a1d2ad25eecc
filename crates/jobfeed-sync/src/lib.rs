//! Bulk-import pipeline: dedup against the destination, batch planning,
//! parallel upload with retry, and run progress reporting.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use jobfeed_core::{
    assign_ids, hash_record, plan_batches, KeyedRecord, PlannedBatch, Record, RecordHash, SqlValue,
};
use jobfeed_csv::{read_records, MappingConfig};
use jobfeed_remote::{
    BackoffPolicy, PipelineEntry, RemoteClient, RemoteConfig, RemoteError, StatementOutcome, Stmt,
    WireValue,
};

pub use jobfeed_csv::MappingError;

pub const CRATE_NAME: &str = "jobfeed-sync";

/// Conflict policy applied by every INSERT in a run. Both variants are
/// non-destructive under replay, which is what makes retries and an
/// incomplete identity index safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// `INSERT OR IGNORE`: collisions on the content-hash unique index are
    /// skipped, leaving the existing row untouched.
    IgnoreByHash,
    /// `INSERT OR REPLACE`: collisions on the surrogate primary key
    /// overwrite the existing row.
    ReplaceById,
}

impl ConflictPolicy {
    pub fn insert_verb(&self) -> &'static str {
        match self {
            ConflictPolicy::IgnoreByHash => "INSERT OR IGNORE",
            ConflictPolicy::ReplaceById => "INSERT OR REPLACE",
        }
    }
}

/// Fatal misconfiguration, detected before any network call.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),
    #[error("csv file {0} does not exist")]
    CsvNotFound(PathBuf),
    #[error("{0} must be positive")]
    NonPositive(&'static str),
    #[error("--partition-key given but the mapping has no partition_column")]
    PartitionNotMapped,
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("http client: {0}")]
    Client(String),
}

/// Explicit run configuration; constructed once and passed in, never read
/// from process-global state.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub auth_token: String,
    pub csv_path: PathBuf,
    pub partition_key: Option<String>,
    pub batch_size: usize,
    pub stmt_limit: usize,
    pub workers: usize,
    pub dry_run: bool,
    pub conflict: ConflictPolicy,
    pub index_page_size: usize,
    pub http_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl SyncConfig {
    pub fn new(
        database_url: impl Into<String>,
        auth_token: impl Into<String>,
        csv_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            database_url: database_url.into(),
            auth_token: auth_token.into(),
            csv_path: csv_path.into(),
            partition_key: None,
            batch_size: 2_000,
            stmt_limit: 100,
            workers: 4,
            dry_run: false,
            conflict: ConflictPolicy::IgnoreByHash,
            index_page_size: 50_000,
            http_timeout: Duration::from_secs(120),
            backoff: BackoffPolicy::default(),
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.csv_path.exists() {
            return Err(ConfigError::CsvNotFound(self.csv_path.clone()));
        }
        if self.batch_size == 0 {
            return Err(ConfigError::NonPositive("batch_size"));
        }
        if self.stmt_limit == 0 {
            return Err(ConfigError::NonPositive("stmt_limit"));
        }
        if self.workers == 0 {
            return Err(ConfigError::NonPositive("workers"));
        }
        Ok(())
    }
}

/// Snapshot of content hashes already present at the destination.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    hashes: HashSet<RecordHash>,
    complete: bool,
}

impl IdentityIndex {
    pub fn contains(&self, hash: &RecordHash) -> bool {
        self.hashes.contains(hash)
    }

    pub fn len(&self) -> usize {
        self.hashes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
    }

    /// False when pagination was cut short by a query error. The run then
    /// proceeds fail-open: an incomplete index costs upload bandwidth, not
    /// correctness, because inserts stay idempotent.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Page through the destination's hash-field columns in bounded chunks
    /// and hash each retrieved row. A page-level error stops pagination and
    /// returns the partially built set.
    pub async fn load_existing(
        client: &RemoteClient,
        mapping: &MappingConfig,
        partition_key: Option<&str>,
        page_size: usize,
    ) -> Self {
        let mut hashes = HashSet::new();
        let mut complete = true;
        let columns = mapping.hash_fields.join(", ");
        let (filter, filter_args) = partition_filter(mapping, partition_key);
        let mut offset = 0usize;

        loop {
            let sql = format!(
                "SELECT {columns} FROM {table}{filter} ORDER BY {id} LIMIT {page_size} OFFSET {offset}",
                table = mapping.table,
                id = mapping.id_column,
            );
            let page = match client.execute(sql, filter_args.clone()).await {
                Ok(result) => result,
                Err(err) => {
                    warn!(%err, offset, "identity index pagination stopped early; continuing with partial index");
                    complete = false;
                    break;
                }
            };

            let fetched = page.rows.len();
            for row in page.rows {
                match row_to_record(&mapping.hash_fields, row) {
                    Ok(record) => {
                        hashes.insert(hash_record(&record, &mapping.hash_fields));
                    }
                    Err(err) => {
                        warn!(%err, "undecodable row while building identity index");
                        complete = false;
                    }
                }
            }
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }

        info!(existing = hashes.len(), complete, "identity index loaded");
        Self { hashes, complete }
    }
}

fn partition_filter(
    mapping: &MappingConfig,
    partition_key: Option<&str>,
) -> (String, Vec<WireValue>) {
    match (mapping.partition_column.as_deref(), partition_key) {
        (Some(column), Some(value)) => (
            format!(" WHERE {column} = ?"),
            vec![WireValue::Text {
                value: value.to_string(),
            }],
        ),
        _ => (String::new(), Vec::new()),
    }
}

fn row_to_record(fields: &[String], row: Vec<WireValue>) -> Result<Record, RemoteError> {
    let mut record = Record::new();
    for (field, value) in fields.iter().zip(row) {
        record.insert(field.clone(), value.into_sql()?);
    }
    Ok(record)
}

/// Reserve a contiguous surrogate-ID range for `count` rows: one `MAX(id)`
/// query per run, issued before any worker dispatch, so no cross-worker
/// coordination is needed during upload. Two runs executing concurrently
/// against the same destination are outside this design's guarantees.
pub async fn reserve_ids(
    client: &RemoteClient,
    mapping: &MappingConfig,
    count: usize,
) -> Result<i64> {
    let sql = format!(
        "SELECT MAX({id}) FROM {table}",
        id = mapping.id_column,
        table = mapping.table
    );
    let result = client
        .execute(sql, Vec::new())
        .await
        .context("querying max surrogate id")?;

    let max = match result.rows.first().and_then(|row| row.first()) {
        Some(WireValue::Integer { value }) => {
            value.parse::<i64>().context("non-decimal max surrogate id")?
        }
        Some(WireValue::Null) | None => 0,
        Some(other) => anyhow::bail!("unexpected max surrogate id value {other:?}"),
    };

    let first_id = max + 1;
    info!(first_id, count, "reserved surrogate id range");
    Ok(first_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Success,
    Failed,
    Cancelled,
}

/// Outcome of one batch after all retry attempts. For every batch,
/// `inserted + errored == rows`.
#[derive(Debug)]
pub struct BatchResult {
    pub batch_index: usize,
    pub rows: usize,
    pub inserted: u64,
    pub errored: u64,
    pub attempts: usize,
    pub state: BatchState,
    pub errors: Vec<String>,
}

/// Build the multi-row INSERT for one statement chunk. Column order is
/// surrogate ID, mapped data columns, partition column (when not already
/// mapped), content hash.
fn build_insert(mapping: &MappingConfig, policy: ConflictPolicy, rows: &[KeyedRecord]) -> Stmt {
    let mut columns: Vec<&str> = Vec::with_capacity(mapping.columns.len() + 3);
    columns.push(mapping.id_column.as_str());
    columns.extend(mapping.columns.iter().map(|c| c.field.as_str()));
    if let Some(partition) = mapping.partition_column.as_deref() {
        if !columns.contains(&partition) {
            columns.push(partition);
        }
    }
    columns.push(mapping.hash_column.as_str());

    let placeholder_row = format!("({})", vec!["?"; columns.len()].join(", "));
    let placeholders = vec![placeholder_row; rows.len()].join(", ");
    let sql = format!(
        "{verb} INTO {table} ({cols}) VALUES {placeholders}",
        verb = policy.insert_verb(),
        table = mapping.table,
        cols = columns.join(", "),
    );

    let mut args = Vec::with_capacity(rows.len() * columns.len());
    for keyed in rows {
        args.push(WireValue::Integer {
            value: keyed.id.to_string(),
        });
        for column in &columns[1..columns.len() - 1] {
            let value = keyed
                .record
                .get(column)
                .map(WireValue::from)
                .unwrap_or(WireValue::Null);
            args.push(value);
        }
        args.push(WireValue::Text {
            value: keyed.hash.as_str().to_string(),
        });
    }
    Stmt { sql, args }
}

/// Upload one batch: a single pipelined request carrying all of its
/// statements, retried wholesale on transient failure with exponential
/// backoff. Statement-level rejections inside an otherwise successful
/// response are deterministic and are counted without retrying.
pub async fn upload_batch(
    client: &RemoteClient,
    mapping: &MappingConfig,
    policy: ConflictPolicy,
    backoff: BackoffPolicy,
    batch: &PlannedBatch<KeyedRecord>,
) -> BatchResult {
    let rows = batch.row_count();
    let mut entries: Vec<PipelineEntry> = batch
        .statements
        .iter()
        .map(|chunk| PipelineEntry::Execute {
            stmt: build_insert(mapping, policy, chunk),
        })
        .collect();
    entries.push(PipelineEntry::Close);

    let mut attempts = 0usize;
    loop {
        attempts += 1;
        let outcome = client.pipeline(entries.clone()).await.and_then(|outcomes| {
            if outcomes.len() <= batch.statements.len() {
                Err(RemoteError::Protocol(format!(
                    "{} outcomes for {} statements",
                    outcomes.len(),
                    batch.statements.len()
                )))
            } else {
                Ok(outcomes)
            }
        });

        match outcome {
            Ok(outcomes) => {
                let mut inserted = 0u64;
                let mut errored = 0u64;
                let mut errors = Vec::new();
                for (chunk, outcome) in batch.statements.iter().zip(outcomes) {
                    match outcome {
                        StatementOutcome::Ok { .. } => inserted += chunk.len() as u64,
                        StatementOutcome::Error { error } => {
                            errored += chunk.len() as u64;
                            errors.push(error.message);
                        }
                    }
                }
                return BatchResult {
                    batch_index: batch.index,
                    rows,
                    inserted,
                    errored,
                    attempts,
                    state: BatchState::Success,
                    errors,
                };
            }
            Err(err) if err.is_transient() && attempts <= backoff.max_retries => {
                let delay = backoff.delay_for_attempt(attempts - 1);
                warn!(
                    batch = batch.index,
                    attempt = attempts,
                    %err,
                    ?delay,
                    "transient batch failure; backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                return BatchResult {
                    batch_index: batch.index,
                    rows,
                    inserted: 0,
                    errored: rows as u64,
                    attempts,
                    state: BatchState::Failed,
                    errors: vec![err.to_string()],
                };
            }
        }
    }
}

/// Aggregates batch results in completion order and renders one progress
/// line per completed batch.
#[derive(Debug)]
pub struct ProgressTracker {
    started: Instant,
    total_rows: u64,
    total_batches: usize,
    rows_done: AtomicU64,
    inserted: AtomicU64,
    errored: AtomicU64,
    batches_done: AtomicU64,
    failed_batches: AtomicU64,
}

impl ProgressTracker {
    pub fn new(total_rows: u64, total_batches: usize) -> Self {
        Self {
            started: Instant::now(),
            total_rows,
            total_batches,
            rows_done: AtomicU64::new(0),
            inserted: AtomicU64::new(0),
            errored: AtomicU64::new(0),
            batches_done: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    pub fn record(&self, result: &BatchResult) {
        let rows_done =
            self.rows_done.fetch_add(result.rows as u64, Ordering::Relaxed) + result.rows as u64;
        self.inserted.fetch_add(result.inserted, Ordering::Relaxed);
        self.errored.fetch_add(result.errored, Ordering::Relaxed);
        let done = self.batches_done.fetch_add(1, Ordering::Relaxed) + 1;
        if result.state != BatchState::Success {
            self.failed_batches.fetch_add(1, Ordering::Relaxed);
        }

        let elapsed = self.started.elapsed().as_secs_f64();
        let throughput = if elapsed > 0.0 {
            rows_done as f64 / elapsed
        } else {
            0.0
        };
        let remaining = self.total_rows.saturating_sub(rows_done);
        let eta = if throughput > 0.0 {
            format!("{:.0}s", remaining as f64 / throughput)
        } else {
            "n/a".to_string()
        };
        let marker = match result.state {
            BatchState::Success => "OK",
            BatchState::Failed => "ERR",
            BatchState::Cancelled => "CANCELLED",
        };

        println!(
            "[{done}/{total}] {marker} batch {index}: inserted={inserted} errored={errored} attempts={attempts} | {rows_done}/{total_rows} rows, {throughput:.1} rows/s, eta {eta}",
            total = self.total_batches,
            index = result.batch_index,
            inserted = result.inserted,
            errored = result.errored,
            attempts = result.attempts,
            total_rows = self.total_rows,
        );
    }

    pub fn inserted(&self) -> u64 {
        self.inserted.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn rows_done(&self) -> u64 {
        self.rows_done.load(Ordering::Relaxed)
    }

    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub partition_key: Option<String>,
    pub csv_rows: usize,
    pub skipped_duplicates: usize,
    pub unseen_rows: usize,
    pub batches: usize,
    pub first_id: Option<i64>,
    pub inserted: u64,
    pub errored: u64,
    pub failed_batches: usize,
    pub index_complete: bool,
    pub elapsed_secs: f64,
    pub rows_per_sec: f64,
}

pub struct SyncPipeline {
    config: SyncConfig,
    mapping: MappingConfig,
    client: RemoteClient,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig, mapping: MappingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        mapping.validate()?;
        if config.partition_key.is_some() && mapping.partition_column.is_none() {
            return Err(ConfigError::PartitionNotMapped);
        }

        let client = RemoteClient::new(RemoteConfig {
            base_url: config.database_url.clone(),
            auth_token: config.auth_token.clone(),
            timeout: config.http_timeout,
        })
        .map_err(|err| ConfigError::Client(err.to_string()))?;

        Ok(Self {
            config,
            mapping,
            client,
        })
    }

    pub fn from_files(config: SyncConfig, mapping_path: &Path) -> Result<Self, ConfigError> {
        let mapping = MappingConfig::load(mapping_path)?;
        Self::new(config, mapping)
    }

    /// One synchronization run: CSV -> dedup -> plan -> reserve IDs ->
    /// parallel upload -> summary. `cancel` is only honored between
    /// batches, never while a request is in flight.
    pub async fn run_once(&self, cancel: CancellationToken) -> Result<SyncRunSummary> {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            csv = %self.config.csv_path.display(),
            partition = self.config.partition_key.as_deref().unwrap_or("-"),
            dry_run = self.config.dry_run,
            "starting import run"
        );

        let mut records = read_records(&self.config.csv_path, &self.mapping)
            .with_context(|| format!("reading {}", self.config.csv_path.display()))?;
        let csv_rows = records.len();

        if let (Some(column), Some(value)) = (
            self.mapping.partition_column.as_deref(),
            self.config.partition_key.as_deref(),
        ) {
            for record in &mut records {
                record.insert(column.to_string(), SqlValue::Text(value.to_string()));
            }
        }

        let index = IdentityIndex::load_existing(
            &self.client,
            &self.mapping,
            self.config.partition_key.as_deref(),
            self.config.index_page_size,
        )
        .await;

        // Drop rows already present at the destination, plus intra-file
        // duplicates: the first occurrence wins.
        let mut seen: HashSet<RecordHash> = HashSet::new();
        let mut unseen: Vec<(RecordHash, Record)> = Vec::new();
        for record in records {
            let hash = hash_record(&record, &self.mapping.hash_fields);
            if index.contains(&hash) || !seen.insert(hash.clone()) {
                continue;
            }
            unseen.push((hash, record));
        }
        let skipped_duplicates = csv_rows - unseen.len();
        let unseen_rows = unseen.len();

        if self.config.dry_run {
            let batches = plan_batches(unseen, self.config.batch_size, self.config.stmt_limit);
            info!(unseen_rows, skipped_duplicates, "dry run; no writes performed");
            return Ok(self.summary(
                run_id,
                started_at,
                started,
                csv_rows,
                skipped_duplicates,
                unseen_rows,
                batches.len(),
                None,
                0,
                0,
                0,
                index.is_complete(),
            ));
        }

        if unseen.is_empty() {
            info!("nothing to upload; destination already has every input row");
            return Ok(self.summary(
                run_id,
                started_at,
                started,
                csv_rows,
                skipped_duplicates,
                0,
                0,
                None,
                0,
                0,
                0,
                index.is_complete(),
            ));
        }

        let first_id = reserve_ids(&self.client, &self.mapping, unseen_rows).await?;
        let keyed = assign_ids(unseen, first_id);
        let total_rows = keyed.len() as u64;
        let batches = plan_batches(keyed, self.config.batch_size, self.config.stmt_limit);
        let total_batches = batches.len();

        let tracker = Arc::new(ProgressTracker::new(total_rows, total_batches));
        let limit = Arc::new(Semaphore::new(self.config.workers));
        let mut tasks = JoinSet::new();

        for batch in batches {
            let client = self.client.clone();
            let mapping = self.mapping.clone();
            let policy = self.config.conflict;
            let backoff = self.config.backoff;
            let limit = limit.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = limit.acquire_owned().await.expect("semaphore not closed");
                if cancel.is_cancelled() {
                    let rows = batch.row_count();
                    return BatchResult {
                        batch_index: batch.index,
                        rows,
                        inserted: 0,
                        errored: rows as u64,
                        attempts: 0,
                        state: BatchState::Cancelled,
                        errors: vec!["run cancelled before dispatch".to_string()],
                    };
                }
                upload_batch(&client, &mapping, policy, backoff, &batch).await
            });
        }

        let mut failed_batches = 0usize;
        while let Some(joined) = tasks.join_next().await {
            let result = joined.context("upload worker panicked")?;
            if result.state != BatchState::Success {
                failed_batches += 1;
            }
            tracker.record(&result);
        }

        let inserted = tracker.inserted();
        let errored = tracker.errored();
        info!(inserted, errored, failed_batches, "import run finished");
        Ok(self.summary(
            run_id,
            started_at,
            started,
            csv_rows,
            skipped_duplicates,
            unseen_rows,
            total_batches,
            Some(first_id),
            inserted,
            errored,
            failed_batches,
            index.is_complete(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn summary(
        &self,
        run_id: Uuid,
        started_at: DateTime<Utc>,
        started: Instant,
        csv_rows: usize,
        skipped_duplicates: usize,
        unseen_rows: usize,
        batches: usize,
        first_id: Option<i64>,
        inserted: u64,
        errored: u64,
        failed_batches: usize,
        index_complete: bool,
    ) -> SyncRunSummary {
        let elapsed_secs = started.elapsed().as_secs_f64();
        let rows_per_sec = if elapsed_secs > 0.0 && inserted + errored > 0 {
            (inserted + errored) as f64 / elapsed_secs
        } else {
            0.0
        };
        SyncRunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            partition_key: self.config.partition_key.clone(),
            csv_rows,
            skipped_duplicates,
            unseen_rows,
            batches,
            first_id,
            inserted,
            errored,
            failed_batches,
            index_complete,
            elapsed_secs,
            rows_per_sec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobfeed_csv::{ColumnKind, ColumnSpec};

    fn mapping() -> MappingConfig {
        MappingConfig {
            table: "job_postings".into(),
            id_column: "id".into(),
            hash_column: "content_hash".into(),
            partition_column: Some("workstyle".into()),
            hash_fields: vec!["company".into(), "title".into()],
            columns: vec![
                ColumnSpec {
                    csv: "Company Name".into(),
                    field: "company".into(),
                    kind: ColumnKind::Text,
                },
                ColumnSpec {
                    csv: "Job Title".into(),
                    field: "title".into(),
                    kind: ColumnKind::Text,
                },
            ],
        }
    }

    fn keyed(id: i64, company: &str, title: &str) -> KeyedRecord {
        let record = Record::from_pairs([
            ("company".to_string(), SqlValue::Text(company.into())),
            ("title".to_string(), SqlValue::Text(title.into())),
        ]);
        let hash = hash_record(&record, &["company".to_string(), "title".to_string()]);
        KeyedRecord { id, hash, record }
    }

    #[test]
    fn insert_sql_lists_id_data_partition_and_hash_columns() {
        let rows = vec![keyed(101, "Acme", "Welder"), keyed(102, "Globex", "Fitter")];
        let stmt = build_insert(&mapping(), ConflictPolicy::IgnoreByHash, &rows);

        assert_eq!(
            stmt.sql,
            "INSERT OR IGNORE INTO job_postings (id, company, title, workstyle, content_hash) \
             VALUES (?, ?, ?, ?, ?), (?, ?, ?, ?, ?)"
        );
        assert_eq!(stmt.args.len(), 10);
        assert_eq!(stmt.args[0], WireValue::Integer { value: "101".into() });
        assert_eq!(stmt.args[1], WireValue::Text { value: "Acme".into() });
        // Unset partition column is null, hash comes last.
        assert_eq!(stmt.args[3], WireValue::Null);
        assert!(matches!(&stmt.args[4], WireValue::Text { value } if value.len() == 16));
    }

    #[test]
    fn refresh_mode_switches_the_insert_verb() {
        let rows = vec![keyed(7, "Acme", "Welder")];
        let stmt = build_insert(&mapping(), ConflictPolicy::ReplaceById, &rows);
        assert!(stmt.sql.starts_with("INSERT OR REPLACE INTO job_postings"));
    }

    #[test]
    fn partition_filter_requires_both_column_and_key() {
        let (filter, args) = partition_filter(&mapping(), Some("onsite"));
        assert_eq!(filter, " WHERE workstyle = ?");
        assert_eq!(args, vec![WireValue::Text { value: "onsite".into() }]);

        let (filter, args) = partition_filter(&mapping(), None);
        assert!(filter.is_empty());
        assert!(args.is_empty());

        let mut unpartitioned = mapping();
        unpartitioned.partition_column = None;
        let (filter, _) = partition_filter(&unpartitioned, Some("onsite"));
        assert!(filter.is_empty());
    }

    #[test]
    fn tracker_accumulates_results_in_any_completion_order() {
        let tracker = ProgressTracker::new(300, 3);
        tracker.record(&BatchResult {
            batch_index: 2,
            rows: 100,
            inserted: 98,
            errored: 2,
            attempts: 1,
            state: BatchState::Success,
            errors: vec!["constraint".into()],
        });
        tracker.record(&BatchResult {
            batch_index: 0,
            rows: 100,
            inserted: 0,
            errored: 100,
            attempts: 4,
            state: BatchState::Failed,
            errors: vec!["timeout".into()],
        });

        assert_eq!(tracker.rows_done(), 200);
        assert_eq!(tracker.inserted(), 98);
        assert_eq!(tracker.errored(), 102);
        assert_eq!(tracker.failed_batches(), 1);
    }

    #[test]
    fn config_validation_rejects_zero_bounds_and_missing_csv() {
        let missing = SyncConfig::new("http://db", "token", "/definitely/not/here.csv");
        assert!(matches!(missing.validate(), Err(ConfigError::CsvNotFound(_))));

        let file = tempfile::NamedTempFile::new().expect("temp csv");
        let mut config = SyncConfig::new("http://db", "token", file.path());
        config.batch_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::NonPositive("batch_size"))));
    }

    #[test]
    fn pipeline_rejects_partition_key_without_partition_column() {
        let file = tempfile::NamedTempFile::new().expect("temp csv");
        let mut config = SyncConfig::new("http://db", "token", file.path());
        config.partition_key = Some("onsite".into());

        let mut unpartitioned = mapping();
        unpartitioned.partition_column = None;

        let err = SyncPipeline::new(config, unpartitioned).err().expect("config error");
        assert!(matches!(err, ConfigError::PartitionNotMapped));
    }
}
