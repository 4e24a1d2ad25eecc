//! HTTP batch-execute client for the remote relational store.
//!
//! The destination is reachable only through a single HTTPS endpoint that
//! accepts a pipelined JSON body of SQL statements and returns a parallel
//! array of per-statement outcomes. This crate owns the wire encoding and
//! the transient/permanent error classification; retry scheduling lives
//! with the callers so the backoff policy stays unit-testable.

use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use jobfeed_core::SqlValue;

pub const CRATE_NAME: &str = "jobfeed-remote";

/// Wire form of a SQL value. Integers travel as decimal strings, matching
/// the remote API's JSON encoding; conversion to and from [`SqlValue`]
/// happens only at this boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireValue {
    Null,
    Text { value: String },
    Integer { value: String },
    Float { value: f64 },
}

impl From<&SqlValue> for WireValue {
    fn from(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => WireValue::Null,
            SqlValue::Text(s) => WireValue::Text { value: s.clone() },
            SqlValue::Integer(i) => WireValue::Integer { value: i.to_string() },
            SqlValue::Float(f) => WireValue::Float { value: *f },
        }
    }
}

impl WireValue {
    pub fn into_sql(self) -> Result<SqlValue, RemoteError> {
        Ok(match self {
            WireValue::Null => SqlValue::Null,
            WireValue::Text { value } => SqlValue::Text(value),
            WireValue::Integer { value } => SqlValue::Integer(value.parse().map_err(|_| {
                RemoteError::Protocol(format!("non-decimal integer value `{value}`"))
            })?),
            WireValue::Float { value } => SqlValue::Float(value),
        })
    }
}

/// One parameterized SQL statement.
#[derive(Debug, Clone, Serialize)]
pub struct Stmt {
    pub sql: String,
    pub args: Vec<WireValue>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PipelineEntry {
    Execute { stmt: Stmt },
    Close,
}

#[derive(Debug, Serialize)]
struct PipelineRequest {
    requests: Vec<PipelineEntry>,
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    #[serde(default)]
    results: Vec<StatementOutcome>,
}

/// Per-statement outcome, parallel to the submitted entries (the trailing
/// close included).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StatementOutcome {
    Ok { response: OutcomeResponse },
    Error { error: ApiError },
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutcomeResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub result: Option<StmtResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiError {
    pub message: String,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StmtResult {
    #[serde(default)]
    pub cols: Vec<Col>,
    #[serde(default)]
    pub rows: Vec<Vec<WireValue>>,
    #[serde(default)]
    pub affected_row_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Col {
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff schedule for transient upload failures.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    /// Delay before the retry following `attempt_index` failed attempts:
    /// `base_delay * 2^attempt_index`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("http status {status} from batch endpoint")]
    Status { status: u16 },
    #[error("statement rejected: {message}")]
    Statement { message: String },
    #[error("malformed response: {0}")]
    Protocol(String),
}

impl RemoteError {
    /// Whether the whole request is worth retrying. Statement rejections
    /// are deterministic and never transient; an undecodable body usually
    /// means an intermediary failed mid-response, so it is.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Transport(err) => {
                classify_reqwest_error(err) == RetryDisposition::Retryable
            }
            RemoteError::Status { status } => StatusCode::from_u16(*status)
                .map(|s| classify_status(s) == RetryDisposition::Retryable)
                .unwrap_or(false),
            RemoteError::Statement { .. } => false,
            RemoteError::Protocol(_) => true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub auth_token: String,
    pub timeout: Duration,
}

/// Thin client over the pipelined batch-execute endpoint. Each call is a
/// single HTTP request; callers own retries.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    client: reqwest::Client,
    endpoint: String,
    auth_token: String,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building http client")?;
        let endpoint = format!("{}/v2/pipeline", config.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            auth_token: config.auth_token,
        })
    }

    /// Submit one pipelined request. The returned outcomes are parallel to
    /// `entries`, including the trailing close.
    pub async fn pipeline(
        &self,
        entries: Vec<PipelineEntry>,
    ) -> Result<Vec<StatementOutcome>, RemoteError> {
        let body = PipelineRequest { requests: entries };
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
            });
        }

        let decoded: PipelineResponse = response
            .json()
            .await
            .map_err(|err| RemoteError::Protocol(err.to_string()))?;
        debug!(outcomes = decoded.results.len(), "pipeline response decoded");
        Ok(decoded.results)
    }

    /// Convenience for a single statement followed by close. A statement
    /// error comes back as [`RemoteError::Statement`].
    pub async fn execute(
        &self,
        sql: impl Into<String>,
        args: Vec<WireValue>,
    ) -> Result<StmtResult, RemoteError> {
        let entry = PipelineEntry::Execute {
            stmt: Stmt {
                sql: sql.into(),
                args,
            },
        };
        let mut outcomes = self.pipeline(vec![entry, PipelineEntry::Close]).await?;
        if outcomes.is_empty() {
            return Err(RemoteError::Protocol("empty results array".to_string()));
        }
        match outcomes.swap_remove(0) {
            StatementOutcome::Ok { response } => response
                .result
                .ok_or_else(|| RemoteError::Protocol("ok outcome without result".to_string())),
            StatementOutcome::Error { error } => Err(RemoteError::Statement {
                message: error.message,
            }),
        }
    }
}
