//! End-to-end pipeline tests against a mocked batch-execute endpoint.

use std::io::Write;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use jobfeed_core::{hash_record, plan_batches, KeyedRecord, Record, SqlValue};
use jobfeed_csv::{ColumnKind, ColumnSpec, MappingConfig};
use jobfeed_remote::{BackoffPolicy, RemoteClient, RemoteConfig};
use jobfeed_sync::{
    reserve_ids, upload_batch, BatchState, ConflictPolicy, IdentityIndex, SyncConfig, SyncPipeline,
};

fn mapping() -> MappingConfig {
    MappingConfig {
        table: "job_postings".into(),
        id_column: "id".into(),
        hash_column: "content_hash".into(),
        partition_column: None,
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

fn client_for(server: &MockServer) -> RemoteClient {
    RemoteClient::new(RemoteConfig {
        base_url: server.uri(),
        auth_token: "test-token".into(),
        timeout: Duration::from_secs(5),
    })
    .expect("client")
}

fn fast_backoff(max_retries: usize) -> BackoffPolicy {
    BackoffPolicy {
        max_retries,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(40),
    }
}

fn ok_execute(rows: Value) -> Value {
    json!({"type": "ok", "response": {"type": "execute", "result": {
        "cols": [],
        "rows": rows,
        "affected_row_count": 0
    }}})
}

fn ok_close() -> Value {
    json!({"type": "ok", "response": {"type": "close"}})
}

fn pipeline_body(results: Vec<Value>) -> Value {
    json!({ "results": results })
}

fn text(value: &str) -> Value {
    json!({"type": "text", "value": value})
}

fn keyed_rows(count: usize, first_id: i64) -> Vec<KeyedRecord> {
    (0..count)
        .map(|i| {
            let record = Record::from_pairs([
                ("company".to_string(), SqlValue::Text(format!("Company {i}"))),
                ("title".to_string(), SqlValue::Text("Welder".into())),
            ]);
            let hash = hash_record(&record, &["company".to_string(), "title".to_string()]);
            KeyedRecord {
                id: first_id + i as i64,
                hash,
                record,
            }
        })
        .collect()
}

fn write_csv(rows: usize, present: usize) -> (tempfile::NamedTempFile, Vec<Value>) {
    let mut file = tempfile::NamedTempFile::new().expect("temp csv");
    writeln!(file, "Company Name,Job Title").expect("header");
    let mut existing_rows = Vec::new();
    for i in 0..rows {
        writeln!(file, "Company {i},Welder").expect("row");
        if i < present {
            existing_rows.push(json!([text(&format!("Company {i}")), text("Welder")]));
        }
    }
    file.flush().expect("flush");
    (file, existing_rows)
}

async fn mount_identity_page(server: &MockServer, rows: Vec<Value>) {
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .and(body_string_contains("SELECT company"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pipeline_body(vec![ok_execute(Value::Array(rows)), ok_close()])),
        )
        .mount(server)
        .await;
}

async fn mount_max_id(server: &MockServer, max: Option<i64>) {
    let value = match max {
        Some(max) => json!({"type": "integer", "value": max.to_string()}),
        None => json!({"type": "null"}),
    };
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .and(body_string_contains("SELECT MAX("))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pipeline_body(vec![ok_execute(json!([[value]])), ok_close()])),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn run_uploads_only_records_missing_from_the_identity_index() {
    let server = MockServer::start().await;
    let (csv, existing) = write_csv(10, 3);

    mount_identity_page(&server, existing).await;
    mount_max_id(&server, Some(100)).await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .and(body_string_contains("INSERT OR IGNORE"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pipeline_body(vec![ok_execute(json!([])), ok_close()])),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut config = SyncConfig::new(server.uri(), "test-token", csv.path());
    config.backoff = fast_backoff(2);
    let pipeline = SyncPipeline::new(config, mapping()).expect("pipeline");
    let summary = pipeline.run_once(CancellationToken::new()).await.expect("run");

    assert_eq!(summary.csv_rows, 10);
    assert_eq!(summary.skipped_duplicates, 3);
    assert_eq!(summary.unseen_rows, 7);
    assert_eq!(summary.inserted, 7);
    assert_eq!(summary.errored, 0);
    assert_eq!(summary.failed_batches, 0);
    assert_eq!(summary.first_id, Some(101));
    assert!(summary.index_complete);
    server.verify().await;
}

#[tokio::test]
async fn transient_failures_are_retried_with_backoff_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pipeline_body(vec![
            ok_execute(json!([])),
            ok_execute(json!([])),
            ok_close(),
        ])))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let batches = plan_batches(keyed_rows(4, 1), 4, 2);
    let result = upload_batch(
        &client,
        &mapping(),
        ConflictPolicy::IgnoreByHash,
        fast_backoff(3),
        &batches[0],
    )
    .await;

    assert_eq!(result.state, BatchState::Success);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.inserted, 4);
    assert_eq!(result.errored, 0);
}

#[tokio::test]
async fn a_permanently_failing_batch_stops_after_the_retry_budget() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let batches = plan_batches(keyed_rows(5, 1), 5, 5);
    let result = upload_batch(
        &client,
        &mapping(),
        ConflictPolicy::IgnoreByHash,
        fast_backoff(2),
        &batches[0],
    )
    .await;

    assert_eq!(result.state, BatchState::Failed);
    assert_eq!(result.attempts, 3);
    assert_eq!(result.inserted, 0);
    assert_eq!(result.errored, 5);
    assert!(result.errors[0].contains("503"));
    server.verify().await;
}

#[tokio::test]
async fn a_statement_rejection_is_counted_but_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pipeline_body(vec![
            ok_execute(json!([])),
            json!({"type": "error", "error": {"message": "SQLITE_CONSTRAINT: NOT NULL"}}),
            ok_close(),
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let client = client_for(&server);
    let batches = plan_batches(keyed_rows(100, 1), 100, 50);
    let result = upload_batch(
        &client,
        &mapping(),
        ConflictPolicy::IgnoreByHash,
        fast_backoff(3),
        &batches[0],
    )
    .await;

    assert_eq!(result.state, BatchState::Success);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.inserted, 50);
    assert_eq!(result.errored, 50);
    assert_eq!(result.inserted + result.errored, 100);
    assert!(result.errors[0].contains("SQLITE_CONSTRAINT"));
    server.verify().await;
}

#[tokio::test]
async fn dry_run_reports_projected_counts_and_writes_nothing() {
    let server = MockServer::start().await;
    let (csv, _) = write_csv(500, 0);
    mount_identity_page(&server, Vec::new()).await;

    let mut config = SyncConfig::new(server.uri(), "test-token", csv.path());
    config.dry_run = true;
    let pipeline = SyncPipeline::new(config, mapping()).expect("pipeline");
    let summary = pipeline.run_once(CancellationToken::new()).await.expect("run");

    assert!(summary.dry_run);
    assert_eq!(summary.unseen_rows, 500);
    assert_eq!(summary.batches, 1);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.first_id, None);

    let requests = server.received_requests().await.expect("recorded requests");
    assert!(!requests.is_empty());
    for request in requests {
        let body = String::from_utf8_lossy(&request.body).to_string();
        assert!(!body.contains("INSERT"), "dry run issued a write: {body}");
        assert!(!body.contains("MAX("), "dry run reserved ids: {body}");
    }
}

#[tokio::test]
async fn identity_index_degrades_instead_of_failing_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v2/pipeline"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let client = client_for(&server);
    let index = IdentityIndex::load_existing(&client, &mapping(), None, 1_000).await;

    assert!(!index.is_complete());
    assert!(index.is_empty());
}

#[tokio::test]
async fn reserved_range_starts_just_past_the_destination_maximum() {
    let server = MockServer::start().await;
    mount_max_id(&server, Some(41)).await;

    let client = client_for(&server);
    let first_id = reserve_ids(&client, &mapping(), 10).await.expect("reserve");
    assert_eq!(first_id, 42);
}

#[tokio::test]
async fn an_empty_table_reserves_from_one() {
    let server = MockServer::start().await;
    mount_max_id(&server, None).await;

    let client = client_for(&server);
    let first_id = reserve_ids(&client, &mapping(), 10).await.expect("reserve");
    assert_eq!(first_id, 1);
}

#[tokio::test]
async fn cancellation_skips_undispatched_batches_without_ambiguous_writes() {
    let server = MockServer::start().await;
    let (csv, _) = write_csv(4, 0);
    mount_identity_page(&server, Vec::new()).await;
    mount_max_id(&server, Some(0)).await;

    let mut config = SyncConfig::new(server.uri(), "test-token", csv.path());
    config.batch_size = 2;
    config.workers = 1;
    let pipeline = SyncPipeline::new(config, mapping()).expect("pipeline");

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = pipeline.run_once(cancel).await.expect("run");

    assert_eq!(summary.batches, 2);
    assert_eq!(summary.failed_batches, 2);
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.errored, 4);

    let requests = server.received_requests().await.expect("recorded requests");
    for request in requests {
        let body = String::from_utf8_lossy(&request.body).to_string();
        assert!(!body.contains("INSERT"), "cancelled run issued a write: {body}");
    }
}
