// tests/batch_fork.rs
//! Batches on duplicate-strategy workers, and the pool feeding run
//! persistence end to end.
#![cfg(unix)]

mod support;

use flowrun_engine::persistence::{
    EvaluationRetryPolicy, MemoryStore, SqliteStore, SqlQuery, SummaryExporter, SummarySettings,
};
use flowrun_engine::persistence::DocumentStore;
use flowrun_engine::recording::{FanoutExporter, SpanExporter};
use flowrun_engine::runtime::{
    BatchRequest, ConnectionSource, FlowReference, LineStatus, RunReference,
};
use flowrun_engine::EngineError;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use support::{collecting, fast_config, fork_launcher, init_tracing, pool, rows, template};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forked_workers_run_every_line() {
    init_tracing();
    let template = template(ConnectionSource::None);
    let (_, exporter) = collecting();
    let pool = pool(fork_launcher(&template), fast_config(3), template, exporter);

    let data: Vec<_> = (0..8).map(|i| json!({ "prompt": format!("line {}", i) })).collect();
    let (envelopes, stats) = pool
        .submit(BatchRequest::new("fork-chat", FlowReference::new("chat"), rows(data)))
        .unwrap()
        .collect()
        .await
        .unwrap();

    assert_eq!(envelopes.len(), 8);
    for (i, envelope) in envelopes.iter().enumerate() {
        assert_eq!(envelope.status, LineStatus::Success);
        assert_eq!(envelope.output, Some(json!(format!("echo: line {}", i))));
        // Root plus the LLM span
        assert_eq!(envelope.spans.len(), 2);
    }
    assert_eq!(stats.succeeded, 8);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_forked_crash_and_panic() {
    init_tracing();
    let template = template(ConnectionSource::None);
    let (_, exporter) = collecting();
    let pool = pool(fork_launcher(&template), fast_config(2), template, exporter);

    let (crashed, stats) = pool
        .submit(BatchRequest::new(
            "fork-crash",
            FlowReference::new("crash"),
            rows(vec![json!({"crash": true}), json!({"crash": false}), json!({"crash": false})]),
        ))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(crashed[0].status, LineStatus::SystemError);
    assert_eq!(crashed[1].status, LineStatus::Success);
    assert_eq!(crashed[2].status, LineStatus::Success);
    assert!(stats.workers_lost >= 1);

    // A panic is caught inside the worker and stays a user error
    let (panicked, stats) = pool
        .submit(BatchRequest::new(
            "fork-panic",
            FlowReference::new("panic"),
            rows(vec![json!({"message": "boom"})]),
        ))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(panicked[0].status, LineStatus::UserError);
    assert_eq!(panicked[0].error.as_ref().unwrap().kind, "Panic");
    assert_eq!(stats.workers_lost, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_duplicate_run_id_rejected_while_active() {
    init_tracing();
    let template = template(ConnectionSource::None);
    let (_, exporter) = collecting();
    let pool = pool(fork_launcher(&template), fast_config(1), template, exporter);

    let request = BatchRequest::new(
        "fork-dup",
        FlowReference::new("sleep"),
        rows(vec![json!({"seconds": 30.0})]),
    );
    let handle = pool.submit(request.clone()).unwrap();
    assert!(matches!(pool.submit(request), Err(EngineError::DuplicateRun(_))));

    handle.cancel();
    let (envelopes, _) = handle.collect().await.unwrap();
    assert_eq!(envelopes[0].status, LineStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_evaluation_batch_folds_into_main_run() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let summaries = Arc::new(SummaryExporter::spawn(
        store.clone(),
        SummarySettings {
            collection_id: "integration".to_string(),
            retry: EvaluationRetryPolicy {
                attempts: 20,
                backoff: Duration::from_millis(50),
            },
            ..SummarySettings::default()
        },
    ));
    let (collected, collecting_exporter) = collecting();
    let exporter: Arc<dyn SpanExporter> = Arc::new(
        FanoutExporter::new()
            .with(summaries.clone())
            .with(collecting_exporter),
    );

    let template = template(ConnectionSource::None);
    let pool = pool(fork_launcher(&template), fast_config(2), template, exporter);

    let data = || rows(vec![json!({"answer": "a"}), json!({"answer": "b"}), json!({"answer": "c"})]);
    pool.submit(BatchRequest::new("main-run", FlowReference::new("echo"), data()))
        .unwrap()
        .collect()
        .await
        .unwrap();
    pool.submit(
        BatchRequest::new("eval-run", FlowReference::new("echo"), data())
            .evaluating(RunReference::Batch("main-run".to_string())),
    )
    .unwrap()
    .collect()
    .await
    .unwrap();

    let persisted = summaries.shutdown().await;
    assert_eq!(persisted.failed, 0);
    assert_eq!(persisted.persisted, collected.len());

    for line in 0..3u64 {
        let found = store
            .query_items(&SqlQuery::equality(&[
                ("line_run_id", Value::Null),
                ("batch_run_id", json!("main-run")),
                ("line_number", json!(line)),
            ]))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        let record = &found[0];
        assert_eq!(record["status"], json!("Ok"));
        assert_eq!(record["session_id"], json!("integration"));

        let evaluation = &record["evaluations"]["eval-run"];
        assert_eq!(evaluation["batch_run_id"], json!("eval-run"));
        assert_eq!(evaluation["line_number"], json!(line));
    }
    // Three main records and three evaluation records
    assert_eq!(store.len(), 6);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_failed_lines_are_persisted_to_sqlite() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(&dir.path().join("runs.db")).await.unwrap());
    let summaries = Arc::new(SummaryExporter::spawn(store.clone(), SummarySettings::default()));

    let template = template(ConnectionSource::None);
    let pool = pool(fork_launcher(&template), fast_config(1), template, summaries.clone());

    let (envelopes, _) = pool
        .submit(BatchRequest::new(
            "sqlite-run",
            FlowReference::new("crash"),
            rows(vec![json!({"crash": true}), json!({"crash": false})]),
        ))
        .unwrap()
        .collect()
        .await
        .unwrap();
    assert_eq!(envelopes[0].status, LineStatus::SystemError);
    summaries.shutdown().await;

    let records = store
        .query_items(&SqlQuery::equality(&[("batch_run_id", json!("sqlite-run"))]))
        .await
        .unwrap();
    assert_eq!(records.len(), 2);

    let crashed = records
        .iter()
        .find(|record| record["line_number"] == json!(0))
        .unwrap();
    assert_eq!(crashed["status"], json!("Error"));
    assert_eq!(crashed["inputs"], json!({"crash": true}));
}
