//! End-to-end pipeline scenarios over the real queue and bus.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{Harness, ScriptedLlm, ScriptedOcr};
use ocrbase_app::pipeline::events::{JobEvent, job_channel};
use ocrbase_app::pipeline::job::{ErrorCode, JobKind, JobStatus};
use ocrbase_app::services::{FilePayload, ItemState, JobStore, SchemaInput, SubmitRequest};
use serde_json::json;

const TERMINAL_WAIT: Duration = Duration::from_secs(10);

fn direct_request(kind: JobKind, bytes: Vec<u8>, schema: Option<SchemaInput>) -> SubmitRequest {
    SubmitRequest {
        tenant_id: "org_a".to_string(),
        submitter_id: "user_a".to_string(),
        kind,
        file: Some(FilePayload {
            file_name: "doc.pdf".to_string(),
            mime_type: "application/pdf".to_string(),
            bytes: Bytes::from(bytes),
        }),
        url: None,
        file_name: None,
        mime_type: None,
        schema,
        hints: None,
        request_id: None,
    }
}

#[tokio::test]
async fn parse_happy_path_delivers_status_then_completed() {
    let harness = Harness::new(
        ScriptedOcr::ok("# Parsed document"),
        ScriptedLlm::always("{}"),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(direct_request(JobKind::Parse, vec![0_u8; 100 * 1024], None))
        .await
        .expect("submit");
    assert_eq!(job.status, JobStatus::Pending);

    // Subscribe before the worker runs, so the live event order is
    // observable: status(processing) then completed.
    let mut sub = harness
        .bus
        .subscribe(&job_channel(&job.id))
        .expect("subscribe");

    harness.start_queue();
    let terminal = harness.wait_terminal(&job.id, TERMINAL_WAIT).await;

    assert_eq!(terminal.status, JobStatus::Completed);
    assert_eq!(terminal.page_count, Some(1));
    assert_eq!(terminal.markdown_result.as_deref(), Some("# Parsed document"));
    assert!(terminal.json_result.is_none());
    assert!(terminal.processing_time_ms.is_some());
    assert!(terminal.error_code.is_none());

    let first = sub.recv().await.expect("status event");
    match first {
        JobEvent::Status { data, .. } => assert_eq!(data.status, JobStatus::Processing),
        other => panic!("expected status event, got {other:?}"),
    }
    let second = sub.recv().await.expect("completed event");
    match second {
        JobEvent::Completed { data, .. } => {
            assert_eq!(data.status, JobStatus::Completed);
            assert_eq!(data.markdown_result.as_deref(), Some("# Parsed document"));
        }
        other => panic!("expected completed event, got {other:?}"),
    }
}

#[tokio::test]
async fn extract_with_simple_schema_produces_typed_json() {
    let harness = Harness::new(
        ScriptedOcr::ok("# Invoice\nTotal: 12.50 from ACME"),
        ScriptedLlm::always(r#"{"total": 12.5, "vendor": "ACME"}"#),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(direct_request(
            JobKind::Extract,
            b"fake invoice image".to_vec(),
            Some(SchemaInput::Inline(json!({
                "total": "number",
                "vendor": "string"
            }))),
        ))
        .await
        .expect("submit");

    harness.start_queue();
    let terminal = harness.wait_terminal(&job.id, TERMINAL_WAIT).await;

    assert_eq!(terminal.status, JobStatus::Completed);
    let value = terminal.json_result_value().expect("json result");
    assert!(value["total"].is_number());
    assert!(value["vendor"].is_string());
    assert_eq!(value["vendor"], "ACME");
    assert!(terminal.llm_model.as_deref().is_some_and(|m| !m.is_empty()));
    assert_eq!(terminal.token_count, Some(11));
    assert!(terminal.markdown_result.is_some());
}

#[tokio::test]
async fn url_ingest_with_persistent_503_exhausts_attempts() {
    // A local origin that always answers 503.
    let app = axum::Router::new().route(
        "/down",
        axum::routing::get(|| async {
            (axum::http::StatusCode::SERVICE_UNAVAILABLE, "down")
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let harness = Harness::new(
        ScriptedOcr::ok("unused"),
        ScriptedLlm::always("{}"),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(SubmitRequest {
            tenant_id: "org_a".to_string(),
            submitter_id: "user_a".to_string(),
            kind: JobKind::Parse,
            file: None,
            url: Some(format!("http://{addr}/down")),
            file_name: None,
            mime_type: None,
            schema: None,
            hints: None,
            request_id: None,
        })
        .await
        .expect("submit");

    harness.start_queue();
    let terminal = harness.wait_terminal(&job.id, TERMINAL_WAIT).await;

    assert_eq!(terminal.status, JobStatus::Failed);
    assert_eq!(terminal.error_code, Some(ErrorCode::FetchFailed));
    assert_eq!(terminal.attempts_made, 3);
    assert!(terminal.markdown_result.is_none());
}

#[tokio::test]
async fn malformed_llm_json_twice_fails_without_queue_retry() {
    let harness = Harness::new(
        ScriptedOcr::ok("# Invoice"),
        ScriptedLlm::sequence(&["not json at all", "still { not json"]),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(direct_request(
            JobKind::Extract,
            b"invoice".to_vec(),
            Some(SchemaInput::Inline(json!({ "total": "number" }))),
        ))
        .await
        .expect("submit");

    harness.start_queue();
    let terminal = harness.wait_terminal(&job.id, TERMINAL_WAIT).await;

    assert_eq!(terminal.status, JobStatus::Failed);
    assert_eq!(terminal.error_code, Some(ErrorCode::LlmParseFailed));
    // Unrecoverable on the first queue attempt, regardless of max_attempts.
    assert_eq!(terminal.attempts_made, 1);
    // Markdown survived the failed extraction.
    assert_eq!(terminal.markdown_result.as_deref(), Some("# Invoice"));
}

#[tokio::test]
async fn transient_ocr_failure_retries_to_success() {
    let harness = Harness::new(
        ScriptedOcr::flaky("# Recovered", 2),
        ScriptedLlm::always("{}"),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(direct_request(JobKind::Parse, vec![1_u8; 64], None))
        .await
        .expect("submit");

    harness.start_queue();
    let terminal = harness.wait_terminal(&job.id, TERMINAL_WAIT).await;

    assert_eq!(terminal.status, JobStatus::Completed);
    assert_eq!(terminal.markdown_result.as_deref(), Some("# Recovered"));
    assert_eq!(terminal.attempts_made, 3);
    // Attempt errors were visible while retries remained; the successful
    // terminal write cleared them.
    assert!(terminal.error_code.is_none());
    assert!(terminal.error_message.is_none());

    let (state, _) = harness
        .queue
        .item_state(&job.id)
        .expect("queue state")
        .expect("item present");
    assert_eq!(state, ItemState::Done);
}

#[tokio::test]
async fn completed_event_implies_completed_snapshot() {
    let harness = Harness::new(
        ScriptedOcr::ok("# Doc"),
        ScriptedLlm::always("{}"),
        "http://localhost:0",
    );

    let job = harness
        .submission
        .submit(direct_request(JobKind::Parse, vec![2_u8; 64], None))
        .await
        .expect("submit");

    let mut sub = harness
        .bus
        .subscribe(&job_channel(&job.id))
        .expect("subscribe");
    harness.start_queue();

    loop {
        let event = sub.recv().await.expect("event");
        if let JobEvent::Completed { job_id, .. } = event {
            // The terminal event follows the durable write.
            let snapshot = harness
                .jobs
                .get(&job_id)
                .expect("store read")
                .expect("job present");
            assert_eq!(snapshot.status, JobStatus::Completed);
            break;
        }
    }
}
