//! End-to-end behaviour of the query workflow with stub collaborators.

mod common;

use common::{eventually, StreamMode, Stubs};
use knowledge_assistant::error::{ErrorKind, Node, WorkflowError};
use knowledge_assistant::models::{StreamMetadata, WorkflowEvent};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Barrier, Notify};
use tokio_stream::StreamExt;

const QUERY: &str = "what is the capital of France?";

// ─── Routing ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_routing_runs_exactly_the_selected_branches() {
    for (needs_context, needs_memory) in [(false, false), (true, false), (false, true), (true, true)] {
        let stubs = Stubs::new(needs_context, needs_memory);
        let outcome = stubs.workflow().run(QUERY, Some(1)).await.unwrap();

        assert_eq!(
            stubs.retriever.calls.load(Ordering::SeqCst),
            needs_context as usize,
            "context branch for ({}, {})",
            needs_context,
            needs_memory
        );
        assert_eq!(
            stubs.memory.calls.load(Ordering::SeqCst),
            needs_memory as usize,
            "memory branch for ({}, {})",
            needs_context,
            needs_memory
        );
        assert_eq!(stubs.generator.calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.context_used, needs_context);
        assert_eq!(outcome.memory_used, needs_memory);

        let request = stubs.last_request();
        assert_eq!(request.context.is_empty(), !needs_context);
        assert_eq!(request.memory.is_empty(), !needs_memory);
    }
}

#[tokio::test]
async fn test_branches_run_concurrently() {
    let stubs = Stubs::new(true, true);
    // Each branch blocks until the other one has started.
    let barrier = Arc::new(Barrier::new(2));
    *stubs.retriever.barrier.lock().unwrap() = Some(barrier.clone());
    *stubs.memory.barrier.lock().unwrap() = Some(barrier);

    let outcome = tokio::time::timeout(Duration::from_secs(5), stubs.workflow().run(QUERY, Some(1)))
        .await
        .expect("branches did not run concurrently")
        .unwrap();
    assert_eq!(outcome.answer, "Paris.");
}

#[tokio::test]
async fn test_generate_receives_joined_outputs() {
    let stubs = Stubs::new(true, true);
    *stubs.retriever.snippets.lock().unwrap() =
        vec!["France's capital is Paris.".into(), "Paris is on the Seine.".into()];

    stubs.workflow().run(QUERY, Some(1)).await.unwrap();

    let request = stubs.last_request();
    assert_eq!(request.query, "what is the capital of france?");
    assert_eq!(request.context, "France's capital is Paris.\n\nParis is on the Seine.");
    assert_eq!(request.memory, "User: hi\nAssistant: Hello.");

    let (query, top_k) = stubs.retriever.last_query.lock().unwrap().clone().unwrap();
    assert_eq!(query, "what is the capital of france?");
    assert_eq!(top_k, 5);
}

#[tokio::test]
async fn test_memory_skipped_without_user() {
    let stubs = Stubs::new(false, true);
    let outcome = stubs.workflow().run(QUERY, None).await.unwrap();

    assert_eq!(stubs.memory.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stubs.last_request().memory, "");
    assert_eq!(outcome.answer, "Paris.");
}

// ─── Failure policy ─────────────────────────────────────────────────

#[tokio::test]
async fn test_context_failure_is_not_fatal() {
    let stubs = Stubs::new(true, true);
    stubs.retriever.fail.store(true, Ordering::SeqCst);

    let outcome = stubs.workflow().run(QUERY, Some(1)).await.unwrap();
    assert_eq!(outcome.answer, "Paris.");
    let request = stubs.last_request();
    assert_eq!(request.context, "");
    assert_eq!(request.memory, "User: hi\nAssistant: Hello.");
}

#[tokio::test]
async fn test_memory_failure_is_not_fatal() {
    let stubs = Stubs::new(true, true);
    stubs.memory.fail.store(true, Ordering::SeqCst);

    let outcome = stubs.workflow().run(QUERY, Some(1)).await.unwrap();
    assert_eq!(outcome.answer, "Paris.");
    let request = stubs.last_request();
    assert_eq!(request.context, "France's capital is Paris.");
    assert_eq!(request.memory, "");
    assert_eq!(stubs.audit.record_count(), 1);
    assert_eq!(stubs.audit.records.lock().unwrap()[0].past_memory, "");
}

#[tokio::test]
async fn test_classify_failure_aborts() {
    let stubs = Stubs::new(true, true);
    stubs.classifier.fail.store(true, Ordering::SeqCst);

    let err = stubs.workflow().run(QUERY, Some(1)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Upstream { node: Node::Classify, .. }));
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert!(!err.user_message().contains("503"));

    assert_eq!(stubs.retriever.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stubs.generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stubs.audit.turn_count(), 0);
}

#[tokio::test]
async fn test_generate_failure_aborts_without_logging() {
    let stubs = Stubs::new(true, false);
    stubs.generator.fail.store(true, Ordering::SeqCst);

    let err = stubs.workflow().run(QUERY, Some(1)).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Upstream { node: Node::Generate, .. }));
    assert_eq!(stubs.audit.turn_count(), 0);
    assert_eq!(stubs.audit.record_count(), 0);
}

#[tokio::test]
async fn test_invalid_queries_rejected_before_graph() {
    let stubs = Stubs::new(true, true);
    let workflow = stubs.workflow();
    let too_long = "x".repeat(5001);

    for query in ["", "   \n\t", too_long.as_str()] {
        let err = workflow.run(query, Some(1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(err.code(), "bad_request");
    }
    assert_eq!(stubs.classifier.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_log_failure_does_not_block_answer() {
    let stubs = Stubs::new(false, false);
    stubs.audit.fail.store(true, Ordering::SeqCst);

    let outcome = stubs.workflow().run(QUERY, Some(1)).await.unwrap();
    assert_eq!(outcome.answer, "Paris.");
}

// ─── Outcome and logging ────────────────────────────────────────────

#[tokio::test]
async fn test_end_to_end_example() {
    let stubs = Stubs::new(true, false);
    let outcome = stubs.workflow().run(QUERY, None).await.unwrap();

    assert_eq!(outcome.query, QUERY);
    assert_eq!(outcome.normalized_query, "what is the capital of france?");
    assert!(outcome.context_used);
    assert!(!outcome.memory_used);
    assert_eq!(outcome.answer, "Paris.");
}

#[tokio::test]
async fn test_logs_turn_and_audit_record() {
    let stubs = Stubs::new(true, false);
    stubs.workflow().run("  What is the Capital of France?", Some(7)).await.unwrap();

    let turns = stubs.audit.turns.lock().unwrap().clone();
    assert_eq!(
        turns,
        vec![(7, "  What is the Capital of France?".to_string(), "Paris.".to_string())]
    );

    let records = stubs.audit.records.lock().unwrap().clone();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].user_id, 7);
    assert_eq!(records[0].processed_query, "what is the capital of france?");
    assert_eq!(records[0].context, "France's capital is Paris.");
    assert_eq!(records[0].past_memory, "");
    assert_eq!(records[0].llm_response, "Paris.");
}

#[tokio::test]
async fn test_anonymous_requests_not_logged() {
    let stubs = Stubs::new(true, true);
    stubs.workflow().run(QUERY, None).await.unwrap();
    assert_eq!(stubs.audit.turn_count(), 0);
    assert_eq!(stubs.audit.record_count(), 0);
}

// ─── Streaming ──────────────────────────────────────────────────────

async fn collect(workflow: &knowledge_assistant::workflow::Workflow, user_id: Option<i32>) -> Vec<WorkflowEvent> {
    workflow
        .run_stream(QUERY, user_id)
        .await
        .unwrap()
        .collect()
        .await
}

fn tokens(events: &[WorkflowEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            WorkflowEvent::Token(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_stream_matches_blocking_answer() {
    let stubs = Stubs::new(true, false);
    stubs.set_answer("Paris is the capital of France.");
    let workflow = stubs.workflow();

    let blocking = workflow.run(QUERY, None).await.unwrap();
    let events = collect(&workflow, None).await;

    assert_eq!(tokens(&events), blocking.answer);
    assert_eq!(tokens(&events), "Paris is the capital of France.");
    assert!(events.iter().filter(|e| matches!(e, WorkflowEvent::Token(_))).count() > 1);
}

#[tokio::test]
async fn test_stream_event_order() {
    let stubs = Stubs::new(true, false);
    stubs.set_answer("Paris is the capital of France.");
    let events = collect(&stubs.workflow(), None).await;

    assert_eq!(
        events.first(),
        Some(&WorkflowEvent::Metadata(StreamMetadata {
            normalized_query: "what is the capital of france?".into(),
            needs_context: true,
            needs_memory: false,
        }))
    );
    assert_eq!(events.last(), Some(&WorkflowEvent::done()));
    assert_eq!(
        events.iter().filter(|e| matches!(e, WorkflowEvent::Done(_))).count(),
        1
    );
    assert_eq!(stubs.generator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(stubs.generator.stream_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stream_logs_once_after_done() {
    let stubs = Stubs::new(false, false);
    stubs.set_answer("Paris is the capital of France.");
    collect(&stubs.workflow(), Some(3)).await;

    let audit = stubs.audit.clone();
    assert!(eventually(|| audit.record_count() == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stubs.audit.turn_count(), 1);
    assert_eq!(stubs.audit.record_count(), 1);
    assert_eq!(
        stubs.audit.turns.lock().unwrap()[0].2,
        "Paris is the capital of France."
    );
}

#[tokio::test]
async fn test_stream_generation_failure_emits_error() {
    let stubs = Stubs::new(false, false);
    stubs.generator.fail.store(true, Ordering::SeqCst);

    let events = collect(&stubs.workflow(), Some(3)).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(events[0], WorkflowEvent::Metadata(_)));
    match &events[1] {
        WorkflowEvent::Error(payload) => assert!(!payload.message.contains("500")),
        other => panic!("expected error event, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stubs.audit.turn_count(), 0);
}

#[tokio::test]
async fn test_stream_interrupted_midway() {
    let stubs = Stubs::new(false, false);
    stubs.set_answer("Paris is the capital of France.");
    *stubs.generator.mode.lock().unwrap() = StreamMode::FailAfter(2);

    let events = collect(&stubs.workflow(), Some(3)).await;
    assert_eq!(tokens(&events), "Paris is ");
    assert!(matches!(events.last(), Some(WorkflowEvent::Error(_))));
    assert!(!events.iter().any(|e| matches!(e, WorkflowEvent::Done(_))));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(stubs.audit.turn_count(), 0);
}

#[tokio::test]
async fn test_stream_disconnect_skips_log() {
    let stubs = Stubs::new(false, false);
    stubs.set_answer("Paris is the capital of France.");
    let gate = Arc::new(Notify::new());
    *stubs.generator.mode.lock().unwrap() = StreamMode::Gated(gate.clone());

    let mut events = stubs.workflow().run_stream(QUERY, Some(3)).await.unwrap();
    assert!(matches!(events.next().await, Some(WorkflowEvent::Metadata(_))));
    assert_eq!(events.next().await, Some(WorkflowEvent::Token("Paris ".into())));
    drop(events);
    gate.notify_one();

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(stubs.audit.turn_count(), 0);
    assert_eq!(stubs.audit.record_count(), 0);
}

#[test]
fn test_stream_finish_persists_before_runtime_shutdown() {
    let stubs = Stubs::new(false, false);
    stubs.audit.delay_ms.store(20, Ordering::SeqCst);
    let workflow = stubs.workflow();

    // Mirrors the CLI: drain the stream, wait for it, then tear the runtime down.
    let runtime = tokio::runtime::Runtime::new().unwrap();
    runtime.block_on(async {
        let mut events = workflow.run_stream(QUERY, Some(7)).await.unwrap();
        let mut last = None;
        while let Some(event) = events.next().await {
            last = Some(event);
        }
        assert_eq!(last, Some(WorkflowEvent::done()));
        events.finish().await;
    });
    drop(runtime);

    assert_eq!(stubs.audit.turn_count(), 1);
    assert_eq!(stubs.audit.record_count(), 1);
    assert_eq!(stubs.audit.turns.lock().unwrap()[0].0, 7);
}

#[tokio::test]
async fn test_stream_finish_after_disconnect_skips_log() {
    let stubs = Stubs::new(false, false);
    stubs.set_answer("Paris is the capital of France.");
    let gate = Arc::new(Notify::new());
    *stubs.generator.mode.lock().unwrap() = StreamMode::Gated(gate.clone());

    let mut events = stubs.workflow().run_stream(QUERY, Some(3)).await.unwrap();
    assert!(matches!(events.next().await, Some(WorkflowEvent::Metadata(_))));
    gate.notify_one();
    events.finish().await;

    assert_eq!(stubs.audit.turn_count(), 0);
}

#[tokio::test]
async fn test_stream_rejects_before_streaming() {
    let stubs = Stubs::new(true, true);
    stubs.classifier.fail.store(true, Ordering::SeqCst);

    let err = stubs.workflow().run_stream(QUERY, Some(1)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert_eq!(stubs.generator.stream_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stream_degrades_like_blocking() {
    let stubs = Stubs::new(true, true);
    stubs.retriever.fail.store(true, Ordering::SeqCst);

    let events = collect(&stubs.workflow(), Some(1)).await;
    assert_eq!(events.last(), Some(&WorkflowEvent::done()));
    assert_eq!(stubs.last_request().context, "");
}
