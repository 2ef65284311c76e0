//! Live stage and group streams, read the way a client would.

use super::test_utils::{executor, no_retry_settings, reply_for, stage_responder, COUNTERFACTUAL_REPLY};
use casework::generation::GenerationClient;
use casework::provider::{ScriptStep, ScriptedFailure, ScriptedProvider};
use casework::store::InMemoryResultStore;
use casework::stream::Event;
use casework::workflow::{prompts, ExecutorSettings, StageExecutor};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

const CASE: &str = "72F with two days of confusion and a temperature of 38.9 C.";

async fn collect(exec: &StageExecutor, stage: &str) -> Vec<Event> {
    exec.stream("case-1", stage, CancellationToken::new())
        .await
        .unwrap()
        .into_events()
        .collect()
        .await
}

fn kinds(events: &[Event]) -> Vec<&str> {
    events.iter().map(|e| e.event_type.as_str()).collect()
}

fn chunk_text(events: &[Event], stage_id: &str) -> String {
    events
        .iter()
        .filter(|e| e.event_type == "chunk" && e.data["stage_id"] == stage_id)
        .filter_map(|e| e.data["content"].as_str())
        .collect()
}

#[tokio::test]
async fn test_group_stream_reports_each_stage_then_the_summary() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();

    let events = collect(&exec, "diagnosis_group").await;
    let kinds = kinds(&events);

    assert_eq!(kinds[0], "start");
    assert_eq!(events[0].data["stage_id"], "diagnosis_group");
    assert_eq!(events[0].data["stage_name"], "Diagnosis");
    assert_eq!(events[1].data["stage_id"], "counterfactual");

    let progress: Vec<f64> = events
        .iter()
        .filter(|e| e.event_type == "progress")
        .map(|e| e.data["progress_percent"].as_f64().unwrap())
        .collect();
    assert_eq!(progress, vec![50.0, 100.0]);

    let stage_completes: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == "stage_complete")
        .map(|e| e.data["stage_id"].as_str().unwrap())
        .collect();
    assert_eq!(stage_completes, vec!["counterfactual", "diagnosis", "diagnosis_group"]);

    let last = events.last().unwrap();
    assert_eq!(last.data["next_stage"], "treatment_planning_group");
    assert_eq!(last.data["summary"], "SUMMARY diagnosis");
    assert_eq!(&kinds[kinds.len() - 2..], &["end", "stage_complete"]);

    assert_eq!(chunk_text(&events, "counterfactual"), COUNTERFACTUAL_REPLY);
    assert_eq!(chunk_text(&events, "diagnosis_group"), "SUMMARY diagnosis");

    let status = exec.status("case-1").await.unwrap();
    assert_eq!(status.case.current_stage, "treatment_planning_group");
    let rollup = status
        .results
        .iter()
        .find(|r| r.stage_name == "diagnosis_group")
        .unwrap();
    assert_eq!(rollup.result["summary"], "SUMMARY diagnosis");
}

#[tokio::test]
async fn test_failed_extraction_stream_is_start_then_error() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Transport)],
    );
    let exec = executor(provider);
    exec.create_case("case-1", CASE).await.unwrap();

    let wire: Vec<String> = exec
        .stream("case-1", "extraction", CancellationToken::new())
        .await
        .unwrap()
        .into_wire()
        .collect()
        .await;

    assert_eq!(wire.len(), 2);
    assert!(wire[0].starts_with("event: start\nid: start-"));
    assert!(wire[1].starts_with("event: error\nid: error-"));
    assert!(wire[1].contains("\"code\":\"transport_error\""));
    assert!(wire[1].contains("\"stage_id\":\"extraction\""));
    assert!(wire.iter().all(|frame| frame.ends_with("\n\n")));

    let status = exec.status("case-1").await.unwrap();
    let stored = status
        .results
        .iter()
        .find(|r| r.stage_name == "extraction")
        .unwrap();
    assert_eq!(stored.result["error"]["code"], "transport_error");
}

#[tokio::test]
async fn test_initial_stream_chunks_the_case_text() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();

    let events = collect(&exec, "initial").await;
    assert_eq!(chunk_text(&events, "initial"), CASE);

    let mut expected_position = 0;
    for chunk in events.iter().filter(|e| e.event_type == "chunk") {
        assert_eq!(chunk.data["position"], expected_position);
        assert_eq!(chunk.data["is_word_boundary"], true);
        expected_position += chunk.data["length"].as_u64().unwrap();
    }
    assert_eq!(expected_position as usize, CASE.chars().count());
    assert_eq!(kinds(&events).last().copied(), Some("stage_complete"));
}

#[tokio::test]
async fn test_first_event_carries_retry_hint() {
    let client = GenerationClient::new(Arc::new(stage_responder()), no_retry_settings());
    let exec = StageExecutor::new(
        Arc::new(client),
        Arc::new(InMemoryResultStore::new()),
        ExecutorSettings {
            retry_hint_ms: Some(3000),
            ..ExecutorSettings::default()
        },
    );
    exec.create_case("case-1", CASE).await.unwrap();

    let wire: Vec<String> = exec
        .stream("case-1", "extraction", CancellationToken::new())
        .await
        .unwrap()
        .into_wire()
        .collect()
        .await;
    assert!(wire[0].contains("\nretry: 3000\n"));
    assert!(wire[1..].iter().all(|frame| !frame.contains("\nretry: ")));
}

#[tokio::test]
async fn test_group_summary_failure_is_reported_not_completed() {
    let summary_line = prompts::DIAGNOSIS_SUMMARY.lines().next().unwrap_or_default();
    let provider = ScriptedProvider::with_responder("scripted-model", move |messages| {
        let prompt = messages.first().map(|m| m.content.as_str()).unwrap_or("");
        if prompt.contains(summary_line) {
            ScriptStep::Fail(ScriptedFailure::Malformed)
        } else {
            ScriptStep::Reply(reply_for(prompt).to_string())
        }
    });
    let exec = executor(provider);
    exec.create_case("case-1", CASE).await.unwrap();

    let events = collect(&exec, "diagnosis_group").await;
    let last = events.last().unwrap();
    assert_eq!(last.event_type, "error");
    assert_eq!(last.data["stage_id"], "diagnosis_group");
    assert_eq!(last.data["code"], "malformed_response_error");
    assert!(!events
        .iter()
        .any(|e| e.event_type == "stage_complete" && e.data["stage_id"] == "diagnosis_group"));

    let status = exec.status("case-1").await.unwrap();
    let rollup = status
        .results
        .iter()
        .find(|r| r.stage_name == "diagnosis_group")
        .unwrap();
    assert!(rollup.result["summary"].is_null());
    assert_eq!(rollup.result["summary_error"]["code"], "malformed_response_error");
}
