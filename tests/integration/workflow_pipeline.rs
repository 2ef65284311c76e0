//! Batch workflow scenarios: a case driven group by group to completion.

use super::test_utils::{
    executor, executor_with, responder_with_validation, stage_responder, VALIDATION_PENDING,
    VALIDATION_READY,
};
use casework::error::WorkflowError;
use casework::provider::{MessageRole, ScriptStep, ScriptedFailure, ScriptedProvider};
use casework::workflow::ErrorPolicy;
use futures::StreamExt;
use serde_json::Value;

const CASE: &str = "58M smoker, three days of fever and productive cough.";

#[tokio::test]
async fn test_case_runs_through_all_groups_to_complete() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();

    let first = exec.start("case-1").await.unwrap();
    assert!(first.succeeded(), "failures: {:?}", first.failures);
    assert_eq!(first.stage, "patient_case_analysis_group");
    assert_eq!(first.next_stage, "diagnosis_group");
    assert_eq!(first.result["summary"], "SUMMARY case analysis");
    let backend = first.result["backend_results"].as_object().unwrap();
    let names: Vec<&str> = backend.keys().map(String::as_str).collect();
    for stage in ["initial", "extraction", "causal_analysis", "validation"] {
        assert!(names.contains(&stage), "missing {stage} in {names:?}");
    }
    assert_eq!(backend["initial"]["case_text"], CASE);
    assert_eq!(backend["validation"]["ready"], true);

    let second = exec.process("case-1", "diagnosis_group", None).await.unwrap();
    assert_eq!(second.next_stage, "treatment_planning_group");
    assert_eq!(
        second.result["backend_results"]["diagnosis"]["diagnosis"],
        "DIAGNOSIS community acquired pneumonia"
    );
    assert!(second.result["backend_results"]["counterfactual"]["causal_sections"]
        .as_array()
        .map_or(false, |sections| sections.len() == 1));

    let third = exec
        .process("case-1", "treatment_planning_group", None)
        .await
        .unwrap();
    assert_eq!(third.next_stage, "complete");

    let status = exec.status("case-1").await.unwrap();
    assert!(status.case.complete);
    assert_eq!(status.case.current_stage, "complete");
    // Nine backend stages plus three rollups, one record each.
    assert_eq!(status.results.len(), 12);
    assert_eq!(status.results.first().unwrap().stage_name, "initial");

    let note = exec.generate_note("case-1").await.unwrap();
    assert_eq!(note, "NOTE Subjective: fever");
}

#[tokio::test]
async fn test_later_stages_see_earlier_outputs() {
    let provider = stage_responder();
    let exec = executor(provider.clone());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.process("case-1", "extraction", None).await.unwrap();
    exec.process("case-1", "causal_analysis", None).await.unwrap();

    let requests = provider.requests();
    let causal_prompt = requests
        .iter()
        .map(|messages| messages[0].content.as_str())
        .find(|prompt| prompt.contains("Build a causal understanding"))
        .unwrap();
    assert!(causal_prompt.contains("FACTORS fever, cough, 40 pack-years"));
}

#[tokio::test]
async fn test_validation_loop_holds_group_until_ready() {
    let exec = executor(responder_with_validation(VALIDATION_PENDING));
    exec.create_case("case-1", CASE).await.unwrap();

    let outcome = exec.start("case-1").await.unwrap();
    assert_eq!(outcome.next_stage, "patient_case_analysis_group");
    assert_eq!(
        outcome.result["backend_results"]["validation"]["next_stage"],
        "validation"
    );
    let status = exec.status("case-1").await.unwrap();
    assert_eq!(status.case.current_stage, "patient_case_analysis_group");
    assert!(!status.case.complete);
}

#[tokio::test]
async fn test_validation_loop_resolves_after_more_information() {
    // Each validation run makes two calls: the stage, then the group summary.
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![
            ScriptStep::Reply(VALIDATION_PENDING.to_string()),
            ScriptStep::Reply("SUMMARY pending".to_string()),
            ScriptStep::Reply(VALIDATION_READY.to_string()),
            ScriptStep::Reply("SUMMARY ready".to_string()),
        ],
    );
    let exec = executor(provider.clone());
    exec.create_case("case-1", CASE).await.unwrap();

    let looped = exec.process("case-1", "validation", None).await.unwrap();
    assert_eq!(looped.result["ready"], false);
    assert_eq!(looped.next_stage, "validation");

    exec.add_message("case-1", MessageRole::User, "WBC 14.2")
        .await
        .unwrap();
    let resolved = exec
        .process("case-1", "validation", Some("WBC 14.2"))
        .await
        .unwrap();
    assert_eq!(resolved.result["ready"], true);
    assert_eq!(resolved.next_stage, "counterfactual");

    // The follow-up message travels with the stage prompt as history.
    let third_call = &provider.requests()[2];
    assert!(third_call.iter().any(|m| m.content == "WBC 14.2"));
}

#[tokio::test]
async fn test_rollup_contains_every_processed_stage() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.process("case-1", "extraction", None).await.unwrap();
    exec.process("case-1", "causal_analysis", None).await.unwrap();

    let status = exec.status("case-1").await.unwrap();
    let rollup = status
        .results
        .iter()
        .find(|r| r.stage_name == "patient_case_analysis_group")
        .unwrap();
    let backend = rollup.result["backend_results"].as_object().unwrap();
    assert_eq!(backend.len(), 2);
    assert!(backend.contains_key("extraction"));
    assert!(backend.contains_key("causal_analysis"));
    assert_eq!(rollup.result["summary"], "SUMMARY case analysis");
}

#[tokio::test]
async fn test_reprocessing_upserts_in_place() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    for _ in 0..3 {
        exec.process("case-1", "diagnosis", None).await.unwrap();
    }
    let status = exec.status("case-1").await.unwrap();
    let diagnosis_records = status
        .results
        .iter()
        .filter(|r| r.stage_name == "diagnosis")
        .count();
    let group_records = status
        .results
        .iter()
        .filter(|r| r.stage_name == "diagnosis_group")
        .count();
    assert_eq!(diagnosis_records, 1);
    assert_eq!(group_records, 1);

    // Re-creating the case replaces its text but keeps it a single record.
    let updated = exec.create_case("case-1", "Updated text").await.unwrap();
    assert_eq!(updated.case_text, "Updated text");
    assert_eq!(updated.current_stage, "treatment_planning");
}

#[tokio::test]
async fn test_approval_only_moves_forward() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.process("case-1", "extraction", None).await.unwrap();
    exec.process("case-1", "diagnosis", None).await.unwrap();
    assert_eq!(
        exec.status("case-1").await.unwrap().case.current_stage,
        "treatment_planning"
    );

    let late = exec.approve("case-1", "extraction").await.unwrap();
    assert!(!late.advanced);
    assert_eq!(late.current_stage, "treatment_planning");

    exec.process("case-1", "final_plan", None).await.unwrap();
    let done = exec.approve("case-1", "final_plan").await.unwrap();
    assert!(done.complete);
    assert_eq!(done.current_stage, "complete");

    let approved: Vec<bool> = exec
        .status("case-1")
        .await
        .unwrap()
        .results
        .iter()
        .filter(|r| r.stage_name == "extraction" || r.stage_name == "final_plan")
        .map(|r| r.approved)
        .collect();
    assert_eq!(approved, vec![true, true]);
}

#[tokio::test]
async fn test_group_approval_moves_to_next_group() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.process("case-1", "initial", None).await.unwrap();
    let approved = exec
        .approve("case-1", "patient_case_analysis_group")
        .await
        .unwrap();
    assert!(approved.advanced);
    assert_eq!(approved.current_stage, "diagnosis_group");
}

#[tokio::test]
async fn test_note_requires_complete_case() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    let err = exec.generate_note("case-1").await.unwrap_err();
    assert!(matches!(err, WorkflowError::CaseNotComplete(_)));
    assert_eq!(err.code(), "case_not_complete");
}

#[tokio::test]
async fn test_halt_policy_holds_group_on_failure() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Auth)],
    );
    let exec = executor_with(provider, ErrorPolicy::Halt);
    exec.create_case("case-1", CASE).await.unwrap();

    let outcome = exec.process("case-1", "diagnosis_group", None).await.unwrap();
    assert_eq!(outcome.next_stage, "diagnosis_group");
    // Both backend stages and the summary failed.
    assert_eq!(outcome.failures.len(), 3);
    assert_eq!(outcome.result["summary"], Value::Null);
    assert_eq!(outcome.result["summary_error"]["code"], "configuration_error");
    assert_eq!(
        exec.status("case-1").await.unwrap().case.current_stage,
        "diagnosis_group"
    );
}

#[tokio::test]
async fn test_advance_policy_moves_past_failure() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Malformed)],
    );
    let exec = executor(provider);
    exec.create_case("case-1", CASE).await.unwrap();

    let outcome = exec.process("case-1", "diagnosis_group", None).await.unwrap();
    assert_eq!(outcome.next_stage, "treatment_planning_group");
    assert_eq!(
        outcome.result["backend_results"]["diagnosis"]["error"]["code"],
        "malformed_response_error"
    );
}

#[tokio::test]
async fn test_messages_are_kept_in_order() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.add_message("case-1", MessageRole::User, "Any allergies?")
        .await
        .unwrap();
    exec.add_message("case-1", MessageRole::Assistant, "None known.")
        .await
        .unwrap();
    let messages = exec.messages("case-1").await.unwrap();
    let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["Any allergies?", "None known."]);
    assert!(messages[0].seq < messages[1].seq);

    assert!(matches!(
        exec.add_message("missing", MessageRole::User, "hi").await,
        Err(WorkflowError::CaseNotFound(_))
    ));
}

#[tokio::test]
async fn test_finished_case_stays_complete_when_reprocessed() {
    let exec = executor(stage_responder());
    exec.create_case("case-1", CASE).await.unwrap();
    exec.process("case-1", "final_plan", None).await.unwrap();

    let rerun = exec.process("case-1", "extraction", None).await.unwrap();
    assert_eq!(rerun.next_stage, "causal_analysis");
    let _: Vec<_> = exec
        .stream("case-1", "diagnosis", tokio_util::sync::CancellationToken::new())
        .await
        .unwrap()
        .into_events()
        .collect()
        .await;

    let status = exec.status("case-1").await.unwrap();
    assert!(status.case.complete);
    assert_eq!(status.case.current_stage, "complete");
}
