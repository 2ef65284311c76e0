//! Integration tests for the sled-backed result store

use super::test_utils::{no_retry_settings, stage_responder};
use casework::generation::GenerationClient;
use casework::provider::MessageRole;
use casework::store::{ResultStore, SledResultStore};
use casework::workflow::{ExecutorSettings, StageExecutor};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn sled_executor(store: SledResultStore) -> StageExecutor {
    StageExecutor::new(
        Arc::new(GenerationClient::new(
            Arc::new(stage_responder()),
            no_retry_settings(),
        )),
        Arc::new(store),
        ExecutorSettings::default(),
    )
}

#[tokio::test]
async fn test_case_progress_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("store");

    {
        let store = SledResultStore::open(&path).unwrap();
        let exec = sled_executor(store.clone());
        exec.create_case("case-1", "Chest pain radiating to the left arm.")
            .await
            .unwrap();
        exec.add_message("case-1", MessageRole::User, "Troponin pending")
            .await
            .unwrap();
        exec.start("case-1").await.unwrap();
        exec.approve("case-1", "extraction").await.unwrap();
        store.flush().unwrap();
    }

    let exec = sled_executor(SledResultStore::open(&path).unwrap());
    let status = exec.status("case-1").await.unwrap();
    assert_eq!(status.case.current_stage, "diagnosis_group");
    assert_eq!(status.message_count, 1);
    assert_eq!(status.results.len(), 5);
    let extraction = status
        .results
        .iter()
        .find(|r| r.stage_name == "extraction")
        .unwrap();
    assert!(extraction.approved);
}

#[tokio::test]
async fn test_concurrent_upserts_to_distinct_keys_all_land() {
    let temp_dir = TempDir::new().unwrap();
    let store = Arc::new(SledResultStore::open(temp_dir.path().join("store")).unwrap());

    let writes = ["extraction", "causal_analysis", "validation", "diagnosis"]
        .into_iter()
        .map(|stage| {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                store
                    .upsert_stage_result("case-1", stage, json!({ "stage": stage }))
                    .await
            })
        })
        .collect::<Vec<_>>();
    for write in writes {
        write.await.unwrap().unwrap();
    }

    let results = store.list_stage_results("case-1").await.unwrap();
    assert_eq!(results.len(), 4);
    for result in &results {
        assert_eq!(result.result["stage"], result.stage_name.as_str());
    }
}

#[tokio::test]
async fn test_upsert_replaces_payload_and_keeps_created_at() {
    let temp_dir = TempDir::new().unwrap();
    let store = SledResultStore::open(temp_dir.path().join("store")).unwrap();

    let first = store
        .upsert_stage_result("case-1", "diagnosis", json!({ "diagnosis": "first" }))
        .await
        .unwrap();
    let second = store
        .upsert_stage_result("case-1", "diagnosis", json!({ "diagnosis": "second" }))
        .await
        .unwrap();

    assert_eq!(second.created_at, first.created_at);
    assert!(second.updated_at >= first.updated_at);
    let stored = store
        .get_stage_result("case-1", "diagnosis")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.result["diagnosis"], "second");
}
