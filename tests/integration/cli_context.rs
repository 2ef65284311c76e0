//! The CLI run context end to end, over the scripted provider.

use casework::cli::{Cli, RunContext};
use clap::Parser;
use serde_json::Value;
use std::path::Path;
use tempfile::TempDir;

fn write_config(dir: &Path, store: &str) -> std::path::PathBuf {
    let path = dir.join("casework.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[provider]
provider_type = "scripted"
model = "offline"
replies = ["Status: ✅ Yes – All data is available."]

[generation]
max_retries = 0

{store}
"#
        ),
    )
    .unwrap();
    path
}

async fn run(ctx: &RunContext, args: &[&str]) -> String {
    let mut argv = vec!["casework"];
    argv.extend_from_slice(args);
    let cli = Cli::try_parse_from(argv).unwrap();
    ctx.execute(&cli.command).await.unwrap()
}

#[tokio::test]
async fn test_commands_drive_a_case_through_the_first_group() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), "[store]\nbackend = \"memory\"");
    let ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(config)).unwrap();

    let created: Value =
        serde_json::from_str(&run(&ctx, &["case", "create", "c-1", "Fever and rigors."]).await)
            .unwrap();
    assert_eq!(created["current_stage"], "initial");

    let started: Value = serde_json::from_str(&run(&ctx, &["start", "c-1"]).await).unwrap();
    assert_eq!(started["next_stage"], "diagnosis_group");
    assert_eq!(started["failures"], Value::Array(Vec::new()));

    let status: Value = serde_json::from_str(&run(&ctx, &["status", "c-1"]).await).unwrap();
    assert_eq!(status["case"]["current_stage"], "diagnosis_group");
    assert_eq!(status["results"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn test_sled_store_persists_between_contexts() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), "[store]\nbackend = \"sled\"\npath = \"data/store\"");

    {
        let ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(config.clone())).unwrap();
        run(&ctx, &["case", "create", "c-1", "Rash after amoxicillin."]).await;
        run(&ctx, &["message", "add", "c-1", "user", "Onset two hours ago"]).await;
    }
    assert!(temp_dir.path().join("data/store").exists());

    let ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(config)).unwrap();
    let messages: Value =
        serde_json::from_str(&run(&ctx, &["message", "list", "c-1"]).await).unwrap();
    assert_eq!(messages[0]["content"], "Onset two hours ago");
    assert_eq!(messages[0]["role"], "user");
}

#[tokio::test]
async fn test_workflow_errors_surface_with_their_code() {
    let temp_dir = TempDir::new().unwrap();
    let config = write_config(temp_dir.path(), "[store]\nbackend = \"memory\"");
    let ctx = RunContext::new(temp_dir.path().to_path_buf(), Some(config)).unwrap();

    let cli = Cli::try_parse_from(["casework", "process", "missing", "triage"]).unwrap();
    let err = ctx.execute(&cli.command).await.unwrap_err();
    assert_eq!(
        casework::cli::map_error(&err),
        "error[unknown_stage]: Unknown stage: triage"
    );
}

#[test]
fn test_invalid_configuration_is_rejected_up_front() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("casework.toml");
    std::fs::write(&path, "[provider]\nprovider_type = \"scripted\"\nmodel = \"\"\n").unwrap();
    let err = RunContext::new(temp_dir.path().to_path_buf(), Some(path))
        .err()
        .unwrap();
    assert!(casework::cli::map_error(&err).contains("Model name cannot be empty"));
}
