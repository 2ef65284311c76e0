//! Retry, backoff and time budget of the generation client, on paused time.

use casework::error::GenerationError;
use casework::generation::{GenerationClient, GenerationRequest, GenerationSettings};
use casework::provider::{ScriptStep, ScriptedFailure, ScriptedProvider};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn client(provider: &ScriptedProvider) -> GenerationClient {
    GenerationClient::new(
        Arc::new(provider.clone()),
        GenerationSettings {
            max_retries: 2,
            backoff_unit_ms: 1000,
            timeout_secs: 30,
            ..GenerationSettings::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_are_retried_with_doubling_backoff() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![
            ScriptStep::Fail(ScriptedFailure::Transport),
            ScriptStep::Fail(ScriptedFailure::RateLimit),
            ScriptStep::Reply("Recovered".to_string()),
        ],
    );
    let started = Instant::now();
    let result = client(&provider)
        .invoke(&GenerationRequest::new("prompt"))
        .await;

    assert_eq!(result.text(), Some("Recovered"));
    assert_eq!(result.attempts, 3);
    assert_eq!(provider.calls(), 3);
    // One unit after the first failure, two after the second.
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_report_attempts() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Transport)],
    );
    let result = client(&provider)
        .invoke(&GenerationRequest::new("prompt").with_max_retries(1))
        .await;

    match result.error() {
        Some(GenerationError::Transport { attempts, .. }) => assert_eq!(*attempts, 2),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_configuration_errors_are_not_retried() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Auth)],
    );
    let result = client(&provider)
        .invoke(&GenerationRequest::new("prompt"))
        .await;

    assert!(matches!(
        result.error(),
        Some(GenerationError::Configuration { .. })
    ));
    assert_eq!(result.attempts, 1);
    assert_eq!(provider.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_provider_hits_the_time_budget() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Stall(
            Duration::from_secs(600),
            Box::new(ScriptStep::Reply("too late".to_string())),
        )],
    );
    let started = Instant::now();
    let result = client(&provider)
        .invoke(&GenerationRequest::new("prompt").with_timeout(Duration::from_secs(5)))
        .await;

    match result.error() {
        Some(GenerationError::Timeout { budget_ms, .. }) => assert_eq!(*budget_ms, 5000),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn test_backoff_past_the_deadline_is_not_attempted() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::Fail(ScriptedFailure::Transport)],
    );
    // Attempt 1 fails at 0s, attempt 2 at 1s; the next backoff would end at 3s.
    let result = client(&provider)
        .invoke(
            &GenerationRequest::new("prompt")
                .with_max_retries(5)
                .with_timeout(Duration::from_secs(2)),
        )
        .await;

    assert!(matches!(result.error(), Some(GenerationError::Timeout { .. })));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_retries_until_the_first_fragment() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![
            ScriptStep::Fail(ScriptedFailure::Transport),
            ScriptStep::Reply("Start broad-spectrum antibiotics".to_string()),
        ],
    );
    let chunks: Vec<_> = client(&provider)
        .stream(GenerationRequest::new("prompt"), CancellationToken::new())
        .collect()
        .await;

    let text: String = chunks
        .iter()
        .map(|c| c.as_ref().unwrap().content.as_str())
        .collect();
    assert_eq!(text, "Start broad-spectrum antibiotics");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_stream_failure_after_output_is_not_retried() {
    let provider = ScriptedProvider::new(
        "scripted-model",
        vec![ScriptStep::FailAfter(
            vec!["Partial ".to_string(), "answer ".to_string()],
            ScriptedFailure::Transport,
        )],
    );
    let items: Vec<_> = client(&provider)
        .stream(GenerationRequest::new("prompt"), CancellationToken::new())
        .collect()
        .await;

    assert!(items.first().map_or(false, |first| first.is_ok()));
    assert!(matches!(
        items.last(),
        Some(Err(GenerationError::Transport { .. }))
    ));
    assert_eq!(provider.calls(), 1);
}
