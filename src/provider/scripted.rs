//! Scripted provider: replays canned steps in-process.
//!
//! Used for offline runs (`provider_type = "scripted"`) and throughout the test
//! suite to drive retries, stalls and mid-stream failures deterministically.

use super::{
    ChatMessage, CompletionOptions, CompletionResponse, CompletionStream, ModelProviderClient,
    TokenUsage,
};
use crate::error::ApiError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Failure a scripted step raises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedFailure {
    /// Connection reset or 5xx; retryable
    Transport,
    /// 429; retryable
    RateLimit,
    /// 401; not retryable
    Auth,
    /// Unparseable payload; not retryable
    Malformed,
}

impl ScriptedFailure {
    fn to_api_error(self) -> ApiError {
        match self {
            ScriptedFailure::Transport => {
                ApiError::ProviderRequestFailed("scripted connection reset".to_string())
            }
            ScriptedFailure::RateLimit => {
                ApiError::ProviderRateLimit("scripted rate limit".to_string())
            }
            ScriptedFailure::Auth => ApiError::ProviderAuthFailed("scripted bad key".to_string()),
            ScriptedFailure::Malformed => {
                ApiError::ProviderMalformedResponse("scripted garbage".to_string())
            }
        }
    }
}

/// One provider call's behavior
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Complete with this text; streams it word by word
    Reply(String),
    /// Stream exactly these fragments; completes with their concatenation
    Fragments(Vec<String>),
    /// Fail before producing anything
    Fail(ScriptedFailure),
    /// Stream these fragments, then fail; `complete` fails outright
    FailAfter(Vec<String>, ScriptedFailure),
    /// Wait, then behave like the inner step
    Stall(Duration, Box<ScriptStep>),
}

struct Outcome {
    fragments: Vec<String>,
    failure: Option<ScriptedFailure>,
}

type Responder = Arc<dyn Fn(&[ChatMessage]) -> ScriptStep + Send + Sync>;

#[derive(Default)]
struct ScriptState {
    queue: VecDeque<ScriptStep>,
    last: Option<ScriptStep>,
    calls: usize,
    requests: Vec<Vec<ChatMessage>>,
}

/// In-process provider driven by a queue of [`ScriptStep`]s.
///
/// Steps are consumed in order. Once the queue is empty the responder (if any)
/// decides, otherwise the last step repeats.
#[derive(Clone)]
pub struct ScriptedProvider {
    model: String,
    state: Arc<Mutex<ScriptState>>,
    responder: Option<Responder>,
}

impl ScriptedProvider {
    pub fn new(model: impl Into<String>, steps: Vec<ScriptStep>) -> Self {
        Self {
            model: model.into(),
            state: Arc::new(Mutex::new(ScriptState {
                queue: steps.into(),
                ..ScriptState::default()
            })),
            responder: None,
        }
    }

    pub fn replying(model: impl Into<String>, replies: Vec<String>) -> Self {
        Self::new(model, replies.into_iter().map(ScriptStep::Reply).collect())
    }

    /// Answer every call by inspecting the prompt
    pub fn with_responder<F>(model: impl Into<String>, responder: F) -> Self
    where
        F: Fn(&[ChatMessage]) -> ScriptStep + Send + Sync + 'static,
    {
        Self {
            responder: Some(Arc::new(responder)),
            ..Self::new(model, Vec::new())
        }
    }

    /// Number of `complete` and `stream` calls so far
    pub fn calls(&self) -> usize {
        self.state.lock().calls
    }

    /// Messages of every call, oldest first
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.state.lock().requests.clone()
    }

    fn next_step(&self, messages: &[ChatMessage]) -> ScriptStep {
        let mut state = self.state.lock();
        state.calls += 1;
        state.requests.push(messages.to_vec());
        if let Some(step) = state.queue.pop_front() {
            state.last = Some(step.clone());
            return step;
        }
        if let Some(responder) = &self.responder {
            return responder(messages);
        }
        state
            .last
            .clone()
            .unwrap_or_else(|| ScriptStep::Reply("Scripted response".to_string()))
    }

    async fn play(mut step: ScriptStep) -> Outcome {
        loop {
            return match step {
                ScriptStep::Stall(delay, inner) => {
                    tokio::time::sleep(delay).await;
                    step = *inner;
                    continue;
                }
                ScriptStep::Reply(text) => Outcome {
                    fragments: text.split_inclusive(' ').map(str::to_string).collect(),
                    failure: None,
                },
                ScriptStep::Fragments(fragments) => Outcome {
                    fragments,
                    failure: None,
                },
                ScriptStep::Fail(failure) => Outcome {
                    fragments: Vec::new(),
                    failure: Some(failure),
                },
                ScriptStep::FailAfter(fragments, failure) => Outcome {
                    fragments,
                    failure: Some(failure),
                },
            };
        }
    }

    fn response(&self, content: String) -> CompletionResponse {
        let completion_tokens = content.split_whitespace().count() as u32;
        CompletionResponse {
            content,
            model: self.model.clone(),
            usage: TokenUsage {
                prompt_tokens: 0,
                completion_tokens,
                total_tokens: completion_tokens,
            },
            finish_reason: Some("stop".to_string()),
        }
    }
}

#[async_trait]
impl ModelProviderClient for ScriptedProvider {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        let outcome = Self::play(self.next_step(&messages)).await;
        match outcome.failure {
            Some(failure) => Err(failure.to_api_error()),
            None => Ok(self.response(outcome.fragments.concat())),
        }
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        _options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        let Outcome { fragments, failure } = Self::play(self.next_step(&messages)).await;
        if fragments.is_empty() {
            if let Some(failure) = failure {
                return Err(failure.to_api_error());
            }
        }

        let items: Vec<Result<String, ApiError>> = fragments
            .into_iter()
            .map(Ok)
            .chain(failure.map(|f| Err(f.to_api_error())))
            .collect();
        Ok(Box::pin(futures::stream::iter(items)))
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
