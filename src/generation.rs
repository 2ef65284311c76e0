//! Generation Invocation Client
//!
//! One client per configured provider, resolved at construction and shared via
//! `Arc`. Batch calls return a [`GenerationResult`] that carries failure as a
//! field; streaming calls yield word-respecting [`StreamChunk`]s.

pub mod retry;

use crate::chunker::{Chunker, StreamChunk, DEFAULT_CHUNK_SIZE};
use crate::error::GenerationError;
use crate::provider::{
    ChatMessage, CompletionOptions, ModelProviderClient, ProviderConfig, ProviderFactory,
    TokenUsage,
};
use futures::{Stream, StreamExt};
use retry::{Attempted, RetryPolicy};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// `[generation]` configuration section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationSettings {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// End-to-end budget per call, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_unit_ms")]
    pub backoff_unit_ms: u64,
    /// Target chunk size for streaming, in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Attach provider, model and timestamp to streamed chunks
    #[serde(default)]
    pub include_metadata: bool,
}

fn default_temperature() -> f32 {
    0.5
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_unit_ms() -> u64 {
    1000
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_unit_ms: default_backoff_unit_ms(),
            chunk_size: default_chunk_size(),
            include_metadata: false,
        }
    }
}

impl GenerationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn backoff_unit(&self) -> Duration {
        Duration::from_millis(self.backoff_unit_ms)
    }
}

/// One generation call. Built once, then handed to the client.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub history: Vec<ChatMessage>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            history: Vec::new(),
            temperature: None,
            max_tokens: None,
            timeout: None,
            max_retries: None,
        }
    }

    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Without history the prompt is the only user message. With history the
    /// prompt becomes the system message and the conversation follows it.
    pub fn messages(&self) -> Vec<ChatMessage> {
        if self.history.is_empty() {
            return vec![ChatMessage::user(self.prompt.clone())];
        }
        let mut messages = Vec::with_capacity(self.history.len() + 1);
        messages.push(ChatMessage::system(self.prompt.clone()));
        messages.extend(self.history.iter().cloned());
        messages
    }
}

/// Outcome of a batch call
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub outcome: Result<String, GenerationError>,
    pub latency: Duration,
    pub provider: String,
    pub model: String,
    pub attempts: u32,
    pub usage: Option<TokenUsage>,
}

impl GenerationResult {
    pub fn success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn text(&self) -> Option<&str> {
        self.outcome.as_deref().ok()
    }

    pub fn error(&self) -> Option<&GenerationError> {
        self.outcome.as_ref().err()
    }
}

/// Lazy, finite, non-restartable chunk sequence of one streaming call
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, GenerationError>> + Send>>;

enum Upstream {
    Cancelled,
    Item(Option<Result<String, crate::error::ApiError>>),
}

/// Provider-agnostic generation client
pub struct GenerationClient {
    provider: Arc<dyn ModelProviderClient>,
    settings: GenerationSettings,
}

impl GenerationClient {
    pub fn new(provider: Arc<dyn ModelProviderClient>, settings: GenerationSettings) -> Self {
        Self { provider, settings }
    }

    /// Resolve the provider once; missing credentials fail here, not per call.
    pub fn from_config(
        provider: &ProviderConfig,
        settings: GenerationSettings,
    ) -> Result<Self, GenerationError> {
        let descriptor = provider.to_model_provider()?;
        let client = ProviderFactory::create_client(&descriptor)?;
        Ok(Self::new(Arc::from(client), settings))
    }

    pub fn provider_name(&self) -> &str {
        self.provider.provider_name()
    }

    pub fn model_name(&self) -> &str {
        self.provider.model_name()
    }

    pub fn settings(&self) -> &GenerationSettings {
        &self.settings
    }

    fn policy_for(&self, request: &GenerationRequest) -> RetryPolicy {
        RetryPolicy {
            max_retries: request.max_retries.unwrap_or(self.settings.max_retries),
            backoff_unit: self.settings.backoff_unit(),
            timeout: request.timeout.unwrap_or_else(|| self.settings.timeout()),
        }
    }

    fn options_for(&self, request: &GenerationRequest) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(request.temperature.unwrap_or(self.settings.temperature)),
            max_tokens: Some(request.max_tokens.unwrap_or(self.settings.max_tokens)),
        }
    }

    /// Batch generation. Never returns `Err`; failures land in `outcome`.
    pub async fn invoke(&self, request: &GenerationRequest) -> GenerationResult {
        let started = Instant::now();
        let policy = self.policy_for(request);
        let messages = request.messages();
        let options = self.options_for(request);
        let provider = &self.provider;

        let Attempted { result, attempts } = policy
            .run("invoke", |_| {
                let messages = messages.clone();
                let options = options.clone();
                async move {
                    provider
                        .complete(messages, options)
                        .await
                        .map_err(GenerationError::from)
                }
            })
            .await;

        let latency = started.elapsed();
        let (outcome, usage) = match result {
            Ok(response) => {
                info!(
                    provider = self.provider_name(),
                    model = self.model_name(),
                    attempts,
                    latency_ms = latency.as_millis() as u64,
                    chars = response.content.chars().count(),
                    "Generation completed"
                );
                (Ok(response.content), Some(response.usage))
            }
            Err(error) => {
                warn!(
                    provider = self.provider_name(),
                    attempts,
                    code = error.code(),
                    error = %error,
                    "Generation failed"
                );
                (Err(error), None)
            }
        };

        GenerationResult {
            outcome,
            latency,
            provider: self.provider_name().to_string(),
            model: self.model_name().to_string(),
            attempts,
            usage,
        }
    }

    /// Streaming generation.
    ///
    /// Retries and the time budget apply until the first fragment arrives.
    /// After that any upstream failure ends the stream with that error. The
    /// stream ends with `Cancelled` when `cancel` fires.
    pub fn stream(&self, request: GenerationRequest, cancel: CancellationToken) -> ChunkStream {
        let provider = Arc::clone(&self.provider);
        let policy = self.policy_for(&request);
        let messages = request.messages();
        let options = self.options_for(&request);
        let mut chunker = Chunker::new(self.settings.chunk_size);
        if self.settings.include_metadata {
            chunker = chunker.with_metadata(self.provider_name(), self.model_name());
        }

        Box::pin(async_stream::stream! {
            let open = policy.run("stream", |_| {
                let provider = Arc::clone(&provider);
                let messages = messages.clone();
                let options = options.clone();
                async move {
                    let mut upstream = provider.stream(messages, options).await?;
                    let first = upstream.next().await.transpose()?;
                    Ok::<_, GenerationError>((upstream, first))
                }
            });
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                attempted = open => Some(attempted),
            };

            let (mut upstream, first) = match opened {
                None => {
                    yield Err(GenerationError::Cancelled);
                    return;
                }
                Some(Attempted { result: Err(error), .. }) => {
                    yield Err(error);
                    return;
                }
                Some(Attempted { result: Ok(opened), .. }) => opened,
            };

            if let Some(fragment) = first {
                for chunk in chunker.push(&fragment) {
                    yield Ok(chunk);
                }
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => Upstream::Cancelled,
                        item = upstream.next() => Upstream::Item(item),
                    };
                    match next {
                        Upstream::Cancelled => {
                            yield Err(GenerationError::Cancelled);
                            return;
                        }
                        Upstream::Item(None) => break,
                        Upstream::Item(Some(Ok(fragment))) => {
                            for chunk in chunker.push(&fragment) {
                                yield Ok(chunk);
                            }
                        }
                        Upstream::Item(Some(Err(error))) => {
                            let error = GenerationError::from(error);
                            warn!(offset = chunker.offset(), error = %error, "Stream failed after first fragment");
                            yield Err(error);
                            return;
                        }
                    }
                }
            }

            for chunk in chunker.finish() {
                yield Ok(chunk);
            }
        })
    }
}
