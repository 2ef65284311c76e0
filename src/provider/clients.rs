//! HTTP provider clients.
//!
//! OpenAI, Azure OpenAI, DeepSeek, Ollama and custom local servers all speak the
//! OpenAI chat-completions dialect and share [`OpenAICompatibleClient`]. Anthropic and
//! Gemini have their own request and stream shapes.

use super::{
    ChatMessage, CompletionOptions, CompletionResponse, CompletionStream, MessageRole,
    ModelProviderClient, TokenUsage,
};
use crate::error::ApiError;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

// Total request time is bounded by the generation layer, so only the connect phase is capped here.
const PROVIDER_HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn build_provider_http_client() -> Result<Client, ApiError> {
    Client::builder()
        .connect_timeout(PROVIDER_HTTP_CONNECT_TIMEOUT)
        .build()
        .map_err(client_build_error)
}

/// A client that cannot be built is a setup fault, never worth retrying.
fn client_build_error(error: impl std::fmt::Display) -> ApiError {
    ApiError::ConfigError(format!("Failed to create HTTP client: {}", error))
}

// Helper function to map HTTP errors to ApiError
fn map_http_error(error: reqwest::Error) -> ApiError {
    if let Some(status) = error.status() {
        status_error(status, error.to_string())
    } else if error.is_timeout() {
        ApiError::ProviderRequestFailed(format!("Request timeout: {}", error))
    } else if error.is_connect() {
        ApiError::ProviderRequestFailed(format!("Connection error: {}", error))
    } else if error.is_decode() {
        ApiError::ProviderMalformedResponse(format!("Undecodable body: {}", error))
    } else {
        ApiError::ProviderError(format!("HTTP error: {}", error))
    }
}

fn status_error(status: StatusCode, detail: String) -> ApiError {
    match status.as_u16() {
        401 | 403 => ApiError::ProviderAuthFailed(format!("Authentication failed: {}", detail)),
        429 => ApiError::ProviderRateLimit(format!("Rate limit exceeded: {}", detail)),
        404 => ApiError::ProviderModelNotFound(format!("Model not found: {}", detail)),
        _ => ApiError::ProviderRequestFailed(format!(
            "Request failed with status {}: {}",
            status, detail
        )),
    }
}

async fn send_checked(request: RequestBuilder) -> Result<Response, ApiError> {
    let response = request.send().await.map_err(map_http_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(status_error(status, error_text))
}

/// Split an SSE body into `data:` payloads. Lines are buffered as bytes so multi-byte
/// characters split across network chunks decode intact.
fn sse_data_payloads(response: Response) -> impl Stream<Item = Result<String, ApiError>> + Send {
    async_stream::stream! {
        let body = response.bytes_stream();
        futures::pin_mut!(body);
        let mut pending: Vec<u8> = Vec::new();
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    yield Err(map_http_error(e));
                    return;
                }
            };
            pending.extend_from_slice(&chunk);
            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim_end_matches(&['\r', '\n'][..]);
                if let Some(data) = line.strip_prefix("data:") {
                    yield Ok(data.trim_start().to_string());
                }
            }
        }
        let rest = String::from_utf8_lossy(&pending);
        if let Some(data) = rest.trim().strip_prefix("data:") {
            yield Ok(data.trim_start().to_string());
        }
    }
}

/// What one stream payload contributed
enum Fragment {
    Text(String),
    Skip,
    Done,
}

fn fragment_stream<F>(response: Response, extract: F) -> CompletionStream
where
    F: Fn(&str) -> Result<Fragment, ApiError> + Send + 'static,
{
    let payloads = sse_data_payloads(response);
    let fragments = async_stream::stream! {
        futures::pin_mut!(payloads);
        while let Some(payload) = payloads.next().await {
            let outcome = payload.and_then(|payload| extract(&payload));
            match outcome {
                Ok(Fragment::Text(text)) => {
                    yield Ok::<String, ApiError>(text);
                }
                Ok(Fragment::Skip) => {}
                Ok(Fragment::Done) => break,
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    };
    Box::pin(fragments)
}

fn parse_payload(payload: &str) -> Result<Value, ApiError> {
    serde_json::from_str(payload)
        .map_err(|e| ApiError::ProviderMalformedResponse(format!("Bad stream payload: {}", e)))
}

// OpenAI-compatible API structures
#[derive(Serialize)]
struct OpenAIMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    model: String,
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: u32,
    completion_tokens: u32,
    total_tokens: u32,
}

enum Auth {
    Bearer(String),
    AzureKey(String),
    Anonymous,
}

/// Client for every endpoint speaking the OpenAI chat-completions dialect
pub struct OpenAICompatibleClient {
    client: Client,
    provider: &'static str,
    model: String,
    chat_url: String,
    auth: Auth,
}

impl OpenAICompatibleClient {
    pub fn openai(model: String, api_key: String, base_url: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        Self::build("openai", model, &base_url, Auth::Bearer(api_key))
    }

    pub fn deepseek(model: String, api_key: String, base_url: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url.unwrap_or_else(|| "https://api.deepseek.com/v1".to_string());
        Self::build("deepseek", model, &base_url, Auth::Bearer(api_key))
    }

    pub fn ollama(model: String, base_url: Option<String>) -> Result<Self, ApiError> {
        let base_url = base_url.unwrap_or_else(|| "http://localhost:11434".to_string());
        let base_url = format!("{}/v1", base_url.trim_end_matches('/'));
        Self::build("ollama", model, &base_url, Auth::Anonymous)
    }

    pub fn local(model: String, endpoint: String, api_key: Option<String>) -> Result<Self, ApiError> {
        let endpoint = if endpoint.contains("://") {
            endpoint
        } else {
            format!("http://{}", endpoint)
        };
        let auth = api_key.map(Auth::Bearer).unwrap_or(Auth::Anonymous);
        Self::build("local", model, &endpoint, auth)
    }

    pub fn azure(
        deployment: String,
        api_key: String,
        endpoint: String,
        api_version: String,
    ) -> Result<Self, ApiError> {
        let chat_url = format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            endpoint.trim_end_matches('/'),
            deployment,
            api_version
        );
        Ok(Self {
            client: build_provider_http_client()?,
            provider: "azure",
            model: deployment,
            chat_url,
            auth: Auth::AzureKey(api_key),
        })
    }

    fn build(provider: &'static str, model: String, base_url: &str, auth: Auth) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_provider_http_client()?,
            provider,
            model,
            chat_url: format!("{}/chat/completions", base_url.trim_end_matches('/')),
            auth,
        })
    }

    fn request(&self, messages: Vec<ChatMessage>, options: CompletionOptions, stream: bool) -> RequestBuilder {
        let body = ChatCompletionRequest {
            model: self.model.clone(),
            messages: messages
                .into_iter()
                .map(|msg| OpenAIMessage {
                    role: msg.role.as_str(),
                    content: msg.content,
                })
                .collect(),
            temperature: options.temperature,
            max_tokens: options.max_tokens,
            stream,
        };
        let builder = self
            .client
            .post(&self.chat_url)
            .header("Content-Type", "application/json")
            .json(&body);
        match &self.auth {
            Auth::Bearer(key) => builder.header("Authorization", format!("Bearer {}", key)),
            Auth::AzureKey(key) => builder.header("api-key", key),
            Auth::Anonymous => builder,
        }
    }
}

#[async_trait]
impl ModelProviderClient for OpenAICompatibleClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        let response = send_checked(self.request(messages, options, false)).await?;
        let completion: ChatCompletionResponse = response.json().await.map_err(|e| {
            ApiError::ProviderMalformedResponse(format!("Failed to parse response: {}", e))
        })?;

        let choice = completion.choices.first().ok_or_else(|| {
            ApiError::ProviderMalformedResponse("No choices in response".to_string())
        })?;
        let content = choice.message.content.clone().ok_or_else(|| {
            ApiError::ProviderMalformedResponse("Choice carries no content".to_string())
        })?;

        let usage = completion.usage.map(|u| TokenUsage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        Ok(CompletionResponse {
            content,
            model: if completion.model.is_empty() {
                self.model.clone()
            } else {
                completion.model
            },
            usage: usage.unwrap_or_default(),
            finish_reason: choice.finish_reason.clone(),
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        let response = send_checked(self.request(messages, options, true)).await?;
        Ok(fragment_stream(response, |payload| {
            if payload == "[DONE]" {
                return Ok(Fragment::Done);
            }
            let value = parse_payload(payload)?;
            match value["choices"][0]["delta"]["content"].as_str() {
                Some(text) if !text.is_empty() => Ok(Fragment::Text(text.to_string())),
                _ => Ok(Fragment::Skip),
            }
        }))
    }

    fn provider_name(&self) -> &str {
        self.provider
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Anthropic messages API client
pub struct AnthropicClient {
    client: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl AnthropicClient {
    pub fn new(model: String, api_key: String) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_provider_http_client()?,
            model,
            api_key,
            base_url: "https://api.anthropic.com/v1".to_string(),
        })
    }

    fn request(&self, messages: Vec<ChatMessage>, options: CompletionOptions, stream: bool) -> RequestBuilder {
        // System prompts travel in a dedicated field, not in the message list.
        let system: Vec<String> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| m.content.clone())
            .collect();
        let turns: Vec<Value> = messages
            .into_iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model,
            "messages": turns,
            "max_tokens": options.max_tokens.unwrap_or(4096),
            "stream": stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }

        self.client
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
    }
}

#[async_trait]
impl ModelProviderClient for AnthropicClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        let response = send_checked(self.request(messages, options, false)).await?;
        let value: Value = response.json().await.map_err(|e| {
            ApiError::ProviderMalformedResponse(format!("Failed to parse response: {}", e))
        })?;

        let blocks = value["content"].as_array().ok_or_else(|| {
            ApiError::ProviderMalformedResponse("Response has no content blocks".to_string())
        })?;
        let content: String = blocks
            .iter()
            .filter_map(|block| block["text"].as_str())
            .collect();

        let prompt_tokens = value["usage"]["input_tokens"].as_u64().unwrap_or(0) as u32;
        let completion_tokens = value["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

        Ok(CompletionResponse {
            content,
            model: value["model"].as_str().unwrap_or(&self.model).to_string(),
            usage: TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            },
            finish_reason: value["stop_reason"].as_str().map(str::to_string),
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        let response = send_checked(self.request(messages, options, true)).await?;
        Ok(fragment_stream(response, |payload| {
            let value = parse_payload(payload)?;
            match value["type"].as_str() {
                Some("content_block_delta") => match value["delta"]["text"].as_str() {
                    Some(text) if !text.is_empty() => Ok(Fragment::Text(text.to_string())),
                    _ => Ok(Fragment::Skip),
                },
                Some("message_stop") => Ok(Fragment::Done),
                Some("error") => Err(ApiError::ProviderRequestFailed(format!(
                    "Stream error: {}",
                    value["error"]["message"].as_str().unwrap_or("unknown")
                ))),
                _ => Ok(Fragment::Skip),
            }
        }))
    }

    fn provider_name(&self) -> &str {
        "anthropic"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Google Gemini generateContent client
pub struct GeminiClient {
    client: Client,
    model: String,
    api_key: String,
    base_url: String,
}

impl GeminiClient {
    pub fn new(model: String, api_key: String) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_provider_http_client()?,
            model,
            api_key,
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
        })
    }

    fn request(&self, messages: Vec<ChatMessage>, options: CompletionOptions, stream: bool) -> RequestBuilder {
        let system: Vec<Value> = messages
            .iter()
            .filter(|m| m.role == MessageRole::System)
            .map(|m| json!({"text": m.content}))
            .collect();
        let contents: Vec<Value> = messages
            .into_iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| {
                let role = match m.role {
                    MessageRole::Assistant => "model",
                    _ => "user",
                };
                json!({"role": role, "parts": [{"text": m.content}]})
            })
            .collect();

        let mut body = json!({
            "contents": contents,
            "generationConfig": {
                "temperature": options.temperature,
                "maxOutputTokens": options.max_tokens,
            },
        });
        if !system.is_empty() {
            body["systemInstruction"] = json!({ "parts": system });
        }

        let url = if stream {
            format!(
                "{}/models/{}:streamGenerateContent?alt=sse",
                self.base_url, self.model
            )
        } else {
            format!("{}/models/{}:generateContent", self.base_url, self.model)
        };
        self.client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&body)
    }
}

fn gemini_text(value: &Value) -> Option<String> {
    let parts = value["candidates"][0]["content"]["parts"].as_array()?;
    Some(parts.iter().filter_map(|p| p["text"].as_str()).collect())
}

#[async_trait]
impl ModelProviderClient for GeminiClient {
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError> {
        let response = send_checked(self.request(messages, options, false)).await?;
        let value: Value = response.json().await.map_err(|e| {
            ApiError::ProviderMalformedResponse(format!("Failed to parse response: {}", e))
        })?;
        let content = gemini_text(&value).ok_or_else(|| {
            ApiError::ProviderMalformedResponse("Response has no candidate text".to_string())
        })?;

        let usage = &value["usageMetadata"];
        Ok(CompletionResponse {
            content,
            model: self.model.clone(),
            usage: TokenUsage {
                prompt_tokens: usage["promptTokenCount"].as_u64().unwrap_or(0) as u32,
                completion_tokens: usage["candidatesTokenCount"].as_u64().unwrap_or(0) as u32,
                total_tokens: usage["totalTokenCount"].as_u64().unwrap_or(0) as u32,
            },
            finish_reason: value["candidates"][0]["finishReason"]
                .as_str()
                .map(str::to_string),
        })
    }

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError> {
        let response = send_checked(self.request(messages, options, true)).await?;
        Ok(fragment_stream(response, |payload| {
            let value = parse_payload(payload)?;
            match gemini_text(&value) {
                Some(text) if !text.is_empty() => Ok(Fragment::Text(text)),
                _ => Ok(Fragment::Skip),
            }
        }))
    }

    fn provider_name(&self) -> &str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
