//! Model Provider Abstraction
//!
//! Unified interface over the generation back-ends (OpenAI, Azure OpenAI, Anthropic,
//! Gemini, DeepSeek, Ollama, custom OpenAI-compatible servers). The provider family is
//! a closed enum resolved once by [`ProviderFactory`]; everything above this module only
//! sees [`ModelProviderClient`].

use crate::error::ApiError;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

pub mod clients;
pub mod scripted;

pub use clients::{AnthropicClient, GeminiClient, OpenAICompatibleClient};
pub use scripted::{ScriptStep, ScriptedFailure, ScriptedProvider};

/// Model provider configuration, one variant per provider family
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ModelProvider {
    OpenAI {
        model: String,
        api_key: String,
        base_url: Option<String>,
    },
    AzureOpenAI {
        deployment: String,
        api_key: String,
        endpoint: String,
        api_version: String,
    },
    Anthropic {
        model: String,
        api_key: String,
    },
    Gemini {
        model: String,
        api_key: String,
    },
    DeepSeek {
        model: String,
        api_key: String,
        base_url: Option<String>,
    },
    Ollama {
        model: String,
        base_url: Option<String>, // Default: http://localhost:11434
    },
    LocalCustom {
        model: String,
        endpoint: String, // Full endpoint URL (e.g., http://localhost:8080/v1)
        api_key: Option<String>,
    },
    /// In-process provider replaying canned replies; used offline and in tests
    Scripted {
        model: String,
        replies: Vec<String>,
    },
}

/// Chat message role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    /// Unknown roles fall back to `User`.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "system" => MessageRole::System,
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// Chat message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

/// Completion options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionOptions {
    pub temperature: Option<f32>, // 0.0-2.0
    pub max_tokens: Option<u32>,  // Maximum tokens to generate
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: Some(0.5),
            max_tokens: Some(4096),
        }
    }
}

/// Token usage information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Completion response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub content: String,
    pub model: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
}

/// Streaming completion: incremental text fragments in arrival order
pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<String, ApiError>> + Send>>;

/// Model provider client trait
#[async_trait]
pub trait ModelProviderClient: Send + Sync {
    /// Generate a completion from a list of messages
    async fn complete(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionResponse, ApiError>;

    /// Open a streaming completion. The returned stream yields text fragments.
    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        options: CompletionOptions,
    ) -> Result<CompletionStream, ApiError>;

    /// Get the provider name
    fn provider_name(&self) -> &str;

    /// Get the model name
    fn model_name(&self) -> &str;
}

/// Provider family as written in configuration files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    OpenAI,
    Azure,
    Anthropic,
    Gemini,
    DeepSeek,
    Ollama,
    #[serde(rename = "local")]
    LocalCustom,
    Scripted,
}

/// Provider section of the configuration file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider_type: ProviderType,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Azure only
    #[serde(default)]
    pub api_version: Option<String>,
    /// Scripted only: replies returned in order, the last one repeats
    #[serde(default)]
    pub replies: Vec<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            provider_type: ProviderType::Gemini,
            model: "gemini-2.5-pro".to_string(),
            api_key: None,
            endpoint: None,
            api_version: None,
            replies: Vec::new(),
        }
    }
}

impl ProviderConfig {
    /// Validate provider configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.model.trim().is_empty() {
            return Err("Model name cannot be empty".to_string());
        }
        let needs_key = matches!(
            self.provider_type,
            ProviderType::OpenAI
                | ProviderType::Azure
                | ProviderType::Anthropic
                | ProviderType::Gemini
                | ProviderType::DeepSeek
        );
        if needs_key && self.resolved_api_key().is_none() {
            return Err(format!(
                "API key required for provider type {:?} (set provider.api_key or {})",
                self.provider_type,
                self.api_key_env_var().unwrap_or("an API key env var")
            ));
        }
        if matches!(
            self.provider_type,
            ProviderType::Azure | ProviderType::LocalCustom
        ) && self.endpoint.as_deref().map_or(true, str::is_empty)
        {
            return Err(format!(
                "Endpoint required for provider type {:?}",
                self.provider_type
            ));
        }
        Ok(())
    }

    fn api_key_env_var(&self) -> Option<&'static str> {
        match self.provider_type {
            ProviderType::OpenAI => Some("OPENAI_API_KEY"),
            ProviderType::Azure => Some("AZURE_OPENAI_API_KEY"),
            ProviderType::Anthropic => Some("ANTHROPIC_API_KEY"),
            ProviderType::Gemini => Some("GOOGLE_API_KEY"),
            ProviderType::DeepSeek => Some("DEEPSEEK_API_KEY"),
            _ => None,
        }
    }

    /// Explicit key first, then the provider's conventional env var.
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.is_empty())
            .or_else(|| {
                self.api_key_env_var()
                    .and_then(|var| std::env::var(var).ok())
                    .filter(|key| !key.is_empty())
            })
    }

    /// Convert to the closed provider descriptor used by the factory
    pub fn to_model_provider(&self) -> Result<ModelProvider, ApiError> {
        self.validate().map_err(ApiError::ProviderNotConfigured)?;
        let model = self.model.clone();
        let key = || {
            self.resolved_api_key()
                .ok_or_else(|| ApiError::ProviderNotConfigured("API key missing".to_string()))
        };
        Ok(match self.provider_type {
            ProviderType::OpenAI => ModelProvider::OpenAI {
                model,
                api_key: key()?,
                base_url: self.endpoint.clone(),
            },
            ProviderType::Azure => ModelProvider::AzureOpenAI {
                deployment: model,
                api_key: key()?,
                endpoint: self.endpoint.clone().unwrap_or_default(),
                api_version: self
                    .api_version
                    .clone()
                    .unwrap_or_else(|| "2024-02-01".to_string()),
            },
            ProviderType::Anthropic => ModelProvider::Anthropic {
                model,
                api_key: key()?,
            },
            ProviderType::Gemini => ModelProvider::Gemini {
                model,
                api_key: key()?,
            },
            ProviderType::DeepSeek => ModelProvider::DeepSeek {
                model,
                api_key: key()?,
                base_url: self.endpoint.clone(),
            },
            ProviderType::Ollama => ModelProvider::Ollama {
                model,
                base_url: self.endpoint.clone(),
            },
            ProviderType::LocalCustom => ModelProvider::LocalCustom {
                model,
                endpoint: self.endpoint.clone().unwrap_or_default(),
                api_key: self.api_key.clone(),
            },
            ProviderType::Scripted => ModelProvider::Scripted {
                model,
                replies: self.replies.clone(),
            },
        })
    }
}

/// Provider factory for creating provider clients
pub struct ProviderFactory;

impl ProviderFactory {
    pub fn create_client(
        provider: &ModelProvider,
    ) -> Result<Box<dyn ModelProviderClient>, ApiError> {
        match provider {
            ModelProvider::OpenAI {
                model,
                api_key,
                base_url,
            } => Ok(Box::new(OpenAICompatibleClient::openai(
                model.clone(),
                api_key.clone(),
                base_url.clone(),
            )?)),
            ModelProvider::AzureOpenAI {
                deployment,
                api_key,
                endpoint,
                api_version,
            } => Ok(Box::new(OpenAICompatibleClient::azure(
                deployment.clone(),
                api_key.clone(),
                endpoint.clone(),
                api_version.clone(),
            )?)),
            ModelProvider::Anthropic { model, api_key } => Ok(Box::new(AnthropicClient::new(
                model.clone(),
                api_key.clone(),
            )?)),
            ModelProvider::Gemini { model, api_key } => Ok(Box::new(GeminiClient::new(
                model.clone(),
                api_key.clone(),
            )?)),
            ModelProvider::DeepSeek {
                model,
                api_key,
                base_url,
            } => Ok(Box::new(OpenAICompatibleClient::deepseek(
                model.clone(),
                api_key.clone(),
                base_url.clone(),
            )?)),
            ModelProvider::Ollama { model, base_url } => Ok(Box::new(
                OpenAICompatibleClient::ollama(model.clone(), base_url.clone())?,
            )),
            ModelProvider::LocalCustom {
                model,
                endpoint,
                api_key,
            } => Ok(Box::new(OpenAICompatibleClient::local(
                model.clone(),
                endpoint.clone(),
                api_key.clone(),
            )?)),
            ModelProvider::Scripted { model, replies } => Ok(Box::new(
                ScriptedProvider::replying(model.clone(), replies.clone()),
            )),
        }
    }
}
