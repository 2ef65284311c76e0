//! Error types for the casework pipeline.
//!
//! `ApiError` is the provider/configuration layer error, `GenerationError` is the
//! classified outcome of a generation call, `StreamError` covers event encoding,
//! and `WorkflowError` is what the stage executor surfaces to its callers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Stored record could not be decoded: {0}")]
    Corrupt(String),

    #[error("Record could not be encoded: {0}")]
    Encode(String),
}

/// Provider and configuration layer errors
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Provider request failed: {0}")]
    ProviderRequestFailed(String),

    #[error("Provider authentication failed: {0}")]
    ProviderAuthFailed(String),

    #[error("Provider rate limit exceeded: {0}")]
    ProviderRateLimit(String),

    #[error("Provider model not found: {0}")]
    ProviderModelNotFound(String),

    #[error("Provider returned a malformed response: {0}")]
    ProviderMalformedResponse(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl From<config::ConfigError> for ApiError {
    fn from(err: config::ConfigError) -> Self {
        ApiError::ConfigError(err.to_string())
    }
}

/// Classified failure of a single generation call.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum GenerationError {
    #[error("Configuration error: {message}")]
    #[serde(rename = "configuration_error")]
    Configuration { message: String },

    #[error("Generation timed out after {elapsed_ms} ms (budget {budget_ms} ms)")]
    #[serde(rename = "timeout_error")]
    Timeout { elapsed_ms: u64, budget_ms: u64 },

    #[error("Transport error after {attempts} attempt(s): {message}")]
    #[serde(rename = "transport_error")]
    Transport { message: String, attempts: u32 },

    #[error("Malformed response: {message}")]
    #[serde(rename = "malformed_response_error")]
    MalformedResponse { message: String },

    #[error("Generation cancelled")]
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl GenerationError {
    /// Only transport failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GenerationError::Transport { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::Configuration { .. } => "configuration_error",
            GenerationError::Timeout { .. } => "timeout_error",
            GenerationError::Transport { .. } => "transport_error",
            GenerationError::MalformedResponse { .. } => "malformed_response_error",
            GenerationError::Cancelled => "cancelled",
        }
    }

    pub(crate) fn with_attempts(self, attempts: u32) -> Self {
        match self {
            GenerationError::Transport { message, .. } => {
                GenerationError::Transport { message, attempts }
            }
            other => other,
        }
    }
}

impl From<ApiError> for GenerationError {
    fn from(err: ApiError) -> Self {
        let message = err.to_string();
        match err {
            ApiError::ConfigError(_)
            | ApiError::ProviderNotConfigured(_)
            | ApiError::ProviderAuthFailed(_)
            | ApiError::ProviderModelNotFound(_) => GenerationError::Configuration { message },
            ApiError::ProviderMalformedResponse(_) => {
                GenerationError::MalformedResponse { message }
            }
            ApiError::ProviderRateLimit(_)
            | ApiError::ProviderRequestFailed(_)
            | ApiError::ProviderError(_)
            | ApiError::StorageError(_) => GenerationError::Transport {
                message,
                attempts: 1,
            },
        }
    }
}

/// Event encoding and validation errors
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Failed to serialize event data: {0}")]
    Serialization(String),

    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    #[error("Event data must be a JSON object, got {0}")]
    InvalidPayload(String),

    #[error("Event receiver is gone")]
    Closed,
}

/// Errors surfaced by the stage executor
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Case not found: {0}")]
    CaseNotFound(String),

    #[error("Stage result not found: {case_id}/{stage_name}")]
    StageResultNotFound { case_id: String, stage_name: String },

    #[error("Case {0} must be complete before generating a note")]
    CaseNotComplete(String),

    #[error("Generation failed: {0}")]
    Generation(#[from] GenerationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl WorkflowError {
    /// Stable code used in error events
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::UnknownStage(_) => "unknown_stage",
            WorkflowError::CaseNotFound(_) => "case_not_found",
            WorkflowError::StageResultNotFound { .. } => "stage_result_not_found",
            WorkflowError::CaseNotComplete(_) => "case_not_complete",
            WorkflowError::Generation(inner) => inner.code(),
            WorkflowError::Storage(_) => "storage_error",
        }
    }
}
