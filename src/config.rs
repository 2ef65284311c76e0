//! Configuration System
//!
//! Layered configuration: built-in defaults, the global file, the workspace
//! file, then `CASEWORK__SECTION__KEY` environment variables. Validation collects
//! every problem instead of stopping at the first.

use crate::error::ApiError;
use crate::generation::GenerationSettings;
use crate::logging::LoggingConfig;
use crate::stream::TransportConfig;
use crate::workflow::{ErrorPolicy, ExecutorSettings};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use crate::provider::{ProviderConfig, ProviderType};

mod merge {
    pub mod merge_policy;
}
mod sources {
    pub mod global_file;
    pub mod workspace_file;
}

pub use sources::global_file::global_config_path;
pub use sources::workspace_file::{workspace_config_path, WORKSPACE_DIR};

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaseworkConfig {
    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub generation: GenerationSettings,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub workflow: WorkflowConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[streaming]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Reconnect hint sent with the first event of each stream
    #[serde(default)]
    pub retry_hint_ms: Option<u64>,
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            retry_hint_ms: None,
        }
    }
}

impl StreamingConfig {
    pub fn transport(&self) -> TransportConfig {
        TransportConfig {
            capacity: self.queue_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
        }
    }
}

/// `[workflow]` section
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Sled,
}

/// `[store]` section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Relative paths resolve against the workspace root
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

fn default_store_path() -> PathBuf {
    PathBuf::from(WORKSPACE_DIR).join("store")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self, workspace_root: &Path) -> PathBuf {
        if self.path.is_absolute() {
            self.path.clone()
        } else {
            workspace_root.join(&self.path)
        }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationError {
    Provider(String),
    Generation(String),
    Streaming(String),
    Store(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Generation(msg) => write!(f, "Generation: {}", msg),
            ValidationError::Streaming(msg) => write!(f, "Streaming: {}", msg),
            ValidationError::Store(msg) => write!(f, "Store: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl CaseworkConfig {
    /// Validate the entire configuration
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }

        let generation = &self.generation;
        if !(0.0..=2.0).contains(&generation.temperature) {
            errors.push(ValidationError::Generation(format!(
                "temperature {} is outside 0.0..=2.0",
                generation.temperature
            )));
        }
        if generation.max_tokens == 0 {
            errors.push(ValidationError::Generation("max_tokens must be positive".into()));
        }
        if generation.timeout_secs == 0 {
            errors.push(ValidationError::Generation("timeout_secs must be positive".into()));
        }

        if self.streaming.queue_capacity == 0 {
            errors.push(ValidationError::Streaming("queue_capacity must be positive".into()));
        }
        if self.streaming.heartbeat_interval_secs == 0 {
            errors.push(ValidationError::Streaming(
                "heartbeat_interval_secs must be positive".into(),
            ));
        }

        if self.store.backend == StoreBackend::Sled && self.store.path.as_os_str().is_empty() {
            errors.push(ValidationError::Store("Store path cannot be empty".into()));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Validation failures folded into one configuration error
    pub fn validated(self) -> Result<Self, ApiError> {
        self.validate().map_err(|errors| {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            ApiError::ConfigError(format!(
                "Configuration validation failed:\n{}",
                messages.join("\n")
            ))
        })?;
        Ok(self)
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            error_policy: self.workflow.error_policy,
            transport: self.streaming.transport(),
            retry_hint_ms: self.streaming.retry_hint_ms,
        }
    }
}

/// Loads [`CaseworkConfig`] from its layered sources
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, global file, workspace file, environment.
    pub fn load(workspace_root: &Path) -> Result<CaseworkConfig, ApiError> {
        Self::load_with_global(workspace_root, global_config_path().as_deref())
    }

    /// Same as [`ConfigLoader::load`] with an explicit global file (or none).
    pub fn load_with_global(
        workspace_root: &Path,
        global: Option<&Path>,
    ) -> Result<CaseworkConfig, ApiError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder, global)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let config = builder
            .add_source(merge::merge_policy::environment())
            .build()?;
        Ok(config.try_deserialize()?)
    }

    /// A single file over the defaults, without the environment layer.
    pub fn load_from_file(path: &Path) -> Result<CaseworkConfig, ApiError> {
        let config = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?;
        Ok(config.try_deserialize()?)
    }
}
