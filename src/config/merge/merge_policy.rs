//! Merge rules: defaults first, then files, then environment.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

/// Builder seeded with the values a partial `[provider]` table cannot omit.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("provider.provider_type", "gemini")?
        .set_default("provider.model", "gemini-2.5-pro")?
        .set_default("store.backend", "sled")?
        .set_default("store.path", ".casework/store")
}

/// `CASEWORK__GENERATION__MAX_RETRIES=0` overrides `generation.max_retries`.
pub fn environment() -> Environment {
    Environment::with_prefix("CASEWORK")
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true)
}
