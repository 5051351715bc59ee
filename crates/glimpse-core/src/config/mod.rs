//! Configuration management for Glimpse.
//!
//! Configuration is loaded from the platform config directory (falling back to
//! `~/.glimpse/config.toml`). Every section has defaults, so an empty or
//! missing file yields a working setup for a local Ollama daemon.

mod types;
mod validate;

pub use types::*;

use crate::error::ConfigError;
use crate::types::ProviderKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Root configuration structure for Glimpse.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Retry/backoff settings
    pub retry: RetryConfig,

    /// Batch execution settings
    pub batch: BatchConfig,

    /// Prompt styles
    pub prompts: PromptsConfig,

    /// Payload normalization settings
    pub normalize: NormalizeConfig,

    /// Provider settings
    pub providers: ProvidersConfig,

    /// Logging settings
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// Returns default configuration if the file doesn't exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from a TOML string.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the default config file path.
    ///
    /// Uses platform-appropriate directories:
    /// - macOS: ~/Library/Application Support/com.glimpse.glimpse/config.toml
    /// - Linux: ~/.config/glimpse/config.toml
    /// - Windows: C:\Users\<User>\AppData\Roaming\glimpse\glimpse\config\config.toml
    ///
    /// Falls back to ~/.glimpse/config.toml if directory detection fails.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "glimpse", "glimpse")
            .map(|dirs| dirs.config_dir().to_path_buf().join("config.toml"))
            .unwrap_or_else(|| {
                let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
                PathBuf::from(home).join(".glimpse").join("config.toml")
            })
    }

    /// Resolved on-device model directory (with ~ expansion).
    pub fn on_device_model_dir(&self) -> PathBuf {
        expand_path(&self.providers.on_device.model_dir)
    }

    /// Default model configured for a provider.
    pub fn default_model(&self, kind: ProviderKind) -> &str {
        match kind {
            ProviderKind::Ollama => &self.providers.ollama.model,
            ProviderKind::Anthropic => &self.providers.anthropic.model,
            ProviderKind::OpenAi => &self.providers.openai.model,
            ProviderKind::OnDevice => &self.providers.on_device.model,
        }
    }

    /// Per-call timeout configured for a provider, in milliseconds.
    pub fn timeout_ms(&self, kind: ProviderKind) -> u64 {
        match kind {
            ProviderKind::Ollama => self.providers.ollama.timeout_ms,
            ProviderKind::Anthropic => self.providers.anthropic.timeout_ms,
            ProviderKind::OpenAi => self.providers.openai.timeout_ms,
            ProviderKind::OnDevice => self.providers.on_device.timeout_ms,
        }
    }

    /// Output token budget configured for a provider.
    pub fn max_tokens(&self, kind: ProviderKind) -> u32 {
        match kind {
            ProviderKind::Ollama => self.providers.ollama.max_tokens,
            ProviderKind::Anthropic => self.providers.anthropic.max_tokens,
            ProviderKind::OpenAi => self.providers.openai.max_tokens,
            ProviderKind::OnDevice => self.providers.on_device.max_tokens,
        }
    }

    /// Serialize the config to a pretty TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::ValidationError(e.to_string()))
    }
}

/// Expand a leading `~` in a path.
pub fn expand_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();
    let expanded = shellexpand::tilde(&path_str);
    PathBuf::from(expanded.into_owned())
}
