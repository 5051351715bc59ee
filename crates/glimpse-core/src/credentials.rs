//! Credential lookup and fingerprinting.
//!
//! The engine never stores secrets by value in cache keys or logs. It asks a
//! [`CredentialSource`] for the current credential and keys provider instances
//! by a short BLAKE3 fingerprint of it, so a rotated key builds a fresh client.

use std::collections::HashMap;

use crate::config::Config;
use crate::types::ProviderKind;

/// Fingerprint used when a provider has no credential.
pub const NO_CREDENTIAL: &str = "none";

/// Source of provider credentials.
pub trait CredentialSource: Send + Sync {
    /// Current credential for `provider`, or `None` when not configured.
    fn get_credential(&self, provider: ProviderKind) -> Option<String>;
}

/// Resolve `${ENV_VAR}` references in config strings.
pub fn resolve_env_var(value: &str) -> Option<String> {
    if value.starts_with("${") && value.ends_with('}') {
        let var_name = &value[2..value.len() - 1];
        std::env::var(var_name).ok().filter(|v| !v.is_empty())
    } else if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Derive the cache fingerprint for a credential.
pub fn fingerprint(credential: Option<&str>) -> String {
    match credential {
        Some(secret) => {
            let hash = blake3::hash(secret.as_bytes());
            hash.to_hex()[..16].to_string()
        }
        None => NO_CREDENTIAL.to_string(),
    }
}

/// Credentials taken from the config file, with `${ENV_VAR}` indirection
/// re-evaluated on every lookup.
#[derive(Debug, Clone)]
pub struct ConfigCredentials {
    anthropic: String,
    openai: String,
}

impl ConfigCredentials {
    pub fn new(config: &Config) -> Self {
        Self {
            anthropic: config.providers.anthropic.api_key.clone(),
            openai: config.providers.openai.api_key.clone(),
        }
    }
}

impl CredentialSource for ConfigCredentials {
    fn get_credential(&self, provider: ProviderKind) -> Option<String> {
        match provider {
            ProviderKind::Anthropic => resolve_env_var(&self.anthropic),
            ProviderKind::OpenAi => resolve_env_var(&self.openai),
            ProviderKind::Ollama | ProviderKind::OnDevice => None,
        }
    }
}

/// Fixed credentials, e.g. a key typed in for one session.
#[derive(Debug, Clone, Default)]
pub struct StaticCredentials {
    keys: HashMap<ProviderKind, String>,
}

impl StaticCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: ProviderKind, key: impl Into<String>) -> Self {
        self.keys.insert(provider, key.into());
        self
    }
}

impl CredentialSource for StaticCredentials {
    fn get_credential(&self, provider: ProviderKind) -> Option<String> {
        self.keys.get(&provider).cloned()
    }
}

/// Try `primary` first, then `fallback`.
pub struct ChainedCredentials<A, B> {
    primary: A,
    fallback: B,
}

impl<A, B> ChainedCredentials<A, B> {
    pub fn new(primary: A, fallback: B) -> Self {
        Self { primary, fallback }
    }
}

impl<A: CredentialSource, B: CredentialSource> CredentialSource for ChainedCredentials<A, B> {
    fn get_credential(&self, provider: ProviderKind) -> Option<String> {
        self.primary
            .get_credential(provider)
            .or_else(|| self.fallback.get_credential(provider))
    }
}
