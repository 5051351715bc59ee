//! Provider registry.
//!
//! Built once at startup and shared by `Arc`. Owns the configuration, the
//! credential source, the provider factory and the instance cache, and turns
//! a `(kind, model)` pair into a ready provider.

use std::sync::Arc;

use crate::cache::{CacheKey, CacheStats, ProviderInstanceCache};
use crate::config::Config;
use crate::credentials::{fingerprint, ConfigCredentials, CredentialSource};
use crate::error::ProviderError;
use crate::normalize::NormalizePolicy;
use crate::provider::{
    on_device, AnthropicProvider, OllamaProvider, OnDeviceProvider, OpenAiProvider,
    UnavailableProvider, VisionProvider,
};
use crate::types::{ProviderDescriptor, ProviderKind};

/// Builds provider instances. The registry calls this at most once per
/// cache key.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        kind: ProviderKind,
        model: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn VisionProvider>, ProviderError>;
}

/// Factory for the built-in providers, driven by the config file.
pub struct ConfigProviderFactory {
    config: Arc<Config>,
}

impl ConfigProviderFactory {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

impl ProviderFactory for ConfigProviderFactory {
    fn create(
        &self,
        kind: ProviderKind,
        model: &str,
        credential: Option<&str>,
    ) -> Result<Arc<dyn VisionProvider>, ProviderError> {
        let providers = &self.config.providers;
        let missing_key = |var: &str| {
            ProviderError::auth(format!("{kind} API key not set. Set {var} env var."))
        };
        Ok(match kind {
            ProviderKind::Ollama => Arc::new(OllamaProvider::new(&providers.ollama)?),
            ProviderKind::Anthropic => {
                let key = credential.ok_or_else(|| missing_key("ANTHROPIC_API_KEY"))?;
                Arc::new(AnthropicProvider::new(&providers.anthropic, key)?)
            }
            ProviderKind::OpenAi => {
                let key = credential.ok_or_else(|| missing_key("OPENAI_API_KEY"))?;
                Arc::new(OpenAiProvider::new(&providers.openai, key)?)
            }
            ProviderKind::OnDevice => Arc::new(OnDeviceProvider::new(&providers.on_device, model)?),
        })
    }
}

/// Explicit registry of providers, descriptors and cached instances.
pub struct ProviderRegistry {
    config: Arc<Config>,
    credentials: Arc<dyn CredentialSource>,
    factory: Arc<dyn ProviderFactory>,
    cache: ProviderInstanceCache,
}

impl ProviderRegistry {
    /// Registry using config-file credentials and the built-in providers.
    pub fn new(config: Arc<Config>) -> Self {
        let credentials = Arc::new(ConfigCredentials::new(&config));
        let factory = Arc::new(ConfigProviderFactory::new(config.clone()));
        Self::with_parts(config, credentials, factory)
    }

    pub fn with_parts(
        config: Arc<Config>,
        credentials: Arc<dyn CredentialSource>,
        factory: Arc<dyn ProviderFactory>,
    ) -> Self {
        Self {
            config,
            credentials,
            factory,
            cache: ProviderInstanceCache::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Static descriptor for a provider kind.
    pub fn descriptor(&self, kind: ProviderKind) -> ProviderDescriptor {
        let providers = &self.config.providers;
        match kind {
            ProviderKind::Ollama => OllamaProvider::descriptor_for(&providers.ollama),
            ProviderKind::Anthropic => AnthropicProvider::descriptor_for(&providers.anthropic),
            ProviderKind::OpenAi => OpenAiProvider::descriptor_for(&providers.openai),
            ProviderKind::OnDevice => OnDeviceProvider::descriptor_for(&providers.on_device),
        }
    }

    pub fn descriptors(&self) -> Vec<ProviderDescriptor> {
        ProviderKind::ALL.iter().map(|k| self.descriptor(*k)).collect()
    }

    /// Payload limits for jobs routed to `kind`.
    pub fn normalize_policy(&self, kind: ProviderKind) -> NormalizePolicy {
        NormalizePolicy::for_descriptor(&self.descriptor(kind), &self.config.normalize)
    }

    /// Resolve a provider, surfacing construction failures.
    ///
    /// An empty `model` means the provider's configured default.
    pub async fn try_resolve(
        &self,
        kind: ProviderKind,
        model: &str,
    ) -> Result<Arc<dyn VisionProvider>, ProviderError> {
        let model = if model.is_empty() {
            self.config.default_model(kind)
        } else {
            model
        };
        let credential = self.credentials.get_credential(kind);
        let key = CacheKey::new(kind, model, fingerprint(credential.as_deref()));
        self.cache
            .get_or_try_init(&key, || async {
                self.factory.create(kind, model, credential.as_deref())
            })
            .await
    }

    /// Resolve a provider. A construction failure yields an
    /// [`UnavailableProvider`] carrying the error; it is not cached, so a
    /// later call (e.g. after setting a key) retries construction.
    pub async fn resolve(&self, kind: ProviderKind, model: &str) -> Arc<dyn VisionProvider> {
        match self.try_resolve(kind, model).await {
            Ok(provider) => provider,
            Err(e) => {
                tracing::warn!(provider = %kind, model, "Provider unavailable: {e}");
                Arc::new(UnavailableProvider::new(&self.descriptor(kind), e))
            }
        }
    }

    /// Models a provider can serve.
    ///
    /// On-device listing reads the model directory directly, so it works
    /// before any model is installed correctly.
    pub async fn list_models(&self, kind: ProviderKind) -> Result<Vec<String>, ProviderError> {
        match kind {
            ProviderKind::OnDevice => on_device::list_model_files(&self.config.on_device_model_dir()),
            _ => self.try_resolve(kind, "").await?.list_models().await,
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }
}
