//! Vision provider trait and request/response types.
//!
//! Every backend (local daemon, cloud API, on-device runtime) implements
//! [`VisionProvider`]. Operational failures are returned as [`ProviderError`]
//! values so the retry policy can classify them.

pub mod anthropic;
pub(crate) mod http;
pub mod ollama;
pub mod on_device;
pub mod openai;
pub mod unavailable;

pub use anthropic::AnthropicProvider;
pub use ollama::OllamaProvider;
pub use on_device::OnDeviceProvider;
pub use openai::OpenAiProvider;
pub use unavailable::UnavailableProvider;

use async_trait::async_trait;
use base64::Engine;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::ProviderError;
use crate::types::{ProviderDescriptor, UsageRecord};

/// Base64-encoded image ready to send to a provider.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    /// Base64-encoded image bytes
    pub data: String,
    /// MIME type (e.g., "image/jpeg")
    pub media_type: String,
}

impl ImagePayload {
    /// Create a payload from raw bytes and a format identifier ("jpeg", "png", ...).
    pub fn from_bytes(bytes: &[u8], format: &str) -> Self {
        let media_type = match format {
            "jpeg" | "jpg" => "image/jpeg",
            "png" => "image/png",
            "webp" => "image/webp",
            "gif" => "image/gif",
            other => {
                tracing::warn!("Unknown image format '{other}', defaulting to image/jpeg");
                "image/jpeg"
            }
        };

        Self {
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            media_type: media_type.to_string(),
        }
    }

    /// Return a data URL suitable for OpenAI-style APIs.
    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.media_type, self.data)
    }
}

/// A request to describe one image.
#[derive(Debug, Clone)]
pub struct DescribeRequest {
    pub image: ImagePayload,
    /// Resolved prompt text
    pub prompt: String,
    /// Model identifier
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// A successful description.
#[derive(Debug, Clone)]
pub struct Description {
    pub text: String,
    /// Model identifier reported by the backend (or the requested one)
    pub model: String,
    pub usage: Option<UsageRecord>,
}

/// Trait that all vision providers implement.
///
/// Uses `async_trait` because native async fn in trait is not object-safe
/// (the cache hands out `Arc<dyn VisionProvider>`).
#[async_trait]
pub trait VisionProvider: Send + Sync {
    /// Static capabilities of this provider.
    fn descriptor(&self) -> &ProviderDescriptor;

    /// Whether the provider is configured and reachable. Never fails.
    async fn is_available(&self) -> bool;

    /// Models this provider can serve.
    async fn list_models(&self) -> Result<Vec<String>, ProviderError>;

    /// Generate a description for the given request.
    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError>;

    /// Usage from the most recent successful call.
    fn last_usage(&self) -> Option<UsageRecord>;

    /// Per-attempt timeout for this provider.
    fn timeout(&self) -> Duration;
}

/// Holds the usage record of the latest call.
#[derive(Debug, Default)]
pub(crate) struct UsageSlot(Mutex<Option<UsageRecord>>);

impl UsageSlot {
    pub(crate) fn set(&self, usage: UsageRecord) {
        if let Ok(mut slot) = self.0.lock() {
            *slot = Some(usage);
        }
    }

    pub(crate) fn get(&self) -> Option<UsageRecord> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

/// Keep models that match any allowlist prefix; fall back to the curated
/// list when nothing matches.
pub(crate) fn filter_models(listed: Vec<String>, allowlist: &[&str], curated: &[&str]) -> Vec<String> {
    let mut models: Vec<String> = listed
        .into_iter()
        .filter(|id| allowlist.iter().any(|prefix| id.starts_with(prefix)))
        .collect();
    if models.is_empty() {
        return curated.iter().map(|s| s.to_string()).collect();
    }
    models.sort();
    models.dedup();
    models
}
