//! Anthropic provider using the Messages API.
//!
//! Sends image + prompt as a base64 image content block followed by a text
//! block.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::http::{self, StatusTable, PROBE_TIMEOUT};
use super::{filter_models, DescribeRequest, Description, UsageSlot, VisionProvider};
use crate::config::AnthropicConfig;
use crate::error::ProviderError;
use crate::types::{ProviderDescriptor, ProviderKind, UsageRecord};

const NAME: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";

/// Model families that accept image input.
const VISION_MODELS: &[&str] = &["claude-3", "claude-sonnet-4", "claude-opus-4", "claude-haiku-4"];

/// Used when the listing endpoint is unreachable or returns nothing usable.
const CURATED_MODELS: &[&str] = &[
    "claude-3-5-haiku-20241022",
    "claude-3-7-sonnet-20250219",
    "claude-opus-4-20250514",
    "claude-sonnet-4-20250514",
];

/// Anthropic provider using the Messages API.
pub struct AnthropicProvider {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
    descriptor: ProviderDescriptor,
    timeout: Duration,
    usage: UsageSlot,
}

impl AnthropicProvider {
    pub fn new(config: &AnthropicConfig, api_key: &str) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::auth(
                "Anthropic API key not set. Set ANTHROPIC_API_KEY env var.",
            ));
        }
        Ok(Self {
            api_key: api_key.to_string(),
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client: http::build_client(NAME)?,
            descriptor: Self::descriptor_for(config),
            timeout: Duration::from_millis(config.timeout_ms),
            usage: UsageSlot::default(),
        })
    }

    pub fn descriptor_for(config: &AnthropicConfig) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::Anthropic,
            name: NAME.to_string(),
            class: ProviderKind::Anthropic.class(),
            needs_credential: true,
            supports_custom_prompt: true,
            max_payload_bytes: config.max_payload_bytes,
            max_dimension: config.max_dimension,
            supports_live_model_listing: true,
        }
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
    }
}

// --- Request types ---

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<Message<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: Vec<ContentBlock<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
enum ContentBlock<'a> {
    #[serde(rename = "image")]
    Image { source: ImageSource<'a> },
    #[serde(rename = "text")]
    Text { text: &'a str },
}

#[derive(Serialize)]
struct ImageSource<'a> {
    #[serde(rename = "type")]
    source_type: &'static str,
    media_type: &'a str,
    data: &'a str,
}

// --- Response types ---

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseContent>,
    model: String,
    usage: Usage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Deserialize)]
struct ResponseContent {
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

fn build_body(request: &DescribeRequest) -> MessagesRequest<'_> {
    MessagesRequest {
        model: &request.model,
        max_tokens: request.max_tokens,
        temperature: Some(request.temperature),
        messages: vec![Message {
            role: "user",
            content: vec![
                ContentBlock::Image {
                    source: ImageSource {
                        source_type: "base64",
                        media_type: &request.image.media_type,
                        data: &request.image.data,
                    },
                },
                ContentBlock::Text {
                    text: &request.prompt,
                },
            ],
        }],
    }
}

fn into_description(resp: MessagesResponse, elapsed: Duration) -> Result<Description, ProviderError> {
    let usage = UsageRecord::from_counts(resp.usage.input_tokens, resp.usage.output_tokens, elapsed)
        .with_finish_reason(resp.stop_reason);

    let text = resp
        .content
        .into_iter()
        .filter_map(|c| c.text)
        .collect::<Vec<_>>()
        .join("");
    let text = text.trim().to_string();
    if text.is_empty() {
        tracing::warn!(
            model = %resp.model,
            output_tokens = usage.completion_tokens,
            stop_reason = usage.finish_reason.as_deref().unwrap_or("unknown"),
            "Anthropic returned no text content; the token budget may be exhausted"
        );
        return Err(ProviderError::empty(format!(
            "Anthropic returned no text for model {}",
            resp.model
        )));
    }

    Ok(Description {
        text,
        model: resp.model,
        usage: Some(usage),
    })
}

#[async_trait]
impl VisionProvider for AnthropicProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/v1/models?limit=100", self.endpoint);
        let listed = async {
            let resp = http::send(
                NAME,
                StatusTable::Cloud,
                self.authorized(self.client.get(&url)).timeout(PROBE_TIMEOUT),
            )
            .await?;
            http::parse_json::<ModelsResponse>(NAME, resp).await
        }
        .await;

        match listed {
            Ok(models) => Ok(filter_models(
                models.data.into_iter().map(|m| m.id).collect(),
                VISION_MODELS,
                CURATED_MODELS,
            )),
            Err(e) => {
                tracing::warn!("Anthropic model listing failed ({e}), using curated list");
                Ok(CURATED_MODELS.iter().map(|s| s.to_string()).collect())
            }
        }
    }

    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError> {
        let url = format!("{}/v1/messages", self.endpoint);
        let start = Instant::now();

        let resp = http::send(
            NAME,
            StatusTable::Cloud,
            self.authorized(self.client.post(&url))
                .json(&build_body(request))
                .timeout(self.timeout),
        )
        .await?;
        let body: MessagesResponse = http::parse_json(NAME, resp).await?;

        let description = into_description(body, start.elapsed())?;
        if let Some(usage) = &description.usage {
            self.usage.set(usage.clone());
        }
        Ok(description)
    }

    fn last_usage(&self) -> Option<UsageRecord> {
        self.usage.get()
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}
