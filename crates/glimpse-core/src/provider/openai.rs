//! OpenAI provider using the Chat Completions API.
//!
//! Sends the image as a data URL in the user message content array. Works
//! against any endpoint that speaks the same protocol.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

use super::http::{self, StatusTable, PROBE_TIMEOUT};
use super::{filter_models, DescribeRequest, Description, UsageSlot, VisionProvider};
use crate::config::OpenAiConfig;
use crate::error::ProviderError;
use crate::types::{ProviderDescriptor, ProviderKind, UsageRecord};

const NAME: &str = "openai";

const VISION_MODELS: &[&str] = &["gpt-4o", "gpt-4.1", "gpt-5", "o1", "o3", "o4"];

const CURATED_MODELS: &[&str] = &["gpt-4.1", "gpt-4.1-mini", "gpt-4o", "gpt-4o-mini"];

/// Reasoning families only accept the default sampling temperature.
const FIXED_TEMPERATURE_MODELS: &[&str] = &["gpt-5", "o1", "o3", "o4"];

fn accepts_temperature(model: &str) -> bool {
    !FIXED_TEMPERATURE_MODELS
        .iter()
        .any(|family| model.starts_with(family))
}

/// OpenAI provider using the Chat Completions API.
pub struct OpenAiProvider {
    api_key: String,
    endpoint: String,
    client: reqwest::Client,
    descriptor: ProviderDescriptor,
    timeout: Duration,
    usage: UsageSlot,
}

impl OpenAiProvider {
    pub fn new(config: &OpenAiConfig, api_key: &str) -> Result<Self, ProviderError> {
        if api_key.is_empty() {
            return Err(ProviderError::auth(
                "OpenAI API key not set. Set OPENAI_API_KEY env var.",
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

    pub fn descriptor_for(config: &OpenAiConfig) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::OpenAi,
            name: NAME.to_string(),
            class: ProviderKind::OpenAi.class(),
            needs_credential: true,
            supports_custom_prompt: true,
            max_payload_bytes: config.max_payload_bytes,
            max_dimension: config.max_dimension,
            supports_live_model_listing: true,
        }
    }
}

// --- Request types ---

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_completion_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Serialize)]
pub(super) struct ChatMessage<'a> {
    role: &'static str,
    content: Vec<ChatContent<'a>>,
}

#[derive(Serialize)]
#[serde(tag = "type")]
pub(super) enum ChatContent<'a> {
    #[serde(rename = "text")]
    Text { text: &'a str },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Serialize)]
pub(super) struct ImageUrl {
    url: String,
}

// --- Response types ---

#[derive(Deserialize)]
pub(super) struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    /// Some compatible servers leave this out
    #[serde(default)]
    model: Option<String>,
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    total_tokens: u32,
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

/// Image first, then the prompt, as a single user turn.
pub(super) fn user_message(request: &DescribeRequest) -> ChatMessage<'_> {
    ChatMessage {
        role: "user",
        content: vec![
            ChatContent::ImageUrl {
                image_url: ImageUrl {
                    url: request.image.data_url(),
                },
            },
            ChatContent::Text {
                text: &request.prompt,
            },
        ],
    }
}

fn build_body(request: &DescribeRequest) -> ChatRequest<'_> {
    ChatRequest {
        model: &request.model,
        max_completion_tokens: request.max_tokens,
        temperature: accepts_temperature(&request.model).then_some(request.temperature),
        messages: vec![user_message(request)],
    }
}

/// Shared by every server speaking the Chat Completions protocol.
pub(super) fn into_description(
    provider: &str,
    resp: ChatResponse,
    requested_model: &str,
    elapsed: Duration,
) -> Result<Description, ProviderError> {
    let model = resp
        .model
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| requested_model.to_string());
    let choice = resp.choices.into_iter().next();
    let finish_reason = choice.as_ref().and_then(|c| c.finish_reason.clone());
    let usage = resp.usage.map(|u| {
        let mut record = UsageRecord::from_counts(u.prompt_tokens, u.completion_tokens, elapsed)
            .with_finish_reason(finish_reason.clone());
        if u.total_tokens > 0 {
            record.total_tokens = u.total_tokens;
        }
        record
    });

    let text = choice
        .and_then(|c| c.message.content)
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if text.is_empty() {
        let truncated = finish_reason.as_deref() == Some("length");
        tracing::warn!(
            model = %model,
            finish_reason = finish_reason.as_deref().unwrap_or("unknown"),
            "{provider} returned no content{}",
            if truncated { "; the token budget was exhausted" } else { "" }
        );
        return Err(ProviderError::empty(format!(
            "{provider} returned no content for model {} (finish_reason: {})",
            model,
            finish_reason.as_deref().unwrap_or("none")
        )));
    }

    Ok(Description {
        text,
        model,
        usage,
    })
}

#[async_trait]
impl VisionProvider for OpenAiProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        !self.api_key.is_empty()
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/models", self.endpoint);
        let listed = async {
            let resp = http::send(
                NAME,
                StatusTable::Cloud,
                self.client
                    .get(&url)
                    .bearer_auth(&self.api_key)
                    .timeout(PROBE_TIMEOUT),
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
                tracing::warn!("OpenAI model listing failed ({e}), using curated list");
                Ok(CURATED_MODELS.iter().map(|s| s.to_string()).collect())
            }
        }
    }

    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError> {
        let url = format!("{}/chat/completions", self.endpoint);
        let start = Instant::now();

        let resp = http::send(
            NAME,
            StatusTable::Cloud,
            self.client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(&build_body(request))
                .timeout(self.timeout),
        )
        .await?;
        let body: ChatResponse = http::parse_json(NAME, resp).await?;

        let description = into_description(NAME, body, &request.model, start.elapsed())?;
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
