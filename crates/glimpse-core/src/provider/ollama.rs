//! Ollama provider for local vision model inference.
//!
//! Talks to a local Ollama daemon via its HTTP API. No authentication, so
//! non-success statuses use the local status table.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::http::{self, StatusTable, PROBE_TIMEOUT};
use super::{DescribeRequest, Description, UsageSlot, VisionProvider};
use crate::config::OllamaConfig;
use crate::error::ProviderError;
use crate::types::{ProviderDescriptor, ProviderKind, UsageRecord};

const NAME: &str = "ollama";

/// Ollama provider for local vision model inference.
pub struct OllamaProvider {
    endpoint: String,
    client: reqwest::Client,
    descriptor: ProviderDescriptor,
    timeout: Duration,
    model_ttl: Duration,
    models: Mutex<Option<(Instant, Vec<String>)>>,
    usage: UsageSlot,
}

impl OllamaProvider {
    pub fn new(config: &OllamaConfig) -> Result<Self, ProviderError> {
        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            client: http::build_client(NAME)?,
            descriptor: Self::descriptor_for(config),
            timeout: Duration::from_millis(config.timeout_ms),
            model_ttl: Duration::from_secs(config.model_cache_ttl_secs),
            models: Mutex::new(None),
            usage: UsageSlot::default(),
        })
    }

    pub fn descriptor_for(config: &OllamaConfig) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::Ollama,
            name: NAME.to_string(),
            class: ProviderKind::Ollama.class(),
            needs_credential: false,
            supports_custom_prompt: true,
            max_payload_bytes: config.max_payload_bytes,
            max_dimension: config.max_dimension,
            supports_live_model_listing: true,
        }
    }

    fn cached_models(&self) -> Option<Vec<String>> {
        let guard = self.models.lock().ok()?;
        match guard.as_ref() {
            Some((fetched, models)) if fetched.elapsed() < self.model_ttl => Some(models.clone()),
            _ => None,
        }
    }

    fn store_models(&self, models: &[String]) {
        if let Ok(mut guard) = self.models.lock() {
            *guard = Some((Instant::now(), models.to_vec()));
        }
    }
}

/// Ollama /api/generate request body.
#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<&'a str>,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

/// Ollama /api/generate response.
#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
    #[serde(default)]
    done_reason: Option<String>,
}

/// Ollama /api/tags response.
#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Deserialize)]
struct TagEntry {
    name: String,
}

fn build_body(request: &DescribeRequest) -> GenerateRequest<'_> {
    GenerateRequest {
        model: &request.model,
        prompt: &request.prompt,
        images: vec![&request.image.data],
        stream: false,
        options: GenerateOptions {
            temperature: request.temperature,
            num_predict: request.max_tokens,
        },
    }
}

fn into_description(
    resp: GenerateResponse,
    requested_model: &str,
    elapsed: Duration,
) -> Result<Description, ProviderError> {
    let usage = UsageRecord::from_counts(
        resp.prompt_eval_count.unwrap_or(0),
        resp.eval_count.unwrap_or(0),
        elapsed,
    )
    .with_finish_reason(resp.done_reason);

    let text = resp.response.trim().to_string();
    if text.is_empty() {
        tracing::warn!(
            model = requested_model,
            eval_count = usage.completion_tokens,
            finish_reason = usage.finish_reason.as_deref().unwrap_or("unknown"),
            "Ollama returned an empty response; the token budget may be exhausted"
        );
        return Err(ProviderError::empty(format!(
            "Ollama returned no text for model {requested_model}"
        )));
    }

    Ok(Description {
        text,
        model: resp.model.unwrap_or_else(|| requested_model.to_string()),
        usage: Some(usage),
    })
}

#[async_trait]
impl VisionProvider for OllamaProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.endpoint);
        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Result<Vec<String>, ProviderError> {
        if let Some(models) = self.cached_models() {
            return Ok(models);
        }
        let url = format!("{}/api/tags", self.endpoint);
        let resp = http::send(
            NAME,
            StatusTable::Local,
            self.client.get(&url).timeout(PROBE_TIMEOUT),
        )
        .await?;
        let tags: TagsResponse = http::parse_json(NAME, resp).await?;
        let mut models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        models.sort();
        self.store_models(&models);
        Ok(models)
    }

    async fn describe_image(&self, request: &DescribeRequest) -> Result<Description, ProviderError> {
        let url = format!("{}/api/generate", self.endpoint);
        let start = Instant::now();

        let resp = http::send(
            NAME,
            StatusTable::Local,
            self.client
                .post(&url)
                .json(&build_body(request))
                .timeout(self.timeout),
        )
        .await?;
        let body: GenerateResponse = http::parse_json(NAME, resp).await?;

        let description = into_description(body, &request.model, start.elapsed())?;
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
