//! Core data types shared by providers, the orchestrator, and callers.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ErrorKind, ProviderError};
use crate::usage::UsageSnapshot;

/// Explicit tag selecting a provider implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Local Ollama daemon
    Ollama,
    /// Anthropic Messages API
    Anthropic,
    /// OpenAI (or compatible) Chat Completions API
    #[serde(rename = "openai")]
    OpenAi,
    /// llama.cpp multimodal runtime on this machine
    OnDevice,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 4] = [
        ProviderKind::Ollama,
        ProviderKind::Anthropic,
        ProviderKind::OpenAi,
        ProviderKind::OnDevice,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::Ollama => "ollama",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::OpenAi => "openai",
            ProviderKind::OnDevice => "on_device",
        }
    }

    /// Transport family of the provider.
    pub fn class(self) -> ProviderClass {
        match self {
            ProviderKind::Ollama => ProviderClass::LocalHttp,
            ProviderKind::Anthropic | ProviderKind::OpenAi => ProviderClass::CloudSdk,
            ProviderKind::OnDevice => ProviderClass::OnDeviceRuntime,
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "ollama" => Ok(ProviderKind::Ollama),
            "anthropic" | "claude" => Ok(ProviderKind::Anthropic),
            "openai" => Ok(ProviderKind::OpenAi),
            "on_device" | "ondevice" | "local" => Ok(ProviderKind::OnDevice),
            other => Err(ProviderError::invalid(format!("Unknown provider: {other}"))),
        }
    }
}

/// How a provider reaches its model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderClass {
    LocalHttp,
    CloudSdk,
    OnDeviceRuntime,
    /// Placeholder for a provider that could not be constructed
    Unavailable,
}

/// Static description of a provider and what it accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderDescriptor {
    pub kind: ProviderKind,
    pub name: String,
    pub class: ProviderClass,
    pub needs_credential: bool,
    pub supports_custom_prompt: bool,
    /// Largest encoded image payload the backend accepts, in bytes
    pub max_payload_bytes: usize,
    /// Resize ceiling for the long side of the image, in pixels
    pub max_dimension: u32,
    pub supports_live_model_listing: bool,
}

/// The text sent to the model: a named style or literal text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prompt {
    /// Key into the prompt library (e.g. "detailed")
    Style(String),
    /// Literal prompt text
    Text(String),
}

impl Default for Prompt {
    fn default() -> Self {
        Prompt::Style(crate::prompt::DEFAULT_STYLE.to_string())
    }
}

/// One unit of work: describe one image with one provider/model/prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Image to describe
    pub image: PathBuf,
    pub provider: ProviderKind,
    pub model: String,
    #[serde(default)]
    pub prompt: Prompt,
    /// Skip the job when the description index already knows this image
    #[serde(default)]
    pub skip_if_described: bool,
    /// Opaque text prepended to the description (location, capture date, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_prefix: Option<String>,
}

impl Job {
    pub fn new(image: impl Into<PathBuf>, provider: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            provider,
            model: model.into(),
            prompt: Prompt::default(),
            skip_if_described: false,
            description_prefix: None,
        }
    }

    pub fn with_prompt(mut self, prompt: Prompt) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn skip_if_described(mut self, skip: bool) -> Self {
        self.skip_if_described = skip;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.description_prefix = Some(prefix.into());
        self
    }

    /// Label used for logs and the usage peak. The full path, since file
    /// names repeat across camera folders.
    pub fn label(&self) -> String {
        self.image.display().to_string()
    }
}

/// Token and timing diagnostics from one provider call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub elapsed_seconds: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

impl UsageRecord {
    /// Build a record, deriving the total from its parts.
    pub fn from_counts(prompt_tokens: u32, completion_tokens: u32, elapsed: Duration) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            elapsed_seconds: elapsed.as_secs_f64(),
            finish_reason: None,
        }
    }

    pub fn with_finish_reason(mut self, reason: Option<String>) -> Self {
        self.finish_reason = reason;
        self
    }
}

/// A terminal job failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<ProviderError> for JobError {
    fn from(err: ProviderError) -> Self {
        Self {
            kind: err.kind,
            message: err.message,
        }
    }
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobOutcome {
    Described { text: String, model: String },
    Skipped,
    Failed(JobError),
}

/// The single, immutable record of a finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobResult {
    /// Position of the job in its batch
    pub index: usize,
    pub job: Job,
    #[serde(flatten)]
    pub outcome: JobOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<UsageRecord>,
    /// Provider attempts made (0 when the provider was never called)
    pub attempts: u32,
    /// Wall time spent on this job
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, JobOutcome::Described { .. })
    }

    pub fn description(&self) -> Option<&str> {
        match &self.outcome {
            JobOutcome::Described { text, .. } => Some(text),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&JobError> {
        match &self.outcome {
            JobOutcome::Failed(e) => Some(e),
            _ => None,
        }
    }
}

/// Batch lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Running,
    Paused,
    Stopped,
    Completed,
}

impl BatchStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BatchStatus::Stopped | BatchStatus::Completed)
    }
}

/// Progress after each finished job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Index of the job that just finished
    pub index: usize,
    /// Jobs finished so far, including this one
    pub finished: usize,
    pub total: usize,
    /// Mean wall time over dispatched (non-skipped) jobs
    #[serde(with = "duration_secs")]
    pub average: Duration,
    /// `average` times the number of jobs left
    #[serde(with = "duration_secs")]
    pub eta: Duration,
}

/// One failed job as reported in the batch summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureSummary {
    pub index: usize,
    pub image: PathBuf,
    pub kind: ErrorKind,
    pub message: String,
}

/// Final (or partial) account of a batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub status: BatchStatus,
    pub total: usize,
    /// Jobs taken off the queue (cursor position)
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<FailureSummary>,
    #[serde(skip)]
    pub results: Vec<JobResult>,
    pub usage: UsageSnapshot,
    #[serde(with = "duration_secs")]
    pub elapsed: Duration,
}

impl BatchSummary {
    /// Failures whose kind suggests trying again later.
    pub fn recoverable_failures(&self) -> impl Iterator<Item = &FailureSummary> {
        self.failures.iter().filter(|f| f.kind.is_retryable())
    }

    /// Failures that point at setup problems (credentials, bad input).
    pub fn configuration_failures(&self) -> impl Iterator<Item = &FailureSummary> {
        self.failures
            .iter()
            .filter(|f| matches!(f.kind, ErrorKind::AuthFailed | ErrorKind::InvalidRequest))
    }
}

/// Serialize `Duration` as fractional seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Ok(Duration::from_secs_f64(secs.max(0.0)))
    }
}
