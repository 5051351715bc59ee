//! Sub-configuration structs with their defaults.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::prompt::DEFAULT_STYLE;

/// Retry/backoff settings for provider calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds
    pub base_delay_ms: u64,

    /// Upper bound for any single backoff in milliseconds
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays
    pub multiplier: f64,

    /// Add 10-50% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Batch execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Refuse to read source images larger than this (megabytes)
    pub max_file_size_mb: u64,

    /// Text placed between a caller-supplied prefix and the description
    pub prefix_separator: String,

    /// Sampling temperature sent to providers that accept one
    pub temperature: f32,

    /// File extensions picked up when a directory is scanned for images
    pub supported_formats: Vec<String>,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_file_size_mb: 100,
            prefix_separator: "\n\n".to_string(),
            temperature: 0.3,
            supported_formats: [
                "jpg", "jpeg", "png", "webp", "gif", "tiff", "tif", "bmp", "heic", "heif",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

/// Prompt style settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsConfig {
    /// Style used when a job names none, or names one that doesn't exist
    pub default_style: String,

    /// Extra styles, or replacements for built-in ones, keyed by style name
    pub styles: BTreeMap<String, String>,
}

impl Default for PromptsConfig {
    fn default() -> Self {
        Self {
            default_style: DEFAULT_STYLE.to_string(),
            styles: BTreeMap::new(),
        }
    }
}

/// JPEG re-encoding settings shared by all providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizeConfig {
    /// First JPEG quality tried
    pub start_quality: u8,

    /// Lowest JPEG quality tried before giving up
    pub min_quality: u8,

    /// Quality decrement between attempts
    pub quality_step: u8,

    /// External converter for containers the decoder can't read, as a command
    /// template. `{input}` and `{output}` are replaced with temp file paths.
    /// Example: `["heif-convert", "{input}", "{output}"]`
    pub converter: Option<Vec<String>>,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        Self {
            start_quality: 85,
            min_quality: 20,
            quality_step: 10,
            converter: None,
        }
    }
}

/// Per-provider settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProvidersConfig {
    pub ollama: OllamaConfig,
    pub anthropic: AnthropicConfig,
    pub openai: OpenAiConfig,
    pub on_device: OnDeviceConfig,
}

/// Ollama configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OllamaConfig {
    /// Ollama API endpoint
    pub endpoint: String,

    /// Default model name
    pub model: String,

    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub max_dimension: u32,
    pub max_payload_bytes: usize,

    /// How long a live model listing stays fresh
    pub model_cache_ttl_secs: u64,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2-vision".to_string(),
            // Vision models running locally can be slow
            timeout_ms: 120_000,
            max_tokens: 600,
            max_dimension: 2048,
            max_payload_bytes: 20 * 1024 * 1024,
            model_cache_ttl_secs: 30,
        }
    }
}

/// Anthropic configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicConfig {
    /// API key (supports ${ENV_VAR} syntax)
    pub api_key: String,

    pub endpoint: String,

    /// Default model name
    pub model: String,

    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub max_dimension: u32,

    /// Raw JPEG ceiling. 3.75 MB base64-encodes to just under the 5 MB
    /// per-image limit of the Messages API.
    pub max_payload_bytes: usize,
}

impl Default for AnthropicConfig {
    fn default() -> Self {
        Self {
            api_key: "${ANTHROPIC_API_KEY}".to_string(),
            endpoint: "https://api.anthropic.com".to_string(),
            model: "claude-sonnet-4-20250514".to_string(),
            timeout_ms: 60_000,
            max_tokens: 1024,
            // Images are billed per tile; larger inputs are downscaled server-side anyway
            max_dimension: 1600,
            max_payload_bytes: 3_750_000,
        }
    }
}

/// OpenAI (or compatible endpoint) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenAiConfig {
    /// API key (supports ${ENV_VAR} syntax)
    pub api_key: String,

    /// Base URL; `/chat/completions` and `/models` are appended
    pub endpoint: String,

    /// Default model name
    pub model: String,

    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub max_dimension: u32,
    pub max_payload_bytes: usize,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_key: "${OPENAI_API_KEY}".to_string(),
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            timeout_ms: 60_000,
            max_tokens: 1024,
            max_dimension: 2048,
            max_payload_bytes: 15 * 1024 * 1024,
        }
    }
}

/// On-device llama.cpp server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnDeviceConfig {
    /// `llama-server` binary (name on PATH or absolute path)
    pub command: String,

    /// Loopback port for the server. A free port is picked when unset.
    pub port: Option<u16>,

    /// How long loading the model may take before the server counts as failed
    pub startup_timeout_ms: u64,

    /// Directory holding `<model>.gguf` and its projector file
    pub model_dir: PathBuf,

    /// Default model (file stem inside `model_dir`)
    pub model: String,

    /// Projector file. Defaults to `mmproj-<model>.gguf` in `model_dir`.
    pub mmproj: Option<PathBuf>,

    /// Layers offloaded to the GPU (Metal/CUDA builds of the runtime)
    pub gpu_layers: Option<u32>,

    pub threads: Option<u32>,

    /// Whether the loaded models follow free-form instructions. Captioning
    /// models that only understand task tokens should set this to false.
    pub custom_prompts: bool,

    pub timeout_ms: u64,
    pub max_tokens: u32,
    pub max_dimension: u32,
    pub max_payload_bytes: usize,
}

impl Default for OnDeviceConfig {
    fn default() -> Self {
        Self {
            command: "llama-server".to_string(),
            port: None,
            startup_timeout_ms: 120_000,
            model_dir: PathBuf::from("~/.glimpse/models"),
            model: "gemma-3-4b-it-Q4_K_M".to_string(),
            mmproj: None,
            gpu_layers: Some(99),
            threads: None,
            custom_prompts: true,
            timeout_ms: 180_000,
            max_tokens: 512,
            // Keeps the vision encoder inside GPU memory on laptops
            max_dimension: 1024,
            max_payload_bytes: 20 * 1024 * 1024,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,

    /// Log format: "pretty" or "json"
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}
