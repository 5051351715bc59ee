//! Configuration validation with range checks.

use crate::error::ConfigError;
use crate::prompt::PromptLibrary;

use super::Config;

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

impl Config {
    /// Validate configuration values are within acceptable ranges.
    pub(crate) fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return Err(invalid("retry.multiplier must be >= 1.0"));
        }
        if self.retry.max_delay_ms == 0 {
            return Err(invalid("retry.max_delay_ms must be > 0"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if self.batch.max_file_size_mb == 0 {
            return Err(invalid("batch.max_file_size_mb must be > 0"));
        }

        let n = &self.normalize;
        if n.min_quality == 0 || n.start_quality > 100 {
            return Err(invalid("normalize quality must be within 1..=100"));
        }
        if n.min_quality > n.start_quality {
            return Err(invalid(
                "normalize.min_quality must not exceed normalize.start_quality",
            ));
        }
        if n.quality_step == 0 {
            return Err(invalid("normalize.quality_step must be > 0"));
        }
        if let Some(template) = &n.converter {
            if template.is_empty() {
                return Err(invalid("normalize.converter must name a program"));
            }
            let joined = template.join(" ");
            if !joined.contains("{input}") || !joined.contains("{output}") {
                return Err(invalid(
                    "normalize.converter must reference both {input} and {output}",
                ));
            }
        }

        let p = &self.providers;
        if p.on_device.startup_timeout_ms == 0 {
            return Err(invalid("providers.on_device.startup_timeout_ms must be > 0"));
        }
        if p.on_device.port == Some(0) {
            return Err(invalid(
                "providers.on_device.port must be > 0 (leave unset to pick a free port)",
            ));
        }
        let limits = [
            ("ollama", p.ollama.timeout_ms, p.ollama.max_dimension, p.ollama.max_payload_bytes),
            (
                "anthropic",
                p.anthropic.timeout_ms,
                p.anthropic.max_dimension,
                p.anthropic.max_payload_bytes,
            ),
            ("openai", p.openai.timeout_ms, p.openai.max_dimension, p.openai.max_payload_bytes),
            (
                "on_device",
                p.on_device.timeout_ms,
                p.on_device.max_dimension,
                p.on_device.max_payload_bytes,
            ),
        ];
        for (name, timeout_ms, max_dimension, max_payload_bytes) in limits {
            if timeout_ms == 0 {
                return Err(invalid(format!("providers.{name}.timeout_ms must be > 0")));
            }
            if max_dimension == 0 {
                return Err(invalid(format!("providers.{name}.max_dimension must be > 0")));
            }
            if max_payload_bytes == 0 {
                return Err(invalid(format!(
                    "providers.{name}.max_payload_bytes must be > 0"
                )));
            }
        }

        let library = PromptLibrary::from_config(&self.prompts);
        if !library.contains(&self.prompts.default_style) {
            return Err(invalid(format!(
                "prompts.default_style '{}' is not a known style",
                self.prompts.default_style
            )));
        }
        Ok(())
    }
}
