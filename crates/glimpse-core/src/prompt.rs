//! Prompt styles.
//!
//! Jobs name a style key or carry literal prompt text. Style keys resolve
//! against the built-in table, extended or overridden from `[prompts.styles]`.

use std::collections::BTreeMap;

use crate::config::PromptsConfig;
use crate::types::{Prompt, ProviderDescriptor};

/// Style used when nothing else is configured.
pub const DEFAULT_STYLE: &str = "detailed";

const BUILTIN_STYLES: &[(&str, &str)] = &[
    (
        "detailed",
        "Describe this image in detail, including the main subjects, setting, \
         colors, lighting, and any visible text. Write in plain prose.",
    ),
    (
        "concise",
        "Describe this image concisely in 1-3 sentences. \
         Focus on the main subject, setting, and mood.",
    ),
    (
        "narrative",
        "Describe this image as a short narrative: what is happening, who or what \
         is involved, and what the scene suggests.",
    ),
    (
        "artistic",
        "Describe this image from an artistic perspective: composition, color \
         palette, use of light, style, and the mood it creates.",
    ),
    (
        "technical",
        "Describe the technical qualities of this image: focus, exposure, depth of \
         field, framing, and likely camera settings, followed by its content.",
    ),
    (
        "colorful",
        "Describe this image with emphasis on its colors, textures, and visual \
         atmosphere.",
    ),
    (
        "simple",
        "Describe this image in one short, simple sentence.",
    ),
];

/// Resolves [`Prompt`] values to the text sent to a provider.
#[derive(Debug, Clone)]
pub struct PromptLibrary {
    styles: BTreeMap<String, String>,
    default_style: String,
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::from_config(&PromptsConfig::default())
    }
}

impl PromptLibrary {
    pub fn from_config(config: &PromptsConfig) -> Self {
        let mut styles: BTreeMap<String, String> = BUILTIN_STYLES
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        for (key, text) in &config.styles {
            styles.insert(key.to_lowercase(), text.clone());
        }
        Self {
            styles,
            default_style: config.default_style.to_lowercase(),
        }
    }

    pub fn contains(&self, style: &str) -> bool {
        self.styles.contains_key(&style.to_lowercase())
    }

    /// Known style names, sorted.
    pub fn style_names(&self) -> impl Iterator<Item = &str> {
        self.styles.keys().map(String::as_str)
    }

    fn default_text(&self) -> &str {
        self.styles
            .get(&self.default_style)
            .or_else(|| self.styles.get(DEFAULT_STYLE))
            .map(String::as_str)
            .unwrap_or_default()
    }

    /// Text for a style key, falling back to the default style.
    pub fn style_text(&self, style: &str) -> &str {
        match self.styles.get(&style.to_lowercase()) {
            Some(text) => text,
            None => {
                tracing::warn!(
                    "Unknown prompt style '{style}', using '{}'",
                    self.default_style
                );
                self.default_text()
            }
        }
    }

    /// Resolve a job prompt for a specific provider.
    ///
    /// Providers that can't follow free-form instructions get the default
    /// style instead of literal text.
    pub fn resolve(&self, prompt: &Prompt, descriptor: &ProviderDescriptor) -> String {
        match prompt {
            Prompt::Style(style) => self.style_text(style).to_string(),
            Prompt::Text(text) if descriptor.supports_custom_prompt => text.clone(),
            Prompt::Text(_) => {
                tracing::warn!(
                    "Provider '{}' does not accept custom prompts, using style '{}'",
                    descriptor.name,
                    self.default_style
                );
                self.default_text().to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ProviderClass, ProviderKind};

    fn descriptor(supports_custom_prompt: bool) -> ProviderDescriptor {
        ProviderDescriptor {
            kind: ProviderKind::OnDevice,
            name: "on_device".to_string(),
            class: ProviderClass::OnDeviceRuntime,
            needs_credential: false,
            supports_custom_prompt,
            max_payload_bytes: 1024,
            max_dimension: 512,
            supports_live_model_listing: false,
        }
    }

    #[test]
    fn test_builtin_styles_present() {
        let library = PromptLibrary::default();
        for name in ["detailed", "concise", "narrative", "artistic", "technical", "colorful", "simple"] {
            assert!(library.contains(name), "missing {name}");
        }
        assert!(library.contains("CONCISE"));
    }

    #[test]
    fn test_resolve_style_and_text() {
        let library = PromptLibrary::default();
        let style = library.resolve(&Prompt::Style("concise".into()), &descriptor(true));
        assert!(style.contains("1-3 sentences"));

        let text = library.resolve(&Prompt::Text("What breed is this dog?".into()), &descriptor(true));
        assert_eq!(text, "What breed is this dog?");
    }

    #[test]
    fn test_literal_text_falls_back_without_custom_prompt_support() {
        let library = PromptLibrary::default();
        let resolved = library.resolve(&Prompt::Text("Count the cars.".into()), &descriptor(false));
        assert_eq!(resolved, library.style_text(DEFAULT_STYLE));
    }

    #[test]
    fn test_unknown_style_uses_default() {
        let library = PromptLibrary::default();
        assert_eq!(library.style_text("nope"), library.style_text(DEFAULT_STYLE));
    }

    #[test]
    fn test_config_overrides_and_extends() {
        let mut config = PromptsConfig::default();
        config.styles.insert("simple".into(), "One word.".into());
        config.styles.insert("Alt_Text".into(), "Write alt text.".into());
        config.default_style = "alt_text".into();
        let library = PromptLibrary::from_config(&config);
        assert_eq!(library.style_text("simple"), "One word.");
        assert_eq!(library.style_text("unknown"), "Write alt text.");
        assert!(library.style_names().any(|n| n == "alt_text"));
    }
}
