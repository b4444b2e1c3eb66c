use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONTEXT_WINDOW_TOKENS: u32 = 128_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Backend family used to key provider-specific capability adapters.
pub enum BackendFamily {
    OpenAi,
    Anthropic,
    Google,
    Other,
}

impl BackendFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendFamily::OpenAi => "openai",
            BackendFamily::Anthropic => "anthropic",
            BackendFamily::Google => "google",
            BackendFamily::Other => "other",
        }
    }

    fn from_provider_label(label: &str) -> Self {
        match label.trim().to_ascii_lowercase().as_str() {
            "openai" | "azure" | "azure-openai" | "openrouter" => BackendFamily::OpenAi,
            "anthropic" | "claude" => BackendFamily::Anthropic,
            "google" | "gemini" | "vertex" => BackendFamily::Google,
            _ => BackendFamily::Other,
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Model metadata exposed uniformly by every backend.
pub trait ModelProfile: Send + Sync {
    fn display_name(&self) -> String;
    fn max_tokens(&self) -> u32;
    fn family(&self) -> BackendFamily;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Enumerates supported `ModelRefParseError` values.
pub enum ModelRefParseError {
    #[error("model reference cannot be empty")]
    Empty,
    #[error("model reference '{0}' is missing a model name after the provider")]
    MissingModel(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// A `provider/model` reference.
pub struct ModelRef {
    pub provider: String,
    pub model: String,
    pub family: BackendFamily,
    context_window_tokens: u32,
}

impl ModelRef {
    pub fn parse(raw: &str) -> Result<Self, ModelRefParseError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(ModelRefParseError::Empty);
        }
        let (provider, model) = match trimmed.split_once('/') {
            Some((provider, model)) => (provider.trim(), model.trim()),
            None => ("openai", trimmed),
        };
        if model.is_empty() {
            return Err(ModelRefParseError::MissingModel(trimmed.to_string()));
        }

        // Routed models such as `openrouter/google/gemini-2.0-flash` take the inner vendor family.
        let family = match model.split_once('/') {
            Some((vendor, _)) if provider.eq_ignore_ascii_case("openrouter") => {
                BackendFamily::from_provider_label(vendor)
            }
            _ => BackendFamily::from_provider_label(provider),
        };

        Ok(Self {
            provider: provider.to_ascii_lowercase(),
            model: model.to_string(),
            family,
            context_window_tokens: context_window_for_model(model),
        })
    }

    pub fn with_context_window(mut self, tokens: u32) -> Self {
        if tokens > 0 {
            self.context_window_tokens = tokens;
        }
        self
    }
}

impl FromStr for ModelRef {
    type Err = ModelRefParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Self::parse(raw)
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.provider, self.model)
    }
}

impl ModelProfile for ModelRef {
    fn display_name(&self) -> String {
        self.to_string()
    }

    fn max_tokens(&self) -> u32 {
        self.context_window_tokens
    }

    fn family(&self) -> BackendFamily {
        self.family
    }
}

fn context_window_for_model(model: &str) -> u32 {
    let normalized = model.to_ascii_lowercase();
    let name = normalized.rsplit('/').next().unwrap_or(normalized.as_str());
    if name.starts_with("gemini") {
        1_000_000
    } else if name.starts_with("claude") {
        200_000
    } else if name.starts_with("gpt-4.1") {
        1_000_000
    } else if name.starts_with("o1") || name.starts_with("o3") || name.starts_with("o4") {
        200_000
    } else if name.starts_with("gpt-5") {
        400_000
    } else {
        DEFAULT_CONTEXT_WINDOW_TOKENS
    }
}
