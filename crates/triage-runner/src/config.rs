use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use triage_agent_core::{
    InvokerConfig, TokenBudget, TokenBudgetError, ToolLoopConfig, UsageLimits,
};
use triage_ai::ModelProfile;
use triage_memory::MemoryConfig;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_concurrency: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
/// Tunables for a triage run, loadable from TOML.
pub struct TriageConfig {
    pub token_budget: TokenBudget,
    pub invoker: InvokerConfig,
    pub usage_limits: UsageLimits,
    pub memory: MemoryConfig,
    pub backend: ToolLoopConfig,
    pub batch: BatchConfig,
}

#[derive(Debug, Error)]
/// Enumerates supported `ConfigError` values.
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error(transparent)]
    TokenBudget(#[from] TokenBudgetError),
    #[error("config field '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl TriageConfig {
    /// Reads and validates a TOML config file. Missing sections take defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: TriageConfig = toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), "loaded triage config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.token_budget.validate()?;
        if self.invoker.timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "invoker.timeout_ms",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.usage_limits.request_limit == 0 {
            return Err(ConfigError::Invalid {
                field: "usage_limits.request_limit",
                reason: "must be greater than 0".to_string(),
            });
        }
        let threshold = self.memory.similarity_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::Invalid {
                field: "memory.similarity_threshold",
                reason: format!("must be within [0, 1], got {threshold}"),
            });
        }
        if self.backend.max_parallel_tool_calls == 0 {
            return Err(ConfigError::Invalid {
                field: "backend.max_parallel_tool_calls",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.batch.max_concurrency == 0 {
            return Err(ConfigError::Invalid {
                field: "batch.max_concurrency",
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(())
    }

    /// Budget for `profile`, capped at the model's context window.
    pub fn token_budget_for(&self, profile: &dyn ModelProfile) -> TokenBudget {
        let window = u64::from(profile.max_tokens());
        if window == 0 {
            return self.token_budget.clone();
        }
        let max_tokens = self.token_budget.max_tokens.min(window);
        self.token_budget.clone().with_max_tokens(max_tokens)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use triage_ai::ModelRef;

    use super::{ConfigError, TriageConfig, DEFAULT_MAX_CONCURRENCY};

    #[test]
    fn unit_default_config_is_valid() {
        let config = TriageConfig::default();
        config.validate().expect("defaults validate");
        assert_eq!(config.batch.max_concurrency, DEFAULT_MAX_CONCURRENCY);
        assert_eq!(config.invoker.max_malformed_retries, 2);
        assert_eq!(config.memory.search_limit, 2);
    }

    #[test]
    fn functional_load_overlays_partial_toml_on_defaults() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(
            file,
            r#"
[token_budget]
max_tokens = 32000
critical_retention = 0.5

[invoker]
max_malformed_retries = 4

[memory]
enabled = false
similarity_threshold = 0.55
"#
        )
        .expect("write config");

        let config = TriageConfig::load(file.path()).expect("load");
        assert_eq!(config.token_budget.max_tokens, 32_000);
        assert_eq!(config.token_budget.critical_retention, 0.5);
        assert_eq!(config.token_budget.high_retention, 0.9);
        assert_eq!(config.invoker.max_malformed_retries, 4);
        assert_eq!(config.invoker.timeout_ms, 30 * 60 * 1_000);
        assert!(!config.memory.enabled);
        assert_eq!(config.usage_limits.request_limit, 16);
    }

    #[test]
    fn regression_load_rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "[memory]\nsimilarity_threshold = 1.5\n").expect("write config");
        let error = TriageConfig::load(file.path()).expect_err("threshold out of range");
        assert!(matches!(
            error,
            ConfigError::Invalid {
                field: "memory.similarity_threshold",
                ..
            }
        ));

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "[token_budget]\nhigh_ratio = 0.95\ncritical_ratio = 0.9\n")
            .expect("write config");
        let error = TriageConfig::load(file.path()).expect_err("ratio order");
        assert!(matches!(error, ConfigError::TokenBudget(_)));

        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        write!(file, "[invoker\n").expect("write config");
        let error = TriageConfig::load(file.path()).expect_err("bad toml");
        assert!(matches!(error, ConfigError::Parse { .. }));
    }

    #[test]
    fn unit_token_budget_is_capped_by_model_window() {
        let config = TriageConfig::default();
        let small = ModelRef::parse("openai/gpt-4o-mini")
            .expect("model")
            .with_context_window(16_000);
        assert_eq!(config.token_budget_for(&small).max_tokens, 16_000);

        let large = ModelRef::parse("google/gemini-2.0-flash").expect("model");
        assert_eq!(
            config.token_budget_for(&large).max_tokens,
            config.token_budget.max_tokens
        );
    }
}
