use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use triage_ai::{ChatUsage, Message, ModelProfile, ToolDefinition, TriageAiError};

use crate::HistoryProcessor;

pub const DEFAULT_REQUEST_LIMIT: usize = 16;
pub const DEFAULT_TOOL_CALLS_LIMIT: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Classification of a failed invocation.
pub enum FailureKind {
    Timeout,
    MalformedProviderResponse,
    ContextExceeded,
    ProviderError,
    ToolFailure,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::MalformedProviderResponse => "malformed_provider_response",
            FailureKind::ContextExceeded => "context_exceeded",
            FailureKind::ProviderError => "provider_error",
            FailureKind::ToolFailure => "tool_failure",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Per-run ceilings enforced by the backend.
pub struct UsageLimits {
    pub request_limit: usize,
    pub tool_calls_limit: Option<usize>,
    pub total_tokens_limit: Option<u64>,
}

impl Default for UsageLimits {
    fn default() -> Self {
        Self {
            request_limit: DEFAULT_REQUEST_LIMIT,
            tool_calls_limit: Some(DEFAULT_TOOL_CALLS_LIMIT),
            total_tokens_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
/// Token and request accounting for one backend run.
pub struct RunUsage {
    pub requests: usize,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

impl RunUsage {
    pub fn record_response(&mut self, usage: &ChatUsage) {
        self.requests = self.requests.saturating_add(1);
        self.input_tokens = self.input_tokens.saturating_add(usage.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(usage.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(usage.total_tokens);
    }

    pub fn merge(&mut self, other: &RunUsage) {
        self.requests = self.requests.saturating_add(other.requests);
        self.tool_calls = self.tool_calls.saturating_add(other.tool_calls);
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

#[derive(Clone)]
/// One backend run: a new user message on top of prior history.
pub struct AgentRunRequest {
    pub message: String,
    pub history: Vec<Message>,
    pub history_processor: Option<Arc<dyn HistoryProcessor>>,
    pub usage_limits: UsageLimits,
    pub output_schema: Option<Value>,
}

impl fmt::Debug for AgentRunRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentRunRequest")
            .field("message_chars", &self.message.chars().count())
            .field("history_len", &self.history.len())
            .field("history_processor", &self.history_processor.is_some())
            .field("usage_limits", &self.usage_limits)
            .field("output_schema", &self.output_schema.is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
/// Successful backend run.
pub struct AgentRunOutput {
    pub output: Value,
    pub usage: RunUsage,
    pub history: Vec<Message>,
}

impl AgentRunOutput {
    pub fn usage(&self) -> RunUsage {
        self.usage
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `BackendError` values.
pub enum BackendError {
    #[error("provider returned a malformed tool call (finish_reason={finish_reason})")]
    MalformedResponse { finish_reason: String },
    #[error("prompt exceeded the model context window: {message}")]
    ContextExceeded { message: String },
    #[error(transparent)]
    Provider(TriageAiError),
    #[error("tool '{tool_name}' ({tool_call_id}) failed: {message}")]
    ToolFailure {
        tool_name: String,
        tool_call_id: String,
        message: String,
    },
    #[error("usage limit '{limit}' of {value} exceeded")]
    UsageLimitExceeded { limit: &'static str, value: u64 },
    #[error("structured output failed: {0}")]
    StructuredOutput(String),
    #[error("{} backend failures", .0.len())]
    Aggregate(Vec<BackendError>),
}

impl BackendError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BackendError::MalformedResponse { .. } => FailureKind::MalformedProviderResponse,
            BackendError::ContextExceeded { .. } => FailureKind::ContextExceeded,
            BackendError::ToolFailure { .. } => FailureKind::ToolFailure,
            BackendError::Aggregate(causes)
                if !causes.is_empty()
                    && causes
                        .iter()
                        .all(|cause| cause.failure_kind() == FailureKind::ToolFailure) =>
            {
                FailureKind::ToolFailure
            }
            BackendError::Provider(_)
            | BackendError::UsageLimitExceeded { .. }
            | BackendError::StructuredOutput(_)
            | BackendError::Aggregate(_) => FailureKind::ProviderError,
        }
    }
}

impl From<TriageAiError> for BackendError {
    fn from(error: TriageAiError) -> Self {
        if error.is_context_exceeded() {
            return BackendError::ContextExceeded {
                message: error.to_string(),
            };
        }
        BackendError::Provider(error)
    }
}

/// Executes one agent run against a model.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn profile(&self) -> &dyn ModelProfile;
    async fn run(&self, request: AgentRunRequest) -> Result<AgentRunOutput, BackendError>;

    /// Runs like [`AgentBackend::run`] and adds usage to `spent` as it is
    /// consumed, so runs that fail still account for their requests.
    ///
    /// The default only sees usage of successful runs.
    async fn run_metered(
        &self,
        request: AgentRunRequest,
        spent: &mut RunUsage,
    ) -> Result<AgentRunOutput, BackendError> {
        let output = self.run(request).await?;
        spent.merge(&output.usage);
        Ok(output)
    }
}

#[derive(Debug, Clone)]
pub struct ToolExecutionResult {
    pub content: Value,
    pub is_error: bool,
}

impl ToolExecutionResult {
    pub fn ok(content: Value) -> Self {
        Self {
            content,
            is_error: false,
        }
    }

    pub fn error(content: Value) -> Self {
        Self {
            content,
            is_error: true,
        }
    }

    /// Converts the payload to text for insertion into a tool result.
    pub fn as_text(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
        }
    }
}

/// A tool the model may call during a run.
#[async_trait]
pub trait AgentTool: Send + Sync {
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value) -> ToolExecutionResult;
}
