//! Resilient agent invocation.
//!
//! [`AgentInvoker::run`] wraps one [`AgentBackend`] call with a bounded retry
//! loop for malformed provider responses and a wall-clock ceiling over the
//! whole call. Every other failure is classified and returned on the first
//! occurrence.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use triage_ai::Message;

use crate::{
    AgentBackend, AgentRunOutput, AgentRunRequest, BackendError, FailureKind, HistoryProcessor,
    RunUsage, Telemetry, TelemetryEvent, UsageLimits,
};

pub const DEFAULT_INVOCATION_TIMEOUT_MS: u64 = 30 * 60 * 1_000;
pub const DEFAULT_MAX_MALFORMED_RETRIES: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
/// Public struct `InvokerConfig` used across triage components.
pub struct InvokerConfig {
    pub timeout_ms: u64,
    pub max_malformed_retries: usize,
}

impl Default for InvokerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_INVOCATION_TIMEOUT_MS,
            max_malformed_retries: DEFAULT_MAX_MALFORMED_RETRIES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Attempt accounting local to one [`AgentInvoker::run`] call.
pub struct RetryState {
    pub attempts: usize,
    pub retries_used: usize,
    pub max_retries: usize,
}

impl RetryState {
    pub fn new(max_retries: usize) -> Self {
        Self {
            attempts: 0,
            retries_used: 0,
            max_retries,
        }
    }

    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Consumes one retry if the budget allows it.
    pub fn try_consume_retry(&mut self) -> bool {
        if self.retries_used >= self.max_retries {
            return false;
        }
        self.retries_used += 1;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `InvocationState` values.
pub enum InvocationState {
    Idle,
    Sending,
    RetryPending,
    Success,
    Failed,
    TimedOut,
}

impl InvocationState {
    pub fn as_str(self) -> &'static str {
        match self {
            InvocationState::Idle => "idle",
            InvocationState::Sending => "sending",
            InvocationState::RetryPending => "retry_pending",
            InvocationState::Success => "success",
            InvocationState::Failed => "failed",
            InvocationState::TimedOut => "timed_out",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InvocationState::Success | InvocationState::Failed | InvocationState::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Advisory per-invocation metrics.
pub struct InvocationMetrics {
    pub model: String,
    pub attempts: usize,
    pub retries: usize,
    pub requests: usize,
    pub tool_calls: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub duration_ms: u64,
    pub state: InvocationState,
    pub failure: Option<FailureKind>,
}

#[derive(Debug, Error)]
/// Enumerates supported `InvokeError` values.
pub enum InvokeError {
    #[error("agent invocation timed out after {timeout_ms}ms ({attempts} attempts)")]
    Timeout { timeout_ms: u64, attempts: usize },
    #[error(
        "provider returned a malformed response on {attempts} attempts (finish_reason={finish_reason}, max_retries={max_retries})"
    )]
    MalformedResponse {
        attempts: usize,
        max_retries: usize,
        finish_reason: String,
    },
    #[error("prompt exceeded the model context window: {message}")]
    ContextExceeded { message: String },
    #[error("tool failure: {0}")]
    ToolFailure(#[source] BackendError),
    #[error("provider error: {0}")]
    Provider(#[source] BackendError),
    #[error("agent output could not be decoded: {0}")]
    InvalidOutput(#[source] serde_json::Error),
}

impl InvokeError {
    pub fn kind(&self) -> FailureKind {
        match self {
            InvokeError::Timeout { .. } => FailureKind::Timeout,
            InvokeError::MalformedResponse { .. } => FailureKind::MalformedProviderResponse,
            InvokeError::ContextExceeded { .. } => FailureKind::ContextExceeded,
            InvokeError::ToolFailure(_) => FailureKind::ToolFailure,
            InvokeError::Provider(_) | InvokeError::InvalidOutput(_) => FailureKind::ProviderError,
        }
    }
}

#[derive(Clone)]
/// Input to [`AgentInvoker::run`].
pub struct InvocationRequest {
    pub message: String,
    pub history: Vec<Message>,
    pub usage_limits: UsageLimits,
    pub output_schema: Option<Value>,
    pub history_processor: Option<Arc<dyn HistoryProcessor>>,
}

impl InvocationRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            history: Vec::new(),
            usage_limits: UsageLimits::default(),
            output_schema: None,
            history_processor: None,
        }
    }

    pub fn with_history(mut self, history: Vec<Message>) -> Self {
        self.history = history;
        self
    }

    pub fn with_usage_limits(mut self, usage_limits: UsageLimits) -> Self {
        self.usage_limits = usage_limits;
        self
    }

    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    pub fn with_history_processor(mut self, processor: Arc<dyn HistoryProcessor>) -> Self {
        self.history_processor = Some(processor);
        self
    }

    fn to_run_request(&self) -> AgentRunRequest {
        AgentRunRequest {
            message: self.message.clone(),
            history: self.history.clone(),
            history_processor: self.history_processor.clone(),
            usage_limits: self.usage_limits.clone(),
            output_schema: self.output_schema.clone(),
        }
    }
}

impl fmt::Debug for InvocationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.to_run_request(), f)
    }
}

#[derive(Debug, Clone)]
/// Successful invocation with decoded output.
pub struct InvocationOutcome<T> {
    pub output: T,
    /// Usage summed over every attempt, retried ones included.
    pub usage: RunUsage,
    pub history: Vec<Message>,
    pub attempts: usize,
    pub retries: usize,
    pub duration_ms: u64,
}

/// Runs agent calls with retry, timeout and failure classification.
pub struct AgentInvoker {
    backend: Arc<dyn AgentBackend>,
    config: InvokerConfig,
    telemetry: Telemetry,
}

struct AttemptTracker {
    retry: RetryState,
    state: InvocationState,
    usage: RunUsage,
}

impl AttemptTracker {
    fn transition(&mut self, next: InvocationState) {
        tracing::trace!(
            from = self.state.as_str(),
            to = next.as_str(),
            attempt = self.retry.attempts,
            "invocation state transition"
        );
        self.state = next;
    }
}

impl AgentInvoker {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        config: InvokerConfig,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            backend,
            config,
            telemetry,
        }
    }

    pub fn backend(&self) -> &Arc<dyn AgentBackend> {
        &self.backend
    }

    pub fn config(&self) -> &InvokerConfig {
        &self.config
    }

    #[tracing::instrument(
        name = "agent_invocation",
        skip_all,
        fields(model = %self.backend.profile().display_name())
    )]
    pub async fn run<T>(
        &self,
        request: InvocationRequest,
    ) -> Result<InvocationOutcome<T>, InvokeError>
    where
        T: DeserializeOwned,
    {
        let started = Instant::now();
        let mut tracker = AttemptTracker {
            retry: RetryState::new(self.config.max_malformed_retries),
            state: InvocationState::Idle,
            usage: RunUsage::default(),
        };
        let timeout = Duration::from_millis(self.config.timeout_ms.max(1));

        let attempt_result =
            tokio::time::timeout(timeout, self.run_with_retries(&request, &mut tracker)).await;
        let result = match attempt_result {
            Ok(Ok(output)) => match serde_json::from_value::<T>(output.output) {
                Ok(decoded) => Ok((decoded, output.history)),
                Err(error) => {
                    tracker.transition(InvocationState::Failed);
                    Err(InvokeError::InvalidOutput(error))
                }
            },
            Ok(Err(error)) => Err(error),
            Err(_) => {
                tracker.transition(InvocationState::TimedOut);
                Err(InvokeError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                    attempts: tracker.retry.attempts,
                })
            }
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        if let Err(error) = &result {
            log_invocation_failure(error);
        }
        self.telemetry
            .emit(TelemetryEvent::Invocation(InvocationMetrics {
                model: self.backend.profile().display_name(),
                attempts: tracker.retry.attempts,
                retries: tracker.retry.retries_used,
                requests: tracker.usage.requests,
                tool_calls: tracker.usage.tool_calls,
                input_tokens: tracker.usage.input_tokens,
                output_tokens: tracker.usage.output_tokens,
                total_tokens: tracker.usage.total_tokens,
                duration_ms,
                state: tracker.state,
                failure: result.as_ref().err().map(InvokeError::kind),
            }));

        let (output, history) = result?;
        tracing::debug!(
            attempts = tracker.retry.attempts,
            retries = tracker.retry.retries_used,
            total_tokens = tracker.usage.total_tokens,
            duration_ms,
            "agent invocation succeeded"
        );
        Ok(InvocationOutcome {
            output,
            usage: tracker.usage,
            history,
            attempts: tracker.retry.attempts,
            retries: tracker.retry.retries_used,
            duration_ms,
        })
    }

    async fn run_with_retries(
        &self,
        request: &InvocationRequest,
        tracker: &mut AttemptTracker,
    ) -> Result<AgentRunOutput, InvokeError> {
        loop {
            tracker.transition(InvocationState::Sending);
            tracker.retry.record_attempt();

            let attempt = self
                .backend
                .run_metered(request.to_run_request(), &mut tracker.usage)
                .await;
            let error = match attempt {
                Ok(output) => {
                    tracker.transition(InvocationState::Success);
                    self.emit_attempt(tracker, None);
                    return Ok(output);
                }
                Err(error) => error,
            };

            let kind = error.failure_kind();
            if let BackendError::MalformedResponse { finish_reason } = error {
                if tracker.retry.try_consume_retry() {
                    tracing::warn!(
                        attempt = tracker.retry.attempts,
                        retries_used = tracker.retry.retries_used,
                        max_retries = tracker.retry.max_retries,
                        finish_reason = finish_reason.as_str(),
                        "malformed provider response; retrying"
                    );
                    tracker.transition(InvocationState::RetryPending);
                    self.emit_attempt(tracker, Some(kind));
                    continue;
                }
                tracker.transition(InvocationState::Failed);
                self.emit_attempt(tracker, Some(kind));
                return Err(InvokeError::MalformedResponse {
                    attempts: tracker.retry.attempts,
                    max_retries: tracker.retry.max_retries,
                    finish_reason,
                });
            }

            tracker.transition(InvocationState::Failed);
            self.emit_attempt(tracker, Some(kind));
            return Err(classify_backend_error(error));
        }
    }

    fn emit_attempt(&self, tracker: &AttemptTracker, failure: Option<FailureKind>) {
        self.telemetry.emit(TelemetryEvent::InvocationAttempt {
            attempt: tracker.retry.attempts,
            state: tracker.state,
            failure,
        });
    }
}

fn classify_backend_error(error: BackendError) -> InvokeError {
    match error.failure_kind() {
        FailureKind::ContextExceeded => InvokeError::ContextExceeded {
            message: error.to_string(),
        },
        FailureKind::ToolFailure => InvokeError::ToolFailure(error),
        FailureKind::Timeout
        | FailureKind::MalformedProviderResponse
        | FailureKind::ProviderError => InvokeError::Provider(error),
    }
}

fn log_invocation_failure(error: &InvokeError) {
    match error {
        InvokeError::ContextExceeded { message } => {
            tracing::error!(
                error = message.as_str(),
                "prompt exceeded the model context window; lower token_budget ratios or max_tokens"
            );
        }
        InvokeError::Timeout {
            timeout_ms,
            attempts,
        } => {
            tracing::error!(timeout_ms, attempts, "agent invocation timed out");
        }
        InvokeError::ToolFailure(source) | InvokeError::Provider(source) => {
            let kind = error.kind();
            if let BackendError::Aggregate(causes) = source {
                let total = causes.len();
                for (index, cause) in causes.iter().enumerate() {
                    tracing::error!(
                        kind = kind.as_str(),
                        cause_index = index + 1,
                        cause_total = total,
                        error = error_chain(cause).as_str(),
                        "agent invocation failure cause"
                    );
                }
            } else {
                tracing::error!(
                    kind = kind.as_str(),
                    error = error_chain(source).as_str(),
                    "agent invocation failed"
                );
            }
        }
        InvokeError::MalformedResponse { .. } | InvokeError::InvalidOutput(_) => {
            tracing::error!(
                kind = error.kind().as_str(),
                error = error_chain(error).as_str(),
                "agent invocation failed"
            );
        }
    }
}

/// Renders an error followed by its `source()` chain.
pub fn error_chain(error: &dyn std::error::Error) -> String {
    let mut rendered = error.to_string();
    let mut current = error.source();
    while let Some(source) = current {
        let text = source.to_string();
        if !rendered.contains(&text) {
            rendered.push_str(": ");
            rendered.push_str(&text);
        }
        current = source.source();
    }
    rendered
}
