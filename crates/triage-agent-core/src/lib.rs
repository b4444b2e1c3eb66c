//! Agent execution core: history trimming, the backend contract, the tool
//! loop backend and the resilient invoker.
mod backend;
mod history;
mod invoker;
mod structured_output;
mod telemetry;
mod tool_loop;

pub use backend::{
    AgentBackend, AgentRunOutput, AgentRunRequest, AgentTool, BackendError, FailureKind,
    RunUsage, ToolExecutionResult, UsageLimits, DEFAULT_REQUEST_LIMIT, DEFAULT_TOOL_CALLS_LIMIT,
};
pub use history::{
    select_conversation_tail, trim_history, HistoryProcessor, HistoryTrimmer, TokenBudget,
    TokenBudgetError, TrimLevel, TrimReport,
};
pub use invoker::{
    error_chain, AgentInvoker, InvocationMetrics, InvocationOutcome, InvocationRequest,
    InvocationState, InvokeError, InvokerConfig, RetryState, DEFAULT_INVOCATION_TIMEOUT_MS,
    DEFAULT_MAX_MALFORMED_RETRIES,
};
pub use structured_output::extract_json_payload;
pub use telemetry::{MemoryRetrievalReport, Telemetry, TelemetryEvent, TelemetrySink};
pub use tool_loop::{ToolLoopBackend, ToolLoopConfig, DEFAULT_SYSTEM_PROMPT};
