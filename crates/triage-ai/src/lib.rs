//! Provider-neutral model types, HTTP clients and backend capability adapters.
mod adapters;
mod openai;
mod provider;
mod retry;
mod types;

pub use adapters::{
    AdaptedClient, AdapterRegistry, BackendAdapter, GoogleFinishReasonAdapter,
    OpenAiToolCallIdAdapter, PassthroughAdapter,
};
pub use openai::{OpenAiApiMode, OpenAiAuthScheme, OpenAiClient, OpenAiConfig};
pub use provider::{BackendFamily, ModelProfile, ModelRef, ModelRefParseError};
pub use types::{
    validate_tool_pairing, ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient,
    Message, MessageRole, PairingViolation, ToolCall, ToolChoice, ToolDefinition, TriageAiError,
    MALFORMED_FUNCTION_CALL_FINISH_REASON,
};
