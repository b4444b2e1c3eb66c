//! Backend capability adapters.
//!
//! Each backend family gets at most one adapter per registry. Adapters are
//! installed on first use through [`AdapterRegistry::ensure_installed`] and
//! then shared by every client of that family, so concurrent runners never
//! re-apply or race on provider quirk handling.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;

use crate::{
    BackendFamily, ChatRequest, ChatResponse, ContentBlock, LlmClient, Message, TriageAiError,
    MALFORMED_FUNCTION_CALL_FINISH_REASON,
};

const RESPONSES_API_CALL_ID_PREFIX: &str = "fc_";
const CHAT_API_CALL_ID_PREFIX: &str = "call_";

/// Provider-specific request/response normalization.
pub trait BackendAdapter: Send + Sync {
    fn family(&self) -> BackendFamily;

    fn normalize_request(&self, request: ChatRequest) -> ChatRequest {
        request
    }

    fn normalize_response(&self, response: ChatResponse) -> ChatResponse {
        response
    }
}

/// Aligns tool-call ids issued by the Responses API with the Chat Completions form.
///
/// Only a fallback for output items that lack `call_id`: the client parses
/// `call_id` first, and those ids already carry the `call_` prefix. A
/// rewritten `fc_` item id pairs calls with results locally but names no real
/// provider-side call.
#[derive(Debug, Default)]
pub struct OpenAiToolCallIdAdapter;

impl OpenAiToolCallIdAdapter {
    fn normalize_id(id: &str) -> String {
        match id.strip_prefix(RESPONSES_API_CALL_ID_PREFIX) {
            Some(rest) if !rest.is_empty() => format!("{CHAT_API_CALL_ID_PREFIX}{rest}"),
            _ => id.to_string(),
        }
    }

    fn normalize_message(message: Message) -> Message {
        let Message { role, content } = message;
        let content = content
            .into_iter()
            .map(|block| match block {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => ContentBlock::ToolCall {
                    id: Self::normalize_id(&id),
                    name,
                    arguments,
                },
                ContentBlock::ToolResult {
                    tool_call_id,
                    tool_name,
                    content,
                    is_error,
                } => ContentBlock::ToolResult {
                    tool_call_id: Self::normalize_id(&tool_call_id),
                    tool_name,
                    content,
                    is_error,
                },
                other => other,
            })
            .collect();
        Message { role, content }
    }
}

impl BackendAdapter for OpenAiToolCallIdAdapter {
    fn family(&self) -> BackendFamily {
        BackendFamily::OpenAi
    }

    fn normalize_request(&self, mut request: ChatRequest) -> ChatRequest {
        request.messages = request
            .messages
            .into_iter()
            .map(Self::normalize_message)
            .collect();
        request
    }

    fn normalize_response(&self, mut response: ChatResponse) -> ChatResponse {
        response.message = Self::normalize_message(response.message);
        response
    }
}

/// Maps Google finish reasons onto the canonical vocabulary, including the
/// malformed-call reasons the generic parser does not know.
#[derive(Debug, Default)]
pub struct GoogleFinishReasonAdapter;

impl GoogleFinishReasonAdapter {
    fn canonical_finish_reason(raw: &str) -> String {
        match raw.trim().to_ascii_uppercase().as_str() {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" | "SPII" => {
                "content_filter".to_string()
            }
            "MALFORMED_FUNCTION_CALL" | "UNEXPECTED_TOOL_CALL" => {
                MALFORMED_FUNCTION_CALL_FINISH_REASON.to_string()
            }
            _ => raw.trim().to_ascii_lowercase(),
        }
    }
}

impl BackendAdapter for GoogleFinishReasonAdapter {
    fn family(&self) -> BackendFamily {
        BackendFamily::Google
    }

    fn normalize_response(&self, mut response: ChatResponse) -> ChatResponse {
        response.finish_reason = response
            .finish_reason
            .as_deref()
            .map(Self::canonical_finish_reason);
        response
    }
}

/// Adapter for families without known quirks.
#[derive(Debug)]
pub struct PassthroughAdapter {
    family: BackendFamily,
}

impl BackendAdapter for PassthroughAdapter {
    fn family(&self) -> BackendFamily {
        self.family
    }
}

fn build_adapter(family: BackendFamily) -> Arc<dyn BackendAdapter> {
    match family {
        BackendFamily::OpenAi => Arc::new(OpenAiToolCallIdAdapter),
        BackendFamily::Google => Arc::new(GoogleFinishReasonAdapter),
        BackendFamily::Anthropic | BackendFamily::Other => Arc::new(PassthroughAdapter { family }),
    }
}

/// Idempotent per-family adapter registry.
#[derive(Default)]
pub struct AdapterRegistry {
    installed: Mutex<HashMap<BackendFamily, Arc<dyn BackendAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the process-wide registry.
    pub fn global() -> &'static AdapterRegistry {
        static GLOBAL: OnceLock<AdapterRegistry> = OnceLock::new();
        GLOBAL.get_or_init(AdapterRegistry::new)
    }

    /// Installs the adapter for `family` if missing and returns the installed instance.
    pub fn ensure_installed(&self, family: BackendFamily) -> Arc<dyn BackendAdapter> {
        let mut installed = lock_or_recover(&self.installed);
        if let Some(adapter) = installed.get(&family) {
            return Arc::clone(adapter);
        }
        let adapter = build_adapter(family);
        installed.insert(family, Arc::clone(&adapter));
        tracing::debug!(family = family.as_str(), "installed backend adapter");
        adapter
    }

    pub fn is_installed(&self, family: BackendFamily) -> bool {
        lock_or_recover(&self.installed).contains_key(&family)
    }

    pub fn installed_count(&self) -> usize {
        lock_or_recover(&self.installed).len()
    }

    /// Wraps `client` with the adapter installed for `family`.
    pub fn adapt_client(
        &self,
        family: BackendFamily,
        client: Arc<dyn LlmClient>,
    ) -> Arc<dyn LlmClient> {
        Arc::new(AdaptedClient {
            inner: client,
            adapter: self.ensure_installed(family),
        })
    }
}

/// `LlmClient` decorator applying one backend adapter.
pub struct AdaptedClient {
    inner: Arc<dyn LlmClient>,
    adapter: Arc<dyn BackendAdapter>,
}

impl AdaptedClient {
    pub fn family(&self) -> BackendFamily {
        self.adapter.family()
    }
}

#[async_trait]
impl LlmClient for AdaptedClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, TriageAiError> {
        let request = self.adapter.normalize_request(request);
        let response = self.inner.complete(request).await?;
        Ok(self.adapter.normalize_response(response))
    }
}

fn lock_or_recover<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
