use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use triage_agent_core::{AgentBackend, AgentRunOutput, AgentRunRequest, BackendError, RunUsage};
use triage_ai::{ModelProfile, ModelRef, TriageAiError};

type Responder =
    Box<dyn Fn(&AgentRunRequest) -> Result<AgentRunOutput, BackendError> + Send + Sync>;

pub(crate) struct ScriptedBackend {
    model: ModelRef,
    outcomes: AsyncMutex<VecDeque<Result<AgentRunOutput, BackendError>>>,
    responder: Option<Responder>,
    requests: AsyncMutex<Vec<AgentRunRequest>>,
    pub(crate) calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(outcomes: Vec<Result<AgentRunOutput, BackendError>>) -> Self {
        Self {
            model: ModelRef::parse("openai/gpt-4o-mini").expect("model"),
            outcomes: AsyncMutex::new(outcomes.into()),
            responder: None,
            requests: AsyncMutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn responding<F>(responder: F) -> Self
    where
        F: Fn(&AgentRunRequest) -> Result<AgentRunOutput, BackendError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new(Vec::new())
        }
    }

    pub(crate) async fn requests(&self) -> Vec<AgentRunRequest> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn profile(&self) -> &dyn ModelProfile {
        &self.model
    }

    async fn run(&self, request: AgentRunRequest) -> Result<AgentRunOutput, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().await.push(request.clone());
        if let Some(responder) = &self.responder {
            return responder(&request);
        }
        self.outcomes.lock().await.pop_front().unwrap_or_else(|| {
            Err(BackendError::Provider(TriageAiError::InvalidResponse(
                "script exhausted".to_string(),
            )))
        })
    }
}

pub(crate) fn triage_json(category: &str) -> Value {
    json!({
        "category": category,
        "labels": ["needs-triage"],
        "confidence": 0.75,
        "explanation": "matches a known pattern",
        "suggested_actions": ["ask for logs"]
    })
}

pub(crate) fn ok_output(output: Value) -> Result<AgentRunOutput, BackendError> {
    Ok(AgentRunOutput {
        output,
        usage: RunUsage {
            requests: 1,
            tool_calls: 0,
            input_tokens: 100,
            output_tokens: 20,
            total_tokens: 120,
        },
        history: Vec::new(),
    })
}

pub(crate) fn malformed() -> Result<AgentRunOutput, BackendError> {
    Err(BackendError::MalformedResponse {
        finish_reason: "malformed_function_call".to_string(),
    })
}
