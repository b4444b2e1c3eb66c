//! Tool-using agent loop over any [`LlmClient`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use triage_ai::{
    ChatRequest, ContentBlock, LlmClient, Message, MessageRole, ModelProfile, ModelRef, ToolCall,
    ToolChoice, ToolDefinition,
};

use crate::structured_output::{
    build_structured_output_retry_prompt, extract_json_payload, parse_structured_output,
    validate_tool_arguments,
};
use crate::{
    AgentBackend, AgentRunOutput, AgentRunRequest, AgentTool, BackendError, RunUsage,
    ToolExecutionResult,
};

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a support engineer triaging GitHub issues. Answer with JSON only.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Public struct `ToolLoopConfig` used across triage components.
pub struct ToolLoopConfig {
    pub system_prompt: String,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub max_parallel_tool_calls: usize,
    pub tool_timeout_ms: Option<u64>,
    pub structured_output_max_retries: usize,
}

impl Default for ToolLoopConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_tokens: None,
            temperature: Some(0.0),
            max_parallel_tool_calls: 4,
            tool_timeout_ms: Some(120_000),
            structured_output_max_retries: 1,
        }
    }
}

#[derive(Clone)]
struct RegisteredTool {
    definition: ToolDefinition,
    tool: Arc<dyn AgentTool>,
}

/// [`AgentBackend`] that alternates model requests and tool execution.
pub struct ToolLoopBackend {
    client: Arc<dyn LlmClient>,
    model: ModelRef,
    config: ToolLoopConfig,
    tools: BTreeMap<String, RegisteredTool>,
}

enum ToolOutcome {
    Completed(ToolExecutionResult),
    Failed(String),
}

impl ToolLoopBackend {
    pub fn new(client: Arc<dyn LlmClient>, model: ModelRef, config: ToolLoopConfig) -> Self {
        Self {
            client,
            model,
            config,
            tools: BTreeMap::new(),
        }
    }

    pub fn register_tool<T>(&mut self, tool: T)
    where
        T: AgentTool + 'static,
    {
        let definition = tool.definition();
        self.tools.insert(
            definition.name.clone(),
            RegisteredTool {
                definition,
                tool: Arc::new(tool),
            },
        );
    }

    pub fn has_tool(&self, tool_name: &str) -> bool {
        self.tools.contains_key(tool_name)
    }

    pub fn config(&self) -> &ToolLoopConfig {
        &self.config
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|registered| registered.definition.clone())
            .collect()
    }

    fn initial_messages(&self, request: &AgentRunRequest) -> Vec<Message> {
        let mut messages = Vec::with_capacity(request.history.len().saturating_add(2));
        let has_system = request
            .history
            .first()
            .map(|message| message.role == MessageRole::System)
            .unwrap_or(false);
        if !has_system {
            messages.push(Message::system(self.config.system_prompt.clone()));
        }
        messages.extend(request.history.iter().cloned());
        messages.push(Message::user(request.message.clone()));
        messages
    }

    async fn execute_tool_calls(
        &self,
        tool_calls: Vec<ToolCall>,
    ) -> Result<Vec<ContentBlock>, BackendError> {
        let max_parallel = self.config.max_parallel_tool_calls.max(1);
        let mut results = Vec::with_capacity(tool_calls.len());

        for chunk in tool_calls.chunks(max_parallel) {
            let mut pending = Vec::with_capacity(chunk.len());
            for call in chunk.iter().cloned() {
                tracing::debug!(
                    tool_name = call.name.as_str(),
                    tool_call_id = call.id.as_str(),
                    "executing tool call"
                );
                let handle = self.spawn_tool_call_task(call.clone());
                pending.push((call, handle));
            }

            let mut failures = Vec::new();
            for (call, handle) in pending {
                let outcome = match handle.await {
                    Ok(outcome) => outcome,
                    Err(error) => ToolOutcome::Failed(format!(
                        "tool '{}' execution task failed: {error}",
                        call.name
                    )),
                };
                match outcome {
                    ToolOutcome::Completed(result) => {
                        results.push(ContentBlock::ToolResult {
                            tool_call_id: call.id,
                            tool_name: call.name,
                            content: result.as_text(),
                            is_error: result.is_error,
                        });
                    }
                    ToolOutcome::Failed(message) => {
                        tracing::warn!(
                            tool_name = call.name.as_str(),
                            tool_call_id = call.id.as_str(),
                            error = message.as_str(),
                            "tool call failed"
                        );
                        failures.push(BackendError::ToolFailure {
                            tool_name: call.name,
                            tool_call_id: call.id,
                            message,
                        });
                    }
                }
            }

            if failures.len() > 1 {
                return Err(BackendError::Aggregate(failures));
            }
            if let Some(failure) = failures.pop() {
                return Err(failure);
            }
        }

        Ok(results)
    }

    fn spawn_tool_call_task(&self, call: ToolCall) -> tokio::task::JoinHandle<ToolOutcome> {
        let registered = self.tools.get(&call.name).cloned();
        let tool_timeout = self
            .config
            .tool_timeout_ms
            .filter(|timeout_ms| *timeout_ms > 0)
            .map(Duration::from_millis);
        tokio::spawn(async move { execute_tool_call_inner(call, registered, tool_timeout).await })
    }
}

#[async_trait]
impl AgentBackend for ToolLoopBackend {
    fn profile(&self) -> &dyn ModelProfile {
        &self.model
    }

    async fn run(&self, request: AgentRunRequest) -> Result<AgentRunOutput, BackendError> {
        let mut spent = RunUsage::default();
        self.run_metered(request, &mut spent).await
    }

    async fn run_metered(
        &self,
        request: AgentRunRequest,
        spent: &mut RunUsage,
    ) -> Result<AgentRunOutput, BackendError> {
        let mut messages = self.initial_messages(&request);
        let mut usage = RunUsage::default();
        let mut structured_retries = 0usize;
        let limits = request.usage_limits.clone();
        let tools = self.tool_definitions();

        loop {
            if usage.requests >= limits.request_limit {
                return Err(BackendError::UsageLimitExceeded {
                    limit: "request_limit",
                    value: limits.request_limit as u64,
                });
            }

            let context = match &request.history_processor {
                Some(processor) => processor.process(&messages),
                None => messages.clone(),
            };
            let chat_request = ChatRequest {
                model: self.model.model.clone(),
                messages: context,
                tool_choice: if tools.is_empty() {
                    None
                } else {
                    Some(ToolChoice::Auto)
                },
                tools: tools.clone(),
                json_mode: request.output_schema.is_some(),
                max_tokens: self.config.max_tokens,
                temperature: self.config.temperature,
            };

            let response = self.client.complete(chat_request).await?;
            usage.record_response(&response.usage);
            spent.record_response(&response.usage);
            tracing::debug!(
                model = self.model.model.as_str(),
                request = usage.requests,
                finish_reason = response.finish_reason.as_deref().unwrap_or("none"),
                total_tokens = usage.total_tokens,
                "model response received"
            );

            if response.is_malformed_tool_call() {
                return Err(BackendError::MalformedResponse {
                    finish_reason: response.finish_reason.unwrap_or_default(),
                });
            }
            if let Some(limit) = limits.total_tokens_limit {
                if usage.total_tokens > limit {
                    return Err(BackendError::UsageLimitExceeded {
                        limit: "total_tokens_limit",
                        value: limit,
                    });
                }
            }

            let assistant = response.message;
            messages.push(assistant.clone());
            let tool_calls = assistant.tool_calls();

            if tool_calls.is_empty() {
                let text = assistant.text_content();
                let Some(schema) = request.output_schema.as_ref() else {
                    let output = extract_json_payload(&text).unwrap_or(Value::String(text));
                    return Ok(AgentRunOutput {
                        output,
                        usage,
                        history: messages,
                    });
                };
                match parse_structured_output(&text, schema) {
                    Ok(output) => {
                        return Ok(AgentRunOutput {
                            output,
                            usage,
                            history: messages,
                        })
                    }
                    Err(error) => {
                        if structured_retries >= self.config.structured_output_max_retries {
                            return Err(BackendError::StructuredOutput(error));
                        }
                        structured_retries = structured_retries.saturating_add(1);
                        tracing::debug!(
                            attempt = structured_retries,
                            error = error.as_str(),
                            "re-prompting for structured output"
                        );
                        messages.push(Message::user(build_structured_output_retry_prompt(
                            schema, &error,
                        )));
                        continue;
                    }
                }
            }

            if let Some(limit) = limits.tool_calls_limit {
                if usage.tool_calls.saturating_add(tool_calls.len()) > limit {
                    return Err(BackendError::UsageLimitExceeded {
                        limit: "tool_calls_limit",
                        value: limit as u64,
                    });
                }
            }
            usage.tool_calls = usage.tool_calls.saturating_add(tool_calls.len());
            spent.tool_calls = spent.tool_calls.saturating_add(tool_calls.len());

            let results = self.execute_tool_calls(tool_calls).await?;
            messages.push(Message::tool_results(results));
        }
    }
}

async fn execute_tool_call_inner(
    call: ToolCall,
    registered: Option<RegisteredTool>,
    tool_timeout: Option<Duration>,
) -> ToolOutcome {
    let Some(RegisteredTool { definition, tool }) = registered else {
        return ToolOutcome::Completed(ToolExecutionResult::error(json!({
            "error": format!("Tool '{}' is not registered", call.name)
        })));
    };

    if let Err(error) = validate_tool_arguments(&definition, &call.arguments) {
        return ToolOutcome::Completed(ToolExecutionResult::error(json!({ "error": error })));
    }

    match tool_timeout {
        Some(timeout) => match tokio::time::timeout(timeout, tool.execute(call.arguments)).await {
            Ok(result) => ToolOutcome::Completed(result),
            Err(_) => ToolOutcome::Failed(format!(
                "tool '{}' timed out after {}ms",
                definition.name,
                timeout.as_millis()
            )),
        },
        None => ToolOutcome::Completed(tool.execute(call.arguments).await),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::{json, Value};
    use tokio::sync::Mutex as AsyncMutex;
    use triage_ai::{
        validate_tool_pairing, ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient,
        Message, ModelRef, ToolDefinition, TriageAiError,
    };

    use super::{ToolLoopBackend, ToolLoopConfig};
    use crate::{
        AgentBackend, AgentInvoker, AgentRunRequest, AgentTool, BackendError, FailureKind,
        HistoryProcessor, InvocationRequest, InvokerConfig, RunUsage, Telemetry,
        TelemetryEvent, ToolExecutionResult, UsageLimits,
    };

    struct CapturingMockClient {
        responses: AsyncMutex<VecDeque<Result<ChatResponse, TriageAiError>>>,
        requests: AsyncMutex<Vec<ChatRequest>>,
    }

    impl CapturingMockClient {
        fn new(responses: Vec<Result<ChatResponse, TriageAiError>>) -> Arc<Self> {
            Arc::new(Self {
                responses: AsyncMutex::new(responses.into()),
                requests: AsyncMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl LlmClient for CapturingMockClient {
        async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, TriageAiError> {
            self.requests.lock().await.push(request);
            self.responses.lock().await.pop_front().unwrap_or_else(|| {
                Err(TriageAiError::InvalidResponse(
                    "mock response queue is empty".to_string(),
                ))
            })
        }
    }

    struct EchoTool {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl AgentTool for EchoTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "search_docs".to_string(),
                description: "Searches documentation".to_string(),
                parameters: json!({
                    "type": "object",
                    "properties": { "query": { "type": "string" } },
                    "required": ["query"]
                }),
            }
        }

        async fn execute(&self, arguments: Value) -> ToolExecutionResult {
            self.calls.fetch_add(1, Ordering::Relaxed);
            ToolExecutionResult::ok(json!({ "hits": [arguments["query"].clone()] }))
        }
    }

    struct SlowTool {
        name: &'static str,
    }

    #[async_trait]
    impl AgentTool for SlowTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: self.name.to_string(),
                description: "Never finishes in time".to_string(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn execute(&self, _arguments: Value) -> ToolExecutionResult {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ToolExecutionResult::ok(json!("late"))
        }
    }

    struct PanicTool;

    #[async_trait]
    impl AgentTool for PanicTool {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "panic_tool".to_string(),
                description: "Always panics".to_string(),
                parameters: json!({ "type": "object" }),
            }
        }

        async fn execute(&self, _arguments: Value) -> ToolExecutionResult {
            panic!("forced panic in tool");
        }
    }

    struct CountingProcessor {
        calls: AtomicUsize,
    }

    impl HistoryProcessor for CountingProcessor {
        fn process(&self, history: &[Message]) -> Vec<Message> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            history.to_vec()
        }
    }

    fn text_response(text: &str) -> Result<ChatResponse, TriageAiError> {
        Ok(ChatResponse {
            message: Message::assistant_text(text),
            finish_reason: Some("stop".to_string()),
            usage: ChatUsage {
                input_tokens: 10,
                output_tokens: 5,
                total_tokens: 15,
            },
        })
    }

    fn tool_call_response(calls: &[(&str, &str)]) -> Result<ChatResponse, TriageAiError> {
        Ok(ChatResponse {
            message: Message::assistant_blocks(
                calls
                    .iter()
                    .map(|(id, name)| ContentBlock::ToolCall {
                        id: id.to_string(),
                        name: name.to_string(),
                        arguments: json!({ "query": "login" }),
                    })
                    .collect(),
            ),
            finish_reason: Some("tool_calls".to_string()),
            usage: ChatUsage {
                input_tokens: 8,
                output_tokens: 2,
                total_tokens: 10,
            },
        })
    }

    fn request(schema: Option<Value>) -> AgentRunRequest {
        AgentRunRequest {
            message: "Triage issue #42".to_string(),
            history: Vec::new(),
            history_processor: None,
            usage_limits: UsageLimits::default(),
            output_schema: schema,
        }
    }

    fn category_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "category": { "type": "string" } },
            "required": ["category"]
        })
    }

    fn backend(client: Arc<CapturingMockClient>, config: ToolLoopConfig) -> ToolLoopBackend {
        ToolLoopBackend::new(
            client,
            ModelRef::parse("openai/gpt-4o-mini").expect("model"),
            config,
        )
    }

    #[tokio::test]
    async fn functional_run_executes_tools_and_returns_structured_output() {
        let client = CapturingMockClient::new(vec![
            tool_call_response(&[("call_1", "search_docs")]),
            text_response(r#"{"category":"bug"}"#),
        ]);
        let calls = Arc::new(AtomicUsize::new(0));
        let mut backend = backend(Arc::clone(&client), ToolLoopConfig::default());
        backend.register_tool(EchoTool {
            calls: Arc::clone(&calls),
        });

        let output = backend
            .run(request(Some(category_schema())))
            .await
            .expect("run succeeds");

        assert_eq!(output.output, json!({ "category": "bug" }));
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(output.usage.requests, 2);
        assert_eq!(output.usage.tool_calls, 1);
        assert_eq!(output.usage.total_tokens, 25);
        assert_eq!(validate_tool_pairing(&output.history), Ok(()));
        assert_eq!(output.history.len(), 5);

        let requests = client.requests.lock().await;
        assert!(requests[0].json_mode);
        assert_eq!(requests[0].model, "gpt-4o-mini");
        assert_eq!(requests[0].tools.len(), 1);
        assert_eq!(requests[1].messages.len(), 4);
    }

    #[tokio::test]
    async fn functional_history_processor_runs_before_every_request() {
        let client = CapturingMockClient::new(vec![
            tool_call_response(&[("call_1", "search_docs")]),
            text_response("plain answer"),
        ]);
        let mut backend = backend(client, ToolLoopConfig::default());
        backend.register_tool(EchoTool {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let processor = Arc::new(CountingProcessor {
            calls: AtomicUsize::new(0),
        });
        let mut run_request = request(None);
        run_request.history_processor = Some(processor.clone());

        let output = backend.run(run_request).await.expect("run succeeds");

        assert_eq!(processor.calls.load(Ordering::Relaxed), 2);
        assert_eq!(output.output, Value::String("plain answer".to_string()));
    }

    #[tokio::test]
    async fn unit_malformed_finish_reason_is_reported() {
        let client = CapturingMockClient::new(vec![Ok(ChatResponse {
            message: Message::assistant_text(""),
            finish_reason: Some("malformed_function_call".to_string()),
            usage: ChatUsage::default(),
        })]);
        let error = backend(client, ToolLoopConfig::default())
            .run(request(None))
            .await
            .expect_err("malformed");
        assert_eq!(error.failure_kind(), FailureKind::MalformedProviderResponse);
    }

    fn malformed_response(total_tokens: u64) -> Result<ChatResponse, TriageAiError> {
        Ok(ChatResponse {
            message: Message::assistant_text(""),
            finish_reason: Some("malformed_function_call".to_string()),
            usage: ChatUsage {
                input_tokens: total_tokens,
                output_tokens: 0,
                total_tokens,
            },
        })
    }

    #[tokio::test]
    async fn unit_run_metered_records_usage_of_failed_runs() {
        let client = CapturingMockClient::new(vec![malformed_response(40)]);
        let mut spent = RunUsage::default();
        let error = backend(client, ToolLoopConfig::default())
            .run_metered(request(None), &mut spent)
            .await
            .expect_err("malformed");
        assert_eq!(error.failure_kind(), FailureKind::MalformedProviderResponse);
        assert_eq!(spent.requests, 1);
        assert_eq!(spent.total_tokens, 40);
    }

    #[tokio::test]
    async fn integration_invocation_metrics_include_retried_attempts() {
        let client = CapturingMockClient::new(vec![
            malformed_response(40),
            malformed_response(30),
            text_response(r#"{"category":"bug"}"#),
        ]);
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let telemetry = Telemetry::new(move |event| {
            if let TelemetryEvent::Invocation(metrics) = event {
                sink.lock().expect("lock").push(metrics.clone());
            }
        });
        let invoker = AgentInvoker::new(
            Arc::new(backend(client, ToolLoopConfig::default())),
            InvokerConfig::default(),
            telemetry,
        );

        let outcome = invoker
            .run::<Value>(InvocationRequest::new("Triage issue #42"))
            .await
            .expect("succeeds after retries");
        assert_eq!(outcome.retries, 2);
        assert_eq!(outcome.usage.requests, 3);
        assert_eq!(outcome.usage.total_tokens, 85);

        let metrics = events.lock().expect("lock");
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].requests, 3);
        assert_eq!(metrics[0].input_tokens, 80);
        assert_eq!(metrics[0].total_tokens, 85);
    }

    #[tokio::test]
    async fn unit_prompt_too_large_is_context_exceeded() {
        let client = CapturingMockClient::new(vec![Err(TriageAiError::HttpStatus {
            status: 400,
            body: "This model's maximum context length is 8192 tokens".to_string(),
        })]);
        let error = backend(client, ToolLoopConfig::default())
            .run(request(None))
            .await
            .expect_err("context exceeded");
        assert!(matches!(error, BackendError::ContextExceeded { .. }));
    }

    #[tokio::test]
    async fn regression_structured_output_retries_then_fails() {
        let client = CapturingMockClient::new(vec![
            text_response("not json"),
            text_response(r#"{"labels":[]}"#),
        ]);
        let error = backend(Arc::clone(&client), ToolLoopConfig::default())
            .run(request(Some(category_schema())))
            .await
            .expect_err("structured output");
        assert!(matches!(error, BackendError::StructuredOutput(_)));
        let requests = client.requests.lock().await;
        assert_eq!(requests.len(), 2);
        let retry_prompt = requests[1]
            .messages
            .last()
            .map(Message::text_content)
            .unwrap_or_default();
        assert!(retry_prompt.contains("could not be accepted as structured JSON"));
    }

    #[tokio::test]
    async fn regression_tool_timeout_is_a_hard_failure() {
        let client =
            CapturingMockClient::new(vec![tool_call_response(&[("call_1", "slow_tool")])]);
        let mut backend = backend(
            client,
            ToolLoopConfig {
                tool_timeout_ms: Some(20),
                ..ToolLoopConfig::default()
            },
        );
        backend.register_tool(SlowTool { name: "slow_tool" });

        let error = backend.run(request(None)).await.expect_err("timeout");
        match error {
            BackendError::ToolFailure {
                tool_name,
                tool_call_id,
                message,
            } => {
                assert_eq!(tool_name, "slow_tool");
                assert_eq!(tool_call_id, "call_1");
                assert!(message.contains("timed out after 20ms"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn integration_parallel_tool_failures_are_aggregated() {
        let client = CapturingMockClient::new(vec![tool_call_response(&[
            ("call_1", "slow_a"),
            ("call_2", "panic_tool"),
        ])]);
        let mut backend = backend(
            client,
            ToolLoopConfig {
                tool_timeout_ms: Some(20),
                ..ToolLoopConfig::default()
            },
        );
        backend.register_tool(SlowTool { name: "slow_a" });
        backend.register_tool(PanicTool);

        let error = backend.run(request(None)).await.expect_err("aggregate");
        let BackendError::Aggregate(causes) = &error else {
            panic!("expected aggregate, got {error:?}");
        };
        assert_eq!(causes.len(), 2);
        assert_eq!(error.failure_kind(), FailureKind::ToolFailure);
    }

    #[tokio::test]
    async fn functional_soft_tool_errors_are_fed_back_to_the_model() {
        let client = CapturingMockClient::new(vec![
            tool_call_response(&[("call_1", "unknown_tool")]),
            text_response(r#"{"category":"question"}"#),
        ]);
        let output = backend(Arc::clone(&client), ToolLoopConfig::default())
            .run(request(None))
            .await
            .expect("run succeeds");
        assert_eq!(output.output, json!({ "category": "question" }));
        let requests = client.requests.lock().await;
        let tool_message = requests[1].messages.last().expect("tool result");
        match &tool_message.content[0] {
            ContentBlock::ToolResult {
                is_error, content, ..
            } => {
                assert!(*is_error);
                assert!(content.contains("is not registered"));
            }
            other => panic!("unexpected block: {other:?}"),
        }
    }

    #[tokio::test]
    async fn regression_tool_call_limit_is_enforced() {
        let client = CapturingMockClient::new(vec![tool_call_response(&[
            ("call_1", "search_docs"),
            ("call_2", "search_docs"),
        ])]);
        let mut backend = backend(client, ToolLoopConfig::default());
        backend.register_tool(EchoTool {
            calls: Arc::new(AtomicUsize::new(0)),
        });
        let mut run_request = request(None);
        run_request.usage_limits.tool_calls_limit = Some(1);

        let error = backend.run(run_request).await.expect_err("limit");
        assert!(matches!(
            error,
            BackendError::UsageLimitExceeded {
                limit: "tool_calls_limit",
                value: 1
            }
        ));
    }

    #[tokio::test]
    async fn unit_existing_system_message_is_not_duplicated() {
        let client = CapturingMockClient::new(vec![text_response("{}")]);
        let mut run_request = request(None);
        run_request.history = vec![Message::system("custom system")];
        backend(Arc::clone(&client), ToolLoopConfig::default())
            .run(run_request)
            .await
            .expect("run succeeds");
        let requests = client.requests.lock().await;
        assert_eq!(requests[0].messages.len(), 2);
        assert_eq!(requests[0].messages[0].text_content(), "custom system");
    }
}
