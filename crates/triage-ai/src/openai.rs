use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::sleep;

use crate::{
    retry::{new_request_id, parse_retry_after_ms, HttpRetryPolicy},
    ChatRequest, ChatResponse, ChatUsage, ContentBlock, LlmClient, Message, MessageRole,
    ToolChoice, ToolDefinition, TriageAiError,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Enumerates supported `OpenAiAuthScheme` values.
pub enum OpenAiAuthScheme {
    #[default]
    Bearer,
    ApiKeyHeader,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
/// Which OpenAI API surface requests are sent to.
pub enum OpenAiApiMode {
    #[default]
    ChatCompletions,
    Responses,
}

#[derive(Debug, Clone)]
/// Public struct `OpenAiConfig` used across triage components.
pub struct OpenAiConfig {
    pub api_base: String,
    pub api_key: String,
    pub organization: Option<String>,
    pub request_timeout_ms: u64,
    pub max_retries: usize,
    pub retry_budget_ms: u64,
    pub retry_jitter: bool,
    pub auth_scheme: OpenAiAuthScheme,
    pub api_mode: OpenAiApiMode,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.openai.com/v1".to_string(),
            api_key: String::new(),
            organization: None,
            request_timeout_ms: 300_000,
            max_retries: 2,
            retry_budget_ms: 0,
            retry_jitter: true,
            auth_scheme: OpenAiAuthScheme::Bearer,
            api_mode: OpenAiApiMode::ChatCompletions,
        }
    }
}

#[derive(Debug, Clone)]
/// Client for OpenAI-compatible endpoints.
pub struct OpenAiClient {
    client: reqwest::Client,
    config: OpenAiConfig,
}

impl OpenAiClient {
    pub fn new(config: OpenAiConfig) -> Result<Self, TriageAiError> {
        if config.api_key.trim().is_empty() {
            return Err(TriageAiError::MissingApiKey);
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        match config.auth_scheme {
            OpenAiAuthScheme::Bearer => {
                let bearer = format!("Bearer {}", config.api_key.trim());
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&bearer).map_err(|e| {
                        TriageAiError::InvalidResponse(format!("invalid API key header: {e}"))
                    })?,
                );
            }
            OpenAiAuthScheme::ApiKeyHeader => {
                headers.insert(
                    "api-key",
                    HeaderValue::from_str(config.api_key.trim()).map_err(|e| {
                        TriageAiError::InvalidResponse(format!("invalid API key header: {e}"))
                    })?,
                );
            }
        }

        if let Some(org) = &config.organization {
            headers.insert(
                "OpenAI-Organization",
                HeaderValue::from_str(org).map_err(|e| {
                    TriageAiError::InvalidResponse(format!("invalid organization header: {e}"))
                })?,
            );
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()?;

        Ok(Self { client, config })
    }

    fn chat_completions_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            return base.to_string();
        }

        format!("{base}/chat/completions")
    }

    fn responses_url(&self) -> String {
        let base = self.config.api_base.trim_end_matches('/');
        if base.ends_with("/responses") {
            return base.to_string();
        }
        if let Some(prefix) = base.strip_suffix("/chat/completions") {
            return format!("{prefix}/responses");
        }

        format!("{base}/responses")
    }

    fn retry_policy(&self) -> HttpRetryPolicy {
        HttpRetryPolicy {
            max_retries: self.config.max_retries,
            budget_ms: self.config.retry_budget_ms,
            jitter: self.config.retry_jitter,
        }
    }

    async fn post_with_retry(&self, url: &str, body: &Value) -> Result<String, TriageAiError> {
        let policy = self.retry_policy();
        let started = Instant::now();
        let mut attempt = 0usize;

        loop {
            let response = self
                .client
                .post(url)
                .header("x-triage-request-id", new_request_id())
                .header("x-triage-retry-attempt", attempt.to_string())
                .json(body)
                .send()
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (error, delay_ms) = match response {
                Ok(response) if response.status().is_success() => {
                    return Ok(response.text().await?);
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after_ms = parse_retry_after_ms(response.headers());
                    let body = response.text().await?;
                    let delay_ms = HttpRetryPolicy::is_retryable_status(status)
                        .then(|| policy.next_delay_ms(attempt, elapsed_ms, retry_after_ms))
                        .flatten();
                    (TriageAiError::HttpStatus { status, body }, delay_ms)
                }
                Err(error) => {
                    let delay_ms = HttpRetryPolicy::is_retryable_error(&error)
                        .then(|| policy.next_delay_ms(attempt, elapsed_ms, None))
                        .flatten();
                    (TriageAiError::Http(error), delay_ms)
                }
            };

            let Some(delay_ms) = delay_ms else {
                return Err(error);
            };
            tracing::debug!(
                attempt,
                delay_ms,
                error = %error,
                "retrying provider request"
            );
            sleep(Duration::from_millis(delay_ms)).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, TriageAiError> {
        match self.config.api_mode {
            OpenAiApiMode::ChatCompletions => {
                let body = build_chat_request_body(&request)?;
                let raw = self
                    .post_with_retry(&self.chat_completions_url(), &body)
                    .await?;
                parse_chat_response(&raw)
            }
            OpenAiApiMode::Responses => {
                let body = build_responses_request_body(&request)?;
                let raw = self.post_with_retry(&self.responses_url(), &body).await?;
                parse_responses_api_response(&raw)
            }
        }
    }
}

fn build_chat_request_body(request: &ChatRequest) -> Result<Value, TriageAiError> {
    let messages = to_openai_messages(&request.messages)?;
    let mut body = json!({
        "model": request.model,
        "messages": messages,
    });

    if !request.tools.is_empty() {
        body["tools"] = to_openai_tools(&request.tools);
    }

    if let Some(tool_choice) = request.tool_choice.as_ref() {
        if !request.tools.is_empty() || matches!(tool_choice, ToolChoice::None) {
            body["tool_choice"] = to_openai_tool_choice(tool_choice);
        }
    }

    if request.json_mode {
        body["response_format"] = json!({
            "type": "json_object",
        });
    }

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }

    Ok(body)
}

fn build_responses_request_body(request: &ChatRequest) -> Result<Value, TriageAiError> {
    let input = to_openai_responses_input(&request.messages)?;
    let mut body = json!({
        "model": request.model,
        "input": input,
    });

    if !request.tools.is_empty() {
        body["tools"] = to_openai_responses_tools(&request.tools);
        if let Some(tool_choice) = request.tool_choice.as_ref() {
            body["tool_choice"] = to_openai_tool_choice_label(tool_choice);
        }
    }

    if request.json_mode {
        body["text"] = json!({ "format": { "type": "json_object" } });
    }

    if let Some(max_tokens) = request.max_tokens {
        body["max_output_tokens"] = json!(max_tokens);
    }

    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }

    Ok(body)
}

fn to_openai_tool_choice(tool_choice: &ToolChoice) -> Value {
    to_openai_tool_choice_label(tool_choice)
}

fn to_openai_tool_choice_label(tool_choice: &ToolChoice) -> Value {
    match tool_choice {
        ToolChoice::Auto => json!("auto"),
        ToolChoice::None => json!("none"),
        ToolChoice::Required => json!("required"),
    }
}

fn to_openai_tools(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn to_openai_responses_tools(tools: &[ToolDefinition]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "name": tool.name,
                    "description": tool.description,
                    "parameters": tool.parameters,
                })
            })
            .collect(),
    )
}

fn to_openai_messages(messages: &[Message]) -> Result<Vec<Value>, TriageAiError> {
    let mut serialized = Vec::new();

    for message in messages {
        match message.role {
            MessageRole::System => serialized.push(json!({
                "role": "system",
                "content": message.text_content(),
            })),
            MessageRole::User => {
                for block in &message.content {
                    if let ContentBlock::ToolResult {
                        tool_call_id,
                        tool_name,
                        content,
                        ..
                    } = block
                    {
                        if tool_call_id.trim().is_empty() {
                            return Err(TriageAiError::InvalidResponse(
                                "tool result is missing tool_call_id".to_string(),
                            ));
                        }
                        serialized.push(json!({
                            "role": "tool",
                            "tool_call_id": tool_call_id,
                            "name": tool_name,
                            "content": content,
                        }));
                    }
                }
                let text = message.text_content();
                if !text.is_empty() || !message.has_tool_result() {
                    serialized.push(json!({
                        "role": "user",
                        "content": text,
                    }));
                }
            }
            MessageRole::Assistant => {
                let tool_calls: Vec<Value> = message
                    .tool_calls()
                    .into_iter()
                    .map(|call| {
                        json!({
                            "id": call.id,
                            "type": "function",
                            "function": {
                                "name": call.name,
                                "arguments": stringify_tool_arguments(&call.arguments),
                            }
                        })
                    })
                    .collect();

                let text = message.text_content();
                let content = if text.trim().is_empty() && !tool_calls.is_empty() {
                    Value::Null
                } else {
                    Value::String(text)
                };

                if tool_calls.is_empty() {
                    serialized.push(json!({
                        "role": "assistant",
                        "content": content,
                    }));
                } else {
                    serialized.push(json!({
                        "role": "assistant",
                        "content": content,
                        "tool_calls": tool_calls,
                    }));
                }
            }
        }
    }

    Ok(serialized)
}

fn to_openai_responses_input(messages: &[Message]) -> Result<Vec<Value>, TriageAiError> {
    let mut input = Vec::new();
    for message in messages {
        let text = message.text_content();
        if !text.is_empty() {
            input.push(json!({
                "role": to_openai_role_name(message.role),
                "content": text,
            }));
        }
        for block in &message.content {
            match block {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => input.push(json!({
                    "type": "function_call",
                    "call_id": id,
                    "name": name,
                    "arguments": stringify_tool_arguments(arguments),
                })),
                ContentBlock::ToolResult {
                    tool_call_id,
                    content,
                    ..
                } => {
                    if tool_call_id.trim().is_empty() {
                        return Err(TriageAiError::InvalidResponse(
                            "tool result is missing tool_call_id".to_string(),
                        ));
                    }
                    input.push(json!({
                        "type": "function_call_output",
                        "call_id": tool_call_id,
                        "output": content,
                    }));
                }
                ContentBlock::Text { .. } => {}
            }
        }
    }
    Ok(input)
}

fn to_openai_role_name(role: MessageRole) -> &'static str {
    match role {
        MessageRole::System => "system",
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
    }
}

fn stringify_tool_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(value) => value.clone(),
        value => value.to_string(),
    }
}

fn parse_chat_response(raw: &str) -> Result<ChatResponse, TriageAiError> {
    let parsed: OpenAiChatResponse = serde_json::from_str(raw)?;
    let choice = parsed.choices.into_iter().next().ok_or_else(|| {
        TriageAiError::InvalidResponse("response contained no choices".to_string())
    })?;

    let mut content = Vec::new();
    if let Some(text) = choice.message.content {
        if !text.is_empty() {
            content.push(ContentBlock::Text { text });
        }
    }

    if let Some(tool_calls) = choice.message.tool_calls {
        for tool_call in tool_calls {
            if tool_call.call_type != "function" {
                continue;
            }
            content.push(ContentBlock::ToolCall {
                id: tool_call.id,
                name: tool_call.function.name,
                arguments: parse_tool_call_arguments(Some(&tool_call.function.arguments)),
            });
        }
    }

    let usage = parsed
        .usage
        .map(|usage| ChatUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_blocks(content),
        finish_reason: choice.finish_reason,
        usage,
    })
}

fn parse_responses_api_response(raw: &str) -> Result<ChatResponse, TriageAiError> {
    let parsed: OpenAiResponsesResponse = serde_json::from_str(raw)?;
    let mut content = Vec::new();

    for output_item in parsed.output.unwrap_or_default() {
        match output_item.item_type.as_deref() {
            Some("message") => {
                for part in output_item.content.unwrap_or_default() {
                    if let Some(text) = part.text {
                        if !text.is_empty() {
                            content.push(ContentBlock::Text { text });
                        }
                    }
                }
            }
            Some("function_call") => {
                let Some(name) = output_item.name else {
                    continue;
                };
                // `id` is the output item id (`fc_...`); `call_id` links the call to its output.
                let id = output_item
                    .call_id
                    .or(output_item.id)
                    .unwrap_or_else(|| "response_function_call".to_string());
                content.push(ContentBlock::ToolCall {
                    id,
                    name,
                    arguments: parse_tool_call_arguments(output_item.arguments.as_deref()),
                });
            }
            _ => {}
        }
    }

    let has_tool_calls = content
        .iter()
        .any(|block| matches!(block, ContentBlock::ToolCall { .. }));
    let finish_reason = match parsed.status.as_deref() {
        Some("completed") if has_tool_calls => Some("tool_calls".to_string()),
        Some("completed") => Some("stop".to_string()),
        Some("incomplete") => Some("length".to_string()),
        other => other.map(str::to_string),
    };

    let usage = parsed
        .usage
        .map(|usage| {
            let input_tokens = usage.input_tokens.unwrap_or_default();
            let output_tokens = usage.output_tokens.unwrap_or_default();
            ChatUsage {
                input_tokens,
                output_tokens,
                total_tokens: usage
                    .total_tokens
                    .unwrap_or(input_tokens.saturating_add(output_tokens)),
            }
        })
        .unwrap_or_default();

    Ok(ChatResponse {
        message: Message::assistant_blocks(content),
        finish_reason,
        usage,
    })
}

fn parse_tool_call_arguments(arguments: Option<&str>) -> Value {
    let Some(arguments) = arguments else {
        return Value::Null;
    };

    match serde_json::from_str::<Value>(arguments) {
        Ok(value) => value,
        Err(_) => Value::String(arguments.to_string()),
    }
}

#[derive(Debug, Deserialize)]
struct OpenAiChatResponse {
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponsesResponse {
    status: Option<String>,
    output: Option<Vec<OpenAiResponsesOutputItem>>,
    usage: Option<OpenAiResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponsesOutputItem {
    #[serde(rename = "type")]
    item_type: Option<String>,
    id: Option<String>,
    call_id: Option<String>,
    name: Option<String>,
    arguments: Option<String>,
    content: Option<Vec<OpenAiResponsesContentPart>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponsesContentPart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponsesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
    total_tokens: Option<u64>,
}
