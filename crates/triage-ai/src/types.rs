use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Finish reason emitted when the backend produced a tool invocation it could not parse.
pub const MALFORMED_FUNCTION_CALL_FINISH_REASON: &str = "malformed_function_call";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `MessageRole` values.
pub enum MessageRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// A tool invocation requested by the model.
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
/// One part of a message.
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl ContentBlock {
    pub fn tool_call(call: ToolCall) -> Self {
        Self::ToolCall {
            id: call.id,
            name: call.name,
            arguments: call.arguments,
        }
    }

    fn char_len(&self) -> usize {
        match self {
            ContentBlock::Text { text } => text.chars().count(),
            ContentBlock::ToolCall {
                id,
                name,
                arguments,
            } => id
                .chars()
                .count()
                .saturating_add(name.chars().count())
                .saturating_add(render_arguments(arguments).chars().count()),
            ContentBlock::ToolResult {
                tool_call_id,
                tool_name,
                content,
                ..
            } => tool_call_id
                .chars()
                .count()
                .saturating_add(tool_name.chars().count())
                .saturating_add(content.chars().count()),
        }
    }
}

fn render_arguments(arguments: &Value) -> String {
    match arguments {
        Value::String(raw) => raw.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// One turn in a conversation.
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    pub fn assistant_blocks(content: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
        }
    }

    /// Builds a user-side message carrying one tool result.
    pub fn tool_result(
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
        is_error: bool,
    ) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentBlock::ToolResult {
                tool_call_id: tool_call_id.into(),
                tool_name: tool_name.into(),
                content: content.into(),
                is_error,
            }],
        }
    }

    /// Builds a user-side message carrying every result of one parallel tool round.
    pub fn tool_results(results: Vec<ContentBlock>) -> Self {
        Self {
            role: MessageRole::User,
            content: results,
        }
    }

    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::ToolCall { .. } | ContentBlock::ToolResult { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                ContentBlock::Text { .. } | ContentBlock::ToolResult { .. } => None,
            })
            .collect()
    }

    pub fn tool_call_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolCall { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn has_tool_call(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolCall { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|block| matches!(block, ContentBlock::ToolResult { .. }))
    }

    /// Character count used for token estimation.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .fold(0usize, |acc, block| acc.saturating_add(block.char_len()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
/// Structural problems that make a history invalid for submission.
pub enum PairingViolation {
    #[error("tool result '{tool_call_id}' at index {index} has no preceding tool call")]
    OrphanedResult { index: usize, tool_call_id: String },
    #[error("tool call '{tool_call_id}' at index {index} has no tool result")]
    MissingResult { index: usize, tool_call_id: String },
}

/// Checks that every tool result follows its call and every call has a result.
pub fn validate_tool_pairing(messages: &[Message]) -> Result<(), PairingViolation> {
    let mut open_calls: Vec<(usize, String)> = Vec::new();
    let mut seen_calls: HashSet<&str> = HashSet::new();
    for (index, message) in messages.iter().enumerate() {
        for block in &message.content {
            match block {
                ContentBlock::ToolCall { id, .. } => {
                    seen_calls.insert(id.as_str());
                    open_calls.push((index, id.clone()));
                }
                ContentBlock::ToolResult { tool_call_id, .. } => {
                    if !seen_calls.contains(tool_call_id.as_str()) {
                        return Err(PairingViolation::OrphanedResult {
                            index,
                            tool_call_id: tool_call_id.clone(),
                        });
                    }
                    open_calls.retain(|(_, id)| id != tool_call_id);
                }
                ContentBlock::Text { .. } => {}
            }
        }
    }
    if let Some((index, tool_call_id)) = open_calls.into_iter().next() {
        return Err(PairingViolation::MissingResult {
            index,
            tool_call_id,
        });
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ToolDefinition` used across triage components.
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `ToolChoice` values.
pub enum ToolChoice {
    Auto,
    None,
    Required,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ChatRequest` used across triage components.
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_choice: Option<ToolChoice>,
    #[serde(default)]
    pub json_mode: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
/// Public struct `ChatUsage` used across triage components.
pub struct ChatUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Public struct `ChatResponse` used across triage components.
pub struct ChatResponse {
    pub message: Message,
    pub finish_reason: Option<String>,
    pub usage: ChatUsage,
}

impl ChatResponse {
    /// Returns true when the backend reported an unparsable tool invocation.
    pub fn is_malformed_tool_call(&self) -> bool {
        self.finish_reason
            .as_deref()
            .map(|reason| reason == MALFORMED_FUNCTION_CALL_FINISH_REASON)
            .unwrap_or(false)
    }
}

#[derive(Debug, Error)]
/// Enumerates supported `TriageAiError` values.
pub enum TriageAiError {
    #[error("missing API key")]
    MissingApiKey,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider returned non-success status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

const CONTEXT_EXCEEDED_MARKERS: &[&str] = &[
    "context_length_exceeded",
    "maximum context length",
    "prompt is too long",
    "input is too long",
    "exceeds the context window",
    "request too large",
];

impl TriageAiError {
    /// Returns true when the provider rejected the request because the prompt was too large.
    pub fn is_context_exceeded(&self) -> bool {
        match self {
            TriageAiError::HttpStatus { status, body } => {
                if !matches!(*status, 400 | 413 | 422) {
                    return false;
                }
                let normalized = body.to_ascii_lowercase();
                CONTEXT_EXCEEDED_MARKERS
                    .iter()
                    .any(|marker| normalized.contains(marker))
            }
            TriageAiError::MissingApiKey
            | TriageAiError::Http(_)
            | TriageAiError::Serde(_)
            | TriageAiError::InvalidResponse(_) => false,
        }
    }
}

#[async_trait]
/// Trait contract for `LlmClient` behavior.
pub trait LlmClient: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, TriageAiError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        validate_tool_pairing, ChatResponse, ChatUsage, ContentBlock, Message, MessageRole,
        PairingViolation, TriageAiError,
    };

    fn call_message(id: &str) -> Message {
        Message::assistant_blocks(vec![ContentBlock::ToolCall {
            id: id.to_string(),
            name: "search_docs".to_string(),
            arguments: json!({ "query": "timeout" }),
        }])
    }

    #[test]
    fn collects_text_content() {
        let message = Message {
            role: MessageRole::Assistant,
            content: vec![
                ContentBlock::Text {
                    text: "first".to_string(),
                },
                ContentBlock::ToolCall {
                    id: "1".to_string(),
                    name: "read".to_string(),
                    arguments: json!({ "path": "README.md" }),
                },
                ContentBlock::Text {
                    text: "second".to_string(),
                },
            ],
        };

        assert_eq!(message.text_content(), "first\nsecond");
        assert_eq!(message.tool_call_ids(), vec!["1"]);
        assert!(message.has_tool_call());
        assert!(!message.has_tool_result());
    }

    #[test]
    fn unit_char_len_counts_every_part() {
        let text = Message::user("abcd");
        assert_eq!(text.char_len(), 4);

        let call = Message::assistant_blocks(vec![ContentBlock::ToolCall {
            id: "c1".to_string(),
            name: "ls".to_string(),
            arguments: json!("xy"),
        }]);
        assert_eq!(call.char_len(), 6);

        let result = Message::tool_result("c1", "ls", "héllo", false);
        assert_eq!(result.char_len(), 9);
    }

    #[test]
    fn functional_validate_tool_pairing_accepts_complete_pairs() {
        let history = vec![
            Message::system("sys"),
            Message::user("hi"),
            call_message("7"),
            Message::tool_result("7", "search_docs", "found", false),
            Message::assistant_text("done"),
        ];
        assert_eq!(validate_tool_pairing(&history), Ok(()));
    }

    #[test]
    fn regression_validate_tool_pairing_rejects_orphans_and_dangling_calls() {
        let orphan = vec![
            Message::system("sys"),
            Message::tool_result("9", "search_docs", "found", false),
        ];
        assert_eq!(
            validate_tool_pairing(&orphan),
            Err(PairingViolation::OrphanedResult {
                index: 1,
                tool_call_id: "9".to_string()
            })
        );

        let dangling = vec![Message::system("sys"), call_message("3")];
        assert_eq!(
            validate_tool_pairing(&dangling),
            Err(PairingViolation::MissingResult {
                index: 1,
                tool_call_id: "3".to_string()
            })
        );
    }

    #[test]
    fn unit_context_exceeded_detection_requires_client_error_and_marker() {
        let exceeded = TriageAiError::HttpStatus {
            status: 400,
            body: r#"{"error":{"code":"context_length_exceeded"}}"#.to_string(),
        };
        assert!(exceeded.is_context_exceeded());

        let server = TriageAiError::HttpStatus {
            status: 500,
            body: "maximum context length".to_string(),
        };
        assert!(!server.is_context_exceeded());

        let other = TriageAiError::HttpStatus {
            status: 400,
            body: "bad tool schema".to_string(),
        };
        assert!(!other.is_context_exceeded());
    }

    #[test]
    fn unit_malformed_finish_reason_is_detected() {
        let response = ChatResponse {
            message: Message::assistant_text(""),
            finish_reason: Some("malformed_function_call".to_string()),
            usage: ChatUsage::default(),
        };
        assert!(response.is_malformed_tool_call());
    }
}
