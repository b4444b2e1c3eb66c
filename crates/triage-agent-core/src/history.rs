//! Token-budget-aware conversation history trimming.
//!
//! The trimmer estimates prompt size from character counts, picks a retention
//! level from the budget's thresholds and keeps the newest messages that fit.
//! The leading system message always survives, and a tool result is never
//! kept without the tool call it answers.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use triage_ai::{Message, ModelProfile};

use crate::{Telemetry, TelemetryEvent};

pub const DEFAULT_MAX_TOKENS: u64 = 128_000;
pub const DEFAULT_HIGH_RATIO: f64 = 0.8;
pub const DEFAULT_CRITICAL_RATIO: f64 = 0.9;
pub const DEFAULT_HIGH_RETENTION: f64 = 0.9;
pub const DEFAULT_CRITICAL_RETENTION: f64 = 0.8;
pub const DEFAULT_HIGH_MIN_MESSAGES: usize = 4;
pub const DEFAULT_CRITICAL_MIN_MESSAGES: usize = 3;
pub const DEFAULT_MIN_HISTORY_LEN: usize = 5;
pub const DEFAULT_CHARS_PER_TOKEN: u64 = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
/// Thresholds and retention rules for history trimming.
pub struct TokenBudget {
    pub max_tokens: u64,
    pub high_ratio: f64,
    pub critical_ratio: f64,
    pub high_retention: f64,
    pub critical_retention: f64,
    pub high_min_messages: usize,
    pub critical_min_messages: usize,
    pub min_history_len: usize,
    pub chars_per_token: u64,
}

impl Default for TokenBudget {
    fn default() -> Self {
        Self {
            max_tokens: DEFAULT_MAX_TOKENS,
            high_ratio: DEFAULT_HIGH_RATIO,
            critical_ratio: DEFAULT_CRITICAL_RATIO,
            high_retention: DEFAULT_HIGH_RETENTION,
            critical_retention: DEFAULT_CRITICAL_RETENTION,
            high_min_messages: DEFAULT_HIGH_MIN_MESSAGES,
            critical_min_messages: DEFAULT_CRITICAL_MIN_MESSAGES,
            min_history_len: DEFAULT_MIN_HISTORY_LEN,
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
/// Enumerates supported `TokenBudgetError` values.
pub enum TokenBudgetError {
    #[error("token budget field '{field}' is invalid: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> TokenBudgetError {
    TokenBudgetError::Invalid {
        field,
        reason: reason.into(),
    }
}

impl TokenBudget {
    pub fn new(max_tokens: u64) -> Self {
        Self {
            max_tokens,
            ..Self::default()
        }
    }

    /// Derives the token ceiling from the model's context window.
    pub fn for_profile(profile: &dyn ModelProfile) -> Self {
        Self::new(u64::from(profile.max_tokens()))
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn validate(&self) -> Result<(), TokenBudgetError> {
        if self.max_tokens == 0 {
            return Err(invalid("max_tokens", "must be greater than 0"));
        }
        if self.chars_per_token == 0 {
            return Err(invalid("chars_per_token", "must be greater than 0"));
        }
        if !(self.high_ratio > 0.0 && self.high_ratio.is_finite()) {
            return Err(invalid("high_ratio", "must be a positive number"));
        }
        if !(self.critical_ratio >= self.high_ratio && self.critical_ratio.is_finite()) {
            return Err(invalid(
                "critical_ratio",
                format!("must be >= high_ratio ({})", self.high_ratio),
            ));
        }
        for (field, value) in [
            ("high_retention", self.high_retention),
            ("critical_retention", self.critical_retention),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(invalid(field, "must be in (0, 1]"));
            }
        }
        if self.critical_retention > self.high_retention {
            return Err(invalid(
                "critical_retention",
                format!("must be <= high_retention ({})", self.high_retention),
            ));
        }
        if self.critical_min_messages == 0 || self.high_min_messages == 0 {
            return Err(invalid("min_messages", "retention floors must be at least 1"));
        }
        if self.critical_min_messages > self.high_min_messages {
            return Err(invalid(
                "critical_min_messages",
                format!("must be <= high_min_messages ({})", self.high_min_messages),
            ));
        }
        Ok(())
    }

    /// Conservative character-based token estimate.
    pub fn estimate_tokens(&self, total_chars: usize) -> u64 {
        (total_chars as u64) / self.chars_per_token.max(1)
    }

    pub fn level_for(&self, estimated_tokens: u64) -> TrimLevel {
        let estimated = estimated_tokens as f64;
        let max_tokens = self.max_tokens as f64;
        if estimated > max_tokens * self.critical_ratio {
            TrimLevel::Critical
        } else if estimated > max_tokens * self.high_ratio {
            TrimLevel::High
        } else {
            TrimLevel::None
        }
    }

    /// Number of non-system messages retained out of `conversation_len` at `level`.
    pub fn keep_count(&self, level: TrimLevel, conversation_len: usize) -> usize {
        let (retention, floor) = match level {
            TrimLevel::None => return conversation_len,
            TrimLevel::High => (self.high_retention, self.high_min_messages),
            TrimLevel::Critical => (self.critical_retention, self.critical_min_messages),
        };
        let scaled = (conversation_len as f64 * retention).floor() as usize;
        scaled.max(floor).min(conversation_len)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `TrimLevel` values.
pub enum TrimLevel {
    None,
    High,
    Critical,
}

impl TrimLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            TrimLevel::None => "none",
            TrimLevel::High => "high",
            TrimLevel::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Usage snapshot reported for every trim pass.
pub struct TrimReport {
    pub estimated_tokens: u64,
    pub max_tokens: u64,
    pub total_chars: usize,
    pub usage_ratio: f64,
    pub message_count: usize,
    pub truncated: bool,
    pub level: TrimLevel,
    pub kept_messages: usize,
    pub dropped_messages: usize,
}

/// Transforms the conversation before each model request.
pub trait HistoryProcessor: Send + Sync {
    fn process(&self, history: &[Message]) -> Vec<Message>;
}

#[derive(Debug, Clone)]
/// History processor that applies [`trim_history`] with a fixed budget.
pub struct HistoryTrimmer {
    budget: TokenBudget,
    telemetry: Telemetry,
}

impl HistoryTrimmer {
    pub fn new(budget: TokenBudget, telemetry: Telemetry) -> Self {
        Self { budget, telemetry }
    }

    pub fn budget(&self) -> &TokenBudget {
        &self.budget
    }
}

impl HistoryProcessor for HistoryTrimmer {
    fn process(&self, history: &[Message]) -> Vec<Message> {
        trim_history(history, &self.budget, &self.telemetry)
    }
}

/// Returns a trimmed copy of `history`. The input is never modified.
pub fn trim_history(
    history: &[Message],
    budget: &TokenBudget,
    telemetry: &Telemetry,
) -> Vec<Message> {
    let total_chars = history
        .iter()
        .fold(0usize, |acc, message| acc.saturating_add(message.char_len()));
    let estimated_tokens = budget.estimate_tokens(total_chars);
    let usage_ratio = estimated_tokens as f64 / budget.max_tokens.max(1) as f64;

    let level = if history.len() <= budget.min_history_len {
        TrimLevel::None
    } else {
        budget.level_for(estimated_tokens)
    };

    let trimmed = match (level, history.split_first()) {
        (TrimLevel::None, _) | (_, None) => history.to_vec(),
        (level, Some((system, conversation))) => {
            let keep = budget.keep_count(level, conversation.len());
            let mut trimmed = Vec::with_capacity(keep.saturating_add(1));
            trimmed.push(system.clone());
            trimmed.extend(select_conversation_tail(conversation, keep));
            trimmed
        }
    };

    let report = TrimReport {
        estimated_tokens,
        max_tokens: budget.max_tokens,
        total_chars,
        usage_ratio,
        message_count: history.len(),
        truncated: trimmed.len() < history.len(),
        level,
        kept_messages: trimmed.len(),
        dropped_messages: history.len().saturating_sub(trimmed.len()),
    };
    if report.truncated {
        tracing::info!(
            level = level.as_str(),
            estimated_tokens,
            max_tokens = budget.max_tokens,
            usage_ratio,
            kept = report.kept_messages,
            dropped = report.dropped_messages,
            "trimmed conversation history"
        );
    } else {
        tracing::debug!(
            estimated_tokens,
            usage_ratio,
            messages = history.len(),
            "conversation history within budget"
        );
    }
    telemetry.emit(TelemetryEvent::HistoryTrim(report));

    trimmed
}

/// Picks up to `keep` of the newest messages without splitting tool pairs.
///
/// Walks newest to oldest. A message carrying tool results is kept together
/// with every call message it answers and every other result message for
/// those calls; when that group no longer fits the walk stops. A result whose
/// call cannot be found is kept on its own.
pub fn select_conversation_tail(conversation: &[Message], keep: usize) -> Vec<Message> {
    let mut included = vec![false; conversation.len()];
    let mut count = 0usize;
    let mut index = conversation.len();

    while index > 0 && count < keep {
        index -= 1;
        if included[index] {
            continue;
        }
        if !conversation[index].has_tool_result() {
            included[index] = true;
            count += 1;
            continue;
        }

        let group = tool_pair_group(conversation, index, &included);
        if count + group.len() > keep {
            break;
        }
        for member in group {
            included[member] = true;
            count += 1;
        }
    }

    conversation
        .iter()
        .zip(included)
        .filter_map(|(message, selected)| selected.then(|| message.clone()))
        .collect()
}

/// Closes `result_index` over shared tool-call ids: calls answered by any
/// member, then results answering any of those calls, until nothing changes.
fn tool_pair_group(
    conversation: &[Message],
    result_index: usize,
    included: &[bool],
) -> Vec<usize> {
    let mut members = vec![false; conversation.len()];
    members[result_index] = true;
    let mut call_ids: HashSet<&str> = HashSet::new();
    let mut result_ids: HashSet<&str> = conversation[result_index]
        .tool_result_ids()
        .into_iter()
        .collect();

    loop {
        let mut grew = false;
        for (position, message) in conversation.iter().enumerate() {
            if members[position] {
                continue;
            }
            let calls = message.tool_call_ids();
            let results = message.tool_result_ids();
            let linked = calls.iter().any(|id| result_ids.contains(id))
                || results.iter().any(|id| call_ids.contains(id));
            if linked {
                members[position] = true;
                call_ids.extend(calls);
                result_ids.extend(results);
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    members
        .iter()
        .enumerate()
        .filter(|(position, member)| **member && !included[*position])
        .map(|(position, _)| position)
        .collect()
}
