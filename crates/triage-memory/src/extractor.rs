use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use triage_agent_core::{AgentInvoker, InvocationRequest, UsageLimits};
use triage_github_issues::{render_issue_context, render_issue_search_text, Issue};

pub const DEFAULT_MAX_SYMPTOM_TERMS: usize = 12;
const MIN_TERM_CHARS: usize = 3;

const STOPWORDS: &[&str] = &[
    "about", "after", "again", "also", "and", "any", "are", "been", "but", "can", "cannot",
    "could", "did", "does", "doing", "don", "each", "even", "for", "from", "get", "getting",
    "had", "has", "have", "hello", "help", "here", "how", "issue", "just", "like", "more",
    "not", "now", "only", "our", "out", "please", "problem", "same", "see", "seems", "should",
    "some", "still", "than", "thanks", "that", "the", "their", "them", "then", "there", "these",
    "they", "this", "trying", "using", "very", "was", "we", "were", "what", "when", "where",
    "which", "while", "who", "why", "will", "with", "would", "you", "your",
];

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Normalized symptom terms used as a similarity query.
pub struct SymptomQuery {
    pub terms: Vec<String>,
}

impl SymptomQuery {
    pub fn from_terms<I, S>(terms: I, max_terms: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut normalized: Vec<String> = Vec::new();
        for term in terms {
            let term = term
                .as_ref()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if term.is_empty() || normalized.contains(&term) {
                continue;
            }
            normalized.push(term);
            if normalized.len() >= max_terms {
                break;
            }
        }
        Self { terms: normalized }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn query_text(&self) -> String {
        self.terms.join(" ")
    }
}

/// Turns an issue into a similarity query.
#[async_trait]
pub trait SymptomExtractor: Send + Sync {
    async fn extract(&self, issue: &Issue) -> Result<SymptomQuery>;
}

#[derive(Debug, Clone)]
/// Deterministic frequency-ranked keyword extraction.
pub struct KeywordSymptomExtractor {
    max_terms: usize,
}

impl Default for KeywordSymptomExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SYMPTOM_TERMS)
    }
}

impl KeywordSymptomExtractor {
    pub fn new(max_terms: usize) -> Self {
        Self {
            max_terms: max_terms.max(1),
        }
    }

    pub fn extract_terms(&self, text: &str) -> SymptomQuery {
        let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
        for (position, raw_token) in text
            .split(|character: char| !(character.is_alphanumeric() || character == '_'))
            .filter(|token| !token.is_empty())
            .enumerate()
        {
            let token = raw_token.to_lowercase();
            if token.chars().count() < MIN_TERM_CHARS
                || token.chars().all(|character| character.is_ascii_digit())
                || STOPWORDS.contains(&token.as_str())
            {
                continue;
            }
            counts
                .entry(token)
                .and_modify(|(count, _)| *count += 1)
                .or_insert((1, position));
        }

        let mut ranked = counts.into_iter().collect::<Vec<_>>();
        ranked.sort_by(|(_, (left_count, left_first)), (_, (right_count, right_first))| {
            right_count
                .cmp(left_count)
                .then_with(|| left_first.cmp(right_first))
        });
        SymptomQuery::from_terms(ranked.into_iter().map(|(term, _)| term), self.max_terms)
    }
}

#[async_trait]
impl SymptomExtractor for KeywordSymptomExtractor {
    async fn extract(&self, issue: &Issue) -> Result<SymptomQuery> {
        Ok(self.extract_terms(&render_issue_search_text(issue)))
    }
}

#[derive(Debug, Deserialize)]
struct SymptomReply {
    symptoms: Vec<String>,
    #[serde(default)]
    components: Vec<String>,
}

fn symptom_reply_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "symptoms": { "type": "array", "items": { "type": "string" } },
            "components": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["symptoms"]
    })
}

/// LLM-backed extraction through a dedicated invoker.
pub struct AgentSymptomExtractor {
    invoker: Arc<AgentInvoker>,
    max_terms: usize,
    usage_limits: UsageLimits,
}

impl AgentSymptomExtractor {
    pub fn new(invoker: Arc<AgentInvoker>, max_terms: usize) -> Self {
        Self {
            invoker,
            max_terms: max_terms.max(1),
            usage_limits: UsageLimits {
                request_limit: 3,
                tool_calls_limit: Some(0),
                total_tokens_limit: None,
            },
        }
    }
}

fn build_symptom_prompt(issue: &Issue) -> String {
    format!(
        "Extract the observable technical symptoms from this support issue: error messages, \
failing operations and affected components. Reply with JSON of the form \
{{\"symptoms\": [...], \"components\": [...]}} using short lowercase phrases.\n\n{}",
        render_issue_context(issue)
    )
}

#[async_trait]
impl SymptomExtractor for AgentSymptomExtractor {
    async fn extract(&self, issue: &Issue) -> Result<SymptomQuery> {
        let request = InvocationRequest::new(build_symptom_prompt(issue))
            .with_output_schema(symptom_reply_schema())
            .with_usage_limits(self.usage_limits.clone());
        let outcome = self
            .invoker
            .run::<SymptomReply>(request)
            .await
            .with_context(|| format!("symptom extraction failed for issue {}", issue.id))?;
        let SymptomReply {
            symptoms,
            components,
        } = outcome.output;
        Ok(SymptomQuery::from_terms(
            symptoms.into_iter().chain(components),
            self.max_terms,
        ))
    }
}
