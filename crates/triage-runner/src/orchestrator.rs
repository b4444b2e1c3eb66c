//! One triage runner: memory lookup, prompt assembly and a resilient agent
//! invocation per issue.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use triage_agent_core::{
    AgentInvoker, FailureKind, HistoryTrimmer, InvocationRequest, InvokeError, RunUsage,
    Telemetry, TokenBudget, UsageLimits,
};
use triage_github_issues::{render_issue_context, Issue};
use triage_memory::{MemoryRetriever, MemoryStats};

use crate::{triage_output_schema, TriageOutput};

const TRIAGE_INSTRUCTIONS: &str = "Triage the support issue below. Decide its category, \
suggest labels, rate your confidence between 0 and 1, explain the decision briefly and \
list concrete next actions. Reply with JSON only.";

#[derive(Debug, Clone, Serialize)]
/// Successful analysis of one issue by one runner.
pub struct AnalysisReport {
    pub runner_id: String,
    pub issue_id: u64,
    pub output: TriageOutput,
    pub usage: RunUsage,
    pub memory_stats: MemoryStats,
    pub attempts: usize,
    pub retries: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Error)]
#[error("runner '{runner_id}' failed on issue #{issue_id}: {source}")]
/// Failed analysis, tagged with where it happened.
pub struct RunnerFailure {
    pub runner_id: String,
    pub issue_id: u64,
    #[source]
    pub source: InvokeError,
}

impl RunnerFailure {
    pub fn kind(&self) -> FailureKind {
        self.source.kind()
    }
}

/// Drives triage of individual issues against one model.
pub struct RunnerOrchestrator {
    runner_id: String,
    invoker: Arc<AgentInvoker>,
    trimmer: Arc<HistoryTrimmer>,
    usage_limits: UsageLimits,
    memory: Option<Arc<MemoryRetriever>>,
}

impl RunnerOrchestrator {
    pub fn new(
        runner_id: impl Into<String>,
        invoker: Arc<AgentInvoker>,
        token_budget: TokenBudget,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            runner_id: runner_id.into(),
            invoker,
            trimmer: Arc::new(HistoryTrimmer::new(token_budget, telemetry)),
            usage_limits: UsageLimits::default(),
            memory: None,
        }
    }

    pub fn with_usage_limits(mut self, usage_limits: UsageLimits) -> Self {
        self.usage_limits = usage_limits;
        self
    }

    pub fn with_memory(mut self, retriever: Arc<MemoryRetriever>) -> Self {
        self.memory = Some(retriever);
        self
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    #[tracing::instrument(
        name = "triage_issue",
        skip_all,
        fields(
            runner_id = %self.runner_id,
            issue_id = issue.id,
            memory_cases = tracing::field::Empty,
            memory_avg_similarity = tracing::field::Empty,
            memory_symptom_terms = tracing::field::Empty
        )
    )]
    pub async fn analyze(&self, issue: &Issue) -> Result<AnalysisReport, RunnerFailure> {
        let (memory_text, memory_stats) = match &self.memory {
            Some(retriever) => retriever.retrieve(issue).await,
            None => (String::new(), MemoryStats::default()),
        };
        let span = tracing::Span::current();
        span.record("memory_cases", memory_stats.cases_retrieved);
        span.record("memory_avg_similarity", memory_stats.avg_similarity);
        span.record("memory_symptom_terms", memory_stats.symptom_terms);
        tracing::debug!(memory_chars = memory_text.chars().count(), "memory lookup finished");

        let request = InvocationRequest::new(build_triage_prompt(issue, &memory_text))
            .with_output_schema(triage_output_schema())
            .with_usage_limits(self.usage_limits.clone())
            .with_history_processor(self.trimmer.clone());

        match self.invoker.run::<TriageOutput>(request).await {
            Ok(outcome) => {
                tracing::info!(
                    category = outcome.output.category.as_str(),
                    confidence = outcome.output.confidence,
                    attempts = outcome.attempts,
                    total_tokens = outcome.usage.total_tokens,
                    "issue triaged"
                );
                Ok(AnalysisReport {
                    runner_id: self.runner_id.clone(),
                    issue_id: issue.id,
                    output: outcome.output,
                    usage: outcome.usage,
                    memory_stats,
                    attempts: outcome.attempts,
                    retries: outcome.retries,
                    duration_ms: outcome.duration_ms,
                })
            }
            Err(source) => Err(RunnerFailure {
                runner_id: self.runner_id.clone(),
                issue_id: issue.id,
                source,
            }),
        }
    }
}

/// User message for one issue: instructions, optional memory block, issue.
pub fn build_triage_prompt(issue: &Issue, memory_text: &str) -> String {
    let mut sections = vec![TRIAGE_INSTRUCTIONS.to_string()];
    if !memory_text.trim().is_empty() {
        sections.push(memory_text.trim_end().to_string());
    }
    sections.push(render_issue_context(issue));
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use std::fmt;
    use std::sync::{Arc, Mutex};

    use serde_json::json;
    use tracing::field::{Field, Visit};
    use tracing::span::{Id, Record};
    use tracing::Subscriber;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
    use triage_agent_core::{
        AgentInvoker, BackendError, FailureKind, InvokerConfig, Telemetry, TokenBudget,
        UsageLimits,
    };
    use triage_ai::{Message, MessageRole};
    use triage_github_issues::Issue;
    use triage_memory::{
        HistoricalCase, KeywordSymptomExtractor, LocalCaseIndex, MemoryConfig, MemoryRetriever,
        DEFAULT_EMBEDDING_DIMENSIONS,
    };

    use super::{build_triage_prompt, RunnerOrchestrator};
    use crate::test_support::{malformed, ok_output, triage_json, ScriptedBackend};
    use crate::TriageCategory;

    fn sso_retriever() -> Arc<MemoryRetriever> {
        let index = LocalCaseIndex::new(
            vec![HistoricalCase {
                case_id: "C-2".to_string(),
                title: "SSO login loop".to_string(),
                symptoms: vec!["sso login redirect loop".to_string()],
                summary: "Users bounce between idp and app".to_string(),
                evidence: vec!["cookie missing samesite".to_string()],
                root_cause: "session cookie blocked as third-party".to_string(),
                fix_actions: vec!["set SameSite=None; Secure".to_string()],
                labels: vec!["auth".to_string()],
            }],
            DEFAULT_EMBEDDING_DIMENSIONS,
        );
        Arc::new(MemoryRetriever::new(
            Arc::new(index),
            Arc::new(KeywordSymptomExtractor::default()),
            MemoryConfig {
                similarity_threshold: 0.3,
                ..MemoryConfig::default()
            },
        ))
    }

    type RecordedFields = Arc<Mutex<Vec<(String, String)>>>;

    /// Collects values recorded onto spans after creation.
    struct SpanRecordCollector(RecordedFields);

    impl Visit for SpanRecordCollector {
        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0
                .lock()
                .expect("lock")
                .push((field.name().to_string(), format!("{value:?}")));
        }
    }

    impl<S: Subscriber> Layer<S> for SpanRecordCollector {
        fn on_record(&self, _span: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            values.record(&mut SpanRecordCollector(Arc::clone(&self.0)));
        }
    }

    fn recorded(fields: &RecordedFields, name: &str) -> Option<String> {
        fields
            .lock()
            .expect("lock")
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.clone())
    }

    fn orchestrator(backend: Arc<ScriptedBackend>, config: InvokerConfig) -> RunnerOrchestrator {
        let invoker = Arc::new(AgentInvoker::new(backend, config, Telemetry::disabled()));
        RunnerOrchestrator::new(
            "gpt-4o-mini",
            invoker,
            TokenBudget::default(),
            Telemetry::disabled(),
        )
    }

    #[test]
    fn unit_prompt_places_memory_before_issue_context() {
        let issue = Issue::new(9, "Export fails", "CSV export stops early");
        let prompt = build_triage_prompt(&issue, "Similar past cases:\n1. [C-1] csv\n");
        let memory_at = prompt.find("Similar past cases").expect("memory block");
        let issue_at = prompt.find("Issue #9: Export fails").expect("issue block");
        assert!(memory_at < issue_at);

        let bare = build_triage_prompt(&issue, "   ");
        assert!(!bare.contains("Similar past cases"));
        assert!(bare.contains("CSV export stops early"));
    }

    #[tokio::test]
    async fn functional_analyze_injects_memory_and_installs_trimmer() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok_output(triage_json(
            "configuration",
        ))]));
        let runner = orchestrator(backend.clone(), InvokerConfig::default())
            .with_memory(sso_retriever())
            .with_usage_limits(UsageLimits {
                request_limit: 4,
                ..UsageLimits::default()
            });
        let issue = Issue::new(7, "SSO login redirect loop", "Login keeps looping");

        let report = runner.analyze(&issue).await.expect("analysis");
        assert_eq!(report.runner_id, "gpt-4o-mini");
        assert_eq!(report.issue_id, 7);
        assert_eq!(report.output.category, TriageCategory::Configuration);
        assert_eq!(report.memory_stats.cases_retrieved, 1);
        assert_eq!(report.attempts, 1);

        let requests = backend.requests().await;
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.message.contains("[C-2] SSO login loop"));
        assert!(request.message.contains("Issue #7: SSO login redirect loop"));
        assert!(request.history.is_empty());
        assert_eq!(request.usage_limits.request_limit, 4);
        assert_eq!(
            request.output_schema.as_ref().expect("schema")["required"][0],
            json!("category")
        );

        let processor = request.history_processor.as_ref().expect("trimmer");
        let history = vec![Message::system("sys"), Message::user("hello")];
        assert_eq!(processor.process(&history), history);
        assert_eq!(history[0].role, MessageRole::System);
    }

    #[tokio::test]
    async fn functional_memory_stats_are_recorded_on_issue_span() {
        let fields: RecordedFields = Arc::new(Mutex::new(Vec::new()));
        let subscriber =
            tracing_subscriber::registry().with(SpanRecordCollector(Arc::clone(&fields)));
        let _guard = tracing::subscriber::set_default(subscriber);

        let backend = Arc::new(ScriptedBackend::new(vec![ok_output(triage_json(
            "configuration",
        ))]));
        let runner =
            orchestrator(backend, InvokerConfig::default()).with_memory(sso_retriever());
        let issue = Issue::new(7, "SSO login redirect loop", "Login keeps looping");
        let report = runner.analyze(&issue).await.expect("analysis");

        assert_eq!(recorded(&fields, "memory_cases").as_deref(), Some("1"));
        assert_eq!(
            recorded(&fields, "memory_symptom_terms"),
            Some(report.memory_stats.symptom_terms.to_string())
        );
        assert!(recorded(&fields, "memory_avg_similarity").is_some());
    }

    #[tokio::test]
    async fn functional_analyze_without_memory_reports_zero_stats() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok_output(triage_json("bug"))]));
        let runner = orchestrator(backend.clone(), InvokerConfig::default());
        let report = runner
            .analyze(&Issue::new(3, "Crash on save", "Stack trace attached"))
            .await
            .expect("analysis");
        assert_eq!(report.memory_stats.cases_retrieved, 0);
        assert!(!backend.requests().await[0]
            .message
            .contains("Similar past cases"));
    }

    #[tokio::test]
    async fn regression_analyze_wraps_invocation_failure_with_ids() {
        let backend = Arc::new(ScriptedBackend::new(vec![malformed(), malformed()]));
        let runner = orchestrator(
            backend,
            InvokerConfig {
                max_malformed_retries: 1,
                ..InvokerConfig::default()
            },
        );
        let failure = runner
            .analyze(&Issue::new(42, "Broken", "body"))
            .await
            .expect_err("retries exhausted");
        assert_eq!(failure.kind(), FailureKind::MalformedProviderResponse);
        assert_eq!(failure.issue_id, 42);
        assert_eq!(failure.runner_id, "gpt-4o-mini");
        assert!(failure
            .to_string()
            .starts_with("runner 'gpt-4o-mini' failed on issue #42"));
    }

    #[tokio::test]
    async fn regression_invalid_output_shape_is_provider_error() {
        let backend = Arc::new(ScriptedBackend::new(vec![ok_output(json!({
            "category": "not-a-category",
            "labels": [],
            "confidence": 0.2,
            "explanation": "x"
        }))]));
        let runner = orchestrator(backend, InvokerConfig::default());
        let failure = runner
            .analyze(&Issue::new(5, "t", "b"))
            .await
            .expect_err("undecodable output");
        assert_eq!(failure.kind(), FailureKind::ProviderError);
    }

    #[tokio::test]
    async fn unit_backend_error_passes_through_unchanged_kind() {
        let backend = Arc::new(ScriptedBackend::new(vec![Err(
            BackendError::ContextExceeded {
                message: "too long".to_string(),
            },
        )]));
        let runner = orchestrator(backend, InvokerConfig::default());
        let failure = runner
            .analyze(&Issue::new(6, "t", "b"))
            .await
            .expect_err("context exceeded");
        assert_eq!(failure.kind(), FailureKind::ContextExceeded);
    }
}
