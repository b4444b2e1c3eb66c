//! Similar-case memory injection.
//!
//! [`MemoryRetriever::retrieve`] never fails: extraction or search errors are
//! logged and yield an empty context so triage proceeds without memory.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::Result;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use triage_agent_core::{MemoryRetrievalReport, Telemetry, TelemetryEvent};
use triage_github_issues::Issue;

use crate::{SimilarCase, SimilaritySearch, SymptomExtractor};

pub const DEFAULT_SEARCH_LIMIT: usize = 2;
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;
pub const DEFAULT_MAX_EVIDENCE_ITEMS: usize = 3;
pub const DEFAULT_MAX_FIX_ACTIONS: usize = 3;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 4_000;
const PRECOMPUTE_CONCURRENCY: usize = 4;
const MEMORY_CONTEXT_HEADER: &str =
    "Similar past cases (for reference, verify before relying on them):";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub enabled: bool,
    pub search_limit: usize,
    pub similarity_threshold: f32,
    pub max_evidence_items: usize,
    pub max_fix_actions: usize,
    pub max_context_chars: usize,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            search_limit: DEFAULT_SEARCH_LIMIT,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            max_evidence_items: DEFAULT_MAX_EVIDENCE_ITEMS,
            max_fix_actions: DEFAULT_MAX_FIX_ACTIONS,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
/// Summary of what memory contributed to one issue.
pub struct MemoryStats {
    pub cases_retrieved: usize,
    pub avg_similarity: f32,
    pub symptom_terms: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Rendered memory block for one issue.
pub struct MemoryContext {
    pub issue_id: u64,
    pub text: String,
    pub stats: MemoryStats,
    pub cases: Vec<SimilarCase>,
}

impl MemoryContext {
    pub fn empty(issue_id: u64) -> Self {
        Self {
            issue_id,
            text: String::new(),
            stats: MemoryStats::default(),
            cases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Read-only per-issue memory snapshot shared by concurrent runners.
pub struct SharedMemoryCache {
    entries: Arc<HashMap<u64, MemoryContext>>,
}

impl SharedMemoryCache {
    pub fn new(entries: HashMap<u64, MemoryContext>) -> Self {
        Self {
            entries: Arc::new(entries),
        }
    }

    pub fn get(&self, issue_id: u64) -> Option<&MemoryContext> {
        self.entries.get(&issue_id)
    }

    pub fn contains(&self, issue_id: u64) -> bool {
        self.entries.contains_key(&issue_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Looks up similar historical cases and renders them as prompt context.
pub struct MemoryRetriever {
    search: Arc<dyn SimilaritySearch>,
    extractor: Arc<dyn SymptomExtractor>,
    config: MemoryConfig,
    cache: SharedMemoryCache,
    telemetry: Telemetry,
}

impl MemoryRetriever {
    pub fn new(
        search: Arc<dyn SimilaritySearch>,
        extractor: Arc<dyn SymptomExtractor>,
        config: MemoryConfig,
    ) -> Self {
        Self {
            search,
            extractor,
            config,
            cache: SharedMemoryCache::default(),
            telemetry: Telemetry::disabled(),
        }
    }

    pub fn with_shared_cache(mut self, cache: SharedMemoryCache) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Telemetry) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Returns the memory block for `issue` and its stats.
    ///
    /// Empty text and zeroed stats mean no memory applies, either because
    /// nothing matched or because retrieval failed.
    #[tracing::instrument(name = "memory_retrieval", skip_all, fields(issue_id = issue.id))]
    pub async fn retrieve(&self, issue: &Issue) -> (String, MemoryStats) {
        if !self.config.enabled {
            return (String::new(), MemoryStats::default());
        }

        if let Some(cached) = self.cache.get(issue.id) {
            tracing::debug!(
                cases = cached.stats.cases_retrieved,
                "memory context served from shared cache"
            );
            self.emit_report(issue.id, true, &cached.text, cached.stats);
            return (cached.text.clone(), cached.stats);
        }

        let context = match self.compute_context(issue).await {
            Ok(context) => context,
            Err(error) => {
                tracing::warn!(
                    error = %format!("{error:#}"),
                    "memory retrieval failed; continuing without memory"
                );
                MemoryContext::empty(issue.id)
            }
        };
        self.emit_report(issue.id, false, &context.text, context.stats);
        (context.text, context.stats)
    }

    /// Extracts symptoms, searches and renders without consulting the cache.
    pub async fn compute_context(&self, issue: &Issue) -> Result<MemoryContext> {
        let query = self.extractor.extract(issue).await?;
        if query.is_empty() {
            tracing::debug!(issue_id = issue.id, "no symptoms extracted; skipping search");
            return Ok(MemoryContext::empty(issue.id));
        }

        let cases = self
            .search
            .search(
                &query.query_text(),
                self.config.search_limit,
                self.config.similarity_threshold,
            )
            .await?;
        if cases.is_empty() {
            tracing::debug!(
                issue_id = issue.id,
                symptom_terms = query.terms.len(),
                "no similar cases above threshold"
            );
            return Ok(MemoryContext::empty(issue.id));
        }

        let avg_similarity =
            cases.iter().map(|case| case.similarity).sum::<f32>() / cases.len() as f32;
        let stats = MemoryStats {
            cases_retrieved: cases.len(),
            avg_similarity,
            symptom_terms: query.terms.len(),
        };
        let text = render_memory_context(&cases, &self.config);
        tracing::debug!(
            issue_id = issue.id,
            cases = stats.cases_retrieved,
            avg_similarity = stats.avg_similarity,
            context_chars = text.chars().count(),
            "built memory context"
        );
        Ok(MemoryContext {
            issue_id: issue.id,
            text,
            stats,
            cases,
        })
    }

    fn emit_report(&self, issue_id: u64, cache_hit: bool, text: &str, stats: MemoryStats) {
        if !self.telemetry.is_enabled() {
            return;
        }
        self.telemetry
            .emit(TelemetryEvent::MemoryRetrieval(MemoryRetrievalReport {
                issue_id,
                cache_hit,
                cases_retrieved: stats.cases_retrieved,
                avg_similarity: stats.avg_similarity,
                symptom_terms: stats.symptom_terms,
                context_chars: text.chars().count(),
            }));
    }
}

/// Renders matched cases as a bounded prompt block.
pub fn render_memory_context(cases: &[SimilarCase], config: &MemoryConfig) -> String {
    if cases.is_empty() {
        return String::new();
    }
    let mut lines = vec![MEMORY_CONTEXT_HEADER.to_string()];
    for (index, case) in cases.iter().enumerate() {
        lines.push(format!(
            "{}. [{}] {} (similarity {:.2})",
            index + 1,
            case.case_id,
            case.title.trim(),
            case.similarity
        ));
        if !case.root_cause.trim().is_empty() {
            lines.push(format!("   Root cause: {}", case.root_cause.trim()));
        }
        push_bullets(&mut lines, "Evidence", &case.evidence, config.max_evidence_items);
        push_bullets(&mut lines, "Fix actions", &case.fix_actions, config.max_fix_actions);
    }
    truncate_chars(&lines.join("\n"), config.max_context_chars)
}

fn push_bullets(lines: &mut Vec<String>, heading: &str, items: &[String], max_items: usize) {
    let items = items
        .iter()
        .map(|item| item.trim())
        .filter(|item| !item.is_empty())
        .take(max_items)
        .collect::<Vec<_>>();
    if items.is_empty() {
        return;
    }
    lines.push(format!("   {heading}:"));
    lines.extend(items.into_iter().map(|item| format!("   - {item}")));
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars == 0 {
        return String::new();
    }
    let mut truncated = text.chars().take(max_chars - 1).collect::<String>();
    truncated.push('…');
    truncated
}

/// Computes memory for every distinct issue once, ahead of concurrent runs.
///
/// Failed lookups are logged and left out, so runners fall back to computing
/// (and degrading) on their own.
pub async fn precompute_shared_cache(
    retriever: &MemoryRetriever,
    issues: &[Issue],
) -> SharedMemoryCache {
    let mut seen = HashSet::new();
    let unique = issues
        .iter()
        .filter(|issue| seen.insert(issue.id))
        .collect::<Vec<_>>();

    let results = futures_util::stream::iter(unique)
        .map(|issue| async move { (issue.id, retriever.compute_context(issue).await) })
        .buffer_unordered(PRECOMPUTE_CONCURRENCY)
        .collect::<Vec<_>>()
        .await;

    let mut entries = HashMap::new();
    for (issue_id, result) in results {
        match result {
            Ok(context) => {
                entries.insert(issue_id, context);
            }
            Err(error) => {
                tracing::warn!(
                    issue_id,
                    error = %format!("{error:#}"),
                    "memory precompute failed"
                );
            }
        }
    }
    tracing::info!(
        issues = issues.len(),
        cached = entries.len(),
        "precomputed shared memory cache"
    );
    SharedMemoryCache::new(entries)
}
