use std::collections::BTreeMap;
use std::sync::Arc;

use futures_util::StreamExt;
use serde::Serialize;
use triage_agent_core::{error_chain, FailureKind, RunUsage};
use triage_github_issues::Issue;

use crate::{AnalysisReport, RunnerFailure, RunnerOrchestrator};

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub runner_id: String,
    pub issue_id: u64,
    pub kind: FailureKind,
    pub error: String,
}

impl From<&RunnerFailure> for FailureRecord {
    fn from(failure: &RunnerFailure) -> Self {
        Self {
            runner_id: failure.runner_id.clone(),
            issue_id: failure.issue_id,
            kind: failure.kind(),
            error: error_chain(failure),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IssueResult {
    Succeeded(AnalysisReport),
    Failed(FailureRecord),
}

impl IssueResult {
    fn sort_key(&self) -> (u64, &str) {
        match self {
            IssueResult::Succeeded(report) => (report.issue_id, report.runner_id.as_str()),
            IssueResult::Failed(record) => (record.issue_id, record.runner_id.as_str()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
/// Outcome of every (runner, issue) pair plus totals.
pub struct BatchReport {
    pub results: Vec<IssueResult>,
    pub succeeded: usize,
    pub failed: usize,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub usage: RunUsage,
}

impl BatchReport {
    fn record(&mut self, result: Result<AnalysisReport, RunnerFailure>) {
        match result {
            Ok(report) => {
                self.succeeded += 1;
                self.usage.merge(&report.usage);
                self.results.push(IssueResult::Succeeded(report));
            }
            Err(failure) => {
                let record = FailureRecord::from(&failure);
                tracing::warn!(
                    runner_id = %record.runner_id,
                    issue_id = record.issue_id,
                    kind = record.kind.as_str(),
                    error = %record.error,
                    "issue triage failed; continuing batch"
                );
                self.failed += 1;
                *self.failures_by_kind.entry(record.kind).or_default() += 1;
                self.results.push(IssueResult::Failed(record));
            }
        }
    }
}

/// Runs every runner over every issue with bounded concurrency.
///
/// A failed pair is recorded and logged; the batch always runs to completion.
/// Results are ordered by issue id, then runner id.
pub async fn run_batch(
    runners: &[Arc<RunnerOrchestrator>],
    issues: &[Issue],
    max_concurrency: usize,
) -> BatchReport {
    let pairs = issues
        .iter()
        .flat_map(|issue| runners.iter().map(move |runner| (runner.clone(), issue)))
        .collect::<Vec<_>>();
    tracing::info!(
        runners = runners.len(),
        issues = issues.len(),
        pairs = pairs.len(),
        max_concurrency,
        "starting triage batch"
    );

    let results = futures_util::stream::iter(pairs)
        .map(|(runner, issue)| async move { runner.analyze(issue).await })
        .buffer_unordered(max_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

    let mut report = BatchReport::default();
    for result in results {
        report.record(result);
    }
    report
        .results
        .sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        total_tokens = report.usage.total_tokens,
        "triage batch finished"
    );
    report
}
