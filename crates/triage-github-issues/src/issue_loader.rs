use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::{GithubIssue, GithubIssueComment, Issue};

#[derive(Debug, Deserialize)]
struct GithubIssueBundle {
    issue: GithubIssue,
    #[serde(default)]
    comments: Vec<GithubIssueComment>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum IssueRecord {
    Bundle(GithubIssueBundle),
    Github(GithubIssue),
    Simple(Issue),
}

impl IssueRecord {
    fn into_issue(self) -> Option<Issue> {
        match self {
            IssueRecord::Bundle(bundle) => {
                if bundle.issue.pull_request.is_some() {
                    return None;
                }
                Some(Issue::from_github(bundle.issue, bundle.comments))
            }
            IssueRecord::Github(issue) => {
                if issue.pull_request.is_some() {
                    return None;
                }
                Some(Issue::from_github(issue, Vec::new()))
            }
            IssueRecord::Simple(issue) => Some(issue),
        }
    }
}

/// Parses a JSON array (or single object) of issue records.
///
/// Accepts `{ "issue": <rest issue>, "comments": [<rest comment>] }` bundles,
/// bare REST issues and simplified `{ id, title, body, comments }` records.
/// Pull requests are skipped.
pub fn parse_issue_records(raw: &str) -> Result<Vec<Issue>> {
    let value: Value = serde_json::from_str(raw).context("issue file is not valid JSON")?;
    let entries = match value {
        Value::Array(entries) => entries,
        Value::Object(_) => vec![value],
        _ => bail!("issue file must contain a JSON array or object"),
    };

    let mut issues = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let record: IssueRecord = serde_json::from_value(entry)
            .with_context(|| format!("issue record {index} has an unsupported shape"))?;
        if let Some(issue) = record.into_issue() {
            issues.push(issue);
        }
    }
    Ok(issues)
}

pub fn load_issues_file(path: &Path) -> Result<Vec<Issue>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read issues file {}", path.display()))?;
    parse_issue_records(&raw).with_context(|| format!("failed to parse {}", path.display()))
}
