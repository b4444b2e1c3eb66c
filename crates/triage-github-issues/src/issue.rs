use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Public struct `GithubUser` used across triage components.
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Public struct `GithubIssueLabel` used across triage components.
pub struct GithubIssueLabel {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Issue payload as returned by the GitHub REST API.
pub struct GithubIssue {
    pub id: u64,
    pub number: u64,
    pub title: String,
    pub body: Option<String>,
    pub user: GithubUser,
    #[serde(default)]
    pub labels: Vec<GithubIssueLabel>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
/// Issue comment payload as returned by the GitHub REST API.
pub struct GithubIssueComment {
    pub id: u64,
    pub body: Option<String>,
    pub user: GithubUser,
    #[serde(default)]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// One comment on an issue.
pub struct IssueComment {
    pub author: String,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
/// Issue record analyzed by triage runners.
///
/// `id` is the repository-scoped issue number and keys the shared memory cache.
pub struct Issue {
    pub id: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub comments: Vec<IssueComment>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl Issue {
    pub fn new(id: u64, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            comments: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn with_comment(mut self, author: impl Into<String>, body: impl Into<String>) -> Self {
        self.comments.push(IssueComment {
            author: author.into(),
            body: body.into(),
        });
        self
    }

    /// Builds a record from REST payloads, skipping comments with empty bodies.
    pub fn from_github(issue: GithubIssue, comments: Vec<GithubIssueComment>) -> Self {
        let comments = comments
            .into_iter()
            .filter_map(|comment| {
                let body = comment.body.unwrap_or_default();
                if body.trim().is_empty() {
                    return None;
                }
                Some(IssueComment {
                    author: comment.user.login,
                    body,
                })
            })
            .collect();
        Self {
            id: issue.number,
            title: issue.title,
            body: issue.body.unwrap_or_default(),
            comments,
            labels: issue.labels.into_iter().map(|label| label.name).collect(),
        }
    }

    /// True when title, body and comments carry no text.
    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty()
            && self.body.trim().is_empty()
            && self
                .comments
                .iter()
                .all(|comment| comment.body.trim().is_empty())
    }
}
