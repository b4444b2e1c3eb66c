//! Issue records consumed by the triage pipeline.
//! This crate converts GitHub REST payloads into flat issue records, renders
//! them as model context and loads issue batches from disk.

pub mod issue;
pub mod issue_loader;
pub mod issue_render;

pub use issue::{
    GithubIssue, GithubIssueComment, GithubIssueLabel, GithubUser, Issue, IssueComment,
};
pub use issue_loader::{load_issues_file, parse_issue_records};
pub use issue_render::{render_issue_context, render_issue_search_text};
