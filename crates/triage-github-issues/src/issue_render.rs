use crate::Issue;

pub const EMPTY_BODY_PLACEHOLDER: &str = "(no description provided)";

/// Renders the issue as the base user-message context.
pub fn render_issue_context(issue: &Issue) -> String {
    let mut lines = vec![format!("Issue #{}: {}", issue.id, issue.title.trim())];
    if !issue.labels.is_empty() {
        lines.push(format!("Labels: {}", issue.labels.join(", ")));
    }
    lines.push(String::new());
    let body = issue.body.trim();
    if body.is_empty() {
        lines.push(EMPTY_BODY_PLACEHOLDER.to_string());
    } else {
        lines.push(body.to_string());
    }

    let comments: Vec<_> = issue
        .comments
        .iter()
        .filter(|comment| !comment.body.trim().is_empty())
        .collect();
    if !comments.is_empty() {
        lines.push(String::new());
        lines.push(format!("Comments ({}):", comments.len()));
        for comment in comments {
            lines.push(format!("- @{}: {}", comment.author, comment.body.trim()));
        }
    }
    lines.join("\n")
}

/// Flattens the issue text for keyword extraction and similarity queries.
pub fn render_issue_search_text(issue: &Issue) -> String {
    let mut parts = vec![issue.title.trim(), issue.body.trim()];
    parts.extend(issue.comments.iter().map(|comment| comment.body.trim()));
    parts
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::{render_issue_context, render_issue_search_text, EMPTY_BODY_PLACEHOLDER};
    use crate::Issue;

    #[test]
    fn functional_render_issue_context_includes_comments_and_labels() {
        let mut issue = Issue::new(7, "Export fails", "CSV export returns 500")
            .with_comment("bob", "also on staging")
            .with_comment("carol", " ");
        issue.labels.push("export".to_string());

        let rendered = render_issue_context(&issue);
        assert_eq!(
            rendered,
            "Issue #7: Export fails\nLabels: export\n\nCSV export returns 500\n\nComments (1):\n- @bob: also on staging"
        );
    }

    #[test]
    fn unit_render_issue_context_uses_placeholder_for_empty_body() {
        let rendered = render_issue_context(&Issue::new(3, "Title only", "  "));
        assert!(rendered.ends_with(EMPTY_BODY_PLACEHOLDER));
        assert!(!rendered.contains("Comments"));
    }

    #[test]
    fn unit_search_text_skips_empty_parts() {
        let issue = Issue::new(1, "", "body").with_comment("bob", "comment");
        assert_eq!(render_issue_search_text(&issue), "body\ncomment");
        assert_eq!(render_issue_search_text(&Issue::new(2, " ", "")), "");
    }
}
