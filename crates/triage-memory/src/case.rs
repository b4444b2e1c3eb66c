use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A resolved support case from the historical case log.
pub struct HistoricalCase {
    pub case_id: String,
    pub title: String,
    #[serde(default)]
    pub symptoms: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default)]
    pub root_cause: String,
    #[serde(default)]
    pub fix_actions: Vec<String>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl HistoricalCase {
    /// Text indexed for similarity search.
    pub fn search_text(&self) -> String {
        let mut parts = vec![self.title.as_str()];
        parts.extend(self.symptoms.iter().map(String::as_str));
        parts.push(self.summary.as_str());
        parts.extend(self.evidence.iter().map(String::as_str));
        parts
            .into_iter()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A historical case matched against an issue.
pub struct SimilarCase {
    pub case_id: String,
    pub title: String,
    pub similarity: f32,
    pub evidence: Vec<String>,
    pub root_cause: String,
    pub fix_actions: Vec<String>,
}

impl SimilarCase {
    pub fn from_case(case: &HistoricalCase, similarity: f32) -> Self {
        Self {
            case_id: case.case_id.clone(),
            title: case.title.clone(),
            similarity,
            evidence: case.evidence.clone(),
            root_cause: case.root_cause.clone(),
            fix_actions: case.fix_actions.clone(),
        }
    }
}
