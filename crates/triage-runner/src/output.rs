use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriageCategory {
    Bug,
    FeatureRequest,
    Question,
    Configuration,
    Documentation,
    Other,
}

impl TriageCategory {
    pub const ALL: [TriageCategory; 6] = [
        TriageCategory::Bug,
        TriageCategory::FeatureRequest,
        TriageCategory::Question,
        TriageCategory::Configuration,
        TriageCategory::Documentation,
        TriageCategory::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TriageCategory::Bug => "bug",
            TriageCategory::FeatureRequest => "feature_request",
            TriageCategory::Question => "question",
            TriageCategory::Configuration => "configuration",
            TriageCategory::Documentation => "documentation",
            TriageCategory::Other => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Structured triage verdict produced by a runner.
pub struct TriageOutput {
    pub category: TriageCategory,
    pub labels: Vec<String>,
    pub confidence: f32,
    pub explanation: String,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
}

/// JSON schema the agent's final answer must satisfy.
pub fn triage_output_schema() -> Value {
    let categories = TriageCategory::ALL
        .iter()
        .map(|category| category.as_str())
        .collect::<Vec<_>>();
    json!({
        "type": "object",
        "properties": {
            "category": { "type": "string", "enum": categories },
            "labels": { "type": "array", "items": { "type": "string" } },
            "confidence": { "type": "number", "minimum": 0, "maximum": 1 },
            "explanation": { "type": "string", "minLength": 1 },
            "suggested_actions": { "type": "array", "items": { "type": "string" } }
        },
        "required": ["category", "labels", "confidence", "explanation"]
    })
}
