use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::{HistoricalCase, SimilarCase};

pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 256;

/// Similarity lookup over past cases.
#[async_trait]
pub trait SimilaritySearch: Send + Sync {
    async fn search(&self, query: &str, limit: usize, threshold: f32) -> Result<Vec<SimilarCase>>;
}

#[derive(Debug, Clone)]
struct IndexedCase {
    case: HistoricalCase,
    embedding: Vec<f32>,
}

#[derive(Debug, Clone)]
/// In-memory case index using hashed bag-of-words embeddings.
pub struct LocalCaseIndex {
    cases: Vec<IndexedCase>,
    dimensions: usize,
}

impl LocalCaseIndex {
    pub fn new(cases: Vec<HistoricalCase>, dimensions: usize) -> Self {
        let dimensions = dimensions.max(1);
        let cases = cases
            .into_iter()
            .map(|case| IndexedCase {
                embedding: embed_text_vector(&case.search_text(), dimensions),
                case,
            })
            .collect();
        Self { cases, dimensions }
    }

    /// Loads one case per line; blank lines are skipped.
    pub fn load_jsonl(path: &Path, dimensions: usize) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read case history {}", path.display()))?;
        let mut cases = Vec::new();
        for (index, line) in raw.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let case: HistoricalCase = serde_json::from_str(trimmed).with_context(|| {
                format!(
                    "failed to parse case history {} line {}",
                    path.display(),
                    index + 1
                )
            })?;
            cases.push(case);
        }
        tracing::debug!(
            path = %path.display(),
            cases = cases.len(),
            "loaded case history"
        );
        Ok(Self::new(cases, dimensions))
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    /// Ranks cases by cosine similarity, highest first, ties broken by case id.
    pub fn rank(&self, query: &str, limit: usize, threshold: f32) -> Vec<SimilarCase> {
        if limit == 0 || query.trim().is_empty() {
            return Vec::new();
        }
        let query_embedding = embed_text_vector(query, self.dimensions);
        if query_embedding.iter().all(|component| *component == 0.0) {
            return Vec::new();
        }

        let mut matches = self
            .cases
            .iter()
            .filter_map(|indexed| {
                let score = cosine_similarity(&query_embedding, &indexed.embedding);
                (score >= threshold).then(|| SimilarCase::from_case(&indexed.case, score))
            })
            .collect::<Vec<_>>();
        matches.sort_by(|left, right| {
            right
                .similarity
                .total_cmp(&left.similarity)
                .then_with(|| left.case_id.cmp(&right.case_id))
        });
        matches.truncate(limit);
        matches
    }
}

#[async_trait]
impl SimilaritySearch for LocalCaseIndex {
    async fn search(&self, query: &str, limit: usize, threshold: f32) -> Result<Vec<SimilarCase>> {
        Ok(self.rank(query, limit, threshold))
    }
}

pub fn embed_text_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let dimensions = dimensions.max(1);
    let mut vector = vec![0.0f32; dimensions];
    for raw_token in text.split(|character: char| !character.is_alphanumeric()) {
        if raw_token.is_empty() {
            continue;
        }
        let token = raw_token.to_ascii_lowercase();
        let hash = fnv1a_hash(token.as_bytes());
        let index = (hash as usize) % dimensions;
        let sign = if (hash & 1) == 0 { 1.0 } else { -1.0 };
        vector[index] += sign;
    }

    let magnitude = vector
        .iter()
        .map(|component| component * component)
        .sum::<f32>()
        .sqrt();
    if magnitude > 0.0 {
        for component in &mut vector {
            *component /= magnitude;
        }
    }
    vector
}

pub fn cosine_similarity(left: &[f32], right: &[f32]) -> f32 {
    if left.len() != right.len() {
        return 0.0;
    }
    left.iter()
        .zip(right)
        .map(|(left, right)| left * right)
        .sum()
}

fn fnv1a_hash(bytes: &[u8]) -> u64 {
    const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;
    let mut hash = FNV_OFFSET_BASIS;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
