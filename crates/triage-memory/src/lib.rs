//! Similar-case memory for issue triage: case index, symptom extraction and
//! the cache-aware retriever.
mod case;
mod extractor;
mod retriever;
mod search;

pub use case::{HistoricalCase, SimilarCase};
pub use extractor::{
    AgentSymptomExtractor, KeywordSymptomExtractor, SymptomExtractor, SymptomQuery,
    DEFAULT_MAX_SYMPTOM_TERMS,
};
pub use retriever::{
    precompute_shared_cache, render_memory_context, MemoryConfig, MemoryContext,
    MemoryRetriever, MemoryStats, SharedMemoryCache, DEFAULT_MAX_CONTEXT_CHARS,
    DEFAULT_MAX_EVIDENCE_ITEMS, DEFAULT_MAX_FIX_ACTIONS, DEFAULT_SEARCH_LIMIT,
    DEFAULT_SIMILARITY_THRESHOLD,
};
pub use search::{
    cosine_similarity, embed_text_vector, LocalCaseIndex, SimilaritySearch,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
