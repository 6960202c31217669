//! Pipeline configuration: per-feature sub-configs aggregated by [`RagConfig`].
//!
//! Every struct carries a `Default` impl holding the documented default
//! values. Partial reconfiguration goes through [`ConfigPatch`], whose fields
//! are all optional; `RagConfig::apply` merges a patch in place.

use serde::{Deserialize, Serialize};

/// Longest accepted collection name.
pub const MAX_COLLECTION_NAME_LEN: usize = 256;

/// Hard cap applied to queries during sanitization.
pub const MAX_QUERY_LENGTH: usize = 1000;

/// Validate a collection name: alphanumeric plus `- . _` and space.
pub fn validate_collection_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("collection name is empty".to_string());
    }
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(format!(
            "collection name exceeds {} bytes",
            MAX_COLLECTION_NAME_LEN
        ));
    }
    if let Some(bad) = name
        .chars()
        .find(|c| !(c.is_alphanumeric() || matches!(c, '-' | '.' | '_' | ' ')))
    {
        return Err(format!("invalid character {:?} in collection name", bad));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HybridSearchConfig {
    pub enabled: bool,
    pub vector_weight: f32,
    pub keyword_weight: f32,
    pub sparse_weight: f32,
    pub late_weight: f32,
    pub enable_sparse: bool,
    pub enable_late: bool,
}

impl Default for HybridSearchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            vector_weight: 0.5,
            keyword_weight: 0.5,
            sparse_weight: 0.3,
            late_weight: 0.2,
            enable_sparse: false,
            enable_late: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankingConfig {
    pub enabled: bool,
    pub use_model: bool,
    /// Key for the external rerank API; selects the external strategy when set.
    pub external_api_key: Option<String>,
    /// Endpoint for the external rerank API.
    pub external_api_url: Option<String>,
}

impl Default for RerankingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_model: false,
            external_api_key: None,
            external_api_url: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryExpansionConfig {
    pub enabled: bool,
    pub max_variants: usize,
    pub use_hyde: bool,
}

impl Default for QueryExpansionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_variants: 3,
            use_hyde: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub enabled: bool,
    pub max_size: usize,
    pub ttl_ms: u64,
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 100,
            ttl_ms: 300_000,
            persist: false,
        }
    }
}

/// What to do when an incoming document's fingerprint is already indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DedupMode {
    /// Leave the existing chunks in place and skip the new document.
    #[serde(rename = "skip")]
    Skip,
    /// Delete the existing chunks, then index the new document.
    #[serde(rename = "upsert")]
    Upsert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupConfig {
    pub enabled: bool,
    pub mode: DedupMode,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: DedupMode::Skip,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveRerankingConfig {
    pub enabled: bool,
    /// Clamped to [0, 1] at application time.
    pub feedback_weight: f32,
    pub min_feedback_count: usize,
}

impl Default for AdaptiveRerankingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            feedback_weight: 0.3,
            min_feedback_count: 3,
        }
    }
}

/// Recovery behavior when corrective grading empties the candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CorrectiveFallback {
    #[serde(rename = "none")]
    None,
    #[serde(rename = "relax_threshold")]
    RelaxThreshold,
    #[serde(rename = "keep_best")]
    KeepBest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrectiveRagConfig {
    pub enabled: bool,
    pub relevance_threshold: f32,
    pub use_model: bool,
    pub fallback: CorrectiveFallback,
    /// Grading never leaves fewer than this many documents when a fallback
    /// other than `None` is configured.
    pub min_chunks: usize,
}

impl Default for CorrectiveRagConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            relevance_threshold: 0.4,
            use_model: false,
            fallback: CorrectiveFallback::KeepBest,
            min_chunks: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterativeRetrievalConfig {
    pub enabled: bool,
    pub max_iterations: usize,
    pub sufficiency_threshold: f32,
}

impl Default for IterativeRetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_iterations: 2,
            sufficiency_threshold: 0.5,
        }
    }
}

/// How chunks are produced from a source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Soft cap on chunk size in characters.
    pub max_chunk_chars: usize,
    /// Prefix chunks with a heading/position summary before embedding.
    pub contextualize: bool,
    /// Use the language model (when configured) for contextualization.
    pub contextualize_with_model: bool,
    /// Copy the enclosing section's text into `parent_content` metadata.
    pub parent_child: bool,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: 1200,
            contextualize: false,
            contextualize_with_model: false,
            parent_child: false,
        }
    }
}

/// How per-variant result lists are merged into one candidate set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariantMerge {
    #[serde(rename = "rrf")]
    Rrf,
    #[serde(rename = "max")]
    Max,
    #[serde(rename = "sum")]
    Sum,
    #[serde(rename = "avg")]
    Avg,
}

/// Aggregated pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RagConfig {
    pub hybrid_search: HybridSearchConfig,
    pub reranking: RerankingConfig,
    pub query_expansion: QueryExpansionConfig,
    pub cache: CacheConfig,
    pub dedup: DedupConfig,
    pub adaptive_reranking: AdaptiveRerankingConfig,
    pub corrective_rag: CorrectiveRagConfig,
    pub iterative_retrieval: IterativeRetrievalConfig,
    pub chunking: ChunkingConfig,
    pub top_k: usize,
    pub similarity_threshold: f32,
    /// Token budget for the assembled context.
    pub max_context_length: usize,
    pub variant_merge: VariantMerge,
    /// Assemble via the dynamic context manager rather than straight
    /// concatenation.
    pub dynamic_context: bool,
    pub enable_citations: bool,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            hybrid_search: HybridSearchConfig::default(),
            reranking: RerankingConfig::default(),
            query_expansion: QueryExpansionConfig::default(),
            cache: CacheConfig::default(),
            dedup: DedupConfig::default(),
            adaptive_reranking: AdaptiveRerankingConfig::default(),
            corrective_rag: CorrectiveRagConfig::default(),
            iterative_retrieval: IterativeRetrievalConfig::default(),
            chunking: ChunkingConfig::default(),
            top_k: 5,
            similarity_threshold: 0.5,
            max_context_length: 4000,
            variant_merge: VariantMerge::Rrf,
            dynamic_context: true,
            enable_citations: false,
        }
    }
}

impl RagConfig {
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(v) = patch.hybrid_search {
            self.hybrid_search = v;
        }
        if let Some(v) = patch.reranking {
            self.reranking = v;
        }
        if let Some(v) = patch.query_expansion {
            self.query_expansion = v;
        }
        if let Some(v) = patch.cache {
            self.cache = v;
        }
        if let Some(v) = patch.dedup {
            self.dedup = v;
        }
        if let Some(v) = patch.adaptive_reranking {
            self.adaptive_reranking = v;
        }
        if let Some(v) = patch.corrective_rag {
            self.corrective_rag = v;
        }
        if let Some(v) = patch.iterative_retrieval {
            self.iterative_retrieval = v;
        }
        if let Some(v) = patch.chunking {
            self.chunking = v;
        }
        if let Some(v) = patch.top_k {
            self.top_k = v;
        }
        if let Some(v) = patch.similarity_threshold {
            self.similarity_threshold = v;
        }
        if let Some(v) = patch.max_context_length {
            self.max_context_length = v;
        }
        if let Some(v) = patch.variant_merge {
            self.variant_merge = v;
        }
        if let Some(v) = patch.dynamic_context {
            self.dynamic_context = v;
        }
        if let Some(v) = patch.enable_citations {
            self.enable_citations = v;
        }
    }
}

/// Partial configuration: every field optional, merged by [`RagConfig::apply`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPatch {
    pub hybrid_search: Option<HybridSearchConfig>,
    pub reranking: Option<RerankingConfig>,
    pub query_expansion: Option<QueryExpansionConfig>,
    pub cache: Option<CacheConfig>,
    pub dedup: Option<DedupConfig>,
    pub adaptive_reranking: Option<AdaptiveRerankingConfig>,
    pub corrective_rag: Option<CorrectiveRagConfig>,
    pub iterative_retrieval: Option<IterativeRetrievalConfig>,
    pub chunking: Option<ChunkingConfig>,
    pub top_k: Option<usize>,
    pub similarity_threshold: Option<f32>,
    pub max_context_length: Option<usize>,
    pub variant_merge: Option<VariantMerge>,
    pub dynamic_context: Option<bool>,
    pub enable_citations: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = RagConfig::default();
        assert!(cfg.hybrid_search.enabled);
        assert_eq!(cfg.hybrid_search.vector_weight, 0.5);
        assert_eq!(cfg.hybrid_search.keyword_weight, 0.5);
        assert!(cfg.reranking.enabled);
        assert!(!cfg.reranking.use_model);
        assert!(!cfg.query_expansion.enabled);
        assert_eq!(cfg.query_expansion.max_variants, 3);
        assert!(cfg.cache.enabled);
        assert_eq!(cfg.cache.max_size, 100);
        assert_eq!(cfg.cache.ttl_ms, 300_000);
        assert_eq!(cfg.top_k, 5);
        assert_eq!(cfg.similarity_threshold, 0.5);
        assert_eq!(cfg.max_context_length, 4000);
    }

    #[test]
    fn patch_merges_only_present_fields() {
        let mut cfg = RagConfig::default();
        cfg.apply(ConfigPatch {
            top_k: Some(10),
            ..Default::default()
        });
        assert_eq!(cfg.top_k, 10);
        // Untouched sections keep their defaults.
        assert!(cfg.cache.enabled);
    }

    #[test]
    fn collection_name_validation() {
        assert!(validate_collection_name("kb").is_ok());
        assert!(validate_collection_name("my-notes.v2 _x").is_ok());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("bad/name").is_err());
        assert!(validate_collection_name(&"x".repeat(257)).is_err());
    }
}
