//! Result types flowing out of the retrieval pipeline.

use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;

/// One retrieval modality contributing a ranked list to fusion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SearchSource {
    #[serde(rename = "vector")]
    Vector,
    #[serde(rename = "keyword")]
    Keyword,
    #[serde(rename = "sparse")]
    Sparse,
    #[serde(rename = "late")]
    Late,
}

/// A candidate document after search and (re)ranking.
///
/// `original_score` is the score the document entered reranking with;
/// `rerank_score` is whatever the active strategy produced. Both are kept so
/// downstream filters and diagnostics can see the movement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RerankedDoc {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub original_score: f32,
    pub rerank_score: f32,
}

impl RerankedDoc {
    pub fn new(id: impl Into<String>, content: impl Into<String>, score: f32) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            metadata: Metadata::new(),
            original_score: score,
            rerank_score: score,
        }
    }
}

/// Expansion products for one query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpandedQuery {
    pub original: String,
    pub variants: Vec<String>,
    pub keywords: Vec<String>,
    pub hypothetical_passage: Option<String>,
    pub rewritten: Option<String>,
}

/// A single citation entry built from an included chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    /// 1-based position in the formatted context (`[Source k]`).
    pub index: usize,
    pub chunk_id: String,
    pub source: Option<String>,
    pub title: Option<String>,
}

/// What actually ran during a retrieval, for observability and cache clients.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub hybrid_search_used: bool,
    pub query_expansion_used: bool,
    pub reranking_used: bool,
    pub adaptive_reranking_used: bool,
    pub corrective_applied: bool,
    pub fallback_used: bool,
    pub cache_hit: bool,
    pub sanitized: bool,
    /// Candidate count entering reranking.
    pub pre_rerank_count: usize,
    /// Candidate count surviving corrective grading.
    pub post_grading_count: usize,
    /// Retrieval passes performed (1 unless iterative retrieval ran).
    pub iterations: usize,
    /// Why an empty context was returned, when it was.
    pub empty_reason: Option<String>,
}

/// The retrieval result: ordered top-K documents plus the assembled context.
///
/// This is the cacheable unit; it is `Serialize`/`Deserialize` so the query
/// cache can mirror it to a durable key-value store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineContext {
    pub documents: Vec<RerankedDoc>,
    /// The query after sanitization, as actually searched.
    pub query: String,
    pub expanded_query: Option<ExpandedQuery>,
    pub formatted_context: String,
    pub total_tokens_estimate: usize,
    pub citations: Option<Vec<Citation>>,
    pub search_metadata: SearchMetadata,
}

impl PipelineContext {
    /// The never-throwing failure shape: no documents, a reason in metadata.
    pub fn empty(query: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut ctx = Self {
            query: query.into(),
            ..Default::default()
        };
        ctx.search_metadata.empty_reason = Some(reason.into());
        ctx
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// User feedback signal attached to a (query, document) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedbackAction {
    #[serde(rename = "click")]
    Click,
    #[serde(rename = "use")]
    Use,
    #[serde(rename = "dismiss")]
    Dismiss,
    #[serde(rename = "explicit")]
    Explicit,
}

impl FeedbackAction {
    /// How strongly this signal counts toward the learned boost.
    pub fn weight(&self) -> f32 {
        match self {
            FeedbackAction::Explicit => 1.0,
            FeedbackAction::Use => 0.8,
            FeedbackAction::Dismiss => 0.6,
            FeedbackAction::Click => 0.4,
        }
    }
}

/// Per-collection stats surfaced by the pipeline.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionStats {
    pub document_count: usize,
    pub exists: bool,
}

/// Outcome record for one `index_document` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexReport {
    pub chunks_created: usize,
    pub success: bool,
    pub error: Option<String>,
    /// True when dedup mode `skip` found the document already indexed.
    pub skipped_duplicate: bool,
}
