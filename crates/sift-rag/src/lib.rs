//! sift-rag — hybrid retrieval and context assembly for the sift workspace.
//!
//! This crate provides the retrieval side of RAG:
//! - Retrieval: dense vectors via a pluggable backend (with an in-memory
//!   cosine fallback), BM25 via the `sift-index` actor, plus optional sparse
//!   and late-interaction signals.
//! - Fusion: score normalization, weighted Reciprocal Rank Fusion, variant
//!   merging, and optional MMR diversity selection.
//! - Reranking: heuristic, model-backed, external-API, and feedback-adaptive
//!   strategies; none of them can fail a retrieval.
//! - Context assembly: token-budgeted selection, near-duplicate filtering,
//!   compression, and formatting.
//! - Orchestration: [`RagPipeline`], the state machine tying sanitization,
//!   caching, expansion, multi-variant search, grading, and assembly
//!   together.
//!
//! Design emphases, in order: deterministic behavior given the same inputs,
//! in-band failure reporting (the retrieve surface never returns an error),
//! and strong observability through `tracing` fields at every degraded path.
//!
//! Concurrency
//! - BM25 is served by a Tokio actor owned by `sift-index`; all calls from
//!   this crate are guarded by client-side timeouts.
//! - The pipeline's own state (mirror, sparse/late indexes, caches, feedback
//!   store) lives behind `tokio::sync::RwLock` with writer discipline on the
//!   mutation paths.
//!
//! Quickstart
//! ```no_run
//! use std::sync::Arc;
//! use sift_core::{EmbeddingService, FeedbackAction};
//! use sift_rag::{IndexingOptions, RagPipeline};
//!
//! # async fn example(embedder: Arc<dyn EmbeddingService>) {
//! let pipeline = RagPipeline::new(embedder);
//!
//! let report = pipeline
//!     .index_document(
//!         "Machine learning is a subset of artificial intelligence.",
//!         IndexingOptions {
//!             collection: "kb".to_string(),
//!             ..Default::default()
//!         },
//!     )
//!     .await;
//! assert!(report.success);
//!
//! let ctx = pipeline.retrieve("kb", "what is machine learning").await;
//! println!("{}", ctx.formatted_context);
//!
//! pipeline
//!     .record_feedback("what is machine learning", &ctx.documents[0].id, 1.0, FeedbackAction::Use)
//!     .await;
//! # }
//! ```

pub mod cache;
pub mod chunking;
pub mod context;
pub mod core;
pub mod error;
pub mod expand;
pub mod fusion;
pub mod grade;
pub mod rerank;
pub mod sanitize;

pub use cache::{CacheStats, QueryCache};
pub use context::{
    classify_query, format_context, ApproxCharTokenizer, BudgetReport, Complexity, ContextConfig,
    DynamicContextManager, TokenCounter,
};
pub use core::{IndexingOptions, RagPipeline, RagPipelineBuilder};
pub use error::RagError;
pub use fusion::{
    cosine_sim, merge_by_id, mmr_select, normalize_scores, rrf_fuse, MergeStrategy, MmrConfig,
    ScoreNorm, RRF_K,
};
pub use rerank::adaptive::{AdaptiveParams, AdaptiveReranker};
pub use rerank::{
    boost_by_metadata, boost_by_recency, filter_by_relevance, HeuristicWeights, MetadataBoost,
    RerankStrategy,
};
pub use sanitize::{sanitize_query, validate_retrieval_input, SanitizedQuery};
pub use sift_index::Bm25Status;
