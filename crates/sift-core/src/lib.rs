//! sift-core — shared data model for the sift retrieval workspace.
//!
//! This crate holds the types every other sift crate speaks:
//! - [`Chunk`]/[`IndexedChunk`]: the unit of indexing and retrieval, with
//!   stable character offsets and an open [`Metadata`] map of tagged
//!   [`Scalar`] values.
//! - [`PipelineContext`] and friends: the retrieval result surface,
//!   serializable so the query cache can mirror it durably.
//! - [`RagConfig`]: per-feature configuration with documented defaults and
//!   [`ConfigPatch`] for partial updates.
//! - External collaborator traits ([`EmbeddingService`], [`LanguageModel`],
//!   [`VectorStore`], [`PersistentStore`], [`KvStore`]): async contracts the
//!   pipeline borrows and treats as call-at-will.
//!
//! No I/O happens here; everything is plain data plus trait definitions.

pub mod chunk;
pub mod config;
pub mod metadata;
pub mod rag_types;
pub mod traits;

pub use chunk::{Chunk, ContentFingerprint, IndexedChunk, SparseVec};
pub use config::{
    validate_collection_name, AdaptiveRerankingConfig, CacheConfig, ChunkingConfig, ConfigPatch,
    CorrectiveFallback, CorrectiveRagConfig, DedupConfig, DedupMode, HybridSearchConfig,
    IterativeRetrievalConfig, QueryExpansionConfig, RagConfig, RerankingConfig, VariantMerge,
    MAX_COLLECTION_NAME_LEN, MAX_QUERY_LENGTH,
};
pub use metadata::{Metadata, Scalar};
pub use rag_types::{
    Citation, CollectionStats, ExpandedQuery, FeedbackAction, IndexReport, PipelineContext,
    RerankedDoc, SearchMetadata, SearchSource,
};
pub use traits::{
    CollectionInfo, EmbeddingService, KvStore, LanguageModel, PersistentStore, StoredDoc,
    VectorDocument, VectorHit, VectorStore,
};
