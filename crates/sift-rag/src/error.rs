//! Error types for sift-rag.
//!
//! [`RagError`] captures channel failures, embedding failures, search state
//! violations, and persistence problems. A conversion into the workspace-wide
//! error type is provided so higher layers can uniformly handle failures.
//!
//! Note that the `retrieve` surface itself never returns these: retrieval
//! degrades in-band to an empty [`sift_core::PipelineContext`]. `RagError`
//! flows out of indexing, deletion, and maintenance surfaces.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Embedding error: {0}")]
    Embed(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl From<sift_embed::EmbedError> for RagError {
    fn from(e: sift_embed::EmbedError) -> Self {
        match e {
            sift_embed::EmbedError::Cancelled => RagError::Cancelled("embedding".to_string()),
            other => RagError::Embed(other.to_string()),
        }
    }
}

impl From<RagError> for sift_error::Error {
    fn from(value: RagError) -> sift_error::Error {
        match value {
            RagError::Channel(msg) => sift_error::Error::Channel(msg),
            RagError::Embed(msg) => sift_error::Error::Embed(msg),
            RagError::Search(msg) => sift_error::Error::Internal(format!("search: {msg}")),
            RagError::Invalid(msg) => sift_error::Error::Invalid(msg),
            RagError::Persist(msg) => sift_error::Error::Persist(msg),
            RagError::Cancelled(msg) => sift_error::Error::Cancelled(msg),
        }
    }
}
