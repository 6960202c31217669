//! External collaborator contracts.
//!
//! The pipeline borrows these for its whole lifetime and treats them as
//! thread-safe and call-at-will. Every method may suspend; all failures are
//! recoverable at the call site (the pipeline degrades to local state where
//! a fallback is specified).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::metadata::Metadata;
use sift_error::Error;

/// Text to dense vector. `embed_batch` returns vectors in input order, all of
/// equal length.
#[async_trait]
pub trait EmbeddingService: Send + Sync + std::fmt::Debug {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, Error>;

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, Error>;

    /// Output dimensionality; used to validate collection homogeneity.
    fn dimensions(&self) -> usize;
}

/// Prompt to text. Used for expansion, rewriting, contextualization,
/// model-backed reranking and grading; callers parse leniently and fall back
/// on malformed output.
#[async_trait]
pub trait LanguageModel: Send + Sync + std::fmt::Debug {
    async fn generate(&self, prompt: &str, temperature: f32) -> Result<String, Error>;
}

/// A document as handed to the vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorDocument {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

/// One ANN hit from the vector backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub id: String,
    pub content: String,
    pub metadata: Metadata,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionInfo {
    pub name: String,
    pub document_count: usize,
}

/// Id-keyed ANN backend. All operations may fail; callers fall back to the
/// in-memory mirror.
#[async_trait]
pub trait VectorStore: Send + Sync + std::fmt::Debug {
    async fn add_documents(
        &self,
        collection: &str,
        documents: Vec<VectorDocument>,
    ) -> Result<(), Error>;

    async fn search(
        &self,
        collection: &str,
        query_embedding: &[f32],
        top_k: usize,
    ) -> Result<Vec<VectorHit>, Error>;

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<(), Error>;

    async fn delete_all(&self, collection: &str) -> Result<(), Error>;

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>, Error>;
}

/// A chunk as written to the durable mirror.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDoc {
    pub id: String,
    pub payload: String,
}

/// Id-keyed durable mirror of indexed chunks. Best-effort: failures are
/// logged by callers and never fatal.
#[async_trait]
pub trait PersistentStore: Send + Sync + std::fmt::Debug {
    async fn initialize(&self) -> Result<(), Error>;

    async fn load_documents(&self, collection: &str) -> Result<Vec<StoredDoc>, Error>;

    async fn save_documents(&self, collection: &str, docs: Vec<StoredDoc>) -> Result<(), Error>;

    async fn delete_documents(&self, collection: &str, ids: &[String]) -> Result<(), Error>;

    async fn clear_collection(&self, collection: &str) -> Result<(), Error>;

    /// Collections with at least one stored chunk.
    async fn list_collections(&self) -> Result<Vec<String>, Error>;
}

/// Small durable key-value surface used by the query cache's persistence
/// mirror. Writes are best-effort and must never block the caller.
#[async_trait]
pub trait KvStore: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<String>, Error>;

    async fn put(&self, key: &str, value: String) -> Result<(), Error>;

    async fn delete(&self, key: &str) -> Result<(), Error>;

    async fn keys(&self) -> Result<Vec<String>, Error>;
}
