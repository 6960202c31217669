//! Chunk records: the unit of indexing and retrieval.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::metadata::Metadata;

/// An immutable slice of a source document.
///
/// `id` is unique within its collection. `start_offset`/`end_offset` are
/// character offsets into the source text, with `start_offset < end_offset`.
/// Once indexed a chunk's content never changes; mutation is expressed as
/// delete + re-add.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub content: String,
    /// Content prefixed with a document/heading/position summary, when the
    /// indexing pass produced one. Preferred for embedding over raw content.
    pub contextual_content: Option<String>,
    pub chunk_index: usize,
    pub start_offset: usize,
    pub end_offset: usize,
    pub metadata: Metadata,
}

impl Chunk {
    /// The text that should be embedded: contextualized form when available.
    pub fn embedding_text(&self) -> &str {
        self.contextual_content.as_deref().unwrap_or(&self.content)
    }

    /// Offset invariant check; violated only by construction bugs.
    pub fn offsets_valid(&self) -> bool {
        self.start_offset < self.end_offset
    }
}

/// Sparse representation: term-id to weight, mostly zero by construction.
pub type SparseVec = HashMap<u32, f32>;

/// A chunk plus its learned representations.
///
/// Dense vectors within one collection all share the same dimensionality;
/// the indexer enforces this when the first chunk of a collection lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    pub dense_embedding: Vec<f32>,
    pub sparse_embedding: Option<SparseVec>,
}

impl IndexedChunk {
    pub fn id(&self) -> &str {
        &self.chunk.id
    }

    pub fn dimensions(&self) -> usize {
        self.dense_embedding.len()
    }
}

/// Content fingerprint used for cheap duplicate detection.
///
/// A v5 UUID over the whitespace-normalized, lowercased content, so the same
/// text always fingerprints identically across runs and machines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentFingerprint(pub Uuid);

impl ContentFingerprint {
    pub fn of(content: &str) -> Self {
        let normalized: String = content
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        ContentFingerprint(Uuid::new_v5(&Uuid::NAMESPACE_OID, normalized.as_bytes()))
    }

    pub fn as_string(&self) -> String {
        self.0.to_string()
    }
}
