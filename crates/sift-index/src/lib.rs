//! sift-index — lexical retrieval structures for the sift workspace.
//!
//! Three complementary signals over the same tokenization:
//! - [`Bm25Index`]: incremental Okapi BM25 inverted index, served behind a
//!   Tokio actor ([`bm25::service`]) so mutation is serialized and retrieval
//!   tasks stay lock-free.
//! - [`SparseIndex`]: term-id -> weight vectors scored by cosine.
//! - [`LateIndex`]: per-term signature MaxSim scoring.
//!
//! All three return `Vec<(String, f32)>` ranked lists that feed straight into
//! the fusion layer. Empty queries and unknown collections answer with empty
//! lists, never errors.

pub mod bm25;
pub mod late;
pub mod sparse;
pub mod tokenizer;

pub use bm25::service::{start as start_bm25, start_default as start_bm25_default, Bm25Cmd, Bm25Status};
pub use bm25::{Bm25Index, Bm25Params};
pub use late::LateIndex;
pub use sparse::{sparse_embed, term_id, SparseIndex};
pub use tokenizer::Tokenizer;
