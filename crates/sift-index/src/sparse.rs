//! Sparse lexical representations: term-id -> weight maps scored by dot
//! product.
//!
//! Term ids are stable fxhash-derived 32-bit values, so sparse vectors built
//! on different machines or runs agree. Weights use sublinear tf
//! (`1 + ln(tf)`) and are L2-normalized, which makes the dot product a cosine
//! and keeps scores comparable across documents of different lengths.

use std::collections::HashMap;

use fxhash::hash32;
use sift_core::SparseVec;

use crate::tokenizer::Tokenizer;

/// Stable id for a term.
pub fn term_id(term: &str) -> u32 {
    hash32(term.as_bytes())
}

/// Build the sparse embedding for a text.
pub fn sparse_embed(text: &str) -> SparseVec {
    let terms = Tokenizer.tokenize(text);
    let mut tf: HashMap<u32, f32> = HashMap::new();
    for term in terms {
        *tf.entry(term_id(&term)).or_insert(0.0) += 1.0;
    }
    let mut vec: SparseVec = tf
        .into_iter()
        .map(|(id, count)| (id, 1.0 + count.ln()))
        .collect();

    let norm: f32 = vec.values().map(|w| w * w).sum::<f32>().sqrt();
    if norm > 0.0 {
        for w in vec.values_mut() {
            *w /= norm;
        }
    }
    vec
}

fn dot(a: &SparseVec, b: &SparseVec) -> f32 {
    // Iterate the smaller map.
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(id, w)| large.get(id).map(|v| w * v))
        .sum()
}

/// Per-collection store of sparse vectors with brute-force scoring.
///
/// Collections here are small in-memory mirrors; a linear scan over them is
/// cheaper than maintaining sparse postings until collections grow far past
/// the sizes this pipeline targets.
#[derive(Debug, Default)]
pub struct SparseIndex {
    collections: HashMap<String, HashMap<String, SparseVec>>,
}

impl SparseIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index `text` under (collection, id), returning the built vector so the
    /// caller can also store it on the chunk.
    pub fn add(&mut self, collection: &str, id: &str, text: &str) -> SparseVec {
        let vec = sparse_embed(text);
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), vec.clone());
        vec
    }

    /// Register a prebuilt vector (e.g. restored from the durable mirror).
    pub fn add_prebuilt(&mut self, collection: &str, id: &str, vec: SparseVec) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), vec);
    }

    pub fn remove(&mut self, collection: &str, id: &str) -> bool {
        let Some(docs) = self.collections.get_mut(collection) else {
            return false;
        };
        let removed = docs.remove(id).is_some();
        if docs.is_empty() {
            self.collections.remove(collection);
        }
        removed
    }

    pub fn remove_collection(&mut self, collection: &str) {
        self.collections.remove(collection);
    }

    pub fn size(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, HashMap::len)
    }

    /// Cosine scores for `query` against every document in the collection.
    /// Zero scores are omitted; order is score-descending, id ascending on
    /// ties so results are deterministic.
    pub fn search(&self, collection: &str, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        let query_vec = sparse_embed(query);
        if query_vec.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut results: Vec<(String, f32)> = docs
            .iter()
            .filter_map(|(id, vec)| {
                let score = dot(&query_vec, vec);
                (score > 0.0).then(|| (id.clone(), score))
            })
            .collect();
        results.sort_by(|(ida, sa), (idb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| ida.cmp(idb))
        });
        results.truncate(top_k);
        results
    }
}
