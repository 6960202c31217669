//! Late-interaction scoring over per-term signatures.
//!
//! Instead of pooling a document into one vector, each term keeps its own
//! signature (a stable hash plus a character-trigram set). A query is scored
//! MaxSim-style: every query term takes its best match across the document's
//! terms (exact hash match = 1.0, otherwise trigram Jaccard), and the
//! per-term maxima are averaged. Near-miss terms ("tokenize" vs "tokenizer")
//! still earn partial credit, which a pooled lexical signal cannot give.

use std::collections::{HashMap, HashSet};

use fxhash::hash64;

use crate::tokenizer::Tokenizer;

#[derive(Debug, Clone)]
pub struct TermSig {
    hash: u64,
    trigrams: HashSet<u32>,
}

impl TermSig {
    fn of(term: &str) -> Self {
        let padded: Vec<char> = format!("\u{2}{}\u{3}", term).chars().collect();
        let trigrams = padded
            .windows(3)
            .map(|w| fxhash::hash32(&w.iter().collect::<String>()))
            .collect();
        Self {
            hash: hash64(term),
            trigrams,
        }
    }

    fn similarity(&self, other: &TermSig) -> f32 {
        if self.hash == other.hash {
            return 1.0;
        }
        let intersection = self.trigrams.intersection(&other.trigrams).count();
        if intersection == 0 {
            return 0.0;
        }
        let union = self.trigrams.len() + other.trigrams.len() - intersection;
        intersection as f32 / union as f32
    }
}

/// Build the per-term signature sequence for a text.
pub fn term_signatures(text: &str) -> Vec<TermSig> {
    Tokenizer.tokenize(text).iter().map(|t| TermSig::of(t)).collect()
}

/// MaxSim score of a query signature set against one document's signatures.
pub fn max_sim(query: &[TermSig], doc: &[TermSig]) -> f32 {
    if query.is_empty() || doc.is_empty() {
        return 0.0;
    }
    let total: f32 = query
        .iter()
        .map(|q| {
            doc.iter()
                .map(|d| q.similarity(d))
                .fold(0.0f32, f32::max)
        })
        .sum();
    total / query.len() as f32
}

/// Per-collection store of term-signature sequences.
#[derive(Debug, Default)]
pub struct LateIndex {
    collections: HashMap<String, HashMap<String, Vec<TermSig>>>,
}

impl LateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, collection: &str, id: &str, text: &str) {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), term_signatures(text));
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

    /// Score every document in the collection; zero scores omitted, ordered
    /// score-descending with id tie-break.
    pub fn search(&self, collection: &str, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let Some(docs) = self.collections.get(collection) else {
            return Vec::new();
        };
        let query_sigs = term_signatures(query);
        if query_sigs.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut results: Vec<(String, f32)> = docs
            .iter()
            .filter_map(|(id, sigs)| {
                let score = max_sim(&query_sigs, sigs);
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_terms_score_one() {
        let q = term_signatures("ownership");
        let d = term_signatures("rust ownership model");
        assert!((max_sim(&q, &d) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn near_terms_earn_partial_credit() {
        let q = term_signatures("tokenizer");
        let exact = term_signatures("tokenizer");
        let near = term_signatures("tokenize");
        let far = term_signatures("gardening");

        let s_exact = max_sim(&q, &exact);
        let s_near = max_sim(&q, &near);
        let s_far = max_sim(&q, &far);
        assert!(s_exact > s_near);
        assert!(s_near > s_far);
    }

    #[test]
    fn index_ranks_matching_documents_first() {
        let mut idx = LateIndex::new();
        idx.add("kb", "d1", "query tokenizer implementation details");
        idx.add("kb", "d2", "completely unrelated cooking recipe");

        let results = idx.search("kb", "tokenizer", 10);
        assert!(!results.is_empty());
        assert_eq!(results[0].0, "d1");
    }
}
