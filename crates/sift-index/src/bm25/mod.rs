//! Incremental Okapi BM25 inverted index.
//!
//! One [`Bm25Index`] covers one collection. Documents are added and removed
//! individually; `doc_freq` and the running average document length are
//! maintained in O(1) amortized per term, so the index never needs a rebuild
//! after deletes.
//!
//! Scoring uses the plus-one smoothed IDF, `ln((N - df + 0.5)/(df + 0.5) + 1)`,
//! which is non-negative for every `df <= N`. Results are ordered by score
//! descending with insertion order breaking ties, so repeated searches over an
//! unchanged index are reproducible.

pub mod service;

use std::collections::HashMap;

use crate::tokenizer::Tokenizer;

pub const DEFAULT_K1: f32 = 1.2;
pub const DEFAULT_B: f32 = 0.75;

#[derive(Debug, Clone, Copy)]
pub struct Bm25Params {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Params {
    fn default() -> Self {
        Self {
            k1: DEFAULT_K1,
            b: DEFAULT_B,
        }
    }
}

#[derive(Debug, Default)]
struct DocEntry {
    /// term -> tf for this document, kept so `remove` can decrement postings.
    term_freqs: HashMap<String, usize>,
    len: usize,
    /// Monotonic insertion sequence; the stable tie-break for equal scores.
    seq: u64,
}

/// In-memory inverted index with incremental add/remove.
#[derive(Debug, Default)]
pub struct Bm25Index {
    params: Bm25Params,
    tokenizer: Tokenizer,
    /// term -> set of documents containing it, with tf.
    postings: HashMap<String, HashMap<String, usize>>,
    docs: HashMap<String, DocEntry>,
    total_len: usize,
    next_seq: u64,
}

impl Bm25Index {
    pub fn new() -> Self {
        Self::with_params(Bm25Params::default())
    }

    pub fn with_params(params: Bm25Params) -> Self {
        Self {
            params,
            ..Default::default()
        }
    }

    pub fn size(&self) -> usize {
        self.docs.len()
    }

    pub fn has(&self, id: &str) -> bool {
        self.docs.contains_key(id)
    }

    pub fn all_ids(&self) -> Vec<String> {
        let mut ids: Vec<(&u64, &String)> =
            self.docs.iter().map(|(id, e)| (&e.seq, id)).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id.clone()).collect()
    }

    pub fn avg_len(&self) -> f32 {
        if self.docs.is_empty() {
            0.0
        } else {
            self.total_len as f32 / self.docs.len() as f32
        }
    }

    pub fn doc_freq(&self, term: &str) -> usize {
        self.postings.get(term).map_or(0, |p| p.len())
    }

    /// Index `content` under `id`. Re-adding an existing id replaces it.
    pub fn add(&mut self, id: &str, content: &str) {
        if self.docs.contains_key(id) {
            self.remove(id);
        }

        let terms = self.tokenizer.tokenize(content);
        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        for term in terms {
            *term_freqs.entry(term).or_insert(0) += 1;
        }
        let len: usize = term_freqs.values().sum();

        for (term, tf) in &term_freqs {
            self.postings
                .entry(term.clone())
                .or_default()
                .insert(id.to_string(), *tf);
        }

        self.total_len += len;
        let seq = self.next_seq;
        self.next_seq += 1;
        self.docs.insert(
            id.to_string(),
            DocEntry {
                term_freqs,
                len,
                seq,
            },
        );
    }

    pub fn add_batch<I, S>(&mut self, batch: I)
    where
        I: IntoIterator<Item = (S, S)>,
        S: AsRef<str>,
    {
        for (id, content) in batch {
            self.add(id.as_ref(), content.as_ref());
        }
    }

    /// Remove a document; returns false when the id was not indexed.
    pub fn remove(&mut self, id: &str) -> bool {
        let Some(entry) = self.docs.remove(id) else {
            return false;
        };
        for term in entry.term_freqs.keys() {
            if let Some(posting) = self.postings.get_mut(term) {
                posting.remove(id);
                if posting.is_empty() {
                    self.postings.remove(term);
                }
            }
        }
        self.total_len -= entry.len;
        true
    }

    pub fn clear(&mut self) {
        self.postings.clear();
        self.docs.clear();
        self.total_len = 0;
        // seq deliberately not reset; ids re-added later still order stably.
    }

    /// Okapi BM25 over the query terms. Non-positive scores are omitted;
    /// an empty query (or one emptied by stop-word filtering) yields an
    /// empty list rather than an error.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let query_terms = self.tokenizer.tokenize(query);
        if query_terms.is_empty() || self.docs.is_empty() || top_k == 0 {
            return Vec::new();
        }

        let mut query_freqs: HashMap<&str, usize> = HashMap::new();
        for term in &query_terms {
            *query_freqs.entry(term.as_str()).or_insert(0) += 1;
        }

        let n = self.docs.len() as f32;
        let avg_len = self.avg_len();
        let Bm25Params { k1, b } = self.params;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for (term, qf) in query_freqs {
            let Some(posting) = self.postings.get(term) else {
                continue;
            };
            let df = posting.len() as f32;
            let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
            for (doc_id, tf) in posting {
                let doc_len = self.docs[doc_id.as_str()].len as f32;
                let tf = *tf as f32;
                let norm = tf + k1 * (1.0 - b + b * doc_len / avg_len.max(f32::EPSILON));
                let contribution = idf * (tf * (k1 + 1.0)) / norm * qf as f32;
                *scores.entry(doc_id.as_str()).or_insert(0.0) += contribution;
            }
        }

        let mut results: Vec<(String, f32)> = scores
            .into_iter()
            .filter(|(_, s)| *s > 0.0)
            .map(|(id, s)| (id.to_string(), s))
            .collect();
        results.sort_by(|(ida, sa), (idb, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| self.docs[ida.as_str()].seq.cmp(&self.docs[idb.as_str()].seq))
        });
        results.truncate(top_k);
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_rank_by_term_frequency() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "cat dog");
        idx.add("doc2", "dog dog");
        idx.add("doc3", "cat cat cat");

        let results = idx.search("dog", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "doc2");
        assert_eq!(results[1].0, "doc1");
        assert!(results[0].1 > results[1].1);
    }

    #[test]
    fn remove_restores_df_and_avg_len() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "alpha beta");
        let df_before = idx.doc_freq("gamma");
        let avg_before = idx.avg_len();

        idx.add("doc2", "gamma gamma delta");
        assert_eq!(idx.doc_freq("gamma"), 1);

        assert!(idx.remove("doc2"));
        assert_eq!(idx.doc_freq("gamma"), df_before);
        assert_eq!(idx.avg_len(), avg_before);
        assert!(idx.search("gamma", 10).is_empty());
    }

    #[test]
    fn removed_doc_never_surfaces() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "cat dog");
        idx.add("doc2", "dog dog");
        assert!(idx.has("doc2"));
        idx.remove("doc2");
        assert!(!idx.has("doc2"));

        let results = idx.search("dog", 10);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "doc1");
        // avg_len equals the mean over remaining docs.
        assert_eq!(idx.avg_len(), 2.0);
    }

    #[test]
    fn empty_query_returns_empty_list() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "something useful");
        assert!(idx.search("", 10).is_empty());
        // All query terms filtered away by stop words / min length.
        assert!(idx.search("the it a", 10).is_empty());
    }

    #[test]
    fn readd_replaces_previous_content() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "original words here");
        idx.add("doc1", "replacement text");
        assert_eq!(idx.size(), 1);
        assert!(idx.search("original", 10).is_empty());
        assert_eq!(idx.search("replacement", 10).len(), 1);
    }

    #[test]
    fn ties_break_by_insertion_order() {
        let mut idx = Bm25Index::new();
        idx.add("first", "zebra stripe");
        idx.add("second", "zebra stripe");
        let results = idx.search("zebra", 10);
        assert_eq!(results[0].0, "first");
        assert_eq!(results[1].0, "second");
    }

    #[test]
    fn idf_stays_non_negative_for_ubiquitous_terms() {
        let mut idx = Bm25Index::new();
        idx.add("doc1", "common term");
        idx.add("doc2", "common term");
        idx.add("doc3", "common term");
        // df == N; the plus-one smoothed form still yields a positive score.
        let results = idx.search("common", 10);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|(_, s)| *s > 0.0));
    }

    #[test]
    fn clear_empties_everything() {
        let mut idx = Bm25Index::new();
        idx.add_batch(vec![("a", "one two"), ("b", "three four")]);
        idx.clear();
        assert_eq!(idx.size(), 0);
        assert!(idx.all_ids().is_empty());
        assert!(idx.search("one", 10).is_empty());
    }
}
