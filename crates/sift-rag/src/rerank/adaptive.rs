//! Feedback-learning reranker.
//!
//! User signals (clicks, uses, dismissals, explicit ratings) accumulate per
//! (query hash, document id) and nudge future rankings. Entries decay
//! exponentially by age so stale feedback fades, and the applied boost is
//! bounded: `|new - original| <= original * feedback_weight`.
//!
//! Queries are hashed with fxhash over the lowercase-trimmed bytes, which is
//! deterministic across processes. Document ids are reduced to a source key
//! (everything before the trailing `:{chunk_index}` suffix by default) so
//! feedback on one chunk can softly transfer to siblings from the same
//! source document at half weight; supply a custom extractor when ids follow
//! a different scheme.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::rerank::sort_by_rerank_score;
use sift_core::{FeedbackAction, RerankedDoc};

/// Per-query feedback list cap.
const MAX_ENTRIES_PER_QUERY: usize = 100;

/// Global cap on tracked query hashes; oldest-touched evicted first.
const MAX_TRACKED_QUERIES: usize = 1000;

#[derive(Debug, Clone)]
pub struct FeedbackEntry {
    pub doc_id: String,
    /// Relevance in [0, 1]; 0.5 is neutral.
    pub relevance: f32,
    pub action: FeedbackAction,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct QueryFeedback {
    entries: Vec<FeedbackEntry>,
    last_touched: i64,
}

/// Extracts the source-document key from a chunk id.
pub type SourceKeyFn = fn(&str) -> String;

/// Default extractor for `{collection}::{doc}:{chunk_index}` ids: strip the
/// trailing `:{digits}` chunk suffix.
pub fn default_source_key(doc_id: &str) -> String {
    match doc_id.rfind(':') {
        Some(pos)
            if pos > 0
                && !doc_id[..pos].ends_with(':')
                && doc_id[pos + 1..].chars().all(|c| c.is_ascii_digit())
                && !doc_id[pos + 1..].is_empty() =>
        {
            doc_id[..pos].to_string()
        }
        _ => doc_id.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AdaptiveParams {
    /// Daily multiplicative decay applied to entry weight.
    pub decay_factor: f32,
    /// Feedback entries required before boosts apply to a query.
    pub min_feedback_count: usize,
    /// Scale of the applied boost; clamped to [0, 1] at application.
    pub feedback_weight: f32,
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            decay_factor: 0.95,
            min_feedback_count: 3,
            feedback_weight: 0.3,
        }
    }
}

/// Time-decayed feedback store with bounded memory.
#[derive(Debug)]
pub struct AdaptiveReranker {
    params: AdaptiveParams,
    store: HashMap<u64, QueryFeedback>,
    source_key: SourceKeyFn,
    touch_counter: i64,
}

impl AdaptiveReranker {
    pub fn new(params: AdaptiveParams) -> Self {
        Self {
            params,
            store: HashMap::new(),
            source_key: default_source_key,
            touch_counter: 0,
        }
    }

    pub fn with_source_key(mut self, source_key: SourceKeyFn) -> Self {
        self.source_key = source_key;
        self
    }

    fn query_hash(query: &str) -> u64 {
        fxhash::hash64(query.trim().to_lowercase().as_bytes())
    }

    /// Record one feedback signal. Relevance is clamped to [0, 1]; the
    /// per-query list prunes oldest-first past its cap.
    pub fn record(&mut self, query: &str, doc_id: &str, relevance: f32, action: FeedbackAction) {
        self.record_at(query, doc_id, relevance, action, Utc::now())
    }

    pub fn record_at(
        &mut self,
        query: &str,
        doc_id: &str,
        relevance: f32,
        action: FeedbackAction,
        at: DateTime<Utc>,
    ) {
        let hash = Self::query_hash(query);
        self.touch_counter += 1;

        if !self.store.contains_key(&hash) && self.store.len() >= MAX_TRACKED_QUERIES {
            if let Some(oldest) = self
                .store
                .iter()
                .min_by_key(|(_, f)| f.last_touched)
                .map(|(h, _)| *h)
            {
                self.store.remove(&oldest);
            }
        }

        let feedback = self.store.entry(hash).or_default();
        feedback.last_touched = self.touch_counter;
        feedback.entries.push(FeedbackEntry {
            doc_id: doc_id.to_string(),
            relevance: relevance.clamp(0.0, 1.0),
            action,
            at,
        });
        if feedback.entries.len() > MAX_ENTRIES_PER_QUERY {
            let excess = feedback.entries.len() - MAX_ENTRIES_PER_QUERY;
            feedback.entries.drain(..excess);
        }
    }

    pub fn feedback_count(&self, query: &str) -> usize {
        self.store
            .get(&Self::query_hash(query))
            .map_or(0, |f| f.entries.len())
    }

    /// Aggregate boost in [-1, 1] for (query, doc_id), or None when the query
    /// has no direct feedback on the document (the similar-source fallback is
    /// handled by the caller via [`Self::boost_for`]).
    fn direct_boost(
        &self,
        entries: &[FeedbackEntry],
        doc_id: &str,
        now: DateTime<Utc>,
    ) -> Option<f32> {
        let mut weighted_sum = 0.0f32;
        let mut total_weight = 0.0f32;
        for entry in entries.iter().filter(|e| e.doc_id == doc_id) {
            let days = (now - entry.at).num_seconds().max(0) as f32 / 86_400.0;
            let decay = self.params.decay_factor.powf(days);
            let weight = decay * entry.action.weight();
            weighted_sum += (entry.relevance - 0.5) * 2.0 * weight;
            total_weight += weight;
        }
        (total_weight > 0.0).then(|| weighted_sum / total_weight)
    }

    /// Boost for one document: direct feedback, or same-source feedback at
    /// half weight when no direct entries exist.
    fn boost_for(&self, entries: &[FeedbackEntry], doc_id: &str, now: DateTime<Utc>) -> f32 {
        if let Some(direct) = self.direct_boost(entries, doc_id, now) {
            return direct;
        }
        let source = (self.source_key)(doc_id);
        let mut weighted_sum = 0.0f32;
        let mut total_weight = 0.0f32;
        for entry in entries
            .iter()
            .filter(|e| (self.source_key)(&e.doc_id) == source)
        {
            let days = (now - entry.at).num_seconds().max(0) as f32 / 86_400.0;
            let decay = self.params.decay_factor.powf(days);
            let weight = decay * entry.action.weight();
            weighted_sum += (entry.relevance - 0.5) * 2.0 * weight;
            total_weight += weight;
        }
        if total_weight > 0.0 {
            weighted_sum / total_weight * 0.5
        } else {
            0.0
        }
    }

    /// Apply learned boosts to a ranked list. A no-op until the query has
    /// accumulated `min_feedback_count` entries.
    pub fn rerank_with_learning(&self, query: &str, docs: Vec<RerankedDoc>) -> Vec<RerankedDoc> {
        self.rerank_with_learning_at(query, docs, Utc::now())
    }

    pub fn rerank_with_learning_at(
        &self,
        query: &str,
        mut docs: Vec<RerankedDoc>,
        now: DateTime<Utc>,
    ) -> Vec<RerankedDoc> {
        let Some(feedback) = self.store.get(&Self::query_hash(query)) else {
            return docs;
        };
        if feedback.entries.len() < self.params.min_feedback_count {
            debug!(
                entries = feedback.entries.len(),
                needed = self.params.min_feedback_count,
                "feedback below threshold; skipping adaptive rerank"
            );
            return docs;
        }

        let weight = self.params.feedback_weight.clamp(0.0, 1.0);
        for doc in &mut docs {
            let boost = self.boost_for(&feedback.entries, &doc.id, now);
            doc.rerank_score *= 1.0 + boost * weight;
        }
        sort_by_rerank_score(&mut docs);
        docs
    }
}

impl Default for AdaptiveReranker {
    fn default() -> Self {
        Self::new(AdaptiveParams::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn doc(id: &str, score: f32) -> RerankedDoc {
        RerankedDoc::new(id, "content", score)
    }

    #[test]
    fn source_key_strips_chunk_suffix() {
        assert_eq!(default_source_key("kb::doc1:3"), "kb::doc1");
        assert_eq!(default_source_key("kb::doc1"), "kb::doc1");
        assert_eq!(default_source_key("plain-id"), "plain-id");
        assert_eq!(default_source_key("kb::doc:x"), "kb::doc:x");
    }

    #[test]
    fn no_boost_below_min_feedback_count() {
        let mut rr = AdaptiveReranker::default();
        rr.record("boost", "r2", 1.0, FeedbackAction::Explicit);
        rr.record("boost", "r2", 0.95, FeedbackAction::Explicit);
        let docs = vec![doc("r0", 0.9), doc("r1", 0.8), doc("r2", 0.7)];
        let out = rr.rerank_with_learning("boost", docs);
        // Two entries < threshold of three: order unchanged.
        assert_eq!(out[0].id, "r0");
        assert!((out[2].rerank_score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn positive_feedback_promotes_document() {
        let mut rr = AdaptiveReranker::default();
        for relevance in [1.0, 0.95, 0.9] {
            rr.record("boost", "r2", relevance, FeedbackAction::Explicit);
        }
        let docs = vec![doc("r0", 0.9), doc("r1", 0.8), doc("r2", 0.85), doc("r3", 0.5)];
        let out = rr.rerank_with_learning("boost", docs);
        let pos = out.iter().position(|d| d.id == "r2").unwrap();
        assert!(pos < 2, "r2 should move above index 2, got {pos}");
    }

    #[test]
    fn boost_is_bounded_by_feedback_weight() {
        let mut rr = AdaptiveReranker::default();
        for _ in 0..5 {
            rr.record("q", "d", 1.0, FeedbackAction::Explicit);
        }
        let original = 0.8;
        let out = rr.rerank_with_learning("q", vec![doc("d", original)]);
        let delta = (out[0].rerank_score - original).abs();
        assert!(delta <= original * 0.3 + 1e-6);
    }

    #[test]
    fn negative_feedback_demotes() {
        let mut rr = AdaptiveReranker::default();
        for _ in 0..3 {
            rr.record("q", "bad", 0.0, FeedbackAction::Explicit);
        }
        let out = rr.rerank_with_learning("q", vec![doc("bad", 0.9), doc("ok", 0.85)]);
        assert_eq!(out[0].id, "ok");
    }

    #[test]
    fn decay_reduces_old_feedback_weight() {
        let mut rr = AdaptiveReranker::default();
        let now = Utc::now();
        let old = now - Duration::days(60);
        // Old strong positive, recent mild negative; aggregation weighs the
        // recent entry much more.
        rr.record_at("q", "d", 1.0, FeedbackAction::Explicit, old);
        rr.record_at("q", "d", 0.2, FeedbackAction::Explicit, now);
        rr.record_at("q", "d", 0.2, FeedbackAction::Explicit, now);
        let out = rr.rerank_with_learning_at("q", vec![doc("d", 1.0)], now);
        assert!(out[0].rerank_score < 1.0, "aggregate should be negative");
    }

    #[test]
    fn sibling_chunks_get_half_weight_fallback() {
        let mut rr = AdaptiveReranker::default();
        for _ in 0..3 {
            rr.record("q", "kb::doc1:0", 1.0, FeedbackAction::Explicit);
        }
        let now = Utc::now();
        let sibling = rr.rerank_with_learning_at("q", vec![doc("kb::doc1:7", 1.0)], now);
        let direct = rr.rerank_with_learning_at("q", vec![doc("kb::doc1:0", 1.0)], now);
        let sibling_delta = sibling[0].rerank_score - 1.0;
        let direct_delta = direct[0].rerank_score - 1.0;
        assert!(sibling_delta > 0.0);
        assert!((sibling_delta - direct_delta / 2.0).abs() < 1e-3);
    }

    #[test]
    fn per_query_entries_prune_oldest_first() {
        let mut rr = AdaptiveReranker::default();
        for i in 0..(MAX_ENTRIES_PER_QUERY + 10) {
            rr.record("q", &format!("d{i}"), 0.9, FeedbackAction::Click);
        }
        assert_eq!(rr.feedback_count("q"), MAX_ENTRIES_PER_QUERY);
    }

    #[test]
    fn query_hashing_is_case_and_trim_insensitive() {
        let mut rr = AdaptiveReranker::default();
        for _ in 0..3 {
            rr.record("  Boost Query ", "d", 1.0, FeedbackAction::Explicit);
        }
        assert_eq!(rr.feedback_count("boost query"), 3);
    }
}
