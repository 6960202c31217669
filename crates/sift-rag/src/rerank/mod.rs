//! Candidate reranking.
//!
//! Four strategies behind one entry point, [`rerank`]:
//! - `Heuristic`: no external calls; exact-phrase, term-overlap, position,
//!   and length signals with fixed weights.
//! - `Model`: the language model scores an enumerated document list as JSON;
//!   parse failures fall back to the incoming order.
//! - `External`: a rerank HTTP API (see [`external`]).
//! - `Mmr`: diversity-aware selection over document embeddings.
//!
//! Every failure path degrades to passthrough with original scores; reranking
//! never fails the retrieval that invoked it.

pub mod adaptive;
pub mod external;

use std::collections::HashMap;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::fusion::{mmr_select, MmrConfig};
use sift_core::{LanguageModel, RerankedDoc, Scalar};
use sift_index::Tokenizer;

/// Strategy selector, mirroring the configuration surface.
#[derive(Debug, Clone)]
pub enum RerankStrategy {
    Heuristic,
    Model,
    External { api_url: String, api_key: String },
    Mmr { config: MmrConfig },
}

/// Heuristic signal weights: exact phrase, term overlap, position, length.
#[derive(Debug, Clone, Copy)]
pub struct HeuristicWeights {
    pub exact: f32,
    pub overlap: f32,
    pub position: f32,
    pub length: f32,
}

impl Default for HeuristicWeights {
    fn default() -> Self {
        Self {
            exact: 0.4,
            overlap: 0.3,
            position: 0.2,
            length: 0.1,
        }
    }
}

const IDEAL_DOC_CHARS: f32 = 500.0;

/// Score one document against the query with the heuristic signals.
pub fn heuristic_score(query: &str, content: &str, weights: &HeuristicWeights) -> f32 {
    let query_lower = query.to_lowercase();
    let content_lower = content.to_lowercase();

    let exact = if content_lower.contains(&query_lower) {
        1.0
    } else {
        0.0
    };

    let query_terms = Tokenizer.tokenize(query);
    let overlap = if query_terms.is_empty() {
        0.0
    } else {
        let doc_terms: std::collections::HashSet<String> =
            Tokenizer.tokenize(content).into_iter().collect();
        let matched = query_terms
            .iter()
            .filter(|t| doc_terms.contains(t.as_str()))
            .count();
        matched as f32 / query_terms.len() as f32
    };

    let position = query_terms
        .iter()
        .filter_map(|t| content_lower.find(t.as_str()))
        .min()
        .map(|first| 1.0 - (first as f32 / 500.0).min(1.0))
        .unwrap_or(0.0);

    let length = 1.0 - ((content.len() as f32 - IDEAL_DOC_CHARS).abs() / 2000.0).min(0.5);

    weights.exact * exact + weights.overlap * overlap + weights.position * position
        + weights.length * length
}

fn rerank_heuristic(query: &str, mut docs: Vec<RerankedDoc>) -> Vec<RerankedDoc> {
    let weights = HeuristicWeights::default();
    for doc in &mut docs {
        doc.rerank_score = heuristic_score(query, &doc.content, &weights);
    }
    sort_by_rerank_score(&mut docs);
    docs
}

#[derive(Debug, Deserialize)]
struct ModelScore {
    id: String,
    score: f32,
}

fn model_prompt(query: &str, docs: &[RerankedDoc]) -> String {
    let mut prompt = format!(
        "Score each document for relevance to the query on a 0-10 scale.\n\
         Respond with JSON only: [{{\"id\": \"...\", \"score\": 0.0}}]\n\n\
         Query: {query}\n\nDocuments:\n"
    );
    for doc in docs {
        let preview: String = doc.content.chars().take(400).collect();
        prompt.push_str(&format!("[{}] {}\n", doc.id, preview));
    }
    prompt
}

fn extract_json_array(text: &str) -> Option<&str> {
    let start = text.find('[')?;
    let end = text.rfind(']')?;
    (end > start).then(|| &text[start..=end])
}

/// Model-backed rerank; on any failure the docs come back untouched.
async fn rerank_model(
    model: &dyn LanguageModel,
    query: &str,
    mut docs: Vec<RerankedDoc>,
) -> Vec<RerankedDoc> {
    let raw = match model.generate(&model_prompt(query, &docs), 0.0).await {
        Ok(raw) => raw,
        Err(e) => {
            warn!(error = %e, "model rerank call failed; keeping original order");
            return docs;
        }
    };

    let parsed: Vec<ModelScore> = match extract_json_array(&raw)
        .and_then(|json| serde_json::from_str(json).ok())
    {
        Some(scores) => scores,
        None => {
            warn!("model rerank reply was not parseable JSON; keeping original order");
            return docs;
        }
    };

    let by_id: HashMap<&str, f32> = parsed
        .iter()
        .map(|s| (s.id.as_str(), (s.score / 10.0).clamp(0.0, 1.0)))
        .collect();
    for doc in &mut docs {
        if let Some(score) = by_id.get(doc.id.as_str()) {
            doc.rerank_score = *score;
        }
    }
    sort_by_rerank_score(&mut docs);
    docs
}

fn rerank_mmr(
    docs: Vec<RerankedDoc>,
    embeddings: &HashMap<String, Vec<f32>>,
    config: &MmrConfig,
) -> Vec<RerankedDoc> {
    let candidates: Vec<(String, f32)> = docs
        .iter()
        .map(|d| (d.id.clone(), d.rerank_score))
        .collect();
    let selected = mmr_select(&candidates, docs.len(), embeddings, config);

    let mut by_id: HashMap<String, RerankedDoc> =
        docs.into_iter().map(|d| (d.id.clone(), d)).collect();
    selected
        .into_iter()
        .filter_map(|(id, objective)| {
            by_id.remove(&id).map(|mut doc| {
                doc.rerank_score = objective;
                doc
            })
        })
        .collect()
}

/// Rerank `docs` with the selected strategy. Never fails: strategy errors
/// fall back to the heuristic or to passthrough.
pub async fn rerank(
    strategy: &RerankStrategy,
    model: Option<&dyn LanguageModel>,
    query: &str,
    docs: Vec<RerankedDoc>,
    embeddings: &HashMap<String, Vec<f32>>,
) -> Vec<RerankedDoc> {
    if docs.is_empty() {
        return docs;
    }
    match strategy {
        RerankStrategy::Heuristic => rerank_heuristic(query, docs),
        RerankStrategy::Model => match model {
            Some(lm) => rerank_model(lm, query, docs).await,
            None => {
                debug!("model rerank requested without a model; using heuristic");
                rerank_heuristic(query, docs)
            }
        },
        RerankStrategy::External { api_url, api_key } => {
            match external::rerank_via_api(api_url, api_key, query, &docs).await {
                Ok(scores) => {
                    let mut docs = docs;
                    for doc in &mut docs {
                        if let Some(score) = scores.get(doc.id.as_str()) {
                            doc.rerank_score = *score;
                        }
                    }
                    sort_by_rerank_score(&mut docs);
                    docs
                }
                Err(e) => {
                    warn!(error = %e, "external rerank failed; using heuristic");
                    rerank_heuristic(query, docs)
                }
            }
        }
        RerankStrategy::Mmr { config } => rerank_mmr(docs, embeddings, config),
    }
}

pub(crate) fn sort_by_rerank_score(docs: &mut [RerankedDoc]) {
    docs.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// Drop documents scoring below `min_score`.
pub fn filter_by_relevance(docs: Vec<RerankedDoc>, min_score: f32) -> Vec<RerankedDoc> {
    docs.into_iter()
        .filter(|d| d.rerank_score >= min_score)
        .collect()
}

/// One metadata boost rule: multiply the score when `key` equals `value`.
#[derive(Debug, Clone)]
pub struct MetadataBoost {
    pub key: String,
    pub value: Scalar,
    pub factor: f32,
}

/// Apply metadata boost rules and re-sort.
pub fn boost_by_metadata(mut docs: Vec<RerankedDoc>, rules: &[MetadataBoost]) -> Vec<RerankedDoc> {
    for doc in &mut docs {
        for rule in rules {
            if doc.metadata.get(&rule.key) == Some(&rule.value) {
                doc.rerank_score *= rule.factor;
            }
        }
    }
    sort_by_rerank_score(&mut docs);
    docs
}

/// Boost recent documents: full `factor` at age zero, linearly fading to
/// nothing at `max_age_days`. The date field holds a unix timestamp in
/// seconds.
pub fn boost_by_recency(
    mut docs: Vec<RerankedDoc>,
    date_field: &str,
    max_age_days: f64,
    factor: f32,
    now_secs: f64,
) -> Vec<RerankedDoc> {
    for doc in &mut docs {
        let Some(timestamp) = doc.metadata.get_num(date_field) else {
            continue;
        };
        let age_days = ((now_secs - timestamp) / 86_400.0).max(0.0);
        if age_days < max_age_days {
            let freshness = 1.0 - (age_days / max_age_days) as f32;
            doc.rerank_score *= 1.0 + (factor - 1.0) * freshness;
        }
    }
    sort_by_rerank_score(&mut docs);
    docs
}
