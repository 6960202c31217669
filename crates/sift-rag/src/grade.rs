//! Corrective grading: score each candidate against the query and drop the
//! ones judged irrelevant, with a configurable fallback when grading empties
//! the set.
//!
//! The heuristic grader is term overlap with an exact-phrase bonus; the
//! model grader asks for a 0-1 relevance number and parses leniently. Model
//! failures per document fall back to the heuristic for that document, so
//! grading never fails the retrieval that invoked it.

use tracing::{debug, warn};

use sift_core::{CorrectiveFallback, CorrectiveRagConfig, LanguageModel, RerankedDoc};
use sift_index::Tokenizer;

/// Heuristic relevance grade in [0, 1].
pub fn heuristic_grade(query: &str, content: &str) -> f32 {
    let query_terms = Tokenizer.tokenize(query);
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms: std::collections::HashSet<String> =
        Tokenizer.tokenize(content).into_iter().collect();
    let matched = query_terms
        .iter()
        .filter(|t| doc_terms.contains(t.as_str()))
        .count();
    let overlap = matched as f32 / query_terms.len() as f32;

    let exact_bonus = if content.to_lowercase().contains(&query.to_lowercase()) {
        0.3
    } else {
        0.0
    };
    (overlap * 0.7 + exact_bonus).min(1.0)
}

fn grade_prompt(query: &str, content: &str) -> String {
    let preview: String = content.chars().take(600).collect();
    format!(
        "Rate how relevant the document is to the query, as a single number \
         between 0 and 1. Reply with the number only.\n\n\
         Query: {query}\n\nDocument: {preview}"
    )
}

async fn model_grade(model: &dyn LanguageModel, query: &str, content: &str) -> Option<f32> {
    let raw = model.generate(&grade_prompt(query, content), 0.0).await.ok()?;
    // Accept "0.8", "0.8/1", "Score: 0.8" and similar.
    raw.split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .filter_map(|piece| piece.parse::<f32>().ok())
        .find(|v| (0.0..=1.0).contains(v))
}

/// Outcome of a grading pass.
#[derive(Debug, Clone, Default)]
pub struct GradeReport {
    pub graded_out: usize,
    pub fallback_used: bool,
}

/// Grade candidates and drop those below the configured threshold, applying
/// the fallback when too few survive.
pub async fn grade_documents(
    cfg: &CorrectiveRagConfig,
    model: Option<&dyn LanguageModel>,
    query: &str,
    docs: Vec<RerankedDoc>,
) -> (Vec<RerankedDoc>, GradeReport) {
    let mut report = GradeReport::default();
    if docs.is_empty() {
        return (docs, report);
    }

    let graded = grade_pass(cfg, model, query, &docs, cfg.relevance_threshold).await;
    report.graded_out = docs.len() - graded.len();

    if graded.len() >= cfg.min_chunks || matches!(cfg.fallback, CorrectiveFallback::None) {
        return (graded, report);
    }

    report.fallback_used = true;
    match cfg.fallback {
        CorrectiveFallback::None => (graded, report),
        CorrectiveFallback::RelaxThreshold => {
            let relaxed = cfg.relevance_threshold / 2.0;
            debug!(relaxed, "grading emptied results; relaxing threshold");
            let second = grade_pass(cfg, model, query, &docs, relaxed).await;
            if second.len() >= cfg.min_chunks {
                report.graded_out = docs.len() - second.len();
                (second, report)
            } else {
                (keep_best(docs, cfg.min_chunks), report)
            }
        }
        CorrectiveFallback::KeepBest => {
            debug!(min_chunks = cfg.min_chunks, "grading emptied results; keeping best");
            (keep_best(docs, cfg.min_chunks), report)
        }
    }
}

async fn grade_pass(
    cfg: &CorrectiveRagConfig,
    model: Option<&dyn LanguageModel>,
    query: &str,
    docs: &[RerankedDoc],
    threshold: f32,
) -> Vec<RerankedDoc> {
    let mut kept = Vec::with_capacity(docs.len());
    for doc in docs {
        let grade = if cfg.use_model {
            match model {
                Some(lm) => match model_grade(lm, query, &doc.content).await {
                    Some(grade) => grade,
                    None => {
                        warn!(doc = %doc.id, "model grade unparseable; using heuristic");
                        heuristic_grade(query, &doc.content)
                    }
                },
                None => heuristic_grade(query, &doc.content),
            }
        } else {
            heuristic_grade(query, &doc.content)
        };
        if grade >= threshold {
            kept.push(doc.clone());
        }
    }
    kept
}

fn keep_best(mut docs: Vec<RerankedDoc>, n: usize) -> Vec<RerankedDoc> {
    docs.sort_by(|a, b| {
        b.rerank_score
            .partial_cmp(&a.rerank_score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    docs.truncate(n.max(1));
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn doc(id: &str, content: &str, score: f32) -> RerankedDoc {
        RerankedDoc::new(id, content, score)
    }

    fn cfg(threshold: f32, fallback: CorrectiveFallback) -> CorrectiveRagConfig {
        CorrectiveRagConfig {
            enabled: true,
            relevance_threshold: threshold,
            use_model: false,
            fallback,
            min_chunks: 1,
        }
    }

    #[test]
    fn heuristic_grade_orders_by_overlap() {
        let good = heuristic_grade("machine learning", "machine learning explained simply");
        let half = heuristic_grade("machine learning", "learning to cook pasta");
        let none = heuristic_grade("machine learning", "sunny weather outside");
        assert!(good > half);
        assert!(half > none);
        assert_eq!(none, 0.0);
    }

    #[tokio::test]
    async fn grading_drops_irrelevant_docs() {
        let docs = vec![
            doc("a", "machine learning is widely used", 0.9),
            doc("b", "the weather is sunny", 0.8),
        ];
        let (kept, report) =
            grade_documents(&cfg(0.4, CorrectiveFallback::None), None, "machine learning", docs)
                .await;
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "a");
        assert_eq!(report.graded_out, 1);
        assert!(!report.fallback_used);
    }

    #[tokio::test]
    async fn keep_best_fallback_preserves_top_doc() {
        let docs: Vec<RerankedDoc> = (0..5)
            .map(|i| doc(&format!("d{i}"), "unrelated filler text", 0.2 - i as f32 * 0.01))
            .collect();
        let (kept, report) = grade_documents(
            &cfg(0.9, CorrectiveFallback::KeepBest),
            None,
            "quantum entanglement",
            docs,
        )
        .await;
        assert!(report.fallback_used);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, "d0");
    }

    #[tokio::test]
    async fn relax_threshold_fallback_regrades() {
        // Two of three query terms overlap and no exact phrase: grade ~0.47,
        // below 0.9 but above the relaxed 0.45.
        let docs = vec![doc("a", "machine overview and learning tips", 0.9)];
        let (kept, report) = grade_documents(
            &cfg(0.9, CorrectiveFallback::RelaxThreshold),
            None,
            "machine learning basics",
            docs,
        )
        .await;
        assert!(report.fallback_used);
        assert_eq!(kept.len(), 1);
    }

    #[tokio::test]
    async fn model_grader_parses_loose_numbers() {
        #[derive(Debug)]
        struct M;
        #[async_trait]
        impl LanguageModel for M {
            async fn generate(&self, _p: &str, _t: f32) -> Result<String, sift_error::Error> {
                Ok("Score: 0.85".to_string())
            }
        }
        let grade = model_grade(&M, "q", "content").await;
        assert_eq!(grade, Some(0.85));
    }

    #[tokio::test]
    async fn none_fallback_returns_empty() {
        let docs = vec![doc("a", "nothing relevant", 0.9)];
        let (kept, report) = grade_documents(
            &cfg(0.9, CorrectiveFallback::None),
            None,
            "quantum chromodynamics",
            docs,
        )
        .await;
        assert!(kept.is_empty());
        assert!(!report.fallback_used);
    }
}
