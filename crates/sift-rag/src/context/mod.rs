//! Dynamic context assembly: budgeting, selection, deduplication,
//! compression, and formatting of retrieved chunks.
//!
//! Given ranked candidates and a token cap, [`DynamicContextManager::plan`]
//! picks documents greedily by score, truncating only when nothing fits,
//! drops near-duplicates (fingerprint match or token-set Jaccard > 0.8), and
//! renders the survivors with `[Source k]` headers. The tokenizer is
//! abstracted by [`TokenCounter`] so budgeting can later align with a real
//! LLM tokenizer; the default approximates tokens as `ceil(chars / 4)`.

use std::collections::HashSet;

use itertools::Itertools;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sift_core::RerankedDoc;

/// Trait for counting tokens. Implementations can be provided by consumers.
pub trait TokenCounter: Send + Sync + std::fmt::Debug {
    fn count(&self, text: &str) -> usize;
}

/// A simple, deterministic tokenizer: approximates tokens as ceil(chars / 4).
#[derive(Default, Debug)]
pub struct ApproxCharTokenizer;

impl TokenCounter for ApproxCharTokenizer {
    fn count(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Query complexity classes driving the token target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

lazy_static! {
    static ref COMPARISON_WORDS: HashSet<&'static str> = [
        "compare", "versus", "difference", "differences", "better", "worse", "between",
        "contrast", "tradeoff", "tradeoffs",
    ]
    .into_iter()
    .collect();
}

/// Classify a query by word count, comparison words, and multi-clause
/// markers.
pub fn classify_query(query: &str) -> Complexity {
    let words: Vec<&str> = query.split_whitespace().collect();
    let comparisons = words
        .iter()
        .filter(|w| COMPARISON_WORDS.contains(w.to_lowercase().as_str()))
        .count();
    let clauses = query.matches([';', ',']).count()
        + query.to_lowercase().matches(" and ").count()
        + query.matches('?').count().saturating_sub(1);

    if comparisons > 0 || clauses >= 2 || words.len() > 20 {
        Complexity::Complex
    } else if words.len() > 8 || clauses == 1 {
        Complexity::Moderate
    } else {
        Complexity::Simple
    }
}

#[derive(Debug, Clone)]
pub struct ContextConfig {
    pub max_tokens: usize,
    pub reserve_tokens: usize,
    pub max_chunks: usize,
    /// Jaccard similarity above which a chunk counts as a near-duplicate.
    pub similarity_cutoff: f32,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: 8000,
            reserve_tokens: 2000,
            max_chunks: 10,
            similarity_cutoff: 0.8,
        }
    }
}

/// Token accounting for one planning pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetReport {
    pub complexity: Option<Complexity>,
    pub target_tokens: usize,
    pub used_tokens: usize,
    pub truncated: usize,
    pub dropped_duplicates: usize,
}

/// Budget floor; targets never go below this.
const MIN_TARGET_TOKENS: usize = 500;

/// Minimum leftover budget worth truncating a document into.
const MIN_TRUNCATION_TOKENS: usize = 100;

#[derive(Debug)]
pub struct DynamicContextManager {
    cfg: ContextConfig,
    tokenizer: Box<dyn TokenCounter>,
}

impl Default for DynamicContextManager {
    fn default() -> Self {
        Self::new(ContextConfig::default())
    }
}

impl DynamicContextManager {
    pub fn new(cfg: ContextConfig) -> Self {
        Self {
            cfg,
            tokenizer: Box::new(ApproxCharTokenizer),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Box<dyn TokenCounter>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn estimate_tokens(&self, text: &str) -> usize {
        self.tokenizer.count(text)
    }

    /// Select and truncate documents to honor the token budget, then format.
    /// `token_cap` further restricts the configured maximum when given.
    pub fn plan(
        &self,
        query: &str,
        docs: &[RerankedDoc],
        token_cap: Option<usize>,
    ) -> (Vec<RerankedDoc>, String, BudgetReport) {
        let mut report = BudgetReport::default();
        if docs.is_empty() {
            return (Vec::new(), String::new(), report);
        }

        let available = self
            .cfg
            .max_tokens
            .min(token_cap.unwrap_or(usize::MAX))
            .saturating_sub(self.cfg.reserve_tokens);

        let total_doc_tokens: usize = docs
            .iter()
            .map(|d| self.tokenizer.count(&d.content))
            .sum();

        let complexity = classify_query(query);
        report.complexity = Some(complexity);
        let class_target = match complexity {
            Complexity::Simple => 2000,
            Complexity::Moderate => 4000.min((total_doc_tokens as f64 * 0.8) as usize),
            Complexity::Complex => available,
        };
        let target = available
            .min(total_doc_tokens)
            .min(class_target)
            .max(MIN_TARGET_TOKENS);
        report.target_tokens = target;

        // Greedy selection; order is score-descending regardless of input
        // order.
        let mut ranked: Vec<&RerankedDoc> = docs.iter().collect();
        ranked.sort_by(|a, b| {
            b.rerank_score
                .partial_cmp(&a.rerank_score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut selected: Vec<RerankedDoc> = Vec::new();
        let mut used = 0usize;
        for doc in ranked {
            if selected.len() >= self.cfg.max_chunks {
                break;
            }
            let doc_tokens = self.tokenizer.count(&doc.content);
            let remaining = target.saturating_sub(used);
            if doc_tokens <= remaining {
                used += doc_tokens;
                selected.push(doc.clone());
            } else if selected.is_empty() && remaining > MIN_TRUNCATION_TOKENS {
                // Nothing included yet and the best doc is oversized:
                // truncate it to fit rather than returning nothing.
                let truncated = truncate_to_tokens(&doc.content, remaining, &*self.tokenizer);
                used += self.tokenizer.count(&truncated);
                let mut clipped = doc.clone();
                clipped.content = truncated;
                selected.push(clipped);
                report.truncated += 1;
                break;
            } else if remaining == 0 {
                break;
            }
        }

        // Diversity post-filter.
        let (selected, dropped) = drop_near_duplicates(selected, self.cfg.similarity_cutoff);
        report.dropped_duplicates = dropped;
        report.used_tokens = selected
            .iter()
            .map(|d| self.tokenizer.count(&d.content))
            .sum();

        let formatted = format_context(&selected);
        debug!(
            selected = selected.len(),
            target = report.target_tokens,
            used = report.used_tokens,
            truncated = report.truncated,
            dropped = report.dropped_duplicates,
            "context planned"
        );
        (selected, formatted, report)
    }

    /// Compress `text` toward `target_tokens`; returns the compressed text
    /// and the achieved compression ratio (`final / original`, 1.0 when the
    /// input already fits).
    pub fn compress(&self, text: &str, target_tokens: usize) -> (String, f32) {
        let original = self.tokenizer.count(text).max(1);
        if original <= target_tokens {
            return (text.to_string(), 1.0);
        }

        // Stage 1: collapse whitespace runs.
        let mut out = text.split_whitespace().collect::<Vec<_>>().join(" ");

        // Stage 2: cap run-on sentences at 100 words.
        if self.tokenizer.count(&out) > target_tokens {
            out = out
                .split_inclusive(['.', '!', '?'])
                .map(|sentence| {
                    let words: Vec<&str> = sentence.split_whitespace().collect();
                    if words.len() > 100 {
                        format!("{}…", words[..100].join(" "))
                    } else {
                        sentence.to_string()
                    }
                })
                .collect::<Vec<_>>()
                .join("");
        }

        // Stage 3: strip filler phrases.
        if self.tokenizer.count(&out) > target_tokens {
            for filler in FILLER_PATTERNS.iter() {
                out = filler.replace_all(&out, "").into_owned();
            }
            out = out.split_whitespace().collect::<Vec<_>>().join(" ");
        }

        // Stage 4: hard truncate at a sentence boundary.
        if self.tokenizer.count(&out) > target_tokens {
            out = truncate_at_sentence(&out, target_tokens, &*self.tokenizer);
        }

        let ratio = self.tokenizer.count(&out) as f32 / original as f32;
        (out, ratio)
    }
}

lazy_static! {
    /// Readonly filler-phrase table, compiled once.
    static ref FILLER_PATTERNS: Vec<regex::Regex> = [
        r"(?i)it is important to note that ",
        r"(?i)it should be noted that ",
        r"(?i)as a matter of fact, ",
        r"(?i)needless to say, ",
        r"(?i)\bbasically,? ",
        r"(?i)\bessentially,? ",
    ]
    .into_iter()
    .map(|p| regex::Regex::new(p).expect("static filler pattern"))
    .collect();
}

fn truncate_to_tokens(text: &str, max_tokens: usize, tokenizer: &dyn TokenCounter) -> String {
    if tokenizer.count(text) <= max_tokens {
        return text.to_string();
    }
    // Rough cut assuming ~4 chars/token, then shave until it fits.
    let mut candidate: String = text.chars().take(max_tokens.saturating_mul(4)).collect();
    while !candidate.is_empty() && tokenizer.count(&candidate) > max_tokens {
        candidate.pop();
    }
    candidate
}

fn truncate_at_sentence(text: &str, max_tokens: usize, tokenizer: &dyn TokenCounter) -> String {
    let mut out = String::new();
    for sentence in text.split_inclusive(['.', '!', '?']) {
        let mut trial = out.clone();
        trial.push_str(sentence);
        if tokenizer.count(&trial) > max_tokens {
            if out.is_empty() {
                return truncate_to_tokens(text, max_tokens, tokenizer);
            }
            break;
        }
        out = trial;
    }
    out.trim_end().to_string()
}

/// Cheap near-duplicate key: lowercased, whitespace-collapsed prefix plus
/// length bucket.
fn content_fingerprint(content: &str) -> String {
    let normalized = content
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    let prefix: String = normalized.chars().take(50).collect();
    format!("{}:{}", prefix, normalized.len())
}

fn token_set(content: &str) -> HashSet<String> {
    content
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f32 / union as f32
}

/// Keep the first occurrence of near-identical content; returns the survivors
/// and the count dropped.
fn drop_near_duplicates(
    docs: Vec<RerankedDoc>,
    similarity_cutoff: f32,
) -> (Vec<RerankedDoc>, usize) {
    let mut kept: Vec<RerankedDoc> = Vec::with_capacity(docs.len());
    let mut fingerprints: HashSet<String> = HashSet::new();
    let mut token_sets: Vec<HashSet<String>> = Vec::new();
    let mut dropped = 0usize;

    for doc in docs {
        let fp = content_fingerprint(&doc.content);
        if fingerprints.contains(&fp) {
            dropped += 1;
            continue;
        }
        let tokens = token_set(&doc.content);
        if token_sets
            .iter()
            .any(|prior| jaccard(prior, &tokens) > similarity_cutoff)
        {
            dropped += 1;
            continue;
        }
        fingerprints.insert(fp);
        token_sets.push(tokens);
        kept.push(doc);
    }
    (kept, dropped)
}

/// Render selected chunks as `[Source k] (source) [Relevance: p%]` blocks
/// joined by blank lines.
pub fn format_context(docs: &[RerankedDoc]) -> String {
    docs.iter()
        .enumerate()
        .map(|(i, doc)| {
            let source = doc.metadata.get_str("source").unwrap_or("unknown");
            let relevance = (doc.rerank_score.clamp(0.0, 1.0) * 100.0).round() as u32;
            let mut block = format!(
                "[Source {}] ({}) [Relevance: {}%]\n",
                i + 1,
                source,
                relevance
            );
            if let Some(title) = doc.metadata.get_str("title") {
                block.push_str(&format!("Title: {}\n", title));
            }
            block.push_str(&doc.content);
            block
        })
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, content: &str, score: f32) -> RerankedDoc {
        RerankedDoc::new(id, content, score)
    }

    #[test]
    fn approx_tokenizer_counts() {
        let tk = ApproxCharTokenizer;
        assert_eq!(tk.count(""), 0);
        assert_eq!(tk.count("abcd"), 1);
        assert_eq!(tk.count("abcde"), 2);
    }

    #[test]
    fn complexity_classes() {
        assert_eq!(classify_query("what is rust"), Complexity::Simple);
        assert_eq!(
            classify_query("how does the borrow checker handle lifetimes in closures"),
            Complexity::Moderate
        );
        assert_eq!(
            classify_query("compare rust and go for network services"),
            Complexity::Complex
        );
    }

    #[test]
    fn budget_selects_all_when_they_fit() {
        let mgr = DynamicContextManager::new(ContextConfig {
            max_tokens: 8000,
            reserve_tokens: 2000,
            max_chunks: 10,
            similarity_cutoff: 0.8,
        });
        // Five distinct 500-char docs, ~125 tokens each.
        let docs: Vec<RerankedDoc> = (0..5)
            .map(|i| {
                let filler: String = format!("word{i} ").repeat(500 / 6);
                doc(&format!("d{i}"), &filler[..500.min(filler.len())], 0.9 - i as f32 * 0.1)
            })
            .collect();
        let (selected, formatted, report) =
            mgr.plan("explain the complete retrieval architecture and its tradeoffs", &docs, None);
        assert_eq!(selected.len(), 5);
        assert_eq!(report.truncated, 0);
        assert!((600..=650).contains(&report.used_tokens), "{}", report.used_tokens);
        for k in 1..=5 {
            assert!(formatted.contains(&format!("[Source {k}]")));
        }
    }

    #[test]
    fn oversized_first_doc_truncates_to_fit() {
        let mgr = DynamicContextManager::new(ContextConfig {
            max_tokens: 2700,
            reserve_tokens: 2000,
            max_chunks: 10,
            similarity_cutoff: 0.8,
        });
        let big = "alpha beta gamma ".repeat(1000);
        let docs = vec![doc("d0", &big, 0.9)];
        let (selected, _formatted, report) = mgr.plan("short query", &docs, None);
        assert_eq!(selected.len(), 1);
        assert_eq!(report.truncated, 1);
        assert!(report.used_tokens <= report.target_tokens);
    }

    #[test]
    fn near_duplicates_are_dropped() {
        let mgr = DynamicContextManager::default();
        let text = "The quick brown fox jumps over the lazy dog near the river bank today";
        let docs = vec![
            doc("a", text, 0.9),
            doc("b", text, 0.8),
            doc("c", "Entirely different content about database indexing strategies", 0.7),
        ];
        let (selected, _f, report) = mgr.plan("quick brown fox", &docs, None);
        assert_eq!(selected.len(), 2);
        assert_eq!(report.dropped_duplicates, 1);
    }

    #[test]
    fn jaccard_filter_catches_paraphrase_overlap() {
        let a = token_set("one two three four five six seven eight nine ten");
        let b = token_set("one two three four five six seven eight nine eleven");
        assert!(jaccard(&a, &b) > 0.8);
        let c = token_set("totally different words entirely");
        assert!(jaccard(&a, &c) < 0.1);
    }

    #[test]
    fn token_cap_tightens_budget() {
        let mgr = DynamicContextManager::default();
        let docs: Vec<RerankedDoc> = (0..3)
            .map(|i| doc(&format!("d{i}"), &format!("unique content {i} ").repeat(200), 0.9))
            .collect();
        let (_s, _f, report) = mgr.plan("q", &docs, Some(2600));
        assert!(report.target_tokens <= 600);
    }

    #[test]
    fn compression_reports_ratio() {
        let mgr = DynamicContextManager::default();
        let text = "It is important to note that caching helps. ".repeat(100);
        let (compressed, ratio) = mgr.compress(&text, 100);
        assert!(mgr.estimate_tokens(&compressed) <= 110);
        assert!(ratio < 1.0);
    }

    #[test]
    fn formatting_includes_source_and_relevance() {
        let mut d = doc("a", "body text", 0.87);
        d.metadata.set("source", "notes.md");
        d.metadata.set("title", "Notes");
        let out = format_context(&[d]);
        assert!(out.starts_with("[Source 1] (notes.md) [Relevance: 87%]\n"));
        assert!(out.contains("Title: Notes\n"));
        assert!(out.contains("body text"));
    }
}
