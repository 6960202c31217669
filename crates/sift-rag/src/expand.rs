//! Query expansion via the language model.
//!
//! The model is asked for strict JSON; real models drift, so parsing is
//! lenient with a line-splitting fallback, and any model failure degrades to
//! the original query alone. HyDE (a hypothetical answer passage to embed
//! alongside the query) and single-shot query rewriting live here too.

use serde::Deserialize;
use tracing::debug;

use sift_core::{ExpandedQuery, LanguageModel};

#[derive(Debug, Clone, Copy)]
pub struct ExpandOptions {
    pub max_variants: usize,
    pub use_hyde: bool,
}

#[derive(Debug, Deserialize)]
struct ExpansionResponse {
    #[serde(default)]
    variants: Vec<String>,
    #[serde(default)]
    keywords: Vec<String>,
}

fn expansion_prompt(query: &str, max_variants: usize) -> String {
    format!(
        "Rewrite the search query below into up to {max_variants} alternative phrasings that \
         would match relevant documents, and extract its key terms.\n\
         Respond with JSON only: {{\"variants\": [\"...\"], \"keywords\": [\"...\"]}}\n\n\
         Query: {query}"
    )
}

fn hyde_prompt(query: &str) -> String {
    format!(
        "Write a short factual passage (3-4 sentences) that would perfectly answer the \
         question below. Do not mention that it is hypothetical.\n\nQuestion: {query}"
    )
}

/// Pull the first JSON object out of a model reply that may carry prose or
/// code fences around it.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

fn parse_expansion(raw: &str, max_variants: usize) -> (Vec<String>, Vec<String>) {
    if let Some(json) = extract_json(raw) {
        if let Ok(parsed) = serde_json::from_str::<ExpansionResponse>(json) {
            let variants = parsed
                .variants
                .into_iter()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .take(max_variants)
                .collect();
            return (variants, parsed.keywords);
        }
    }
    // Fallback: treat non-empty lines as variants.
    debug!("expansion response was not JSON; falling back to line split");
    let variants = raw
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*', ' ']).to_string())
        .filter(|l| !l.is_empty() && !l.starts_with('{') && !l.starts_with('}'))
        .take(max_variants)
        .collect();
    (variants, Vec::new())
}

/// Expand a query into variants and keywords, optionally with a HyDE passage.
/// Model failures degrade to an expansion containing only the original.
pub async fn expand_query(
    model: &dyn LanguageModel,
    query: &str,
    opts: ExpandOptions,
) -> ExpandedQuery {
    let mut expanded = ExpandedQuery {
        original: query.to_string(),
        ..Default::default()
    };

    match model.generate(&expansion_prompt(query, opts.max_variants), 0.3).await {
        Ok(raw) => {
            let (variants, keywords) = parse_expansion(&raw, opts.max_variants);
            // Never echo the original back as a variant.
            expanded.variants = variants
                .into_iter()
                .filter(|v| !v.eq_ignore_ascii_case(query))
                .collect();
            expanded.keywords = keywords;
        }
        Err(e) => {
            debug!(error = %e, "query expansion failed; continuing with original query");
        }
    }

    if opts.use_hyde {
        match model.generate(&hyde_prompt(query), 0.7).await {
            Ok(passage) if !passage.trim().is_empty() => {
                expanded.hypothetical_passage = Some(passage.trim().to_string());
            }
            Ok(_) => {}
            Err(e) => debug!(error = %e, "HyDE generation failed; skipping"),
        }
    }

    expanded
}

/// Rewrite a query given the documents retrieved so far; used by iterative
/// retrieval. Returns None when the model is unavailable or unhelpful.
pub async fn rewrite_query(
    model: &dyn LanguageModel,
    query: &str,
    seen_snippets: &[String],
) -> Option<String> {
    let context = seen_snippets
        .iter()
        .take(3)
        .map(|s| s.chars().take(200).collect::<String>())
        .collect::<Vec<_>>()
        .join("\n---\n");
    let prompt = format!(
        "The query below did not retrieve enough relevant material. Rewrite it to surface \
         complementary information. Reply with the rewritten query only.\n\n\
         Query: {query}\n\nRetrieved so far:\n{context}"
    );
    match model.generate(&prompt, 0.5).await {
        Ok(raw) => {
            let rewritten = raw.trim().trim_matches('"').to_string();
            (!rewritten.is_empty() && !rewritten.eq_ignore_ascii_case(query))
                .then_some(rewritten)
        }
        Err(e) => {
            debug!(error = %e, "query rewrite failed");
            None
        }
    }
}
