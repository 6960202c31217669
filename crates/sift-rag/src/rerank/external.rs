//! External rerank API provider.
//!
//! POSTs `{query, documents, top_n}` to a hosted cross-encoder endpoint and
//! maps the returned relevance scores back onto document ids. Transport and
//! shape errors surface as [`RagError`]; the caller treats any failure as a
//! signal to fall back, never as fatal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::RagError;
use sift_core::RerankedDoc;

#[derive(Serialize)]
struct RerankRequest<'a> {
    query: &'a str,
    documents: Vec<&'a str>,
    top_n: usize,
}

#[derive(Deserialize)]
struct RerankResult {
    index: usize,
    relevance_score: f32,
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankResult>,
}

/// Call the rerank endpoint; returns id -> relevance score.
pub async fn rerank_via_api(
    api_url: &str,
    api_key: &str,
    query: &str,
    docs: &[RerankedDoc],
) -> Result<HashMap<String, f32>, RagError> {
    let request = RerankRequest {
        query,
        documents: docs.iter().map(|d| d.content.as_str()).collect(),
        top_n: docs.len(),
    };

    let client = reqwest::Client::new();
    let res = client
        .post(api_url)
        .header("Authorization", format!("Bearer {api_key}"))
        .json(&request)
        .send()
        .await
        .map_err(|e| RagError::Search(format!("rerank API transport: {e}")))?;

    if !res.status().is_success() {
        return Err(RagError::Search(format!(
            "rerank API returned {}",
            res.status()
        )));
    }

    let response = res
        .json::<RerankResponse>()
        .await
        .map_err(|e| RagError::Search(format!("rerank API response shape: {e}")))?;

    let mut scores = HashMap::with_capacity(response.results.len());
    for result in response.results {
        if let Some(doc) = docs.get(result.index) {
            scores.insert(doc.id.clone(), result.relevance_score);
        }
    }
    Ok(scores)
}
