//! Fusion utilities: score normalization, weighted RRF, merge strategies,
//! and MMR.
//!
//! These combine ranked lists from different modalities (dense, keyword,
//! sparse, late-interaction) into a single deterministic ranking. Entry
//! points:
//! - [`normalize_scores`]: bring scores from different modalities onto a
//!   comparable scale.
//! - [`rrf_fuse`]: weighted reciprocal rank fusion across N lists with
//!   rank-sum tie-breaking.
//! - [`merge_by_id`]: score-combining merge (max/sum/avg) for query-variant
//!   result sets.
//! - [`mmr_select`]: diversity-aware selection using cosine similarity.
//!
//! The algorithms are intentionally small and pure (no I/O) to aid testing
//! and reuse.

use std::collections::{HashMap, HashSet};

/// Score normalization strategies for making scores comparable across
/// modalities.
#[derive(Debug, Clone)]
pub enum ScoreNorm {
    /// No normalization; passthrough.
    None,
    /// Min-max normalization to [0, 1] with epsilon for stability.
    MinMax { epsilon: f32 },
    /// Standard score normalization: mean 0, unit variance.
    ZScore { epsilon: f32 },
}

impl Default for ScoreNorm {
    fn default() -> Self {
        ScoreNorm::MinMax { epsilon: 1e-6 }
    }
}

/// Normalize a list of (id, score) pairs using the selected method.
/// Order and ids are preserved; only scores are transformed.
pub fn normalize_scores(scores: &[(String, f32)], method: &ScoreNorm) -> Vec<(String, f32)> {
    match method {
        ScoreNorm::None => scores.to_vec(),
        ScoreNorm::MinMax { epsilon } => {
            if scores.is_empty() {
                return Vec::new();
            }
            let mut min_v = f32::INFINITY;
            let mut max_v = f32::NEG_INFINITY;
            for &(_, s) in scores {
                min_v = min_v.min(s);
                max_v = max_v.max(s);
            }
            let denom = (max_v - min_v).max(*epsilon);
            scores
                .iter()
                .map(|(id, s)| (id.clone(), ((*s - min_v) / denom).clamp(0.0, 1.0)))
                .collect()
        }
        ScoreNorm::ZScore { epsilon } => {
            if scores.is_empty() {
                return Vec::new();
            }
            let n = scores.len() as f32;
            let mean = scores.iter().map(|(_, s)| *s).sum::<f32>() / n;
            let var = scores
                .iter()
                .map(|(_, s)| {
                    let d = *s - mean;
                    d * d
                })
                .sum::<f32>()
                / n;
            let stddev = var.sqrt().max(*epsilon);
            scores
                .iter()
                .map(|(id, s)| (id.clone(), (*s - mean) / stddev))
                .collect()
        }
    }
}

/// Default RRF smoothing constant.
pub const RRF_K: f32 = 60.0;

/// Fuse N ranked lists using weighted Reciprocal Rank Fusion.
///
/// For a document at 0-indexed rank `r` in list `i`, the contribution is
/// `weights[i] / (k + r + 1)`. Missing documents contribute nothing. Weights
/// default to `1/n` when the slice is empty or the wrong length. Ties in the
/// fused score break toward the lower original-rank-sum, then toward the id,
/// so fusion is deterministic given its inputs.
pub fn rrf_fuse(lists: &[Vec<(String, f32)>], weights: &[f32], k: f32) -> Vec<(String, f32)> {
    if lists.is_empty() {
        return Vec::new();
    }
    let uniform = 1.0 / lists.len() as f32;
    let weight_of = |i: usize| -> f32 {
        if weights.len() == lists.len() {
            weights[i]
        } else {
            uniform
        }
    };

    let mut fused: HashMap<&str, f32> = HashMap::new();
    // Sum of ranks across the lists a doc appears in; the tie-break key.
    let mut rank_sums: HashMap<&str, usize> = HashMap::new();

    for (i, list) in lists.iter().enumerate() {
        let w = weight_of(i);
        for (rank, (id, _)) in list.iter().enumerate() {
            *fused.entry(id.as_str()).or_insert(0.0) += w / (k + rank as f32 + 1.0);
            *rank_sums.entry(id.as_str()).or_insert(0) += rank;
        }
    }

    let mut out: Vec<(String, f32)> = fused
        .into_iter()
        .map(|(id, s)| (id.to_string(), s))
        .collect();
    out.sort_by(|(ida, sa), (idb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| rank_sums[ida.as_str()].cmp(&rank_sums[idb.as_str()]))
            .then_with(|| ida.cmp(idb))
    });
    out
}

/// How per-variant result sets are merged by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// Rank-based fusion across the variant lists.
    Rrf,
    /// Keep the maximum score seen for each id.
    Max,
    /// Sum scores across variants.
    Sum,
    /// Average scores across the variants an id appeared in.
    Avg,
}

/// Merge variant result lists by id with the chosen score combination.
/// Scores are min-max normalized per list first so variants with different
/// score scales cannot dominate the merge.
pub fn merge_by_id(
    lists: &[Vec<(String, f32)>],
    strategy: MergeStrategy,
) -> Vec<(String, f32)> {
    if lists.is_empty() {
        return Vec::new();
    }
    if matches!(strategy, MergeStrategy::Rrf) {
        return rrf_fuse(lists, &[], RRF_K);
    }

    let norm = ScoreNorm::default();
    let mut combined: HashMap<String, (f32, usize)> = HashMap::new();
    for list in lists {
        for (id, score) in normalize_scores(list, &norm) {
            let entry = combined.entry(id).or_insert((0.0, 0));
            entry.0 = match strategy {
                MergeStrategy::Max => entry.0.max(score),
                _ => entry.0 + score,
            };
            entry.1 += 1;
        }
    }

    let mut out: Vec<(String, f32)> = combined
        .into_iter()
        .map(|(id, (score, count))| {
            let score = match strategy {
                MergeStrategy::Avg => score / count as f32,
                _ => score,
            };
            (id, score)
        })
        .collect();
    out.sort_by(|(ida, sa), (idb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ida.cmp(idb))
    });
    out
}

/// Configuration for Maximal Marginal Relevance (MMR).
#[derive(Debug, Clone, Copy)]
pub struct MmrConfig {
    /// Tradeoff between relevance and diversity:
    /// objective = λ * rel - (1-λ) * max_sim
    pub lambda: f32,
    /// Consider only the top-N candidates by relevance when selecting.
    pub candidate_pool: usize,
}

impl Default for MmrConfig {
    fn default() -> Self {
        Self {
            lambda: 0.7,
            candidate_pool: 50,
        }
    }
}

fn l2_normalize(v: &[f32]) -> Option<Vec<f32>> {
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        Some(v.iter().map(|x| x / norm).collect())
    } else {
        None
    }
}

/// Cosine similarity of two raw vectors.
pub fn cosine_sim(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).take(len).map(|(x, y)| x * y).sum();
    let na = a.iter().take(len).map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().take(len).map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Select a diverse subset of candidates using Maximal Marginal Relevance.
///
/// - `candidates`: (id, relevance) pairs, higher is better
/// - `embeddings`: id -> vector; missing or zero-norm vectors imply sim 0.0
///
/// Returns (id, mmr_objective) for the selected items, in selection order.
pub fn mmr_select(
    candidates: &[(String, f32)],
    k: usize,
    embeddings: &HashMap<String, Vec<f32>>,
    cfg: &MmrConfig,
) -> Vec<(String, f32)> {
    if k == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let mut norm_map: HashMap<&str, Vec<f32>> = HashMap::with_capacity(embeddings.len());
    for (id, vec) in embeddings {
        if let Some(nv) = l2_normalize(vec) {
            norm_map.insert(id.as_str(), nv);
        }
    }

    let mut pool: Vec<(String, f32)> = candidates.to_vec();
    pool.sort_by(|(ida, sa), (idb, sb)| {
        sb.partial_cmp(sa)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| ida.cmp(idb))
    });
    let mut seen: HashSet<String> = HashSet::with_capacity(pool.len());
    pool.retain(|(id, _)| seen.insert(id.clone()));
    pool.truncate(cfg.candidate_pool);

    let mut selected: Vec<(String, f32)> = Vec::with_capacity(k.min(pool.len()));
    let mut selected_ids: Vec<String> = Vec::new();

    while selected.len() < k && !pool.is_empty() {
        let mut best_idx = 0usize;
        let mut best_obj = f32::NEG_INFINITY;

        for (i, (cid, rel)) in pool.iter().enumerate() {
            let penalty = selected_ids
                .iter()
                .filter_map(|sid| {
                    match (norm_map.get(cid.as_str()), norm_map.get(sid.as_str())) {
                        (Some(cv), Some(sv)) => {
                            Some(cv.iter().zip(sv.iter()).map(|(x, y)| x * y).sum::<f32>())
                        }
                        _ => None,
                    }
                })
                .fold(0.0f32, f32::max);

            let obj = cfg.lambda * rel - (1.0 - cfg.lambda) * penalty;
            if obj > best_obj {
                best_obj = obj;
                best_idx = i;
            }
        }

        let chosen = pool.remove(best_idx);
        selected_ids.push(chosen.0.clone());
        selected.push((chosen.0, best_obj));
    }

    selected
}
