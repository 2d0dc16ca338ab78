//! Reciprocal Rank Fusion.
//!
//! Combines several ranked lists into one by scoring each document as the
//! sum of `1 / (k + rank)` across every list it appears in, where `rank`
//! is its 1-based position in that list. Documents absent from a list
//! contribute nothing for it. This is rank-based rather than
//! score-based, so lists from incomparable scoring scales (BM25 vs. a
//! dense cosine score) combine without needing to be normalized first.

use std::collections::BTreeMap;

use crate::types::{RetrievalResult, SimilarityMetric};

use super::RankedList;

/// Fuse multiple ranked lists into a single list of up to `top_k` results,
/// ordered by descending fused score. Equivalent to
/// [`reciprocal_rank_fusion_weighted`] with every source weighted `1.0`.
pub fn reciprocal_rank_fusion(
    lists: &[RankedList],
    k: f64,
    top_k: usize,
) -> Vec<RetrievalResult> {
    reciprocal_rank_fusion_weighted(lists, k, top_k, &BTreeMap::new())
}

/// Fuse multiple ranked lists as [`reciprocal_rank_fusion`] does, but scale
/// each list's contribution by its source's weight before summing. A
/// source absent from `weights` contributes at weight `1.0`; this keeps
/// unweighted callers (and the config default, an empty map) identical to
/// the unweighted fusion.
pub fn reciprocal_rank_fusion_weighted(
    lists: &[RankedList],
    k: f64,
    top_k: usize,
    weights: &BTreeMap<String, f64>,
) -> Vec<RetrievalResult> {
    // Keyed on fused score plus each document's highest per-source score,
    // the latter used only to break ties deterministically rather than
    // falling back to document-id order.
    let mut fused: BTreeMap<String, (f64, f64, RetrievalResult)> = BTreeMap::new();

    for list in lists {
        let weight = weights.get(&list.source).copied().unwrap_or(1.0);
        for (idx, result) in list.results.iter().enumerate() {
            let rank = idx + 1;
            let contribution = weight * (1.0 / (k + rank as f64));
            fused
                .entry(result.document_id.clone())
                .and_modify(|(score, max_source_score, _)| {
                    *score += contribution;
                    *max_source_score = max_source_score.max(result.score);
                })
                .or_insert_with(|| {
                    (
                        contribution,
                        result.score,
                        RetrievalResult {
                            document_id: result.document_id.clone(),
                            text: result.text.clone(),
                            score: 0.0,
                            metric: SimilarityMetric::Lexical,
                            rank: 0,
                        },
                    )
                });
        }
    }

    let mut ranked: Vec<(f64, f64, RetrievalResult)> = fused.into_values().collect();
    ranked.sort_by(|a, b| {
        b.0.partial_cmp(&a.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal))
    });

    ranked
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(idx, (score, _max_source_score, mut result))| {
            result.score = score;
            result.rank = idx + 1;
            result
        })
        .collect()
}
