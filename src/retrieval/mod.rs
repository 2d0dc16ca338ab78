//! C4 — hybrid retrieval.
//!
//! A [`SearchBackend`] trait abstracting over whatever backing search
//! indexes exist (the datastores themselves are an external interface, out
//! of scope for this crate — see [`crate::persistence`]), plus the fusion
//! logic that combines multiple ranked result lists into one: weighted
//! Reciprocal Rank Fusion, optional query expansion before retrieval, a
//! local re-rank pass (relevance/informativeness/combined), and an
//! optional LLM re-ranking pass that degrades gracefully when the
//! generation runtime is unavailable.
//!
//! Sub-source failures are tolerated: a backend erroring on one query
//! variant does not sink the whole retrieval, only its own contribution to
//! fusion. Only when *every* backend call across *every* query variant
//! fails does [`Retriever::retrieve`] raise (spec §8 boundary:
//! `Unavailable`).

mod rrf;

pub use rrf::{reciprocal_rank_fusion, reciprocal_rank_fusion_weighted};

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RetrievalConfig;
use crate::error::{Error, Result, TransientError};
use crate::types::{RetrievalResult, StepId};

/// One ranked result list from a single backing index, as returned before
/// fusion. Carries the index's own name so fused results can note
/// provenance, and so [`RetrievalConfig::source_weights`] can single it
/// out.
#[derive(Debug, Clone)]
pub struct RankedList {
    /// Name of the index/source that produced this list, e.g. `"bm25"` or
    /// `"dense"`.
    pub source: String,
    /// Results in rank order (best first); [`RetrievalResult::rank`] is
    /// recomputed from this order during fusion regardless of what the
    /// source set.
    pub results: Vec<RetrievalResult>,
}

/// External search backend. Out of scope for this crate to implement —
/// datastores are an external interface (see `spec.md` §6) — but the
/// fusion and expansion logic needs something to call, so the trait lives
/// here and a caller supplies a concrete implementation.
#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Run a single query against this backend, returning a ranked list.
    async fn search(&self, query: &str, top_k: usize) -> Result<RankedList>;
}

/// Optional re-ranking backend, typically backed by the generation
/// runtime. A `rerank` failure is treated as non-fatal: retrieval falls
/// back to the fused-but-unreranked order rather than failing the step.
#[async_trait]
pub trait Reranker: Send + Sync {
    /// Re-order `results` for the given query, returning the re-ranked
    /// list (same elements, new order, optionally re-scored).
    async fn rerank(&self, query: &str, results: Vec<RetrievalResult>) -> Result<Vec<RetrievalResult>>;
}

/// Expands a query into one or more alternative phrasings before
/// retrieval, to improve recall against lexical backends. Out of scope to
/// implement with a real model here; a caller supplies an implementation
/// (or [`NoopExpander`] to disable expansion without touching `Config`).
pub trait QueryExpander: Send + Sync {
    /// Produce additional query variants (not including `query` itself).
    fn expand(&self, query: &str) -> Vec<String>;
}

/// An expander that returns no variants; used when
/// [`RetrievalConfig::expand`] is false.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExpander;

impl QueryExpander for NoopExpander {
    fn expand(&self, _query: &str) -> Vec<String> {
        Vec::new()
    }
}

/// Local, model-free re-rank scoring mode applied after fusion (spec
/// §4.4/§9 open question: the combination formula isn't pinned down by the
/// source; `combined` here follows the spec's suggested default of
/// `0.5 * relevance + 0.5 * informativeness`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RerankMode {
    /// Keep the fused relevance order as-is.
    Relevance,
    /// Order purely by how much distinct information a chunk carries.
    Informativeness,
    /// Blend relevance and informativeness in equal parts.
    Combined,
}

impl Default for RerankMode {
    fn default() -> Self {
        RerankMode::Relevance
    }
}

/// Orchestrates expansion, multi-backend search, fusion, and optional
/// re-ranking into a single [`RetrievalResult`] list.
pub struct Retriever<'a> {
    backends: Vec<&'a dyn SearchBackend>,
    expander: &'a dyn QueryExpander,
    reranker: Option<&'a dyn Reranker>,
    config: RetrievalConfig,
}

impl<'a> Retriever<'a> {
    /// Build a retriever over the given backends with the given config.
    pub fn new(backends: Vec<&'a dyn SearchBackend>, config: RetrievalConfig) -> Self {
        Self {
            backends,
            expander: &NOOP,
            reranker: None,
            config,
        }
    }

    /// Attach a query expander, used only when `config.expand` is true.
    #[must_use]
    pub fn with_expander(mut self, expander: &'a dyn QueryExpander) -> Self {
        self.expander = expander;
        self
    }

    /// Attach a re-ranker, used only when `config.rerank` is true.
    #[must_use]
    pub fn with_reranker(mut self, reranker: &'a dyn Reranker) -> Self {
        self.reranker = Some(reranker);
        self
    }

    /// Run the full retrieval pipeline for a single query.
    ///
    /// `step_id` is carried only for error attribution: if every backend
    /// call fails, the returned [`Error::Transient`] names the step that
    /// was trying to retrieve, the same as any other step-level failure.
    ///
    /// # Errors
    /// Returns [`TransientError::Unavailable`] only when every backend
    /// call, across every expanded query variant, failed. A backend
    /// failing on some but not all variants (or failing while others
    /// succeed) is tolerated: its contribution is simply missing from
    /// fusion.
    pub async fn retrieve(&self, step_id: StepId, query: &str) -> Result<Vec<RetrievalResult>> {
        let mut queries = vec![query.to_string()];
        if self.config.expand {
            queries.extend(self.expander.expand(query));
        }

        let mut lists = Vec::new();
        let mut attempted = 0usize;
        let mut failures = Vec::new();
        for q in &queries {
            for backend in &self.backends {
                attempted += 1;
                match backend.search(q, self.config.top_k).await {
                    Ok(list) => lists.push(list),
                    Err(err) => {
                        tracing::warn!(error = %err, query = %q, "retrieval sub-source failed, excluding from fusion");
                        failures.push(err);
                    }
                }
            }
        }

        if attempted > 0 && lists.is_empty() {
            return Err(Error::Transient {
                step: step_id,
                source: TransientError::Unavailable(format!(
                    "all {attempted} retrieval sub-source call(s) failed; last error: {}",
                    failures
                        .last()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "none".to_string())
                )),
            });
        }

        let mut fused =
            reciprocal_rank_fusion_weighted(&lists, self.config.rrf_k, self.config.top_k, &self.config.source_weights);

        if self.config.rerank {
            fused = apply_rerank_mode(fused, self.config.rerank_mode);
            if let Some(reranker) = self.reranker {
                return match reranker.rerank(query, fused.clone()).await {
                    Ok(reranked) => Ok(reranked),
                    Err(err) => {
                        tracing::warn!(error = %err, "re-ranking failed, falling back to fused order");
                        Ok(fused)
                    }
                };
            }
        }

        Ok(fused)
    }
}

static NOOP: NoopExpander = NoopExpander;

/// Min-max normalize a slice of scores to `[0.0, 1.0]`; a flat input (every
/// score equal) normalizes to all `1.0` rather than dividing by zero.
fn normalize(scores: &[f64]) -> Vec<f64> {
    let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if scores.is_empty() {
        return Vec::new();
    }
    if (max - min).abs() < f64::EPSILON {
        return vec![1.0; scores.len()];
    }
    scores.iter().map(|s| (s - min) / (max - min)).collect()
}

/// Heuristic "how much distinct information does this chunk carry": a
/// blend of lexical diversity (unique word ratio) and length, since a
/// short or highly repetitive chunk rarely adds much beyond what's already
/// been retrieved.
fn informativeness(result: &RetrievalResult) -> f64 {
    let words: Vec<&str> = result.text.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let unique: HashSet<&str> = words.iter().copied().collect();
    let diversity = unique.len() as f64 / words.len() as f64;
    let length_factor = ((words.len() as f64).ln_1p() / 5.0).min(1.0);
    0.5 * diversity + 0.5 * length_factor
}

/// Re-order already-fused results according to `mode`, renumbering rank.
/// `Relevance` is a no-op (fusion already sorts by relevance); the other
/// two modes re-score and re-sort.
fn apply_rerank_mode(results: Vec<RetrievalResult>, mode: RerankMode) -> Vec<RetrievalResult> {
    if results.is_empty() || mode == RerankMode::Relevance {
        return results;
    }

    let relevance: Vec<f64> = normalize(&results.iter().map(|r| r.score).collect::<Vec<_>>());
    let informativeness_scores: Vec<f64> = normalize(
        &results
            .iter()
            .map(informativeness)
            .collect::<Vec<_>>(),
    );

    let mut scored: Vec<(f64, RetrievalResult)> = results
        .into_iter()
        .enumerate()
        .map(|(i, result)| {
            let combined = match mode {
                RerankMode::Relevance => unreachable!("handled above"),
                RerankMode::Informativeness => informativeness_scores[i],
                RerankMode::Combined => 0.5 * relevance[i] + 0.5 * informativeness_scores[i],
            };
            (combined, result)
        })
        .collect();

    scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    scored
        .into_iter()
        .enumerate()
        .map(|(idx, (combined, mut result))| {
            result.score = combined;
            result.rank = idx + 1;
            result
        })
        .collect()
}
