//! C10 — result aggregation.
//!
//! Collects every completed step's result for a plan and produces a single
//! structured [`AggregatedAnswer`]: the final answer text (from the
//! terminal [`crate::types::StepType::FinalAnswer`] step if one completed,
//! or synthesized from whatever presentation/synthesis output is
//! available otherwise), its citation trail, a confidence score, and a
//! manifest of which steps contributed, skipped, or failed — so a caller
//! can render a "partial answer" notice when the plan did not fully
//! complete.

use std::collections::BTreeMap;

use crate::config::AggregationConfig;
use crate::types::{Ownership, StepId, StepResultPayload, StepStatus};

/// The aggregated output of a plan's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregatedAnswer {
    /// Final answer text.
    pub text: String,
    /// Evidence ownership trail backing the answer.
    pub citations: Vec<Ownership>,
    /// True if every step in the plan completed successfully.
    pub complete: bool,
    /// Steps that did not complete successfully, with a short reason.
    pub incomplete_steps: Vec<(StepId, String)>,
    /// Weighted combination of median approved-step quality_score and mean
    /// relevance_score of the top-k cited documents (spec §4.10, step 4).
    pub confidence: f64,
    /// Review requests, unsupported sentences, and tolerated upstream
    /// failures surfaced for the caller's attention (spec §4.10, step 5).
    pub warnings: Vec<AggregationWarning>,
}

/// One item the Aggregator flags for caller attention without treating it
/// as a hard failure of the plan.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregationWarning {
    /// A step's result was escalated to human review by the quality gate.
    ReviewRequested { step_id: StepId, reason: String },
    /// A factual-looking sentence in the final answer carries no
    /// supporting citation; it is kept in the text, not dropped.
    UnsupportedSentence { sentence: String },
    /// A step failed or was skipped but an optional dependency let
    /// downstream steps proceed without it.
    TolerableFailure { step_id: StepId, reason: String },
}

/// Aggregates a plan's step results into a final answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    /// Construct an aggregator. Stateless; a struct for call-site symmetry
    /// with the other `Cx` components.
    pub fn new() -> Self {
        Self
    }

    /// Aggregate a plan's results.
    ///
    /// `results` holds every step's final [`StepResultPayload`] for steps
    /// that reached [`StepStatus::Completed`]; `statuses` holds every
    /// step's terminal status (including failed/skipped ones), so steps
    /// absent from `results` can still be reported as incomplete with a
    /// reason. `quality_scores` carries the quality gate's score for every
    /// step the gate *approved* (steps merely reviewed, retried, or
    /// rejected do not count toward the median). `review_flags` carries
    /// the escalation reason for every step the quality gate sent to
    /// human review.
    pub fn aggregate(
        &self,
        results: &BTreeMap<StepId, StepResultPayload>,
        statuses: &BTreeMap<StepId, StepStatus>,
        quality_scores: &BTreeMap<StepId, f64>,
        review_flags: &BTreeMap<StepId, String>,
        config: &AggregationConfig,
    ) -> AggregatedAnswer {
        let final_answer = results.values().find_map(|r| match r {
            StepResultPayload::FinalAnswer { text, citations } => {
                Some((text.clone(), citations.clone()))
            }
            _ => None,
        });

        let (text, citations) = final_answer.unwrap_or_else(|| {
            let synthesized = synthesize_fallback(results);
            (synthesized, collect_implicit_citations(results))
        });

        let incomplete_steps: Vec<(StepId, String)> = statuses
            .iter()
            .filter(|(_, status)| !matches!(status, StepStatus::Completed))
            .map(|(id, status)| (*id, format!("{status:?}")))
            .collect();

        let mut warnings: Vec<AggregationWarning> = Vec::new();
        for (step_id, reason) in review_flags {
            warnings.push(AggregationWarning::ReviewRequested {
                step_id: *step_id,
                reason: reason.clone(),
            });
        }
        for (step_id, status) in statuses {
            if matches!(status, StepStatus::Skipped) {
                warnings.push(AggregationWarning::TolerableFailure {
                    step_id: *step_id,
                    reason: "skipped after an optional dependency failed".to_string(),
                });
            }
        }
        for sentence in mark_unsupported_sentences(&text, &citations) {
            warnings.push(AggregationWarning::UnsupportedSentence { sentence });
        }

        let confidence = compute_confidence(quality_scores, results, config);

        AggregatedAnswer {
            text,
            citations,
            complete: incomplete_steps.is_empty(),
            incomplete_steps,
            confidence,
            warnings,
        }
    }
}

/// When no explicit `FinalAnswer` step ran (e.g. the plan was cancelled
/// mid-execution), stitch together whatever synthesis/presentation output
/// did complete so the caller still gets something useful back.
fn synthesize_fallback(results: &BTreeMap<StepId, StepResultPayload>) -> String {
    let mut parts = Vec::new();
    for result in results.values() {
        match result {
            StepResultPayload::Presentation { rendered } => parts.push(rendered.clone()),
            StepResultPayload::Synthesis { text } => parts.push(text.clone()),
            _ => {}
        }
    }
    if parts.is_empty() {
        "No final answer was produced.".to_string()
    } else {
        parts.join("\n\n")
    }
}

fn collect_implicit_citations(results: &BTreeMap<StepId, StepResultPayload>) -> Vec<Ownership> {
    let mut citations = Vec::new();
    for (step_id, result) in results {
        if let StepResultPayload::Retrieval { results } = result {
            for r in results {
                citations.push(Ownership {
                    step_id: *step_id,
                    document_id: Some(r.document_id.clone()),
                });
            }
        }
    }
    citations
}

/// Split `text` into sentences and return those that carry no supporting
/// citation.
///
/// Handlers hand the Aggregator a flat citation list, not a per-sentence
/// attribution map, so a real per-sentence link only exists when the
/// generated text itself embeds an inline `[document_id]` marker. When at
/// least one such marker appears anywhere in the text, every sentence is
/// checked individually against it; otherwise the citation list is treated
/// as backing the whole answer (present) or none of it (absent), since
/// there is no finer-grained signal to check against.
fn mark_unsupported_sentences(text: &str, citations: &[Ownership]) -> Vec<String> {
    let sentences = split_sentences(text);
    if citations.is_empty() {
        return sentences;
    }

    let markers: Vec<String> = citations
        .iter()
        .filter_map(|c| c.document_id.as_deref())
        .map(|id| format!("[{id}]"))
        .collect();
    let any_marker_present = markers.iter().any(|marker| text.contains(marker.as_str()));
    if !any_marker_present {
        return Vec::new();
    }

    sentences
        .into_iter()
        .filter(|sentence| !markers.iter().any(|marker| sentence.contains(marker.as_str())))
        .collect()
}

fn split_sentences(text: &str) -> Vec<String> {
    text.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Weighted combination of median approved-step quality_score and mean
/// relevance_score across the top-k cited documents (spec §4.10, step 4).
/// Falls back to whichever half is available when the other has no data,
/// and to `0.0` when neither does (nothing ran, or nothing was approved
/// and nothing was retrieved).
fn compute_confidence(
    quality_scores: &BTreeMap<StepId, f64>,
    results: &BTreeMap<StepId, StepResultPayload>,
    config: &AggregationConfig,
) -> f64 {
    let median_quality = median(quality_scores.values().copied());
    let mean_relevance = mean_top_k_relevance(results, config.top_k);

    match (median_quality, mean_relevance) {
        (Some(q), Some(r)) => config.quality_weight * q + config.relevance_weight * r,
        (Some(q), None) => q,
        (None, Some(r)) => r,
        (None, None) => 0.0,
    }
}

fn median(values: impl Iterator<Item = f64>) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).expect("quality scores are never NaN"));
    let mid = sorted.len() / 2;
    Some(if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    })
}

fn mean_top_k_relevance(results: &BTreeMap<StepId, StepResultPayload>, top_k: usize) -> Option<f64> {
    let mut scores: Vec<f64> = results
        .values()
        .flat_map(|r| match r {
            StepResultPayload::Retrieval { results } => {
                results.iter().map(|rr| rr.score).collect::<Vec<_>>()
            }
            _ => Vec::new(),
        })
        .collect();
    if scores.is_empty() {
        return None;
    }
    scores.sort_by(|a, b| b.partial_cmp(a).expect("relevance scores are never NaN"));
    scores.truncate(top_k.max(1));
    Some(scores.iter().sum::<f64>() / scores.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{RetrievalResult, SimilarityMetric};

    fn config() -> AggregationConfig {
        AggregationConfig::default()
    }

    #[test]
    fn uses_explicit_final_answer_when_present() {
        let step_id = StepId::new();
        let mut results = BTreeMap::new();
        results.insert(
            step_id,
            StepResultPayload::FinalAnswer {
                text: "the answer.".to_string(),
                citations: vec![Ownership {
                    step_id,
                    document_id: Some("doc-1".to_string()),
                }],
            },
        );
        let mut statuses = BTreeMap::new();
        statuses.insert(step_id, StepStatus::Completed);
        let mut quality_scores = BTreeMap::new();
        quality_scores.insert(step_id, 0.9);

        let answer = Aggregator::new().aggregate(
            &results,
            &statuses,
            &quality_scores,
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(answer.text, "the answer.");
        assert!(answer.complete);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.confidence, 0.9);
    }

    #[test]
    fn falls_back_to_synthesis_when_no_final_answer_ran() {
        let step_id = StepId::new();
        let mut results = BTreeMap::new();
        results.insert(
            step_id,
            StepResultPayload::Synthesis {
                text: "partial synthesis".to_string(),
            },
        );
        let mut statuses = BTreeMap::new();
        statuses.insert(step_id, StepStatus::Completed);
        let other = StepId::new();
        statuses.insert(other, StepStatus::Failed);

        let answer = Aggregator::new().aggregate(
            &results,
            &statuses,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(answer.text, "partial synthesis");
        assert!(!answer.complete);
        assert_eq!(answer.incomplete_steps.len(), 1);
    }

    #[test]
    fn reports_no_answer_when_nothing_completed() {
        let answer = Aggregator::new().aggregate(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &config(),
        );
        assert_eq!(answer.text, "No final answer was produced.");
        assert!(answer.complete);
        assert_eq!(answer.confidence, 0.0);
    }

    #[test]
    fn skipped_step_becomes_a_tolerable_failure_warning() {
        let step_id = StepId::new();
        let mut statuses = BTreeMap::new();
        statuses.insert(step_id, StepStatus::Skipped);

        let answer = Aggregator::new().aggregate(
            &BTreeMap::new(),
            &statuses,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &config(),
        );
        assert!(matches!(
            answer.warnings.as_slice(),
            [AggregationWarning::TolerableFailure { step_id: s, .. }] if *s == step_id
        ));
    }

    #[test]
    fn review_requested_step_becomes_a_warning() {
        let step_id = StepId::new();
        let mut review_flags = BTreeMap::new();
        review_flags.insert(step_id, "borderline score".to_string());

        let answer = Aggregator::new().aggregate(
            &BTreeMap::new(),
            &BTreeMap::new(),
            &BTreeMap::new(),
            &review_flags,
            &config(),
        );
        assert!(matches!(
            answer.warnings.as_slice(),
            [AggregationWarning::ReviewRequested { step_id: s, reason }]
                if *s == step_id && reason == "borderline score"
        ));
    }

    #[test]
    fn sentence_without_inline_citation_marker_is_flagged_unsupported() {
        let step_id = StepId::new();
        let mut results = BTreeMap::new();
        results.insert(
            step_id,
            StepResultPayload::FinalAnswer {
                text: "Fact one is true [doc-1]. Fact two has no source.".to_string(),
                citations: vec![Ownership {
                    step_id,
                    document_id: Some("doc-1".to_string()),
                }],
            },
        );
        let mut statuses = BTreeMap::new();
        statuses.insert(step_id, StepStatus::Completed);

        let answer = Aggregator::new().aggregate(
            &results,
            &statuses,
            &BTreeMap::new(),
            &BTreeMap::new(),
            &config(),
        );
        let unsupported: Vec<_> = answer
            .warnings
            .iter()
            .filter_map(|w| match w {
                AggregationWarning::UnsupportedSentence { sentence } => Some(sentence.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(unsupported, vec!["Fact two has no source."]);
    }

    #[test]
    fn confidence_combines_quality_and_relevance_with_configured_weights() {
        let retrieval_step = StepId::new();
        let mut results = BTreeMap::new();
        results.insert(
            retrieval_step,
            StepResultPayload::Retrieval {
                results: vec![
                    RetrievalResult {
                        document_id: "doc-1".to_string(),
                        text: "chunk".to_string(),
                        score: 1.0,
                        metric: SimilarityMetric::Cosine,
                        rank: 1,
                    },
                    RetrievalResult {
                        document_id: "doc-2".to_string(),
                        text: "chunk".to_string(),
                        score: 0.5,
                        metric: SimilarityMetric::Cosine,
                        rank: 2,
                    },
                ],
            },
        );
        let quality_step = StepId::new();
        let mut quality_scores = BTreeMap::new();
        quality_scores.insert(quality_step, 0.8);
        let mut statuses = BTreeMap::new();
        statuses.insert(retrieval_step, StepStatus::Completed);
        statuses.insert(quality_step, StepStatus::Completed);

        let answer = Aggregator::new().aggregate(
            &results,
            &statuses,
            &quality_scores,
            &BTreeMap::new(),
            &config(),
        );
        // median quality = 0.8, mean relevance = (1.0 + 0.5) / 2 = 0.75
        let expected = 0.6 * 0.8 + 0.4 * 0.75;
        assert!((answer.confidence - expected).abs() < 1e-9);
    }
}
