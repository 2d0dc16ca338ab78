//! C11 — pre-execution hypothesis estimation.
//!
//! Before the orchestrator spends any retrieval or generation budget, the
//! hypothesis service looks at the [`Analysis`] of a query and decides
//! whether the answer shape is clear enough to proceed, or whether the
//! user should be asked a clarifying question first. This is a cheap,
//! local estimate, not a call to the generation runtime.

use crate::types::{
    Analysis, ComplexityTier, Hypothesis, MissingInfoSeverity, MissingInformation,
    RetrievalResult,
};

/// Ambiguity score at or above which a clarifying question is recommended.
pub const DEFAULT_CLARIFICATION_THRESHOLD: f64 = 0.65;

/// Fixed token-budget table keyed by [`ComplexityTier`] (spec §4.11: "a
/// fixed table keyed by estimated_complexity").
const TOKEN_BUDGET_SIMPLE: u32 = 512;
const TOKEN_BUDGET_MODERATE: u32 = 1536;
const TOKEN_BUDGET_COMPLEX: u32 = 4096;

/// Intents whose answer shape is rarely a single fact, regardless of how
/// few entities the query itself named.
const INHERENTLY_COMPLEX_INTENTS: &[&str] = &["comparison", "calculation", "recommendation"];

/// Stateless hypothesis estimator.
#[derive(Debug, Clone, Copy)]
pub struct HypothesisService {
    /// Ambiguity threshold above which clarification is recommended.
    clarification_threshold: f64,
}

impl Default for HypothesisService {
    fn default() -> Self {
        Self {
            clarification_threshold: DEFAULT_CLARIFICATION_THRESHOLD,
        }
    }
}

impl HypothesisService {
    /// Build a service with the default clarification threshold.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a service with a custom clarification threshold.
    pub fn with_threshold(clarification_threshold: f64) -> Self {
        Self {
            clarification_threshold,
        }
    }

    /// Estimate a hypothesis for the given analysis.
    ///
    /// Missing jurisdiction and missing named entities are both surfaced as
    /// [`MissingInformation`]; jurisdiction is only escalated to
    /// [`MissingInfoSeverity::Critical`] when the query is *already*
    /// ambiguous without it, since many queries (e.g. `definition`) don't
    /// need one to answer sensibly.
    pub fn estimate(&self, analysis: &Analysis) -> Hypothesis {
        self.estimate_with_preliminary_retrieval(analysis, &[])
    }

    /// Estimate a hypothesis the same way as [`Self::estimate`], but blend
    /// in a cheap preliminary retrieval pass (top-k fused, low effort, per
    /// spec §4.11) so the confidence figure reflects whether relevant
    /// evidence actually exists, not just how clearly the query was asked.
    /// When the generation runtime used for a deeper estimate is
    /// unavailable, callers can fall back to the rule-based [`Self::estimate`]
    /// with an empty retrieval slice.
    pub fn estimate_with_preliminary_retrieval(
        &self,
        analysis: &Analysis,
        preliminary: &[RetrievalResult],
    ) -> Hypothesis {
        let confidence = blend_with_retrieval(1.0 - analysis.ambiguity, preliminary);
        let is_ambiguous = analysis.is_ambiguous(self.clarification_threshold);

        let mut missing_information = Vec::new();
        if analysis.jurisdiction.is_none() {
            let severity = if is_ambiguous {
                MissingInfoSeverity::Critical
            } else {
                MissingInfoSeverity::Important
            };
            missing_information.push(MissingInformation {
                item: "jurisdiction".to_string(),
                severity,
            });
        }
        if analysis.entities.is_empty() {
            missing_information.push(MissingInformation {
                item: "specific statute, permit, or procedure".to_string(),
                severity: MissingInfoSeverity::Optional,
            });
        }

        let has_critical_gap = missing_information
            .iter()
            .any(|m| m.severity == MissingInfoSeverity::Critical);
        let clarification = if is_ambiguous || has_critical_gap {
            Some(self.clarifying_question(analysis))
        } else {
            None
        };

        let estimated_complexity = complexity_of(analysis);
        let recommended_token_budget = token_budget_for(estimated_complexity);

        Hypothesis {
            summary: format!(
                "Likely a {} question{}",
                analysis.intent.replace('_', " "),
                analysis
                    .jurisdiction
                    .as_ref()
                    .map(|j| format!(" scoped to {j}"))
                    .unwrap_or_default(),
            ),
            confidence,
            required_criteria: required_criteria_for(analysis),
            available_information: summarize_preliminary(preliminary),
            missing_information,
            clarification,
            estimated_complexity,
            recommended_token_budget,
        }
    }

    fn clarifying_question(&self, analysis: &Analysis) -> String {
        if analysis.jurisdiction.is_none() {
            "Which jurisdiction or authority does this question concern?".to_string()
        } else if analysis.entities.is_empty() {
            "Could you name the specific statute, permit, or procedure you mean?".to_string()
        } else {
            "Could you clarify what outcome you're looking for?".to_string()
        }
    }
}

/// Blend the rule-based confidence estimate with how relevant a cheap
/// preliminary retrieval pass turned out to be. An empty `preliminary`
/// (no retrieval attempted, or the generation runtime behind it was
/// unavailable) leaves the rule-based estimate untouched.
fn blend_with_retrieval(rule_based_confidence: f64, preliminary: &[RetrievalResult]) -> f64 {
    if preliminary.is_empty() {
        return rule_based_confidence;
    }
    let mean_relevance =
        preliminary.iter().map(|r| r.score).sum::<f64>() / preliminary.len() as f64;
    ((rule_based_confidence + mean_relevance) / 2.0).clamp(0.0, 1.0)
}

/// Estimate how much generation work a query will need, independent of how
/// ambiguous it is: an intent that inherently requires multi-step reasoning
/// (comparison, calculation, recommendation) is at least `Moderate` even
/// when every entity it needs is present.
fn complexity_of(analysis: &Analysis) -> ComplexityTier {
    let inherently_complex = INHERENTLY_COMPLEX_INTENTS.contains(&analysis.intent.as_str());
    match (inherently_complex, analysis.entities.len()) {
        (true, n) if n >= 2 => ComplexityTier::Complex,
        (true, _) => ComplexityTier::Moderate,
        (false, n) if n >= 2 => ComplexityTier::Moderate,
        (false, _) => ComplexityTier::Simple,
    }
}

fn token_budget_for(tier: ComplexityTier) -> u32 {
    match tier {
        ComplexityTier::Simple => TOKEN_BUDGET_SIMPLE,
        ComplexityTier::Moderate => TOKEN_BUDGET_MODERATE,
        ComplexityTier::Complex => TOKEN_BUDGET_COMPLEX,
    }
}

/// Facts the final answer must cover, independent of which are already
/// satisfied by `analysis` (that's what [`MissingInformation`] is for).
/// Every question needs a jurisdiction and a grounding legal reference;
/// intents with an inherently multi-part answer shape add one more.
fn required_criteria_for(analysis: &Analysis) -> Vec<String> {
    let mut criteria = vec![
        "jurisdiction".to_string(),
        "applicable statute, permit, or procedure".to_string(),
    ];
    match analysis.intent.as_str() {
        "comparison" => criteria.push("the entities being compared".to_string()),
        "calculation" => criteria.push("the fee or amount basis".to_string()),
        "timeline" => criteria.push("the deadline-triggering event".to_string()),
        _ => {}
    }
    criteria
}

/// One short summary line per preliminary retrieval hit, in rank order, so
/// a caller inspecting the hypothesis can see what evidence already
/// informed its confidence without re-running retrieval.
fn summarize_preliminary(preliminary: &[RetrievalResult]) -> Vec<String> {
    preliminary
        .iter()
        .map(|r| {
            let snippet: String = r.text.chars().take(120).collect();
            format!("{} (score {:.2}): {snippet}", r.document_id, r.score)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn analysis(ambiguity: f64, jurisdiction: Option<&str>, entities: usize) -> Analysis {
        Analysis {
            intent: "lookup".to_string(),
            question_type: "statement".to_string(),
            entities: (0..entities)
                .map(|_| crate::types::Entity {
                    kind: "statute".to_string(),
                    text: "X".to_string(),
                    span: crate::types::Span::new(0, 1),
                    confidence: 0.9,
                })
                .collect(),
            jurisdiction: jurisdiction.map(str::to_string),
            ambiguity,
            confidence: 0.9,
            parameters: BTreeMap::new(),
        }
    }

    #[test]
    fn low_ambiguity_needs_no_clarification() {
        let service = HypothesisService::new();
        let hypothesis = service.estimate(&analysis(0.1, Some("Bavaria"), 1));
        assert!(!hypothesis.needs_clarification());
        assert!(hypothesis.confidence > 0.8);
    }

    #[test]
    fn high_ambiguity_without_jurisdiction_asks_for_it() {
        let service = HypothesisService::new();
        let hypothesis = service.estimate(&analysis(0.9, None, 0));
        assert!(hypothesis.needs_clarification());
        assert!(hypothesis.clarification.unwrap().contains("jurisdiction"));
    }

    #[test]
    fn custom_threshold_changes_recommendation() {
        let lenient = HypothesisService::with_threshold(0.95);
        assert!(!lenient.estimate(&analysis(0.8, Some("Bavaria"), 1)).needs_clarification());
    }

    #[test]
    fn missing_jurisdiction_at_high_ambiguity_is_reported_as_critical() {
        let service = HypothesisService::new();
        let hypothesis = service.estimate(&analysis(0.9, None, 1));
        assert!(hypothesis.has_critical_gap());
        assert_eq!(hypothesis.critical_gap_descriptions(), vec!["jurisdiction".to_string()]);
    }

    #[test]
    fn present_jurisdiction_and_entities_yield_no_missing_information() {
        let service = HypothesisService::new();
        let hypothesis = service.estimate(&analysis(0.1, Some("Bavaria"), 2));
        assert!(hypothesis.missing_information.is_empty());
    }

    #[test]
    fn simple_lookup_gets_the_smallest_token_budget() {
        let service = HypothesisService::new();
        let hypothesis = service.estimate(&analysis(0.1, Some("Bavaria"), 1));
        assert_eq!(hypothesis.estimated_complexity, ComplexityTier::Simple);
        assert_eq!(hypothesis.recommended_token_budget, TOKEN_BUDGET_SIMPLE);
    }

    #[test]
    fn comparison_intent_is_at_least_moderate_even_with_one_entity() {
        let mut query = analysis(0.1, Some("Bavaria"), 1);
        query.intent = "comparison".to_string();
        let hypothesis = HypothesisService::new().estimate(&query);
        assert_eq!(hypothesis.estimated_complexity, ComplexityTier::Moderate);
        assert_eq!(hypothesis.recommended_token_budget, TOKEN_BUDGET_MODERATE);
    }

    #[test]
    fn comparison_intent_with_two_entities_is_complex() {
        let mut query = analysis(0.1, Some("Bavaria"), 2);
        query.intent = "comparison".to_string();
        let hypothesis = HypothesisService::new().estimate(&query);
        assert_eq!(hypothesis.estimated_complexity, ComplexityTier::Complex);
        assert_eq!(hypothesis.recommended_token_budget, TOKEN_BUDGET_COMPLEX);
    }

    #[test]
    fn empty_preliminary_retrieval_leaves_rule_based_confidence_untouched() {
        let service = HypothesisService::new();
        let plain = service.estimate(&analysis(0.1, Some("Bavaria"), 1));
        let blended =
            service.estimate_with_preliminary_retrieval(&analysis(0.1, Some("Bavaria"), 1), &[]);
        assert_eq!(plain.confidence, blended.confidence);
    }

    #[test]
    fn low_relevance_preliminary_retrieval_pulls_confidence_down() {
        use crate::types::SimilarityMetric;

        let service = HypothesisService::new();
        let weak_evidence = vec![RetrievalResult {
            document_id: "doc-1".to_string(),
            text: "unrelated".to_string(),
            score: 0.1,
            metric: SimilarityMetric::Cosine,
            rank: 1,
        }];
        let plain = service.estimate(&analysis(0.1, Some("Bavaria"), 1));
        let blended = service
            .estimate_with_preliminary_retrieval(&analysis(0.1, Some("Bavaria"), 1), &weak_evidence);
        assert!(blended.confidence < plain.confidence);
    }

    #[test]
    fn every_hypothesis_names_jurisdiction_and_a_legal_reference_as_required() {
        let hypothesis = HypothesisService::new().estimate(&analysis(0.1, Some("Bavaria"), 1));
        assert!(hypothesis.required_criteria.contains(&"jurisdiction".to_string()));
        assert_eq!(hypothesis.required_criteria.len(), 2);
    }

    #[test]
    fn comparison_intent_adds_a_compared_entities_criterion() {
        let mut query = analysis(0.1, Some("Bavaria"), 2);
        query.intent = "comparison".to_string();
        let hypothesis = HypothesisService::new().estimate(&query);
        assert_eq!(hypothesis.required_criteria.len(), 3);
    }

    #[test]
    fn estimate_without_preliminary_retrieval_reports_no_available_information() {
        let hypothesis = HypothesisService::new().estimate(&analysis(0.1, Some("Bavaria"), 1));
        assert!(hypothesis.available_information.is_empty());
    }

    #[test]
    fn preliminary_retrieval_hits_are_summarized_into_available_information() {
        use crate::types::SimilarityMetric;

        let service = HypothesisService::new();
        let evidence = vec![RetrievalResult {
            document_id: "doc-1".to_string(),
            text: "permits require a completed application".to_string(),
            score: 0.8,
            metric: SimilarityMetric::Cosine,
            rank: 1,
        }];
        let hypothesis = service
            .estimate_with_preliminary_retrieval(&analysis(0.1, Some("Bavaria"), 1), &evidence);
        assert_eq!(hypothesis.available_information.len(), 1);
        assert!(hypothesis.available_information[0].contains("doc-1"));
    }
}
