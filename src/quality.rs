//! C6 — quality gate.
//!
//! Scores a completed step's result and decides what happens next:
//! approve it (optionally with a warning), retry the step, escalate to
//! human review, or reject it outright once the step's own retry budget is
//! exhausted. The four-way split and banded thresholds mirror the
//! Allow/Deny/RequireApproval shape other policy-engine designs in the
//! reference corpus use, following the teacher's `RiskLevel` banding style
//! in its approval module.

use crate::config::QualityConfig;
use crate::types::{StepId, StepResultPayload};

/// Outcome of evaluating a step's result against the quality gate.
#[derive(Debug, Clone, PartialEq)]
pub enum QualityDecision {
    /// The result is good enough; downstream steps may consume it.
    Approve {
        /// Score that earned the approval.
        score: f64,
        /// True when the score cleared `min` but not `target`: approved,
        /// but the caller may want to flag the assumption to the user.
        warned: bool,
    },
    /// The result is marginal; retry the step (subject to
    /// [`crate::retry::RetryPolicy`] for the error-classification side of
    /// retries, and to `QualityConfig.max_attempts` for this quality-driven
    /// side).
    Retry {
        /// Score that triggered the retry.
        score: f64,
        /// Explanation surfaced in the retry's progress event.
        reason: String,
    },
    /// The score sits in the ambiguous band just below `target`: not
    /// clearly good enough to approve, not clearly bad enough to retry.
    /// Escalates to a human reviewer and pauses the plan.
    RequestReview {
        /// Score that triggered the escalation.
        score: f64,
        /// Explanation surfaced to the reviewer.
        reason: String,
    },
    /// Below `min` with no attempts left; terminal for the step unless the
    /// orchestrator injects an intervention.
    Reject {
        /// Score that triggered the rejection.
        score: f64,
        /// Attempts already spent on this step.
        attempts: u32,
        /// Explanation surfaced in the failure.
        reason: String,
    },
}

impl QualityDecision {
    /// The score associated with this decision, regardless of variant.
    pub fn score(&self) -> f64 {
        match self {
            QualityDecision::Approve { score, .. }
            | QualityDecision::Retry { score, .. }
            | QualityDecision::RequestReview { score, .. }
            | QualityDecision::Reject { score, .. } => *score,
        }
    }

    /// Short label for the decision, used in progress events and logs.
    pub fn label(&self) -> &'static str {
        match self {
            QualityDecision::Approve { .. } => "approve",
            QualityDecision::Retry { .. } => "retry",
            QualityDecision::RequestReview { .. } => "request_review",
            QualityDecision::Reject { .. } => "reject",
        }
    }
}

/// Anything that can assign a quality score to a step's result.
///
/// Kept separate from [`QualityGate`] so a caller can plug in domain logic
/// (e.g. checking whether a synthesis step's citations are all still
/// present in the retrieval results it drew from) without touching the
/// threshold/banding logic below. The quality-dimension vocabulary is
/// handler-specific (spec §4.6); this core treats the scorer's output as a
/// single overall dimension and leaves per-dimension breakdowns to the
/// scorer's own `reason` text.
pub trait QualityScorer: Send + Sync {
    /// Score a completed step's result in `[0.0, 1.0]`.
    fn score(&self, step_id: StepId, result: &StepResultPayload) -> f64;
}

/// A scorer that reads the score straight off a
/// [`StepResultPayload::QualityCheck`] payload, treating every other
/// variant as fully trusted (score 1.0). Used when an explicit
/// `QualityCheck` step upstream already did the scoring work.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughScorer;

impl QualityScorer for PassthroughScorer {
    fn score(&self, _step_id: StepId, result: &StepResultPayload) -> f64 {
        match result {
            StepResultPayload::QualityCheck { score } => *score,
            StepResultPayload::MissingUpstream { .. } => 0.0,
            _ => 1.0,
        }
    }
}

/// Applies [`QualityConfig`] thresholds to a scorer's output to produce a
/// [`QualityDecision`].
pub struct QualityGate<'a> {
    scorer: &'a dyn QualityScorer,
    config: QualityConfig,
}

impl<'a> QualityGate<'a> {
    /// Build a gate from a scorer and threshold configuration.
    pub fn new(scorer: &'a dyn QualityScorer, config: QualityConfig) -> Self {
        Self { scorer, config }
    }

    /// Evaluate a step's result, given how many attempts (including this
    /// one) have already been spent on the step.
    ///
    /// Decision table (spec §4.6):
    /// - `score >= target` → approve.
    /// - `target - review_band <= score < target` → ambiguous, request
    ///   review.
    /// - `min <= score < target - review_band` → approve with warning.
    /// - `score < min` → retry while `attempts < max_attempts`, else
    ///   reject.
    pub fn evaluate(&self, step_id: StepId, result: &StepResultPayload, attempts: u32) -> QualityDecision {
        let score = self.scorer.score(step_id, result);
        let review_floor = (self.config.target - self.config.review_band).max(self.config.min);

        if score >= self.config.target {
            QualityDecision::Approve {
                score,
                warned: false,
            }
        } else if score >= review_floor {
            QualityDecision::RequestReview {
                score,
                reason: format!(
                    "score {score:.2} is within the review band below target {:.2}",
                    self.config.target
                ),
            }
        } else if score >= self.config.min {
            QualityDecision::Approve {
                score,
                warned: true,
            }
        } else if attempts < self.config.max_attempts {
            QualityDecision::Retry {
                score,
                reason: format!(
                    "score {score:.2} is below minimum {:.2} (attempt {attempts} of {})",
                    self.config.min, self.config.max_attempts
                ),
            }
        } else {
            QualityDecision::Reject {
                score,
                attempts,
                reason: format!(
                    "score {score:.2} is below minimum {:.2} after {attempts} attempt(s)",
                    self.config.min
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct FixedScorer(f64);
    impl QualityScorer for FixedScorer {
        fn score(&self, _step_id: StepId, _result: &StepResultPayload) -> f64 {
            self.0
        }
    }

    fn config() -> QualityConfig {
        QualityConfig {
            target: 0.8,
            min: 0.4,
            review_band: 0.1,
            max_attempts: 3,
        }
    }

    fn dummy_result() -> StepResultPayload {
        StepResultPayload::Analysis {
            findings: BTreeMap::new(),
        }
    }

    #[test]
    fn high_score_is_approved_without_warning() {
        let scorer = FixedScorer(0.95);
        let gate = QualityGate::new(&scorer, config());
        let decision = gate.evaluate(StepId::new(), &dummy_result(), 1);
        assert!(matches!(decision, QualityDecision::Approve { warned: false, .. }));
    }

    #[test]
    fn score_in_review_band_requests_review() {
        let scorer = FixedScorer(0.75);
        let gate = QualityGate::new(&scorer, config());
        let decision = gate.evaluate(StepId::new(), &dummy_result(), 1);
        assert!(matches!(decision, QualityDecision::RequestReview { .. }));
    }

    #[test]
    fn score_above_min_but_below_review_band_is_approved_with_warning() {
        let scorer = FixedScorer(0.5);
        let gate = QualityGate::new(&scorer, config());
        let decision = gate.evaluate(StepId::new(), &dummy_result(), 1);
        assert!(matches!(decision, QualityDecision::Approve { warned: true, .. }));
    }

    #[test]
    fn low_score_retries_while_attempts_remain() {
        let scorer = FixedScorer(0.1);
        let gate = QualityGate::new(&scorer, config());
        let decision = gate.evaluate(StepId::new(), &dummy_result(), 1);
        assert!(matches!(decision, QualityDecision::Retry { .. }));
    }

    #[test]
    fn low_score_rejects_once_attempts_are_exhausted() {
        let scorer = FixedScorer(0.1);
        let gate = QualityGate::new(&scorer, config());
        let decision = gate.evaluate(StepId::new(), &dummy_result(), 3);
        assert!(matches!(decision, QualityDecision::Reject { .. }));
    }

    #[test]
    fn boundary_scores_lean_toward_the_higher_band() {
        let scorer = FixedScorer(0.8);
        let gate = QualityGate::new(&scorer, config());
        assert!(matches!(
            gate.evaluate(StepId::new(), &dummy_result(), 1),
            QualityDecision::Approve { warned: false, .. }
        ));

        let scorer = FixedScorer(0.4);
        let gate = QualityGate::new(&scorer, config());
        assert!(matches!(
            gate.evaluate(StepId::new(), &dummy_result(), 1),
            QualityDecision::Approve { warned: true, .. }
        ));
    }

    #[test]
    fn missing_upstream_scores_zero_under_passthrough() {
        let scorer = PassthroughScorer;
        let result = StepResultPayload::MissingUpstream {
            step_id: StepId::new(),
            reason: "dependency failed".into(),
        };
        assert_eq!(scorer.score(StepId::new(), &result), 0.0);
    }
}
