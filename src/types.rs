//! Core data model shared by every component.
//!
//! These types are intentionally plain data: components transform them, but
//! none of them own behavior beyond small constructors and predicates. Typed
//! `StepResultPayload` variants (rather than an untyped JSON blob) keep
//! downstream handlers from having to guess at the shape of upstream output.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque identifier for a single step within a [`ProcessTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StepId(pub Uuid);

impl StepId {
    /// Generate a fresh, random step id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for StepId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for an orchestrated plan (one query's full execution).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PlanId(pub Uuid);

impl PlanId {
    /// Generate a fresh, random plan id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for PlanId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for PlanId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user's incoming question, prior to any analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Query {
    /// Raw question text as submitted.
    pub text: String,
    /// Jurisdiction hint supplied by the caller, if any (e.g. a state or
    /// municipality code). Analysis may refine or override this.
    pub jurisdiction_hint: Option<String>,
    /// Arbitrary caller-supplied metadata (user id, locale, ...). Opaque to
    /// every component except whatever external glue reads it back out.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl Query {
    /// Build a query from raw text with no hints or metadata.
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            jurisdiction_hint: None,
            metadata: BTreeMap::new(),
        }
    }
}

/// Half-open byte offset range `[start, end)` into the source text an
/// entity or span-bearing signal was extracted from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    /// Offset of the first byte.
    pub start: usize,
    /// Offset one past the last byte.
    pub end: usize,
}

impl Span {
    /// Build a span from a start/end pair.
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}

/// A single extracted entity (statute reference, agency name, date, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Entity category, e.g. `"statute"`, `"agency"`, `"date"`.
    pub kind: String,
    /// Surface text as it appeared in the query.
    pub text: String,
    /// Source offset range the text was extracted from.
    pub span: Span,
    /// Per-entity extraction confidence in `[0.0, 1.0]`.
    pub confidence: f64,
}

/// Result of analyzing a [`Query`]: the C1 Analyzer's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Analysis {
    /// Coarse intent label, used to select a process template (C2).
    pub intent: String,
    /// Grammatical shape of the question (what/who/where/when/how/why/
    /// yes_no/comparison/statement), independent of `intent` — two
    /// questions can share an intent but differ in how they expect the
    /// answer to be framed.
    #[serde(default = "default_question_type")]
    pub question_type: String,
    /// Entities extracted from the query text.
    pub entities: Vec<Entity>,
    /// Resolved jurisdiction, defaulting to the query's hint when analysis
    /// could not refine it further.
    pub jurisdiction: Option<String>,
    /// Ambiguity score in `[0.0, 1.0]`; higher means the query is less
    /// clearly scoped and more likely to need clarification.
    pub ambiguity: f64,
    /// Analyzer's confidence in `intent`/`question_type`/`entities`, in
    /// `[0.0, 1.0]`. Distinct from `ambiguity`: a query can be unambiguous
    /// in scope yet still classified with low confidence (e.g. an intent
    /// near a keyword-table tie).
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    /// Free-form parameters extracted for template instantiation (C2),
    /// e.g. `{"statute": "ABC 12.34"}`.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

fn default_question_type() -> String {
    "statement".to_string()
}

fn default_confidence() -> f64 {
    1.0
}

impl Analysis {
    /// True when the ambiguity score crosses the threshold at which the
    /// hypothesis service should recommend clarification.
    pub fn is_ambiguous(&self, threshold: f64) -> bool {
        self.ambiguity >= threshold
    }
}

/// How badly a [`Hypothesis`]'s missing piece of information blocks
/// proceeding without clarification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingInfoSeverity {
    /// Execution cannot proceed sensibly without this; a
    /// `clarification_request` should short-circuit the plan.
    Critical,
    /// Execution can proceed, but the answer should flag the assumption made.
    Important,
    /// Would sharpen the answer, not worth interrupting the user for.
    Optional,
}

/// A single gap the hypothesis service noticed in the query, before any
/// retrieval has run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissingInformation {
    /// What is missing, in human-readable form, e.g. `"jurisdiction"`.
    pub item: String,
    /// How much it matters.
    pub severity: MissingInfoSeverity,
}

/// Coarse estimate of how much generation work answering a query will take,
/// used only to size a token budget — not a scheduling priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ComplexityTier {
    /// A single fact lookup or definition.
    Simple,
    /// Requires synthesizing a few related findings.
    Moderate,
    /// Multi-step reasoning: comparisons, calculations, or multi-jurisdiction
    /// questions.
    Complex,
}

/// A candidate answer hypothesis produced before any retrieval or execution
/// takes place (C11), used to decide whether to ask the user a clarifying
/// question up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Short statement of the hypothesized answer shape.
    pub summary: String,
    /// Confidence in `[0.0, 1.0]` that execution will bear this out.
    pub confidence: f64,
    /// Facts the final answer must cover to be considered complete.
    #[serde(default)]
    pub required_criteria: Vec<String>,
    /// Summaries of evidence already retrieved during the cheap
    /// preliminary pass this hypothesis was estimated from. Empty when
    /// estimation ran without one.
    #[serde(default)]
    pub available_information: Vec<String>,
    /// Gaps noticed in the query, ranked by severity.
    #[serde(default)]
    pub missing_information: Vec<MissingInformation>,
    /// Clarifying question to surface to the user, if confidence is low
    /// enough that proceeding without clarification risks wasted work.
    pub clarification: Option<String>,
    /// Coarse estimate of how much generation work this query will need.
    pub estimated_complexity: ComplexityTier,
    /// Token budget to hand the generation runtime, looked up from a fixed
    /// table keyed by `estimated_complexity` (spec §4.11).
    pub recommended_token_budget: u32,
}

impl Hypothesis {
    /// True if a clarifying question should be surfaced before execution.
    pub fn needs_clarification(&self) -> bool {
        self.clarification.is_some()
    }

    /// True if any missing piece of information is critical — the signal
    /// C2's `ProcessBuilder` uses to short-circuit to a
    /// `clarification_request` step instead of the normal template.
    pub fn has_critical_gap(&self) -> bool {
        self.missing_information
            .iter()
            .any(|m| m.severity == MissingInfoSeverity::Critical)
    }

    /// Human-readable descriptions of every critical gap, for display in a
    /// `clarification_request` step's parameters.
    pub fn critical_gap_descriptions(&self) -> Vec<String> {
        self.missing_information
            .iter()
            .filter(|m| m.severity == MissingInfoSeverity::Critical)
            .map(|m| m.item.clone())
            .collect()
    }
}

/// Declares what kind of work a [`ProcessStep`] performs; selects which
/// handler the StepRunner (C5) dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepType {
    /// Free-text or structured search against an external index.
    Search,
    /// Hybrid retrieval with fusion/re-ranking (C4).
    Retrieval,
    /// Further analysis of already-retrieved material.
    Analysis,
    /// Synthesis of multiple upstream results into prose.
    Synthesis,
    /// Structured comparison between two or more upstream results.
    Comparison,
    /// Validation of an upstream result against a rule or constraint.
    Validation,
    /// Numeric or symbolic calculation.
    Calculation,
    /// Formatting/presentation of upstream results for the final answer.
    Presentation,
    /// Explicit quality check gating downstream steps.
    QualityCheck,
    /// Terminal step producing the plan's final answer.
    FinalAnswer,
    /// Terminal step short-circuiting the plan to ask the user a
    /// clarifying question instead of executing a template (C2, C11).
    ClarificationRequest,
}

/// A single node in a [`ProcessTree`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessStep {
    /// Unique id of this step within its tree.
    pub id: StepId,
    /// Human-readable label, e.g. `"retrieve_primary_sources"`.
    pub name: String,
    /// What kind of work this step performs.
    pub step_type: StepType,
    /// Ids of steps that must complete before this one may run.
    pub depends_on: Vec<StepId>,
    /// Step-type-specific parameters (query text, filters, thresholds, ...).
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    /// If true, a [`StepResultPayload::MissingUpstream`] from a dependency
    /// does not block this step from running; it runs with that dependency
    /// absent instead of being marked unreachable.
    #[serde(default)]
    pub optional_dependencies: bool,
}

/// A complete, immutable plan: the output of C2 ProcessBuilder and the
/// input to C3 DependencyResolver. Once built, a tree's steps and edges
/// never change; replanning produces a new tree (see DESIGN.md Open
/// Question 2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessTree {
    /// Plan this tree belongs to.
    pub plan_id: PlanId,
    /// All steps in the tree, keyed by id for O(1) lookup.
    pub steps: BTreeMap<StepId, ProcessStep>,
    /// Root step ids: steps with no dependencies.
    pub roots: Vec<StepId>,
}

impl ProcessTree {
    /// Look up a step by id.
    pub fn step(&self, id: StepId) -> Option<&ProcessStep> {
        self.steps.get(&id)
    }

    /// Total number of steps in the tree.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// True if the tree has no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Similarity metric used to score a retrieved document against a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimilarityMetric {
    /// Cosine similarity between dense embeddings.
    Cosine,
    /// Euclidean (L2) distance between dense embeddings.
    Euclidean,
    /// Sparse/lexical score (e.g. BM25).
    Lexical,
}

/// A single retrieved document chunk, scored against a query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalResult {
    /// Identifier of the source document.
    pub document_id: String,
    /// Retrieved text chunk.
    pub text: String,
    /// Relevance score; larger is more relevant regardless of metric.
    pub score: f64,
    /// Metric that produced the score.
    pub metric: SimilarityMetric,
    /// 1-based rank within the result list the score was drawn from, used
    /// as fusion input by the RRF combiner.
    pub rank: usize,
}

/// Who produced a piece of evidence included in the final answer, carried
/// through aggregation (C10) for citation purposes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ownership {
    /// Step that produced this evidence.
    pub step_id: StepId,
    /// Document the evidence was drawn from, if applicable.
    pub document_id: Option<String>,
}

/// Lifecycle status of a step within a running plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Not yet eligible to run (dependencies incomplete).
    Pending,
    /// Eligible and waiting for a worker slot.
    Ready,
    /// Currently executing.
    Running,
    /// Completed successfully.
    Completed,
    /// Failed after exhausting retries or on a permanent error.
    Failed,
    /// Skipped because an optional dependency failed (see
    /// [`ProcessStep::optional_dependencies`]).
    Skipped,
    /// Stopped because the plan was cancelled; distinct from `Skipped`
    /// (dependency failure) and `Failed` (ran and errored out).
    Cancelled,
    /// The quality gate escalated this step's result for human review; it
    /// is not `Completed` and not visible to dependents until a `resume`
    /// or `intervene` call resolves it.
    AwaitingReview,
}

/// Typed output of a step execution; one variant per [`StepType`] plus the
/// `MissingUpstream` sentinel for tolerable upstream failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StepResultPayload {
    /// Output of a [`StepType::Search`] or [`StepType::Retrieval`] step.
    Retrieval {
        /// Retrieved, fused, and (optionally) re-ranked results.
        results: Vec<RetrievalResult>,
    },
    /// Output of a [`StepType::Analysis`] step: free-form structured findings.
    Analysis {
        /// Findings keyed by label.
        findings: BTreeMap<String, String>,
    },
    /// Output of a [`StepType::Synthesis`] step.
    Synthesis {
        /// Synthesized prose.
        text: String,
    },
    /// Output of a [`StepType::Comparison`] step.
    Comparison {
        /// Structured diff between compared inputs, keyed by field.
        diff: BTreeMap<String, String>,
    },
    /// Output of a [`StepType::Validation`] step.
    Validation {
        /// Whether the validated input satisfied the rule.
        valid: bool,
        /// Explanation, populated especially when invalid.
        detail: String,
    },
    /// Output of a [`StepType::Calculation`] step.
    Calculation {
        /// Computed numeric value.
        value: f64,
        /// Human-readable description of the calculation performed.
        detail: String,
    },
    /// Output of a [`StepType::Presentation`] step.
    Presentation {
        /// Rendered text ready for inclusion in the final answer.
        rendered: String,
    },
    /// Output of a [`StepType::QualityCheck`] step.
    QualityCheck {
        /// Score in `[0.0, 1.0]` assigned by the check.
        score: f64,
    },
    /// Output of the plan's [`StepType::FinalAnswer`] step.
    FinalAnswer {
        /// Final answer text.
        text: String,
        /// Evidence ownership trail backing the answer.
        citations: Vec<Ownership>,
    },
    /// Sentinel produced in place of a real result when an optional
    /// dependency failed; downstream handlers and the Aggregator both
    /// recognize this explicitly rather than treating it as success.
    MissingUpstream {
        /// The step that failed to produce a result.
        step_id: StepId,
        /// Human-readable reason it is missing.
        reason: String,
    },
    /// Output of a [`StepType::ClarificationRequest`] step: not prose, a
    /// form the caller should present to the user before anything else runs.
    ClarificationRequest {
        /// Descriptions of the critical gaps that triggered the request.
        missing_information: Vec<String>,
        /// Opaque form-schema identifier/payload the caller's UI renders;
        /// this crate does not own form rendering, only what to ask for.
        form_schema: String,
    },
}

/// One entry in a plan's intervention audit log (spec §4.8/§6): who did
/// what, when, and a before/after integrity marker so a restored
/// checkpoint can be checked against what the log claims happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterventionLogEntry {
    /// Who applied the intervention (a user id, service account, or
    /// `"system"` for an orchestrator-initiated action like a cancel).
    pub actor: String,
    /// When the intervention was applied.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// What was done, e.g. `"retry_step"` or `"plan cancelled"`.
    pub action: String,
    /// Non-cryptographic checksum of the plan's step statuses/results
    /// immediately before the intervention was applied.
    pub before_hash: String,
    /// Same checksum immediately after.
    pub after_hash: String,
}

/// Why a plan ended in [`ProgressEventKind::PlanFailed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanFailureCause {
    /// Cancelled by explicit request.
    Cancelled,
    /// The plan's overall wall-clock budget elapsed before completion.
    DeadlineExceeded,
    /// A step was rejected by the quality gate with no path around it.
    QualityRejected,
    /// An unrecoverable internal error.
    Internal,
}

/// A single event in the ordered, replayable progress stream (C9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Plan this event belongs to.
    pub plan_id: PlanId,
    /// Monotonically increasing sequence number within the plan, starting
    /// at 0. Consumers use this to detect gaps after a reconnect.
    pub sequence: u64,
    /// What happened.
    pub kind: ProgressEventKind,
    /// Wall-clock offset from plan start, for display purposes.
    pub elapsed: Duration,
}

/// The kind of thing a [`ProgressEvent`] reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ProgressEventKind {
    /// The plan began executing.
    PlanStarted,
    /// A dependency level became ready to run.
    LevelStarted {
        /// 0-based level index.
        level: usize,
        /// Steps scheduled in this level.
        steps: Vec<StepId>,
    },
    /// A step transitioned to a new status.
    StepStatusChanged {
        /// The step in question.
        step_id: StepId,
        /// Its new status.
        status: StepStatus,
    },
    /// A step is being retried.
    StepRetrying {
        /// The step being retried.
        step_id: StepId,
        /// Attempt number about to be made (1-based).
        attempt: u32,
    },
    /// A human intervention (pause/resume/cancel/review) was applied.
    InterventionApplied {
        /// Description of the intervention.
        detail: String,
    },
    /// The plan finished, successfully or not.
    PlanFinished {
        /// True if the plan produced a final answer.
        succeeded: bool,
    },
    /// The plan failed outright rather than finishing with partial results.
    PlanFailed {
        /// Why the plan failed.
        cause: PlanFailureCause,
        /// Human-readable detail.
        detail: String,
    },
    /// The plan paused pending a human resume or intervention.
    PlanPaused,
    /// A paused plan resumed execution.
    PlanResumed,
    /// Fine-grained progress within a still-running step, distinct from
    /// [`ProgressEventKind::StepStatusChanged`].
    StepProgress {
        /// The step reporting progress.
        step_id: StepId,
        /// Human-readable progress message.
        message: String,
    },
    /// The quality gate evaluated a step's result.
    QualityCheck {
        /// The step whose result was evaluated.
        step_id: StepId,
        /// The gate's decision label (`"approve"`/`"retry"`/
        /// `"request_review"`/`"reject"`).
        decision: String,
        /// Per-dimension scores backing the decision. This core's
        /// [`crate::quality::QualityScorer`] produces a single overall
        /// dimension, so this map carries one `"overall"` entry; a scorer
        /// that breaks scoring into named dimensions can populate more.
        dimension_scores: BTreeMap<String, f64>,
    },
    /// A step's result was escalated to human review and the plan is now
    /// paused awaiting a decision.
    ReviewRequired {
        /// The step awaiting review.
        step_id: StepId,
        /// Why it was escalated.
        reason: String,
    },
    /// An internal fault in the streaming/control plane itself, not in
    /// plan execution (e.g. a subscriber falling behind the replay
    /// buffer).
    SystemError {
        /// Description of the fault.
        detail: String,
    },
}

/// Snapshot of an in-flight plan's state, sufficient to resume it exactly
/// (C8 Orchestrator). Produced on every level transition and on every
/// intervention (see DESIGN.md Open Question 4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Plan this checkpoint belongs to.
    pub plan_id: PlanId,
    /// The tree being executed, captured verbatim.
    pub tree_structure: ProcessTree,
    /// Status of every step at the time of the snapshot.
    pub step_statuses: BTreeMap<StepId, StepStatus>,
    /// Completed results, for steps that have finished.
    pub step_results: BTreeMap<StepId, StepResultPayload>,
    /// Index of the dependency level currently executing or about to run.
    pub level_cursor: usize,
    /// History of interventions applied so far, oldest first.
    pub intervention_log: Vec<InterventionLogEntry>,
}
