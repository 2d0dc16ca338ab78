//! C5 — typed step execution.
//!
//! Dispatches a [`ProcessStep`] to the [`StepHandler`] registered for its
//! [`StepType`], collecting the upstream [`StepResultPayload`]s its
//! dependencies produced first. Mirrors the teacher's `Node<S>` dispatch
//! pattern (`api.rs`): each handler is a small, independently testable
//! unit rather than one large match statement embedding all step logic.
//!
//! Handlers for pure, in-scope logic (`calculation`, `comparison`,
//! `validation`, `clarification_request`) ship with this module, since
//! they need nothing beyond the step's own parameters and its upstream
//! results. Handlers that need an external interface (retrieval,
//! generation) are built against the handles exposed on [`StepContext`]
//! rather than this crate owning a concrete implementation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{Error, PermanentError, Result};
use crate::generation::Generator;
use crate::retrieval::Retriever;
use crate::types::{ProcessStep, StepId, StepResultPayload, StepType};

/// Polled by long-running handlers to notice a plan-level cancellation
/// without the orchestrator having to forcibly abort the task.
pub trait CancellationCheck: Send + Sync {
    /// True if the plan this step belongs to has been cancelled.
    fn is_cancelled(&self) -> bool;
}

/// A check that never reports cancellation; used where a caller has no
/// plan-level control to wire in (e.g. a unit test exercising a handler
/// directly).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancelled;

impl CancellationCheck for NeverCancelled {
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// Callback a handler uses to emit a [`crate::types::ProgressEventKind::StepProgress`]
/// event partway through its own work, without needing to know about
/// [`crate::progress::ProgressStream`] directly.
pub type EmitProgress<'a> = dyn Fn(String) + Send + Sync + 'a;

/// Inputs available to a handler: the step definition, the results of its
/// already-completed dependencies, and handles onto the external
/// interfaces a handler may need (spec §4.5).
pub struct StepContext<'a> {
    /// The step being executed.
    pub step: &'a ProcessStep,
    /// Results of this step's dependencies. A dependency that failed but
    /// was optional (see [`ProcessStep::optional_dependencies`]) appears
    /// here as [`StepResultPayload::MissingUpstream`] rather than being
    /// absent from the map.
    pub upstream: BTreeMap<StepId, StepResultPayload>,
    /// Hybrid retrieval handle, for handlers that need to search (`Search`/
    /// `Retrieval` steps). Absent when the runner was not given one —
    /// handlers that need it should fail with
    /// [`PermanentError::UnsupportedOperation`] rather than panicking.
    pub retriever: Option<&'a Retriever<'a>>,
    /// Generation runtime handle, for handlers that synthesize prose.
    pub generator: Option<&'a dyn Generator>,
    /// Cancellation check, polled by handlers that do meaningfully
    /// interruptible work.
    pub cancellation: &'a dyn CancellationCheck,
    /// Emits a progress message for this step without blocking on it.
    pub emit_progress: &'a EmitProgress<'a>,
}

impl<'a> StepContext<'a> {
    /// Build a context with no retriever/generator and a no-op progress
    /// sink, useful for unit-testing handlers that don't need them.
    pub fn bare(step: &'a ProcessStep, upstream: BTreeMap<StepId, StepResultPayload>) -> Self {
        Self {
            step,
            upstream,
            retriever: None,
            generator: None,
            cancellation: &NEVER_CANCELLED,
            emit_progress: &NOOP_PROGRESS,
        }
    }

    /// Look up a specific dependency's result.
    pub fn upstream_result(&self, id: StepId) -> Option<&StepResultPayload> {
        self.upstream.get(&id)
    }

    /// All dependency results in the fixed order they were declared in the
    /// step's `depends_on` list.
    pub fn ordered_upstream(&self) -> Vec<&StepResultPayload> {
        self.step
            .depends_on
            .iter()
            .filter_map(|id| self.upstream.get(id))
            .collect()
    }
}

static NEVER_CANCELLED: NeverCancelled = NeverCancelled;
fn noop_progress(_message: String) {}
static NOOP_PROGRESS: fn(String) = noop_progress;

/// Executes the work for one [`StepType`].
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step, producing its result.
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload>;
}

/// Dispatches steps to registered handlers by [`StepType`].
#[derive(Default)]
pub struct StepRunner {
    handlers: BTreeMap<HandlerKey, Box<dyn StepHandler>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HandlerKey(u8);

fn key_for(step_type: StepType) -> HandlerKey {
    HandlerKey(match step_type {
        StepType::Search => 0,
        StepType::Retrieval => 1,
        StepType::Analysis => 2,
        StepType::Synthesis => 3,
        StepType::Comparison => 4,
        StepType::Validation => 5,
        StepType::Calculation => 6,
        StepType::Presentation => 7,
        StepType::QualityCheck => 8,
        StepType::FinalAnswer => 9,
        StepType::ClarificationRequest => 10,
    })
}

impl StepRunner {
    /// Build an empty runner with no handlers registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a runner with the handlers this crate ships for pure,
    /// in-scope logic already registered: `calculation`, `comparison`,
    /// `validation`, and `clarification_request`. A caller still needs to
    /// register handlers for the steps that call out to retrieval or
    /// generation, since this crate does not own those backends.
    pub fn with_builtin_handlers() -> Self {
        Self::new()
            .register(StepType::Calculation, CalculationHandler)
            .register(StepType::Comparison, ComparisonHandler)
            .register(StepType::Validation, ValidationHandler)
            .register(StepType::ClarificationRequest, ClarificationHandler)
    }

    /// Register a handler for a step type, replacing any previous
    /// registration for the same type.
    #[must_use]
    pub fn register(mut self, step_type: StepType, handler: impl StepHandler + 'static) -> Self {
        self.handlers.insert(key_for(step_type), Box::new(handler));
        self
    }

    /// Run a single step, given the context it should execute against.
    ///
    /// # Errors
    /// [`PermanentError::UnsupportedOperation`] if no handler is
    /// registered for the step's type.
    pub async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let handler = self
            .handlers
            .get(&key_for(ctx.step.step_type))
            .ok_or_else(|| Error::Permanent {
                step: ctx.step.id,
                source: PermanentError::UnsupportedOperation(format!(
                    "no handler registered for step type {:?}",
                    ctx.step.step_type
                )),
            })?;

        handler.run(ctx).await
    }
}

/// Deterministic numeric calculation over a single upstream `Retrieval`
/// result's scores (spec §4.2 `calculation` template: `compute` reads
/// `search_rates`'s output). Ships as a concrete handler because the
/// actual arithmetic is domain logic this crate owns, not an external
/// collaborator — unlike synthesis or search, there's no backend to call.
pub struct CalculationHandler;

#[async_trait]
impl StepHandler for CalculationHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let mut total = 0.0;
        let mut terms = 0usize;
        for result in ctx.upstream.values() {
            if let StepResultPayload::Retrieval { results } = result {
                for r in results {
                    total += r.score;
                    terms += 1;
                }
            }
        }

        (ctx.emit_progress)(format!("summed {terms} retrieved score(s)"));

        Ok(StepResultPayload::Calculation {
            value: total,
            detail: format!("sum of {terms} upstream retrieval score(s)"),
        })
    }
}

/// Structured diff between every upstream result the step depends on
/// (spec §4.2 `comparison` template: `compare` depends on every
/// `analyze_*` step and produces the final structured comparison).
pub struct ComparisonHandler;

#[async_trait]
impl StepHandler for ComparisonHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let mut diff = BTreeMap::new();
        for (i, dep_id) in ctx.step.depends_on.iter().enumerate() {
            let rendered = match ctx.upstream.get(dep_id) {
                Some(StepResultPayload::Synthesis { text }) => text.clone(),
                Some(StepResultPayload::Analysis { findings }) => findings
                    .values()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join("; "),
                Some(StepResultPayload::MissingUpstream { reason, .. }) => {
                    format!("unavailable: {reason}")
                }
                Some(other) => format!("{other:?}"),
                None => "unavailable: no result".to_string(),
            };
            diff.insert(format!("entity_{i}"), rendered);
        }

        Ok(StepResultPayload::Comparison { diff })
    }
}

/// Validates an upstream result against the simplest rule this crate can
/// check without calling an external interface: that it exists and isn't
/// itself a [`StepResultPayload::MissingUpstream`] sentinel. A caller
/// needing domain-specific validation (e.g. "the cited statute section
/// exists in this jurisdiction") registers its own handler instead.
pub struct ValidationHandler;

#[async_trait]
impl StepHandler for ValidationHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let upstream = ctx.ordered_upstream();
        if upstream.is_empty() {
            return Ok(StepResultPayload::Validation {
                valid: false,
                detail: "no upstream result to validate".to_string(),
            });
        }

        let missing: Vec<&str> = upstream
            .iter()
            .filter_map(|r| match r {
                StepResultPayload::MissingUpstream { reason, .. } => Some(reason.as_str()),
                _ => None,
            })
            .collect();

        if missing.is_empty() {
            Ok(StepResultPayload::Validation {
                valid: true,
                detail: format!("{} upstream result(s) present", upstream.len()),
            })
        } else {
            Ok(StepResultPayload::Validation {
                valid: false,
                detail: format!("missing upstream: {}", missing.join("; ")),
            })
        }
    }
}

/// Terminal handler for a [`StepType::ClarificationRequest`] step: echoes
/// the gaps [`crate::process::ProcessBuilder`] already recorded in the
/// step's parameters back out as a typed result, rather than running any
/// further logic.
pub struct ClarificationHandler;

#[async_trait]
impl StepHandler for ClarificationHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let missing_information = ctx
            .step
            .parameters
            .get("missing_information")
            .map(|joined| joined.split('|').map(str::to_string).collect())
            .unwrap_or_default();

        Ok(StepResultPayload::ClarificationRequest {
            missing_information,
            form_schema: ctx
                .step
                .parameters
                .get("clarification")
                .cloned()
                .unwrap_or_else(|| "clarification_request_default".to_string()),
        })
    }
}

/// Synthesizes prose from every upstream result via the generation
/// runtime. Ships here, rather than as a test-only fixture, because the
/// shape ("concatenate upstream text, hand it to the generator as
/// context") is the same regardless of which generation backend a caller
/// wires in; a caller wanting different prompting registers its own
/// handler in its place.
pub struct GenerationSynthesisHandler {
    prompt: String,
}

impl GenerationSynthesisHandler {
    /// Build a handler that asks the generator to synthesize with the
    /// given system prompt.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

#[async_trait]
impl StepHandler for GenerationSynthesisHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let generator = ctx.generator.ok_or_else(|| Error::Permanent {
            step: ctx.step.id,
            source: PermanentError::UnsupportedOperation(
                "synthesis step requires a generation handle, none was provided".to_string(),
            ),
        })?;

        let context: Vec<String> = ctx
            .ordered_upstream()
            .into_iter()
            .map(|r| format!("{r:?}"))
            .collect();

        if ctx.cancellation.is_cancelled() {
            return Err(Error::Cancelled(format!("step {} cancelled before synthesis ran", ctx.step.id)));
        }

        (ctx.emit_progress)("calling generation runtime".to_string());

        let response = generator
            .generate(crate::generation::GenerationRequest {
                prompt: self.prompt.clone(),
                context,
            })
            .await?;

        Ok(StepResultPayload::Synthesis {
            text: response.text,
        })
    }
}

/// Runs an already-built [`Retriever`] for the step's `query` parameter.
/// Ships here for the same reason [`GenerationSynthesisHandler`] does:
/// the dispatch shape is identical no matter which backend is wired in.
pub struct RetrievalHandler {
    retriever: Arc<Retriever<'static>>,
}

impl RetrievalHandler {
    /// Build a handler around a retriever with a `'static` lifetime (the
    /// retriever's backends/expander/reranker must outlive the runner).
    pub fn new(retriever: Arc<Retriever<'static>>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl StepHandler for RetrievalHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        let query = ctx
            .step
            .parameters
            .get("query")
            .cloned()
            .unwrap_or_else(|| ctx.step.name.clone());

        let results = self.retriever.retrieve(ctx.step.id, &query).await?;
        Ok(StepResultPayload::Retrieval { results })
    }
}
