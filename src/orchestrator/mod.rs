//! C8 — bounded-concurrency orchestrator.
//!
//! Drives a [`ProcessTree`] through [`DependencyResolver`] leveling,
//! dispatching each level's steps to [`StepRunner`] with at most
//! `config.max_concurrency` running at once (a `tokio::sync::Semaphore`,
//! the same primitive the teacher's executor uses to bound concurrent
//! node execution), applying [`QualityGate`]/[`RetryPolicy`] to each
//! result, checkpointing at level boundaries and on every intervention,
//! and publishing a [`ProgressEvent`] for every state change. Supports
//! pause, resume, and cancel from outside the driving task via a shared
//! [`PlanControl`] handle.

pub mod checkpoint;
pub mod intervention;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::aggregator::Aggregator;
use crate::config::Config;
use crate::dependency::DependencyResolver;
use crate::error::{Error, Result};
use crate::generation::Generator;
use crate::persistence::CheckpointStore;
use crate::progress::ProgressStream;
use crate::quality::{QualityDecision, QualityGate, QualityScorer};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::step_runner::{CancellationCheck, StepContext, StepRunner};
use crate::types::{
    Checkpoint, InterventionLogEntry, PlanFailureCause, ProcessTree, ProgressEventKind, StepId,
    StepResultPayload, StepStatus,
};

pub use intervention::InterventionAction;

/// Shared inbox of interventions an external caller has queued but the
/// driving task has not yet applied.
type InterventionInbox = Arc<Mutex<VecDeque<InterventionAction>>>;

/// Shared pause/cancel flags for one in-flight plan. Cheap to clone and
/// safe to hold from outside the task driving execution.
#[derive(Clone, Default)]
pub struct PlanControl {
    paused: Arc<AtomicBool>,
    cancelled: Arc<AtomicBool>,
}

impl PlanControl {
    /// Request the plan pause before its next level starts.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Clear a pending pause, allowing the next level to proceed.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Request the plan stop entirely; in-flight steps are allowed to
    /// finish but no further levels are started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// True if a cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// True if a pause is currently in effect.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}

impl CancellationCheck for PlanControl {
    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Non-cryptographic checksum over a plan's current status/result state,
/// used as the before/after marker on an [`InterventionLogEntry`].
fn state_checksum(
    statuses: &BTreeMap<StepId, StepStatus>,
    results: &BTreeMap<StepId, StepResultPayload>,
) -> String {
    let encoded = bincode::serialize(&(statuses, results)).unwrap_or_default();
    format!("{:08x}", crc32fast::hash(&encoded))
}

/// Apply one queued [`InterventionAction`] to the plan's mutable state,
/// returning a human-readable description for the intervention log and
/// progress stream.
fn apply_intervention(
    tree: &mut ProcessTree,
    statuses: &mut BTreeMap<StepId, StepStatus>,
    results: &mut BTreeMap<StepId, StepResultPayload>,
    preferred_order: &mut Vec<StepId>,
    action: InterventionAction,
) -> String {
    match action {
        InterventionAction::RetryStep(step_id) => {
            statuses.insert(step_id, StepStatus::Pending);
            results.remove(&step_id);
            format!("retry_step({step_id})")
        }
        InterventionAction::SkipStep(step_id) => {
            statuses.insert(step_id, StepStatus::Skipped);
            results.remove(&step_id);
            format!("skip_step({step_id})")
        }
        InterventionAction::ModifyStep { step_id, patch } => {
            if let Some(step) = tree.steps.get_mut(&step_id) {
                step.parameters.extend(patch);
            }
            format!("modify_step({step_id})")
        }
        InterventionAction::AddStep(step) => {
            let step_id = step.id;
            if step.depends_on.is_empty() {
                tree.roots.push(step_id);
            }
            tree.steps.insert(step_id, step);
            statuses.insert(step_id, StepStatus::Pending);
            format!("add_step({step_id})")
        }
        InterventionAction::RemoveStep(step_id) => {
            tree.steps.remove(&step_id);
            tree.roots.retain(|id| *id != step_id);
            for step in tree.steps.values_mut() {
                step.depends_on.retain(|dep| *dep != step_id);
            }
            statuses.remove(&step_id);
            results.remove(&step_id);
            format!("remove_step({step_id})")
        }
        InterventionAction::ReorderSteps(ids) => {
            let description = format!("reorder_steps({})", ids.len());
            *preferred_order = ids;
            description
        }
    }
}

/// Initial state a plan starts execution from: empty for a fresh
/// [`Orchestrator::execute`], or re-hydrated from a [`Checkpoint`] for
/// [`Orchestrator::resume`].
#[derive(Default)]
struct PlanResumeState {
    statuses: BTreeMap<StepId, StepStatus>,
    results: BTreeMap<StepId, StepResultPayload>,
    intervention_log: Vec<InterventionLogEntry>,
    start_level: usize,
}

/// A handle to an in-flight or finished plan: its control flags, its
/// progress stream, and a future resolving to the final aggregated
/// answer.
pub struct PlanHandle {
    /// Pause/cancel control for this plan.
    pub control: PlanControl,
    /// Ordered, replayable progress events for this plan.
    pub progress: Arc<ProgressStream>,
    interventions: InterventionInbox,
    join: tokio::task::JoinHandle<Result<crate::aggregator::AggregatedAnswer>>,
}

impl PlanHandle {
    /// Await the plan's completion.
    pub async fn join(self) -> Result<crate::aggregator::AggregatedAnswer> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("orchestrator task panicked: {e}")))?
    }

    /// Queue a tree mutation (spec §4.8 `intervene`). Applied at the start
    /// of the next level boundary the driving task reaches, under the
    /// same write-lock-then-checkpoint discipline as a plan-level pause:
    /// the tree is mutated, levels are recomputed from the current cursor
    /// onward, and a checkpoint is written before the level proceeds.
    pub fn intervene(&self, action: InterventionAction) {
        self.interventions.lock().push_back(action);
    }
}

/// Drives execution of process trees.
pub struct Orchestrator {
    config: Config,
    step_runner: Arc<StepRunner>,
    scorer: Arc<dyn QualityScorer>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    generator: Option<Arc<dyn Generator>>,
    metrics: crate::telemetry::Metrics,
    /// Control handles for every plan currently running, so
    /// [`Orchestrator::shutdown`] can cancel them all at once. Entries are
    /// removed by the driving task itself as each plan exits.
    active_plans: Arc<dashmap::DashMap<crate::types::PlanId, PlanControl>>,
}

impl Orchestrator {
    /// Build an orchestrator from its configuration and collaborators.
    pub fn new(
        config: Config,
        step_runner: StepRunner,
        scorer: Arc<dyn QualityScorer>,
    ) -> Self {
        Self {
            config,
            step_runner: Arc::new(step_runner),
            scorer,
            checkpoint_store: None,
            generator: None,
            metrics: crate::telemetry::Metrics::new(),
            active_plans: Arc::new(dashmap::DashMap::new()),
        }
    }

    /// Attach durable checkpoint storage. Without one, no checkpoint is
    /// computed or written at level boundaries or interventions, and
    /// [`Self::resume`] has nothing to load.
    #[must_use]
    pub fn with_checkpoint_store(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoint_store = Some(store);
        self
    }

    /// Attach a generation backend, made available to handlers as
    /// `StepContext::generator`. Without one, handlers that need to
    /// synthesize prose must fail with `PermanentError::UnsupportedOperation`.
    #[must_use]
    pub fn with_generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    /// Metrics counters accumulated across every plan this orchestrator
    /// has run.
    pub fn metrics(&self) -> &crate::telemetry::Metrics {
        &self.metrics
    }

    /// Begin executing a process tree, returning immediately with a
    /// handle; the plan runs on a spawned task.
    pub fn execute(&self, tree: ProcessTree) -> Result<PlanHandle> {
        let (levels, _warnings) = DependencyResolver::new().resolve(&tree)?;
        self.spawn_plan(tree, levels, PlanResumeState::default())
    }

    /// Re-hydrate a plan from its most recently persisted checkpoint and
    /// continue execution from `level_cursor` (spec.md §4.8/§6
    /// `restore(snapshot) → handle`). Requires a checkpoint store to have
    /// been attached via [`Self::with_checkpoint_store`].
    ///
    /// Quality scores and review reasons for already-completed steps are
    /// not part of the persisted [`Checkpoint`] (spec.md §3) and so do not
    /// carry over; the Aggregator's confidence computation simply omits
    /// those steps from its median rather than treating them as unscored
    /// failures.
    pub async fn resume(&self, plan_id: crate::types::PlanId) -> Result<PlanHandle> {
        let store = self.checkpoint_store.clone().ok_or_else(|| {
            Error::Internal("resume requires a checkpoint store".to_string())
        })?;
        let wrapped = store.load(plan_id).await?.ok_or_else(|| {
            Error::Internal(format!("no checkpoint found for plan {plan_id}"))
        })?;
        let checkpoint = checkpoint::unwrap(&wrapped)?;

        let (levels, _warnings) = DependencyResolver::new().resolve(&checkpoint.tree_structure)?;
        let resume = PlanResumeState {
            statuses: checkpoint.step_statuses,
            results: checkpoint.step_results,
            intervention_log: checkpoint.intervention_log,
            start_level: checkpoint.level_cursor,
        };
        self.spawn_plan(checkpoint.tree_structure, levels, resume)
    }

    fn spawn_plan(
        &self,
        tree: ProcessTree,
        levels: crate::dependency::ExecutionLevels,
        resume: PlanResumeState,
    ) -> Result<PlanHandle> {
        let control = PlanControl::default();
        let progress = ProgressStream::new(tree.plan_id, self.config.stream_buffer_size);

        let config = self.config.clone();
        let step_runner = self.step_runner.clone();
        let scorer = self.scorer.clone();
        let checkpoint_store = self.checkpoint_store.clone();
        let generator = self.generator.clone();
        let metrics = self.metrics.clone();
        let control_for_task = control.clone();
        let progress_for_task = progress.clone();

        let plan_id = tree.plan_id;
        self.active_plans.insert(plan_id, control.clone());
        let active_plans = self.active_plans.clone();
        let interventions: InterventionInbox = Arc::new(Mutex::new(VecDeque::new()));
        let interventions_for_task = interventions.clone();

        let join = tokio::spawn(async move {
            let outcome = run_plan(
                tree,
                levels,
                config,
                step_runner,
                scorer,
                checkpoint_store,
                generator,
                metrics,
                control_for_task,
                progress_for_task,
                interventions_for_task,
                resume,
            )
            .await;
            active_plans.remove(&plan_id);
            outcome
        });

        Ok(PlanHandle {
            control,
            progress,
            interventions,
            join,
        })
    }

    /// Cancel every plan currently in flight and wait for each to exit at
    /// its next suspension point, distinct from [`PlanControl::cancel`]
    /// which only affects one plan. Intended for orderly process shutdown;
    /// a plan started after this call begins is unaffected.
    pub async fn shutdown(&self) {
        for entry in self.active_plans.iter() {
            entry.value().cancel();
        }
        while !self.active_plans.is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_plan(
    tree: ProcessTree,
    levels: crate::dependency::ExecutionLevels,
    config: Config,
    step_runner: Arc<StepRunner>,
    scorer: Arc<dyn QualityScorer>,
    checkpoint_store: Option<Arc<dyn CheckpointStore>>,
    generator: Option<Arc<dyn Generator>>,
    metrics: crate::telemetry::Metrics,
    control: PlanControl,
    progress: Arc<ProgressStream>,
    interventions: InterventionInbox,
    resume: PlanResumeState,
) -> Result<crate::aggregator::AggregatedAnswer> {
    let plan_id = tree.plan_id;
    let deadline = Instant::now() + config.per_plan_timeout;

    progress.publish(ProgressEventKind::PlanStarted);

    let mut tree = tree;
    let mut statuses: BTreeMap<StepId, StepStatus> = if resume.statuses.is_empty() {
        tree.steps
            .keys()
            .map(|id| (*id, StepStatus::Pending))
            .collect()
    } else {
        resume.statuses
    };
    let mut results: BTreeMap<StepId, StepResultPayload> = resume.results;
    let mut quality_scores: BTreeMap<StepId, f64> = BTreeMap::new();
    let mut review_flags: BTreeMap<StepId, String> = BTreeMap::new();
    let mut intervention_log: Vec<InterventionLogEntry> = resume.intervention_log;
    let mut was_paused = false;
    let mut preferred_order: Vec<StepId> = Vec::new();

    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    let quality_config = config.quality.clone();
    let retry_policy = RetryPolicy::new(config.retry.clone());

    let mut levels = levels;
    let mut level_index = resume.start_level;

    while level_index < levels.levels().len() {
        if control.is_cancelled() {
            let before = state_checksum(&statuses, &results);
            intervention_log.push(InterventionLogEntry {
                actor: "system".to_string(),
                timestamp: chrono::Utc::now(),
                action: format!("plan cancelled before level {level_index}"),
                before_hash: before.clone(),
                after_hash: before,
            });
            progress.publish(ProgressEventKind::InterventionApplied {
                detail: "plan cancelled".to_string(),
            });
            progress.publish(ProgressEventKind::PlanFailed {
                cause: PlanFailureCause::Cancelled,
                detail: format!("cancelled before level {level_index}"),
            });
            break;
        }

        if control.is_paused() && !was_paused {
            was_paused = true;
            progress.publish(ProgressEventKind::PlanPaused);
        }

        while control.is_paused() {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            if control.is_cancelled() {
                break;
            }
        }

        if was_paused && !control.is_paused() {
            was_paused = false;
            let marker = state_checksum(&statuses, &results);
            intervention_log.push(InterventionLogEntry {
                actor: "system".to_string(),
                timestamp: chrono::Utc::now(),
                action: format!("plan resumed before level {level_index}"),
                before_hash: marker.clone(),
                after_hash: marker,
            });
            progress.publish(ProgressEventKind::PlanResumed);
        }

        if control.is_cancelled() {
            break;
        }

        if Instant::now() >= deadline {
            progress.publish(ProgressEventKind::PlanFailed {
                cause: PlanFailureCause::DeadlineExceeded,
                detail: format!("deadline exceeded before level {level_index}"),
            });
            return Err(Error::PlanDeadlineExceeded(config.per_plan_timeout));
        }

        // Apply any queued interventions under this level boundary's
        // implicit write lock: mutate the tree, recompute levels from
        // this cursor onward, then checkpoint before proceeding.
        let queued: Vec<InterventionAction> = {
            let mut inbox = interventions.lock();
            inbox.drain(..).collect()
        };
        if !queued.is_empty() {
            for action in queued {
                let before = state_checksum(&statuses, &results);
                let description = apply_intervention(
                    &mut tree,
                    &mut statuses,
                    &mut results,
                    &mut preferred_order,
                    action,
                );
                let after = state_checksum(&statuses, &results);
                intervention_log.push(InterventionLogEntry {
                    actor: "operator".to_string(),
                    timestamp: chrono::Utc::now(),
                    action: description.clone(),
                    before_hash: before,
                    after_hash: after,
                });
                progress.publish(ProgressEventKind::InterventionApplied { detail: description });
            }

            let (recomputed, _warnings) = DependencyResolver::new().resolve(&tree)?;
            levels = recomputed;
            if level_index >= levels.levels().len() {
                break;
            }

            if let Some(store) = &checkpoint_store {
                let snapshot = Checkpoint {
                    plan_id,
                    tree_structure: tree.clone(),
                    step_statuses: statuses.clone(),
                    step_results: results.clone(),
                    level_cursor: level_index,
                    intervention_log: intervention_log.clone(),
                };
                let wrapped = checkpoint::wrap(&snapshot);
                store.save(plan_id, wrapped).await?;
                metrics.incr(crate::telemetry::counters::CHECKPOINTS_WRITTEN);
            }
        }

        let mut level_steps = levels.levels()[level_index].clone();
        if !preferred_order.is_empty() {
            let rank: BTreeMap<StepId, usize> = preferred_order
                .iter()
                .enumerate()
                .map(|(i, id)| (*id, i))
                .collect();
            level_steps.sort_by_key(|id| rank.get(id).copied().unwrap_or(usize::MAX));
        }

        progress.publish(ProgressEventKind::LevelStarted {
            level: level_index,
            steps: level_steps.clone(),
        });

        let mut join_set: JoinSet<(StepId, Result<StepOutcome>)> = JoinSet::new();

        for step_id in &level_steps {
            let step = tree.step(*step_id).expect("leveled step exists in tree").clone();

            let upstream: BTreeMap<StepId, StepResultPayload> = step
                .depends_on
                .iter()
                .filter_map(|dep| results.get(dep).cloned().map(|r| (*dep, r)))
                .collect();

            let missing_required = step.depends_on.iter().any(|dep| {
                !step.optional_dependencies
                    && matches!(statuses.get(dep), Some(StepStatus::Failed) | Some(StepStatus::Skipped))
            });

            if missing_required {
                statuses.insert(*step_id, StepStatus::Skipped);
                progress.publish(ProgressEventKind::StepStatusChanged {
                    step_id: *step_id,
                    status: StepStatus::Skipped,
                });
                continue;
            }

            statuses.insert(*step_id, StepStatus::Running);
            progress.publish(ProgressEventKind::StepStatusChanged {
                step_id: *step_id,
                status: StepStatus::Running,
            });

            let step_runner = step_runner.clone();
            let scorer = scorer.clone();
            let semaphore = semaphore.clone();
            let retry_policy = retry_policy.clone();
            let quality_config = quality_config.clone();
            let progress = progress.clone();
            let metrics = metrics.clone();
            let control = control.clone();
            let generator = generator.clone();
            let per_step_timeout = config.per_step_timeout;

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                let step_id = step.id;
                let outcome = run_step_with_retries(
                    &step_runner,
                    &scorer,
                    &retry_policy,
                    &quality_config,
                    &progress,
                    &metrics,
                    &control,
                    generator.as_deref(),
                    &step,
                    upstream,
                    per_step_timeout,
                )
                .await;
                (step_id, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (step_id, outcome) = joined
                .map_err(|e| Error::Internal(format!("step task panicked: {e}")))?;
            match outcome {
                Ok(outcome) => {
                    if let Some(reason) = outcome.review_reason {
                        // A quality-gate escalation is neither `approve`
                        // nor `human_approved`, so the step cannot enter
                        // `Completed` (spec.md §3, §8 invariant 2); it
                        // stays pending until an operator resumes or
                        // intervenes, and the plan pauses until then.
                        statuses.insert(step_id, StepStatus::AwaitingReview);
                        progress.publish(ProgressEventKind::StepStatusChanged {
                            step_id,
                            status: StepStatus::AwaitingReview,
                        });
                        review_flags.insert(step_id, reason);
                        if !was_paused {
                            was_paused = true;
                            control.pause();
                            progress.publish(ProgressEventKind::PlanPaused);
                        }
                    } else {
                        statuses.insert(step_id, StepStatus::Completed);
                        progress.publish(ProgressEventKind::StepStatusChanged {
                            step_id,
                            status: StepStatus::Completed,
                        });
                        if let Some(score) = outcome.quality_score {
                            quality_scores.insert(step_id, score);
                        }
                        results.insert(step_id, outcome.payload);
                    }
                }
                Err(err) => {
                    statuses.insert(step_id, StepStatus::Failed);
                    progress.publish(ProgressEventKind::StepStatusChanged {
                        step_id,
                        status: StepStatus::Failed,
                    });
                    results.insert(
                        step_id,
                        StepResultPayload::MissingUpstream {
                            step_id,
                            reason: err.to_string(),
                        },
                    );
                }
            }
        }

        if let Some(store) = &checkpoint_store {
            let snapshot = Checkpoint {
                plan_id,
                tree_structure: tree.clone(),
                step_statuses: statuses.clone(),
                step_results: results.clone(),
                level_cursor: level_index,
                intervention_log: intervention_log.clone(),
            };
            let wrapped = checkpoint::wrap(&snapshot);
            store.save(plan_id, wrapped).await?;
            metrics.incr(crate::telemetry::counters::CHECKPOINTS_WRITTEN);
        }

        level_index += 1;
    }

    let answer = Aggregator::new().aggregate(
        &results,
        &statuses,
        &quality_scores,
        &review_flags,
        &config.aggregation,
    );
    let succeeded = answer.complete;
    progress.publish(ProgressEventKind::PlanFinished { succeeded });

    Ok(answer)
}

/// Result of running one step to a terminal quality decision: the payload
/// itself, plus the quality score if the gate approved it (only approved
/// scores count toward the Aggregator's confidence median) and the
/// escalation reason if the gate sent it to human review.
struct StepOutcome {
    payload: StepResultPayload,
    quality_score: Option<f64>,
    review_reason: Option<String>,
}

#[allow(clippy::too_many_arguments)]
async fn run_step_with_retries(
    step_runner: &StepRunner,
    scorer: &Arc<dyn QualityScorer>,
    retry_policy: &RetryPolicy,
    quality_config: &crate::config::QualityConfig,
    progress: &ProgressStream,
    metrics: &crate::telemetry::Metrics,
    control: &PlanControl,
    generator: Option<&dyn Generator>,
    step: &crate::types::ProcessStep,
    upstream: BTreeMap<StepId, StepResultPayload>,
    per_step_timeout: std::time::Duration,
) -> Result<StepOutcome> {
    let step_id = step.id;
    let mut attempt: u32 = 1;

    loop {
        metrics.incr(crate::telemetry::counters::STEPS_RUN);

        let emit_progress = move |message: String| {
            progress.publish(ProgressEventKind::StepProgress { step_id, message });
        };
        let ctx = StepContext {
            step,
            upstream: upstream.clone(),
            retriever: None,
            generator,
            cancellation: control,
            emit_progress: &emit_progress,
        };
        let run_fut = step_runner.run(&ctx);
        let outcome = tokio::time::timeout(per_step_timeout, run_fut)
            .await
            .map_err(|_| Error::Transient {
                step: step_id,
                source: crate::error::TransientError::Timeout(per_step_timeout),
            })?;

        let result = match outcome {
            Ok(result) => result,
            Err(err) => match retry_policy.decide(&err, attempt) {
                RetryDecision::Retry(delay) => {
                    metrics.incr(crate::telemetry::counters::RETRIES_ISSUED);
                    progress.publish(ProgressEventKind::StepRetrying {
                        step_id,
                        attempt: attempt + 1,
                    });
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                    continue;
                }
                RetryDecision::GiveUp => return Err(err),
            },
        };

        let gate = QualityGate::new(scorer.as_ref(), quality_config.clone());
        let decision = gate.evaluate(step_id, &result, attempt);
        progress.publish(ProgressEventKind::QualityCheck {
            step_id,
            decision: decision.label().to_string(),
            dimension_scores: std::iter::once(("overall".to_string(), decision.score())).collect(),
        });

        match decision {
            QualityDecision::Approve { score, warned } => {
                metrics.incr(crate::telemetry::counters::QUALITY_APPROVED);
                if warned {
                    tracing::warn!(step = %step_id, "quality gate approved with a low-confidence warning");
                }
                return Ok(StepOutcome {
                    payload: result,
                    quality_score: Some(score),
                    review_reason: None,
                });
            }
            QualityDecision::Retry { reason, .. } => {
                metrics.incr(crate::telemetry::counters::QUALITY_RETRIED);
                if attempt >= quality_config.max_attempts {
                    return Ok(StepOutcome {
                        payload: result,
                        quality_score: None,
                        review_reason: None,
                    });
                }
                progress.publish(ProgressEventKind::StepRetrying {
                    step_id,
                    attempt: attempt + 1,
                });
                tracing::debug!(step = %step_id, reason = %reason, "quality gate requested retry");
                attempt += 1;
                continue;
            }
            QualityDecision::RequestReview { reason, .. } => {
                metrics.incr(crate::telemetry::counters::QUALITY_REVIEW_REQUESTED);
                progress.publish(ProgressEventKind::ReviewRequired {
                    step_id,
                    reason: reason.clone(),
                });
                tracing::warn!(step = %step_id, reason = %reason, "quality gate escalated result for review");
                return Ok(StepOutcome {
                    payload: result,
                    quality_score: None,
                    review_reason: Some(reason),
                });
            }
            QualityDecision::Reject {
                score,
                attempts,
                reason,
            } => {
                tracing::error!(step = %step_id, score, reason = %reason, "quality gate rejected result");
                return Err(Error::QualityRejected {
                    step: step_id,
                    attempts,
                    reason,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessBuilder, ProcessTemplate, TemplateStep};
    use crate::quality::PassthroughScorer;
    use crate::types::{Analysis, StepType};
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct AlwaysSucceeds;
    #[async_trait]
    impl crate::step_runner::StepHandler for AlwaysSucceeds {
        async fn run(
            &self,
            ctx: &crate::step_runner::StepContext<'_>,
        ) -> Result<StepResultPayload> {
            match ctx.step.step_type {
                StepType::FinalAnswer => Ok(StepResultPayload::FinalAnswer {
                    text: "done".to_string(),
                    citations: vec![],
                }),
                _ => Ok(StepResultPayload::Synthesis {
                    text: "ok".to_string(),
                }),
            }
        }
    }

    fn tree() -> ProcessTree {
        let builder = ProcessBuilder::new().register(
            "lookup",
            ProcessTemplate::new()
                .with_step(TemplateStep::new("retrieve", StepType::Retrieval))
                .with_step(
                    TemplateStep::new("answer", StepType::FinalAnswer).depends_on("retrieve"),
                ),
        );
        builder
            .build(
                &Analysis {
                    intent: "lookup".to_string(),
                    question_type: "what".to_string(),
                    entities: vec![],
                    jurisdiction: None,
                    ambiguity: 0.0,
                    confidence: 0.9,
                    parameters: BTreeMap::new(),
                },
                None,
            )
            .unwrap()
    }

    #[tokio::test]
    async fn executes_plan_to_completion() {
        let runner = StepRunner::new()
            .register(StepType::Retrieval, AlwaysSucceeds)
            .register(StepType::FinalAnswer, AlwaysSucceeds);
        let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer));
        let handle = orchestrator.execute(tree()).unwrap();
        let answer = handle.join().await.unwrap();
        assert!(answer.complete);
        assert_eq!(answer.text, "done");
    }

    #[tokio::test]
    async fn cancelling_before_start_stops_execution_early() {
        let runner = StepRunner::new()
            .register(StepType::Retrieval, AlwaysSucceeds)
            .register(StepType::FinalAnswer, AlwaysSucceeds);
        let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer));
        let handle = orchestrator.execute(tree()).unwrap();
        handle.control.cancel();
        let answer = handle.join().await.unwrap();
        assert!(!answer.complete);
    }

    #[tokio::test]
    async fn resumes_a_plan_from_its_last_checkpoint() {
        use crate::test_support::InMemoryCheckpointStore;

        let store = Arc::new(InMemoryCheckpointStore::new());
        let runner = StepRunner::new()
            .register(StepType::Retrieval, AlwaysSucceeds)
            .register(StepType::FinalAnswer, AlwaysSucceeds);
        let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer))
            .with_checkpoint_store(store.clone());

        let plan = tree();
        let plan_id = plan.plan_id;
        let handle = orchestrator.execute(plan).unwrap();
        let answer = handle.join().await.unwrap();
        assert!(answer.complete);

        // A checkpoint was written at every level boundary, so a resume
        // after full completion just re-runs to the same finished state.
        let resumed = orchestrator.resume(plan_id).await.unwrap();
        let resumed_answer = resumed.join().await.unwrap();
        assert!(resumed_answer.complete);
        assert_eq!(resumed_answer.text, "done");
    }

    #[tokio::test]
    async fn resume_without_a_checkpoint_store_fails() {
        let runner = StepRunner::new().register(StepType::Retrieval, AlwaysSucceeds);
        let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer));
        let err = orchestrator.resume(crate::types::PlanId::new()).await.unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
