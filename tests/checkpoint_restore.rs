//! Checkpoint persistence across a full plan run: every level transition
//! writes an integrity-wrapped checkpoint, and the last one written
//! reflects the plan's final state.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use veritas_core::config::Config;
use veritas_core::error::Result;
use veritas_core::orchestrator::checkpoint;
use veritas_core::orchestrator::Orchestrator;
use veritas_core::persistence::CheckpointStore;
use veritas_core::process::{ProcessBuilder, ProcessTemplate, TemplateStep};
use veritas_core::quality::PassthroughScorer;
use veritas_core::step_runner::{StepContext, StepHandler, StepRunner};
use veritas_core::types::{Analysis, PlanId, StepResultPayload, StepType};

#[derive(Default)]
struct RecordingStore {
    saved: Mutex<HashMap<PlanId, Vec<Vec<u8>>>>,
}

#[async_trait]
impl CheckpointStore for RecordingStore {
    async fn save(&self, plan_id: PlanId, wrapped_bytes: Vec<u8>) -> Result<()> {
        self.saved.lock().entry(plan_id).or_default().push(wrapped_bytes);
        Ok(())
    }

    async fn load(&self, plan_id: PlanId) -> Result<Option<Vec<u8>>> {
        Ok(self
            .saved
            .lock()
            .get(&plan_id)
            .and_then(|versions| versions.last().cloned()))
    }
}

struct AlwaysSucceeds;
#[async_trait]
impl StepHandler for AlwaysSucceeds {
    async fn run(&self, ctx: &StepContext<'_>) -> Result<StepResultPayload> {
        match ctx.step.step_type {
            StepType::FinalAnswer => Ok(StepResultPayload::FinalAnswer {
                text: "checkpointed answer".to_string(),
                citations: vec![],
            }),
            _ => Ok(StepResultPayload::Synthesis {
                text: "ok".to_string(),
            }),
        }
    }
}

fn two_level_tree() -> veritas_core::types::ProcessTree {
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
                question_type: "statement".to_string(),
                entities: vec![],
                jurisdiction: None,
                ambiguity: 0.0,
                confidence: 0.9,
                parameters: Default::default(),
            },
            None,
        )
        .unwrap()
}

#[tokio::test]
async fn checkpoints_are_written_once_per_level_and_restorable() {
    let store = Arc::new(RecordingStore::default());
    let runner = StepRunner::new()
        .register(StepType::Retrieval, AlwaysSucceeds)
        .register(StepType::FinalAnswer, AlwaysSucceeds);

    let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer))
        .with_checkpoint_store(store.clone());

    let tree = two_level_tree();
    let plan_id = tree.plan_id;
    let handle = orchestrator.execute(tree).unwrap();
    let answer = handle.join().await.unwrap();
    assert!(answer.complete);

    let versions = store.saved.lock().get(&plan_id).cloned().unwrap();
    assert_eq!(versions.len(), 2, "one checkpoint per dependency level");

    let last = store.load(plan_id).await.unwrap().unwrap();
    let restored = checkpoint::unwrap(&last).unwrap();
    assert_eq!(restored.plan_id, plan_id);
    assert_eq!(restored.level_cursor, 1);
    assert!(restored
        .step_statuses
        .values()
        .all(|status| matches!(status, veritas_core::types::StepStatus::Completed)));
}

#[tokio::test]
async fn orchestrator_resume_continues_from_the_last_checkpoint() {
    let store = Arc::new(RecordingStore::default());
    let runner = StepRunner::new()
        .register(StepType::Retrieval, AlwaysSucceeds)
        .register(StepType::FinalAnswer, AlwaysSucceeds);

    let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer))
        .with_checkpoint_store(store.clone());

    let tree = two_level_tree();
    let plan_id = tree.plan_id;
    let handle = orchestrator.execute(tree).unwrap();
    handle.join().await.unwrap();

    let resumed = orchestrator.resume(plan_id).await.unwrap();
    let answer = resumed.join().await.unwrap();
    assert!(answer.complete);
    assert_eq!(answer.text, "checkpointed answer");
}

#[tokio::test]
async fn resuming_an_unknown_plan_fails() {
    let store = Arc::new(RecordingStore::default());
    let runner = StepRunner::new().register(StepType::Retrieval, AlwaysSucceeds);
    let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer))
        .with_checkpoint_store(store);

    let err = orchestrator.resume(PlanId::new()).await.unwrap_err();
    assert!(matches!(err, veritas_core::error::Error::Internal(_)));
}

#[tokio::test]
async fn a_corrupted_checkpoint_is_rejected_on_restore() {
    let store = Arc::new(RecordingStore::default());
    let runner = StepRunner::new()
        .register(StepType::Retrieval, AlwaysSucceeds)
        .register(StepType::FinalAnswer, AlwaysSucceeds);

    let orchestrator = Orchestrator::new(Config::default(), runner, Arc::new(PassthroughScorer))
        .with_checkpoint_store(store.clone());

    let tree = two_level_tree();
    let plan_id = tree.plan_id;
    let handle = orchestrator.execute(tree).unwrap();
    handle.join().await.unwrap();

    let mut corrupted = store.load(plan_id).await.unwrap().unwrap();
    let last = corrupted.len() - 1;
    corrupted[last] ^= 0xFF;

    let err = checkpoint::unwrap(&corrupted).unwrap_err();
    assert!(matches!(
        err,
        veritas_core::orchestrator::checkpoint::CheckpointIntegrityError::ChecksumMismatch { .. }
    ));
}
