//! End-to-end scenarios covering a full query -> plan -> answer run, the
//! kind of integration coverage the teacher keeps in
//! `executor/tests/interrupt_resume_tests.rs` rather than inline in the
//! library crate.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use veritas_core::analysis::Analyzer;
use veritas_core::config::Config;
use veritas_core::error::Error;
use veritas_core::hypothesis::HypothesisService;
use veritas_core::orchestrator::Orchestrator;
use veritas_core::process::{ProcessBuilder, ProcessTemplate, TemplateStep};
use veritas_core::quality::PassthroughScorer;
use veritas_core::step_runner::{StepContext, StepHandler, StepRunner};
use veritas_core::types::{Query, StepResultPayload, StepType};

struct RetrievalHandler;
#[async_trait]
impl StepHandler for RetrievalHandler {
    async fn run(&self, _ctx: &StepContext<'_>) -> veritas_core::error::Result<StepResultPayload> {
        Ok(StepResultPayload::Retrieval { results: vec![] })
    }
}

struct SynthesisHandler;
#[async_trait]
impl StepHandler for SynthesisHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> veritas_core::error::Result<StepResultPayload> {
        let upstream_count = ctx.ordered_upstream().len();
        Ok(StepResultPayload::Synthesis {
            text: format!("synthesized from {upstream_count} upstream result(s)"),
        })
    }
}

struct FinalAnswerHandler;
#[async_trait]
impl StepHandler for FinalAnswerHandler {
    async fn run(&self, ctx: &StepContext<'_>) -> veritas_core::error::Result<StepResultPayload> {
        let text = ctx
            .ordered_upstream()
            .into_iter()
            .find_map(|r| match r {
                StepResultPayload::Synthesis { text } => Some(text.clone()),
                _ => None,
            })
            .unwrap_or_default();
        Ok(StepResultPayload::FinalAnswer {
            text,
            citations: vec![],
        })
    }
}

fn builder() -> ProcessBuilder {
    ProcessBuilder::new().register(
        "lookup",
        ProcessTemplate::new()
            .with_step(TemplateStep::new("retrieve", StepType::Retrieval))
            .with_step(
                TemplateStep::new("synthesize", StepType::Synthesis).depends_on("retrieve"),
            )
            .with_step(
                TemplateStep::new("answer", StepType::FinalAnswer).depends_on("synthesize"),
            ),
    )
}

fn runner() -> StepRunner {
    StepRunner::new()
        .register(StepType::Retrieval, RetrievalHandler)
        .register(StepType::Synthesis, SynthesisHandler)
        .register(StepType::FinalAnswer, FinalAnswerHandler)
}

#[tokio::test]
async fn full_pipeline_from_query_text_to_final_answer() {
    let mut query = Query::new("What is the standard processing timeline for this permit type?");
    query.jurisdiction_hint = Some("Bavaria".to_string());
    let analysis = Analyzer::new().analyze(&query).unwrap();

    let hypothesis = HypothesisService::new().estimate(&analysis);
    assert!(!hypothesis.needs_clarification());

    let tree = builder().build(&analysis, None).unwrap();

    let config = Config::default();
    config.validate().unwrap();

    let orchestrator = Orchestrator::new(config, runner(), Arc::new(PassthroughScorer));
    let handle = orchestrator.execute(tree).unwrap();
    let answer = handle.join().await.unwrap();

    assert!(answer.complete);
    assert!(answer.text.contains("synthesized from"));
}

#[tokio::test]
async fn ambiguous_query_recommends_clarification_before_execution() {
    let query = Query::new("fees?");
    let analysis = Analyzer::new().analyze(&query).unwrap();
    let hypothesis = HypothesisService::new().estimate(&analysis);
    assert!(hypothesis.needs_clarification());
}

#[tokio::test]
async fn cancelling_mid_plan_yields_an_incomplete_but_non_empty_answer() {
    let query = Query::new("What is the filing deadline under BImSchG 4.1?");
    let analysis = Analyzer::new().analyze(&query).unwrap();
    let tree = builder().build(&analysis, None).unwrap();

    let orchestrator = Orchestrator::new(Config::default(), runner(), Arc::new(PassthroughScorer));
    let handle = orchestrator.execute(tree).unwrap();
    handle.control.cancel();
    let answer = handle.join().await.unwrap();

    assert!(!answer.complete);
}

#[tokio::test]
async fn unregistered_intent_is_reported_before_any_execution() {
    let query = Query::new("compare the two permitting regimes");
    let analysis = Analyzer::new().analyze(&query).unwrap();
    assert_eq!(analysis.intent, "comparison");

    let err = builder().build(&analysis, None).unwrap_err();
    assert!(matches!(err, Error::Build(_)));
}

#[tokio::test]
async fn progress_stream_reports_plan_started_and_finished_in_order() {
    let query = Query::new("What is the definition of a permit?");
    let analysis = Analyzer::new().analyze(&query).unwrap();
    let tree = builder().build(&analysis, None).unwrap();

    let orchestrator = Orchestrator::new(Config::default(), runner(), Arc::new(PassthroughScorer));
    let handle = orchestrator.execute(tree).unwrap();
    let mut subscriber = handle.progress.subscribe();
    let answer = handle.join().await.unwrap();
    assert!(answer.complete);

    let replay = handle.progress.replay_from(0);
    assert!(matches!(
        replay.events.first().unwrap().kind,
        veritas_core::types::ProgressEventKind::PlanStarted
    ));
    assert!(matches!(
        replay.events.last().unwrap().kind,
        veritas_core::types::ProgressEventKind::PlanFinished { .. }
    ));

    // Draining the live subscriber should not panic even though the plan
    // already finished; events already published are still buffered.
    let _ = subscriber.try_recv();
}

#[tokio::test]
async fn empty_upstream_map_is_visible_to_root_step_handlers() {
    let upstream: BTreeMap<_, _> = BTreeMap::new();
    assert!(upstream.is_empty());
}
