mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{models, Reply, ScriptedGateway, CALL_COST};
use council_harness::config::{CouncilConfig, StaticConfigProvider};
use council_harness::council::{PipelineError, Stage, StagePipeline};
use council_harness::gateway::CallFailure;
use council_harness::jobs::{CouncilEngine, JobStatus, MemoryJobStore};

const POLL: Duration = Duration::from_millis(10);

fn config(names: &[&str]) -> CouncilConfig {
    CouncilConfig::new(models(names), "chair/model").with_call_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn what_is_two_plus_two_completes_with_tied_ranking() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .answer("a/one", "4")
            .answer("b/two", "4")
            .answer("c/three", "4")
            .chairman(Reply::Content("2+2 = 4".into())),
    );
    let engine = CouncilEngine::builder(
        gateway.clone(),
        Arc::new(StaticConfigProvider(config(&["a/one", "b/two", "c/three"]))),
        Arc::new(MemoryJobStore::new()),
    )
    .reconcile(false)
    .build();

    let job_id = engine.submit("What is 2+2?").await.unwrap();
    let job = engine.wait_for_terminal(job_id, POLL).await.unwrap();

    assert_eq!(job.status(), JobStatus::Completed);
    assert!(job.started_at().unwrap() >= job.created_at);
    assert!(job.completed_at().unwrap() >= job.started_at().unwrap());
    assert!(job.error().is_none());

    let result = job.result().unwrap();
    assert_eq!(result.stage1.len(), 3);
    assert!(result.stage1.iter().all(|r| r.content == "4"));
    assert_eq!(result.stage2.len(), 3);

    let aggregate = &result.metadata.aggregate_ranking;
    assert_eq!(aggregate.len(), 3);
    assert!(aggregate.entries.iter().all(|e| e.mean_rank == Some(1.0)));

    assert!(!result.stage3.content.is_empty());
    assert!(result.metadata.stage_costs.total > 0);
    assert_eq!(result.metadata.stage_costs.total, 7 * CALL_COST);
    assert_eq!(result.metadata.generation_ids.len(), 7);
}

#[tokio::test]
async fn all_stage1_failures_still_reach_the_chairman() {
    let timeout = || Reply::Fail(CallFailure::Timeout(Duration::from_secs(5)));
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply(Stage::Stage1, "a/one", timeout())
            .reply(Stage::Stage1, "b/two", timeout())
            .reply(Stage::Stage1, "c/three", timeout()),
    );
    let pipeline = StagePipeline::new(gateway.clone());

    let result = pipeline
        .run(&config(&["a/one", "b/two", "c/three"]), "What is 2+2?", None, || false)
        .await
        .unwrap();

    assert!(result.stage1.is_empty());
    assert!(result.stage2.is_empty());
    assert!(result.metadata.label_to_model.is_empty());
    assert!(result.metadata.aggregate_ranking.is_empty());
    assert!(gateway.calls(Stage::Stage2).is_empty());
    assert_eq!(gateway.calls(Stage::Stage3), vec!["chair/model"]);
    assert!(gateway
        .last_prompt(Stage::Stage3)
        .unwrap()
        .contains("No council answers are available"));

    assert_eq!(result.metadata.soft_failures.len(), 3);
    assert!(result
        .metadata
        .soft_failures
        .iter()
        .all(|f| f.stage == Stage::Stage1 && f.reason == "timeout"));
    assert_eq!(result.metadata.stage_costs.total, CALL_COST);
}

#[tokio::test]
async fn stage_results_follow_config_order_not_arrival_order() {
    let gateway = Arc::new(
        ScriptedGateway::new()
            .reply(
                Stage::Stage1,
                "a/slow",
                Reply::Delayed(Duration::from_millis(150), "slow".into()),
            )
            .reply(
                Stage::Stage1,
                "b/medium",
                Reply::Delayed(Duration::from_millis(50), "medium".into()),
            )
            .answer("c/fast", "fast"),
    );
    let pipeline = StagePipeline::new(gateway);

    let result = pipeline
        .run(&config(&["a/slow", "b/medium", "c/fast"]), "q", None, || false)
        .await
        .unwrap();

    let order: Vec<&str> = result.stage1.iter().map(|r| r.model.as_str()).collect();
    assert_eq!(order, vec!["a/slow", "b/medium", "c/fast"]);
    let rankers: Vec<&str> = result.stage2.iter().map(|r| r.call.model.as_str()).collect();
    assert_eq!(rankers, vec!["a/slow", "b/medium", "c/fast"]);
}

#[tokio::test]
async fn label_mapping_covers_exactly_the_survivors() {
    let gateway = Arc::new(ScriptedGateway::new().reply(
        Stage::Stage1,
        "b/two",
        Reply::Fail(CallFailure::Http {
            status: 500,
            message: "boom".into(),
        }),
    ));
    let pipeline = StagePipeline::new(gateway).with_rng_seed(11);

    let result = pipeline
        .run(&config(&["a/one", "b/two", "c/three"]), "q", None, || false)
        .await
        .unwrap();

    assert_eq!(result.stage1.len(), 2);
    let mapped: Vec<&str> = result
        .metadata
        .label_to_model
        .values()
        .map(String::as_str)
        .collect();
    assert_eq!(mapped.len(), 2);
    assert!(mapped.contains(&"a/one"));
    assert!(mapped.contains(&"c/three"));

    let mut labels = result.metadata.aggregate_ranking.labels();
    labels.sort_unstable();
    assert_eq!(labels, vec!["A", "B"]);
}

#[tokio::test]
async fn unparseable_ranking_is_excluded_but_billed() {
    let gateway = Arc::new(ScriptedGateway::new().reply(
        Stage::Stage2,
        "b/two",
        Reply::Content("They are all fine answers.".into()),
    ));
    let pipeline = StagePipeline::new(gateway);

    let result = pipeline
        .run(&config(&["a/one", "b/two"]), "q", None, || false)
        .await
        .unwrap();

    assert_eq!(result.stage2.len(), 1);
    assert_eq!(result.stage2[0].call.model, "a/one");
    assert!(result.metadata.call_costs.contains_key("stage2_b/two"));
    assert_eq!(result.metadata.stage_costs.stage2.nanodollars, 2 * CALL_COST);

    let failure = &result.metadata.soft_failures[0];
    assert_eq!(failure.stage, Stage::Stage2);
    assert_eq!(failure.model, "b/two");
    assert_eq!(failure.reason, "unparseable_ranking");
}

#[tokio::test]
async fn chairman_failure_is_fatal() {
    let gateway = Arc::new(
        ScriptedGateway::new().chairman(Reply::Fail(CallFailure::Transport(
            "connection refused".into(),
        ))),
    );
    let engine = CouncilEngine::builder(
        gateway,
        Arc::new(StaticConfigProvider(config(&["a/one", "b/two"]))),
        Arc::new(MemoryJobStore::new()),
    )
    .reconcile(false)
    .build();

    let job_id = engine.submit("q").await.unwrap();
    let job = engine.wait_for_terminal(job_id, POLL).await.unwrap();

    assert_eq!(job.status(), JobStatus::Failed);
    assert!(job.result().is_none());
    let error = job.error().unwrap();
    assert!(error.contains("chair/model"), "{error}");
}

#[tokio::test]
async fn cancellation_between_stages_skips_later_stages() {
    let gateway = Arc::new(ScriptedGateway::new());
    let pipeline = StagePipeline::new(gateway.clone());
    let polls = std::sync::atomic::AtomicUsize::new(0);

    // Not cancelled before stage 1, cancelled before stage 2.
    let err = pipeline
        .run(&config(&["a/one", "b/two"]), "q", None, || {
            polls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) >= 1
        })
        .await
        .unwrap_err();

    assert!(matches!(err, PipelineError::Cancelled { before: Stage::Stage2 }));
    assert_eq!(gateway.calls(Stage::Stage1).len(), 2);
    assert!(gateway.calls(Stage::Stage2).is_empty());
    assert!(gateway.calls(Stage::Stage3).is_empty());
}
