//! End-to-end request scenarios against scripted providers.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;

use engine::mock::{
    happy_path_replies, mock_prices, sample_generation, MockCompletionProvider, MockGeneration,
    MockGenerationProvider, MockReply,
};
use engine::{BudgetConfig, InFlightPolicy, Orchestrator, OrchestratorConfig, Pipeline, RetryConfig};
use pipeline::{
    CallerId, CostBudget, ErrorCode, PipelineRequest, ProviderError, StageKind, TokenCost,
    TokenUsage,
};

const PROMPT: &str = "Create a todo app with dark mode";

fn caller() -> CallerId {
    CallerId::new("caller-1").unwrap()
}

fn approx(actual: TokenCost, expected: f64) -> bool {
    (actual.as_f64() - expected).abs() < 1e-9
}

fn config(cap: f64) -> OrchestratorConfig {
    OrchestratorConfig {
        budget: BudgetConfig {
            cap: CostBudget::new(cap).unwrap(),
            ..BudgetConfig::default()
        },
        retry: RetryConfig {
            jitter_factor: 0.0,
            ..RetryConfig::default()
        },
        ..OrchestratorConfig::default()
    }
}

struct Harness {
    provider: Arc<MockCompletionProvider>,
    generator: Arc<MockGenerationProvider>,
    orchestrator: Orchestrator,
}

fn harness(
    config: OrchestratorConfig,
    replies: Vec<MockReply>,
    generations: Vec<MockGeneration>,
) -> Harness {
    let provider = Arc::new(MockCompletionProvider::new(replies));
    let generator = Arc::new(MockGenerationProvider::new(generations));
    let orchestrator = Orchestrator::new(
        config,
        provider.clone(),
        generator.clone(),
        Arc::new(mock_prices()),
    );
    Harness {
        provider,
        generator,
        orchestrator,
    }
}

#[tokio::test]
async fn scenario_a_all_stages_succeed() {
    let provider = Arc::new(MockCompletionProvider::new(happy_path_replies()));
    let pipeline = Pipeline::standard(provider.clone(), Arc::new(mock_prices()));

    let run = pipeline.execute(PROMPT, &caller()).await;

    assert!(run.succeeded());
    assert_eq!(run.stage_results().len(), 5);
    let costs: Vec<f64> = run
        .stage_results()
        .iter()
        .map(|r| r.cost().as_f64())
        .collect();
    for (actual, expected) in costs.iter().zip([0.01, 0.02, 0.01, 0.03, 0.02]) {
        assert!((actual - expected).abs() < 1e-9);
    }
    assert!(approx(run.total_cost(), 0.09));
    assert!(run.final_artifact().is_some());

    // Through the request boundary the same run is admitted and committed.
    let h = harness(
        config(10.0),
        happy_path_replies(),
        vec![MockGeneration::Ok(sample_generation(0.0))],
    );
    let response = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap();
    assert!(approx(response.total_cost, 0.09));
    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.09));
}

#[tokio::test]
async fn scenario_b_admitted_below_cap_then_rejected() {
    let h = harness(
        config(10.0),
        happy_path_replies(),
        vec![MockGeneration::Ok(sample_generation(0.0))],
    );
    let budget = h.orchestrator.budget();
    budget.commit(&caller(), TokenCost::new(9.95).unwrap());

    let response = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap();
    assert!(approx(response.total_cost, 0.09));
    assert!(approx(budget.spent(&caller()), 10.04));

    let failure = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::BudgetExceeded);
    assert_eq!(failure.remaining_budget, Some(TokenCost::zero()));
    assert_eq!(h.provider.calls(), 5);
    assert_eq!(h.generator.calls(), 1);
}

#[tokio::test]
async fn scenario_c_validation_rejects_unsupported_intent() {
    let mut replies = happy_path_replies();
    replies[0] = MockReply::json(
        json!({ "category": "mobile_native_app", "summary": "An iOS todo app" }),
        TokenUsage::new(1_000, 0),
    );
    let h = harness(config(10.0), replies, vec![]);

    let failure = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap_err();

    assert_eq!(failure.code, ErrorCode::StageFailed);
    assert_eq!(failure.stage, Some(StageKind::Validation));
    assert!(failure.message.contains("mobile_native_app"));
    // Stages 4 and 5 never ran and generation was never attempted.
    assert_eq!(h.provider.calls(), 3);
    assert_eq!(h.generator.calls(), 0);
    assert!(approx(failure.cost_incurred.unwrap(), 0.04));
    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.04));
}

fn slow_first_stage() -> Vec<MockReply> {
    let mut replies = happy_path_replies();
    replies[0] = MockReply::delayed(Duration::from_millis(500), replies[0].clone());
    replies
}

fn with_100ms_deadline() -> PipelineRequest {
    let mut request = PipelineRequest::new(PROMPT, "caller-1");
    request.timeout_override_ms = Some(100);
    request
}

#[tokio::test(start_paused = true)]
async fn scenario_d_timeout_commits_late_stage_cost_when_draining() {
    let h = harness(
        OrchestratorConfig {
            in_flight: InFlightPolicy::Drain,
            ..config(10.0)
        },
        slow_first_stage(),
        vec![],
    );

    let started = Instant::now();
    let failure = h
        .orchestrator
        .handle(with_100ms_deadline())
        .await
        .unwrap_err();
    let waited = started.elapsed();

    assert_eq!(failure.code, ErrorCode::RequestTimeout);
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(150));
    assert_eq!(h.orchestrator.timeouts().pending_count(), 0);
    assert!(h.orchestrator.budget().spent(&caller()).is_zero());

    // Let the late stage-1 completion land.
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.01));
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.generator.calls(), 0);
    assert_eq!(h.orchestrator.timeouts().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_d_timeout_aborts_in_flight_stage_by_default() {
    let h = harness(config(10.0), slow_first_stage(), vec![]);

    let failure = h
        .orchestrator
        .handle(with_100ms_deadline())
        .await
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::RequestTimeout);

    tokio::time::sleep(Duration::from_secs(1)).await;

    // The abandoned call is committed at zero; the window still records it.
    let window = h.orchestrator.budget().window(&caller()).unwrap();
    assert!(window.spent.is_zero());
    assert_eq!(h.provider.calls(), 1);
    assert_eq!(h.generator.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn scenario_e_generation_succeeds_on_third_attempt() {
    let h = harness(
        config(10.0),
        happy_path_replies(),
        vec![
            MockGeneration::Error(ProviderError::RateLimited { retry_after: None }),
            MockGeneration::Error(ProviderError::Transient("502 bad gateway".into())),
            MockGeneration::Ok(sample_generation(0.05)),
        ],
    );

    let response = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap();

    assert_eq!(h.generator.calls(), 3);
    assert_eq!(response.generation_attempts, 3);
    assert_eq!(response.generation.files.len(), 1);
    assert!(approx(response.total_cost, 0.14));
}

fn slow_generation(cost: f64) -> Vec<MockGeneration> {
    vec![MockGeneration::delayed(
        Duration::from_millis(500),
        MockGeneration::Ok(sample_generation(cost)),
    )]
}

#[tokio::test(start_paused = true)]
async fn drained_generation_cost_is_committed_after_timeout() {
    let h = harness(
        OrchestratorConfig {
            in_flight: InFlightPolicy::Drain,
            ..config(10.0)
        },
        happy_path_replies(),
        slow_generation(0.05),
    );

    let failure = h
        .orchestrator
        .handle(with_100ms_deadline())
        .await
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::RequestTimeout);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.generator.calls(), 1);
    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.14));
    assert_eq!(h.orchestrator.timeouts().pending_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn aborted_generation_commits_only_stage_cost() {
    let h = harness(config(10.0), happy_path_replies(), slow_generation(0.05));

    let failure = h
        .orchestrator
        .handle(with_100ms_deadline())
        .await
        .unwrap_err();
    assert_eq!(failure.code, ErrorCode::RequestTimeout);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.generator.calls(), 1);
    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.09));
}

#[tokio::test(start_paused = true)]
async fn generation_failure_after_partial_work_commits_billed_cost() {
    let h = harness(
        config(10.0),
        happy_path_replies(),
        vec![
            MockGeneration::Error(ProviderError::Incomplete {
                message: "stream reset".into(),
                billed: TokenCost::new(0.02).unwrap(),
            }),
            MockGeneration::Error(ProviderError::Authentication("key revoked".into())),
        ],
    );

    let failure = h
        .orchestrator
        .handle(PipelineRequest::new(PROMPT, "caller-1"))
        .await
        .unwrap_err();

    assert_eq!(failure.code, ErrorCode::ProviderError);
    assert!(failure.message.contains("2 attempt"));
    assert!(approx(failure.cost_incurred.unwrap(), 0.11));
    assert!(approx(h.orchestrator.budget().spent(&caller()), 0.11));
}

#[tokio::test(start_paused = true)]
async fn shutdown_times_out_pending_requests() {
    let h = Arc::new(harness(config(10.0), slow_first_stage(), vec![]));

    let runner = h.clone();
    let pending = tokio::spawn(async move {
        runner
            .orchestrator
            .handle(PipelineRequest::new(PROMPT, "caller-1"))
            .await
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let cancelled = h.orchestrator.shutdown();
    assert_eq!(cancelled.len(), 1);

    let failure = pending.await.unwrap().unwrap_err();
    assert_eq!(failure.code, ErrorCode::RequestTimeout);
    assert!(failure.message.contains("shutdown"));
}
