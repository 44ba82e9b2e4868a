//! Request boundary: validation, admission, deadline, execution, accounting.
//!
//! Each admitted request runs on its own task so that its deadline can fire
//! while the work is still in progress. The task always commits the cost it
//! incurred, even when its outcome is discarded because the request has
//! already timed out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument, Span};

use pipeline::{
    CompletionProvider, GenerationProvider, GenerationRequest, PipelineError, PipelineRequest,
    PipelineResponse, PipelineRun, PriceTable, ProviderError, RequestFailure, RequestId,
    RequestOutcome, StageFailureKind, StageKind, TokenCost, ValidatedRequest,
};

use crate::budget::{BudgetConfig, BudgetGuard};
use crate::executor::{InFlightPolicy, Pipeline};
use crate::retry::{with_retry, RetryConfig, RetryError};
use crate::stages::GenerationBrief;
use crate::timeout::{Delivery, TimeoutGuard};

pub const DEFAULT_MAX_REQUEST_TIME: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrchestratorConfig {
    pub budget: BudgetConfig,
    pub max_request_time: Duration,
    pub in_flight: InFlightPolicy,
    pub retry: RetryConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            budget: BudgetConfig::default(),
            max_request_time: DEFAULT_MAX_REQUEST_TIME,
            in_flight: InFlightPolicy::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Entry point for pipeline requests.
pub struct Orchestrator {
    pipeline: Arc<Pipeline>,
    generator: Arc<dyn GenerationProvider>,
    budget: Arc<BudgetGuard>,
    timeouts: TimeoutGuard,
    retry: RetryConfig,
    max_request_time: Duration,
    closing: CancellationToken,
}

impl Orchestrator {
    /// Orchestrator over the standard stages.
    pub fn new(
        config: OrchestratorConfig,
        provider: Arc<dyn CompletionProvider>,
        generator: Arc<dyn GenerationProvider>,
        prices: Arc<PriceTable>,
    ) -> Self {
        Self::with_pipeline(config, Pipeline::standard(provider, prices), generator)
    }

    /// Orchestrator over a caller-supplied pipeline. The pipeline's in-flight
    /// policy is replaced by the one in `config`.
    pub fn with_pipeline(
        config: OrchestratorConfig,
        pipeline: Pipeline,
        generator: Arc<dyn GenerationProvider>,
    ) -> Self {
        Self {
            pipeline: Arc::new(pipeline.with_in_flight(config.in_flight)),
            generator,
            budget: Arc::new(BudgetGuard::new(config.budget)),
            timeouts: TimeoutGuard::new(),
            retry: config.retry,
            max_request_time: config.max_request_time,
            closing: CancellationToken::new(),
        }
    }

    pub fn budget(&self) -> &BudgetGuard {
        &self.budget
    }

    pub fn timeouts(&self) -> &TimeoutGuard {
        &self.timeouts
    }

    /// Handles one request and returns its single outcome.
    #[instrument(skip_all, fields(caller = %request.caller_id, request_id = tracing::field::Empty))]
    pub async fn handle(&self, request: PipelineRequest) -> RequestOutcome {
        let validated = match request.validate() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "request rejected");
                return Err(RequestFailure::from_error(None, &e, None));
            }
        };

        let request_id = RequestId::new_random();
        Span::current().record("request_id", tracing::field::display(request_id));
        if self.is_shutting_down() {
            return Err(refused(request_id));
        }

        let decision =
            self.budget
                .admit_with_cap(&validated.caller, validated.cap, TokenCost::zero());
        if let Some(e) = decision.into_error(&validated.caller) {
            warn!(spent = %decision.spent, cap = %decision.cap, "budget exceeded");
            return Err(RequestFailure::from_error(Some(request_id), &e, None));
        }

        let max_time = validated.max_time.unwrap_or(self.max_request_time);
        let pending = self.timeouts.start(request_id, max_time);
        if self.is_shutting_down() {
            // Shutdown began after the check above and may have missed this entry.
            self.timeouts.finish(request_id, Err(refused(request_id)));
            return pending.outcome().await;
        }
        let job = RunJob {
            request_id,
            request: validated,
            max_time,
            cancel: pending.cancel.clone(),
            pipeline: Arc::clone(&self.pipeline),
            generator: Arc::clone(&self.generator),
            budget: Arc::clone(&self.budget),
            timeouts: self.timeouts.clone(),
            retry: self.retry,
        };
        tokio::spawn(job.run().instrument(Span::current()));

        pending.outcome().await
    }

    /// Refuses new requests and times out every pending one. Pending runs
    /// stop at the next cancellation point and still commit what they cost.
    pub fn shutdown(&self) -> Vec<RequestId> {
        self.closing.cancel();
        let cancelled = self.timeouts.cancel_all();
        info!(cancelled = cancelled.len(), "orchestrator shutdown");
        cancelled
    }

    pub fn is_shutting_down(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Resolves once [`Orchestrator::shutdown`] has been called.
    pub async fn closed(&self) {
        self.closing.cancelled().await;
    }
}

/// Outcome for a request that arrives after shutdown began.
fn refused(request_id: RequestId) -> RequestFailure {
    let failure = RequestFailure::from_error(
        Some(request_id),
        &PipelineError::RequestTimeout {
            after: Duration::ZERO,
        },
        None,
    );
    warn!(%request_id, "request refused: shutting down");
    RequestFailure {
        message: format!("{}; refused during shutdown", failure.message),
        ..failure
    }
}

/// Everything the background task of one request needs.
struct RunJob {
    request_id: RequestId,
    request: ValidatedRequest,
    max_time: Duration,
    cancel: CancellationToken,
    pipeline: Arc<Pipeline>,
    generator: Arc<dyn GenerationProvider>,
    budget: Arc<BudgetGuard>,
    timeouts: TimeoutGuard,
    retry: RetryConfig,
}

impl RunJob {
    async fn run(self) {
        let started = Instant::now();
        let run = self
            .pipeline
            .execute_with(
                self.request_id,
                &self.request.prompt,
                &self.request.caller,
                &self.cancel,
            )
            .await;

        let (result, cost) = match self.settle_run(&run) {
            Err(e) => (Err(e), run.total_cost()),
            Ok(brief) => self.generate(&run, brief, started).await,
        };

        let spent = self.budget.commit(&self.request.caller, cost);
        let remaining = self
            .request
            .cap
            .unwrap_or(self.budget.config().cap)
            .remaining_after(spent);

        let outcome = result.map_err(|e| {
            RequestFailure::from_error(Some(self.request_id), &e, Some(remaining))
        });
        if self.timeouts.finish(self.request_id, outcome) == Delivery::Discarded {
            warn!(committed = %cost, "request already answered; result discarded");
        }
    }

    /// The generation brief of a successful run, or why there is none.
    fn settle_run(&self, run: &PipelineRun) -> Result<GenerationBrief, PipelineError> {
        let timeout = PipelineError::RequestTimeout {
            after: self.max_time,
        };
        if !run.succeeded() {
            let failed = run
                .failed_stage()
                .and_then(|r| r.failure().map(|f| (r.stage(), f)));
            return Err(match failed {
                Some((_, f)) if f.kind == StageFailureKind::Cancelled => timeout,
                Some((stage, f)) => PipelineError::StageFailed {
                    stage,
                    kind: f.kind,
                    reason: f.reason.clone(),
                    cost_incurred: run.total_cost(),
                },
                None => timeout,
            });
        }

        run.final_artifact()
            .cloned()
            .and_then(|a| serde_json::from_value::<GenerationBrief>(a).ok())
            .ok_or_else(|| PipelineError::StageFailed {
                stage: StageKind::PromptBuilding,
                kind: StageFailureKind::MalformedReply,
                reason: "final artifact is not a generation brief".into(),
                cost_incurred: run.total_cost(),
            })
    }

    /// Calls the generation service with retries. Returns the outcome and
    /// everything the request cost, including billed failed attempts.
    async fn generate(
        &self,
        run: &PipelineRun,
        brief: GenerationBrief,
        started: Instant,
    ) -> (Result<PipelineResponse, PipelineError>, TokenCost) {
        let stage_cost = run.total_cost();
        let request = GenerationRequest {
            prompt: brief.prompt.clone(),
            model_tier: brief.tier(),
        };
        debug!(tier = request.model_tier.as_str(), "requesting generation");

        let generator = &self.generator;
        let outcome = with_retry(
            &self.retry,
            &self.cancel,
            self.pipeline.in_flight(),
            ProviderError::retry_policy,
            |attempt| {
                let generator = Arc::clone(generator);
                let request = request.clone();
                async move {
                    debug!(attempt, "generation attempt");
                    generator.generate(&request).await
                }
            },
        )
        .await;

        match outcome {
            Ok(retried) => {
                let failed: TokenCost = retried.failures.iter().map(ProviderError::billed).sum();
                let total = stage_cost + retried.value.cost + failed;
                info!(
                    attempts = retried.attempts,
                    generation_id = %retried.value.id,
                    total_cost = %total,
                    "request completed"
                );
                let response = PipelineResponse {
                    request_id: self.request_id,
                    run_id: run.run_id(),
                    final_artifact: run.final_artifact().cloned().unwrap_or_default(),
                    generation: retried.value,
                    generation_attempts: retried.attempts,
                    total_cost: total,
                    total_elapsed: started.elapsed(),
                };
                (Ok(response), total)
            }
            Err(e) => {
                let failed: TokenCost = e.failed_attempts().map(ProviderError::billed).sum();
                let total = stage_cost + failed;
                let error = match &e {
                    RetryError::Cancelled { .. } => PipelineError::RequestTimeout {
                        after: self.max_time,
                    },
                    RetryError::Terminal { last, attempts, .. }
                    | RetryError::Exhausted { last, attempts, .. } => PipelineError::Provider {
                        class: last.class(),
                        attempts: *attempts,
                        message: last.to_string(),
                        cost_incurred: total,
                    },
                };
                warn!(error = %e, total_cost = %total, "generation failed");
                (Err(error), total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{
        happy_path_replies, mock_prices, sample_generation, MockCompletionProvider,
        MockGeneration, MockGenerationProvider,
    };
    use pipeline::{CallerId, CostBudget, ErrorCode};

    fn orchestrator(
        config: OrchestratorConfig,
        generations: Vec<MockGeneration>,
    ) -> (Arc<MockCompletionProvider>, Arc<MockGenerationProvider>, Orchestrator) {
        let provider = Arc::new(MockCompletionProvider::new(happy_path_replies()));
        let generator = Arc::new(MockGenerationProvider::new(generations));
        let orch = Orchestrator::new(
            config,
            provider.clone(),
            generator.clone(),
            Arc::new(mock_prices()),
        );
        (provider, generator, orch)
    }

    #[tokio::test]
    async fn invalid_request_costs_nothing() {
        let (provider, _, orch) = orchestrator(OrchestratorConfig::default(), vec![]);
        let failure = orch
            .handle(PipelineRequest::new("   ", "caller"))
            .await
            .unwrap_err();

        assert_eq!(failure.code, ErrorCode::ValidationError);
        assert_eq!(provider.calls(), 0);
        assert!(orch.budget().window(&CallerId::new("caller").unwrap()).is_none());
    }

    #[tokio::test]
    async fn cap_override_refuses_before_any_stage() {
        let (provider, generator, orch) = orchestrator(OrchestratorConfig::default(), vec![]);
        let caller = CallerId::new("caller").unwrap();
        orch.budget().commit(&caller, TokenCost::new(0.5).unwrap());

        let mut request = PipelineRequest::new("todo app", "caller");
        request.budget_override = Some(0.5);
        let failure = orch.handle(request).await.unwrap_err();

        assert_eq!(failure.code, ErrorCode::BudgetExceeded);
        assert_eq!(failure.remaining_budget, Some(TokenCost::zero()));
        assert_eq!(failure.cost_incurred, Some(TokenCost::zero()));
        assert_eq!(provider.calls(), 0);
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn response_reports_remaining_budget_on_failure() {
        let config = OrchestratorConfig {
            budget: BudgetConfig {
                cap: CostBudget::new(1.0).unwrap(),
                ..BudgetConfig::default()
            },
            ..OrchestratorConfig::default()
        };
        let (_, _, orch) = orchestrator(
            config,
            vec![MockGeneration::Error(ProviderError::Authentication(
                "revoked".into(),
            ))],
        );

        let failure = orch
            .handle(PipelineRequest::new("todo app", "caller"))
            .await
            .unwrap_err();

        assert_eq!(failure.code, ErrorCode::ProviderError);
        let remaining = failure.remaining_budget.unwrap().as_f64();
        assert!((remaining - 0.91).abs() < 1e-9);
    }

    #[tokio::test]
    async fn requests_after_shutdown_are_refused() {
        let (provider, generator, orch) = orchestrator(OrchestratorConfig::default(), vec![]);
        assert!(orch.shutdown().is_empty());
        assert!(orch.is_shutting_down());
        orch.closed().await;

        let failure = orch
            .handle(PipelineRequest::new("todo app", "caller"))
            .await
            .unwrap_err();

        assert_eq!(failure.code, ErrorCode::RequestTimeout);
        assert!(failure.message.contains("shutdown"));
        assert_eq!(provider.calls(), 0);
        assert_eq!(generator.calls(), 0);
        assert_eq!(orch.timeouts().pending_count(), 0);
        assert!(orch.budget().window(&CallerId::new("caller").unwrap()).is_none());
    }

    #[tokio::test]
    async fn success_records_generation_cost() {
        let (_, generator, orch) = orchestrator(
            OrchestratorConfig::default(),
            vec![MockGeneration::Ok(sample_generation(0.05))],
        );
        let response = orch
            .handle(PipelineRequest::new("todo app", "caller"))
            .await
            .unwrap();

        assert!((response.total_cost.as_f64() - 0.14).abs() < 1e-9);
        assert_eq!(generator.requests()[0].model_tier, pipeline::ModelTier::Mini);
        let spent = orch.budget().spent(&CallerId::new("caller").unwrap());
        assert!((spent.as_f64() - 0.14).abs() < 1e-9);
        assert_eq!(orch.timeouts().pending_count(), 0);
    }
}
