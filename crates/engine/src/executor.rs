//! Sequential stage executor.
//!
//! Runs the five stages in order, feeding each the payloads of the stages
//! before it, and halts at the first failure. Every attempted stage is
//! recorded, including the one that failed.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use pipeline::{
    CallerId, CompletionProvider, PipelineRun, PriceTable, RequestId, RunRecorder, StageInput,
    StageKind,
};

use crate::stages::{standard_stages, Stage};

/// What happens to a stage call that is in flight when its request times out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InFlightPolicy {
    /// Drop the in-flight call.
    ///
    /// A dropped call never reports usage, so it is committed at zero: the
    /// provider is assumed not to bill a request whose connection was closed
    /// before it answered. Use [`InFlightPolicy::Drain`] where that does not
    /// hold.
    #[default]
    Abort,
    /// Let the in-flight call finish so its cost is recorded, then start
    /// nothing new. Applies to stage completions and to generation attempts.
    Drain,
}

/// The ordered five-stage pipeline.
pub struct Pipeline {
    stages: [Arc<dyn Stage>; 5],
    in_flight: InFlightPolicy,
}

impl Pipeline {
    /// Builds a pipeline from stages given in execution order.
    pub fn new(stages: [Arc<dyn Stage>; 5]) -> Self {
        debug_assert!(stages
            .iter()
            .zip(StageKind::ALL)
            .all(|(s, k)| s.kind() == k));
        Self {
            stages,
            in_flight: InFlightPolicy::default(),
        }
    }

    /// The standard stages backed by `provider`.
    pub fn standard(provider: Arc<dyn CompletionProvider>, prices: Arc<PriceTable>) -> Self {
        Self::new(standard_stages(provider, prices))
    }

    #[must_use]
    pub fn with_in_flight(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight = policy;
        self
    }

    pub fn in_flight(&self) -> InFlightPolicy {
        self.in_flight
    }

    /// Runs every stage for `prompt` without a deadline.
    pub async fn execute(&self, prompt: &str, caller: &CallerId) -> PipelineRun {
        self.execute_with(
            RequestId::new_random(),
            prompt,
            caller,
            &CancellationToken::new(),
        )
        .await
    }

    /// Runs the stages until one fails, all succeed, or `cancel` fires.
    ///
    /// Cancellation is checked before each stage. Whether it also interrupts
    /// the stage in flight depends on the [`InFlightPolicy`].
    #[instrument(skip_all, fields(request_id = %request_id, caller = %caller))]
    pub async fn execute_with(
        &self,
        request_id: RequestId,
        prompt: &str,
        caller: &CallerId,
        cancel: &CancellationToken,
    ) -> PipelineRun {
        let mut recorder = RunRecorder::new(request_id, caller.clone());
        let mut input = StageInput::new(prompt);
        let detached = CancellationToken::new();
        let stage_cancel = match self.in_flight {
            InFlightPolicy::Abort => cancel,
            InFlightPolicy::Drain => &detached,
        };

        for stage in &self.stages {
            if cancel.is_cancelled() {
                warn!(next_stage = %stage.kind(), "run cancelled before stage");
                break;
            }
            let result = stage.run(&input, stage_cancel).await;
            let failed = !result.succeeded();
            if let Some(payload) = result.payload() {
                input.insert(result.stage(), payload.clone());
            }
            recorder.record(result);
            if failed {
                break;
            }
        }

        let artifact = input.output(StageKind::PromptBuilding).cloned();
        let run = recorder.seal(artifact);
        info!(
            run_id = %run.run_id(),
            succeeded = run.succeeded(),
            stages = run.stage_results().len(),
            total_cost = %run.total_cost(),
            "pipeline run finished"
        );
        run
    }
}
