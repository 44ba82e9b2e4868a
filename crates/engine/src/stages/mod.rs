//! The five analysis stages and the machinery they share.
//!
//! Every stage follows the same shape: build a prompt from the accumulated
//! [`StageInput`], call the completion provider once, price the reported token
//! usage, and parse the reply into the stage's typed output. What differs per
//! stage (instructions, prompt, output type, content checks) is captured by a
//! [`StageDefinition`]; [`LlmStage`] supplies the rest.
//!
//! Stages never retry. A malformed reply is a hard failure of that stage.

mod brief;
mod intent;
mod patterns;
mod requirements;
mod validation;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use pipeline::{
    CompletionProvider, CompletionRequest, PriceTable, StageFailureKind, StageInput, StageKind,
    StageResult, TokenCost, TokenUsage,
};

pub use brief::{GenerationBrief, PromptBuilding};
pub use intent::{Complexity, IntentAnalysis, IntentAnalysisStage};
pub use patterns::{PatternSelection, PatternSelectionStage, SelectedPattern};
pub use requirements::{RequirementSet, RequirementSynthesis};
pub use validation::{Validation, ValidationVerdict, SUPPORTED_CATEGORIES};

/// A named unit of work in the pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    fn kind(&self) -> StageKind;

    /// Runs the stage once.
    ///
    /// Always returns a result: failures are reported in the [`StageResult`]
    /// together with whatever cost was incurred. If `cancel` fires while the
    /// completion call is in flight the call is dropped and the stage reports
    /// [`StageFailureKind::Cancelled`].
    async fn run(&self, input: &StageInput, cancel: &CancellationToken) -> StageResult;
}

/// Why a reply could not be turned into a stage output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyError {
    /// The reply does not have the expected structure.
    Malformed(String),
    /// The reply is well formed but rejects the request.
    Rejected(String),
}

/// The stage-specific half of an [`LlmStage`].
pub trait StageDefinition: Send + Sync + 'static {
    /// Typed form of the stage's payload.
    type Output: Serialize + DeserializeOwned + Send;

    fn kind(&self) -> StageKind;

    /// Fixed system instruction for this stage.
    fn instructions(&self) -> &'static str;

    fn temperature(&self) -> f32 {
        0.2
    }

    /// Request-specific prompt built from the prompt and earlier outputs.
    fn build_prompt(&self, input: &StageInput) -> String;

    /// Content checks applied after the reply has been decoded.
    fn check(&self, _output: &Self::Output, _input: &StageInput) -> Result<(), ReplyError> {
        Ok(())
    }
}

/// A stage backed by one completion call.
pub struct LlmStage<D> {
    definition: D,
    provider: Arc<dyn CompletionProvider>,
    prices: Arc<PriceTable>,
}

impl<D: StageDefinition> LlmStage<D> {
    pub fn new(definition: D, provider: Arc<dyn CompletionProvider>, prices: Arc<PriceTable>) -> Self {
        Self {
            definition,
            provider,
            prices,
        }
    }

    fn price(&self, model: &str, usage: TokenUsage) -> TokenCost {
        self.prices.cost(self.provider.name().as_str(), model, usage)
    }

    fn interpret(&self, reply: &str, input: &StageInput) -> Result<serde_json::Value, ReplyError> {
        let json = extract_json(reply)
            .ok_or_else(|| ReplyError::Malformed("reply contains no JSON object".into()))?;
        let output: D::Output = serde_json::from_str(json)
            .map_err(|e| ReplyError::Malformed(format!("unexpected reply shape: {e}")))?;
        self.definition.check(&output, input)?;
        serde_json::to_value(&output)
            .map_err(|e| ReplyError::Malformed(format!("payload not representable: {e}")))
    }
}

#[async_trait]
impl<D: StageDefinition> Stage for LlmStage<D> {
    fn kind(&self) -> StageKind {
        self.definition.kind()
    }

    #[instrument(skip_all, fields(stage = %self.definition.kind()))]
    async fn run(&self, input: &StageInput, cancel: &CancellationToken) -> StageResult {
        let kind = self.definition.kind();
        let request = CompletionRequest {
            system_prompt: self.definition.instructions().to_string(),
            user_prompt: self.definition.build_prompt(input),
            temperature: self.definition.temperature(),
        };

        let started = Instant::now();
        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            r = self.provider.complete(&request) => Some(r),
        };
        let elapsed = started.elapsed();

        let completion = match reply {
            None => {
                warn!("completion abandoned: run cancelled");
                return StageResult::failed(
                    kind,
                    StageFailureKind::Cancelled,
                    "run cancelled while awaiting completion",
                    TokenUsage::default(),
                    TokenCost::zero(),
                    elapsed,
                );
            }
            Some(Err(e)) => {
                let usage = e.usage();
                let cost = self.price(self.provider.model().as_str(), usage) + e.billed();
                warn!(class = %e.class(), error = %e, "completion failed");
                return StageResult::failed(
                    kind,
                    StageFailureKind::Provider(e.class()),
                    e.to_string(),
                    usage,
                    cost,
                    elapsed,
                );
            }
            Some(Ok(c)) => c,
        };

        let cost = self.price(completion.model.as_str(), completion.usage);
        match self.interpret(&completion.text, input) {
            Ok(payload) => {
                debug!(
                    cost = %cost,
                    input_tokens = completion.usage.input.as_u64(),
                    output_tokens = completion.usage.output.as_u64(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "stage succeeded"
                );
                StageResult::success(kind, payload, completion.usage, cost, elapsed)
            }
            Err(ReplyError::Malformed(reason)) => {
                warn!(%reason, "malformed stage reply");
                StageResult::failed(
                    kind,
                    StageFailureKind::MalformedReply,
                    reason,
                    completion.usage,
                    cost,
                    elapsed,
                )
            }
            Err(ReplyError::Rejected(reason)) => {
                warn!(%reason, "stage rejected request");
                StageResult::failed(
                    kind,
                    StageFailureKind::Rejected,
                    reason,
                    completion.usage,
                    cost,
                    elapsed,
                )
            }
        }
    }
}

/// Builds the five stages in pipeline order, all sharing one provider.
pub fn standard_stages(
    provider: Arc<dyn CompletionProvider>,
    prices: Arc<PriceTable>,
) -> [Arc<dyn Stage>; 5] {
    [
        Arc::new(LlmStage::new(IntentAnalysisStage, Arc::clone(&provider), Arc::clone(&prices))),
        Arc::new(LlmStage::new(PatternSelectionStage, Arc::clone(&provider), Arc::clone(&prices))),
        Arc::new(LlmStage::new(Validation, Arc::clone(&provider), Arc::clone(&prices))),
        Arc::new(LlmStage::new(RequirementSynthesis, Arc::clone(&provider), Arc::clone(&prices))),
        Arc::new(LlmStage::new(PromptBuilding, provider, prices)),
    ]
}

/// Locates the JSON object in a model reply.
///
/// Models wrap JSON in Markdown fences or surround it with prose; the object
/// is taken to span from the first `{` to the last `}`.
pub fn extract_json(reply: &str) -> Option<&str> {
    let start = reply.find('{')?;
    let end = reply.rfind('}')?;
    (start < end).then(|| &reply[start..=end])
}

/// Renders an earlier stage's payload for inclusion in a prompt.
pub(crate) fn render_output(input: &StageInput, stage: StageKind) -> String {
    input
        .output(stage)
        .and_then(|v| serde_json::to_string_pretty(v).ok())
        .unwrap_or_else(|| "(not available)".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{mock_prices, MockCompletionProvider, MockReply};
    use pipeline::{FailureClass, ProviderError};
    use serde_json::json;
    use std::time::Duration;

    fn stage(replies: Vec<MockReply>) -> (Arc<MockCompletionProvider>, LlmStage<IntentAnalysisStage>) {
        let provider = Arc::new(MockCompletionProvider::new(replies));
        let stage = LlmStage::new(IntentAnalysisStage, provider.clone(), Arc::new(mock_prices()));
        (provider, stage)
    }

    fn intent_reply(input_tokens: u64) -> MockReply {
        MockReply::json(
            json!({ "category": "web_app", "summary": "todo list", "features": ["dark mode"] }),
            TokenUsage::new(input_tokens, 0),
        )
    }

    #[test]
    fn extract_json_handles_fences_and_prose() {
        let reply = "Here you go:\n```json\n{\"a\": {\"b\": 1}}\n```\nThanks";
        assert_eq!(extract_json(reply), Some("{\"a\": {\"b\": 1}}"));
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
    }

    #[tokio::test]
    async fn successful_reply_is_priced_and_parsed() {
        let (provider, stage) = stage(vec![intent_reply(1_000)]);
        let result = stage
            .run(&StageInput::new("todo app"), &CancellationToken::new())
            .await;

        assert!(result.succeeded());
        assert_eq!(result.stage(), StageKind::IntentAnalysis);
        assert!((result.cost().as_f64() - 0.01).abs() < 1e-9);
        assert_eq!(result.payload().unwrap()["category"], "web_app");
        assert_eq!(provider.calls(), 1);
        assert!(provider.requests()[0].user_prompt.contains("todo app"));
    }

    #[tokio::test]
    async fn malformed_reply_still_records_cost() {
        let (_, stage) = stage(vec![MockReply::text(
            "I think this is a todo app.",
            TokenUsage::new(2_000, 0),
        )]);
        let result = stage
            .run(&StageInput::new("todo app"), &CancellationToken::new())
            .await;

        assert!(!result.succeeded());
        assert_eq!(result.failure().unwrap().kind, StageFailureKind::MalformedReply);
        assert!((result.cost().as_f64() - 0.02).abs() < 1e-9);
        assert!(result.payload().is_none());
    }

    #[tokio::test]
    async fn missing_fields_are_malformed() {
        let (_, stage) = stage(vec![MockReply::json(
            json!({ "features": [] }),
            TokenUsage::new(500, 0),
        )]);
        let result = stage
            .run(&StageInput::new("todo app"), &CancellationToken::new())
            .await;
        assert_eq!(result.failure().unwrap().kind, StageFailureKind::MalformedReply);
    }

    #[tokio::test]
    async fn provider_error_is_distinguished_from_malformed_reply() {
        let (provider, stage) = stage(vec![
            MockReply::Error(ProviderError::RateLimited { retry_after: None }),
            intent_reply(1_000),
        ]);
        let result = stage
            .run(&StageInput::new("todo app"), &CancellationToken::new())
            .await;

        assert_eq!(
            result.failure().unwrap().kind,
            StageFailureKind::Provider(FailureClass::RateLimit)
        );
        assert!(result.cost().is_zero());
        // Stages never retry.
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test]
    async fn provider_malformed_response_is_priced_from_reported_usage() {
        let (_, stage) = stage(vec![MockReply::Error(ProviderError::MalformedResponse {
            message: "truncated body".into(),
            usage: TokenUsage::new(3_000, 0),
        })]);
        let result = stage
            .run(&StageInput::new("todo app"), &CancellationToken::new())
            .await;

        assert_eq!(
            result.failure().unwrap().kind,
            StageFailureKind::Provider(FailureClass::MalformedResponse)
        );
        assert!((result.cost().as_f64() - 0.03).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_in_flight_call() {
        let (_, stage) = stage(vec![MockReply::delayed(
            Duration::from_millis(500),
            intent_reply(1_000),
        )]);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let result = stage.run(&StageInput::new("todo app"), &cancel).await;

        assert_eq!(result.failure().unwrap().kind, StageFailureKind::Cancelled);
        assert!(result.cost().is_zero());
        assert!(result.elapsed() >= Duration::from_millis(100));
        assert!(result.elapsed() < Duration::from_millis(500));
    }
}
