//! Request boundary: what callers send in and what they get back.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::run::duration_ms;
use crate::{
    CallerId, CostBudget, ErrorCode, Generation, PipelineError, PipelineRunId, RequestId,
    StageKind, TokenCost,
};

/// Longest prompt accepted at the boundary, in characters.
pub const MAX_PROMPT_CHARS: usize = 20_000;

/// Raw request as received from a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRequest {
    pub prompt: String,
    pub caller_id: String,
    /// Replaces the configured spend cap for this admission only (USD).
    #[serde(default)]
    pub budget_override: Option<f64>,
    /// Replaces the configured request deadline (milliseconds).
    #[serde(default)]
    pub timeout_override_ms: Option<u64>,
}

impl PipelineRequest {
    pub fn new(prompt: impl Into<String>, caller_id: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            caller_id: caller_id.into(),
            budget_override: None,
            timeout_override_ms: None,
        }
    }

    /// Checks the request and converts it into typed form.
    ///
    /// Runs before admission, so a rejected request costs nothing.
    pub fn validate(&self) -> Result<ValidatedRequest, PipelineError> {
        let prompt = self.prompt.trim();
        if prompt.is_empty() {
            return Err(invalid("prompt must not be empty"));
        }
        if prompt.chars().count() > MAX_PROMPT_CHARS {
            return Err(invalid(format!(
                "prompt exceeds {MAX_PROMPT_CHARS} characters"
            )));
        }
        let caller =
            CallerId::new(self.caller_id.trim()).ok_or_else(|| invalid("callerId is required"))?;

        let cap = match self.budget_override {
            None => None,
            Some(v) => Some(
                CostBudget::new(v)
                    .ok_or_else(|| invalid("budgetOverride must be a positive amount"))?,
            ),
        };
        let max_time = match self.timeout_override_ms {
            None => None,
            Some(0) => return Err(invalid("timeoutOverrideMs must be greater than zero")),
            Some(ms) => Some(Duration::from_millis(ms)),
        };

        Ok(ValidatedRequest {
            prompt: prompt.to_string(),
            caller,
            cap,
            max_time,
        })
    }
}

fn invalid(message: impl Into<String>) -> PipelineError {
    PipelineError::Validation {
        message: message.into(),
    }
}

/// A request that passed boundary validation.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRequest {
    pub prompt: String,
    pub caller: CallerId,
    pub cap: Option<CostBudget>,
    pub max_time: Option<Duration>,
}

/// Successful outcome of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub request_id: RequestId,
    pub run_id: PipelineRunId,
    pub final_artifact: Value,
    pub generation: Generation,
    /// Generation calls made, including failed attempts that were retried.
    pub generation_attempts: u32,
    /// Stage costs plus everything the generation service billed.
    pub total_cost: TokenCost,
    #[serde(rename = "totalElapsedMs", with = "duration_ms")]
    pub total_elapsed: Duration,
}

/// Failed outcome of a request, in the shape exposed to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFailure {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_incurred: Option<TokenCost>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<TokenCost>,
}

impl RequestFailure {
    /// Builds the boundary form of `error`.
    pub fn from_error(
        request_id: Option<RequestId>,
        error: &PipelineError,
        remaining_budget: Option<TokenCost>,
    ) -> Self {
        let remaining_budget = match error {
            PipelineError::BudgetExceeded { .. } => Some(TokenCost::zero()),
            _ => remaining_budget,
        };
        Self {
            request_id,
            code: error.code(),
            message: error.to_string(),
            stage: error.stage(),
            cost_incurred: error.cost_incurred(),
            remaining_budget,
        }
    }
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The single outcome delivered for a request.
pub type RequestOutcome = Result<PipelineResponse, RequestFailure>;
