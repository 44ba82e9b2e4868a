//! Top-level error and retry-policy types for the Forgeflow pipeline domain.
//!
//! [`PipelineError`] covers every typed outcome a request can end with other
//! than success. [`ProviderError`] is the failure taxonomy shared by both
//! external capabilities (completion and generation).
//!
//! [`RetryPolicy`] is a cross-cutting concern: any error type that participates
//! in retry decisions must be able to produce a [`RetryPolicy`].

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{CallerId, CostBudget, StageFailureKind, StageKind, TokenCost, TokenUsage};

// ---------------------------------------------------------------------------
// Retry semantics
// ---------------------------------------------------------------------------

/// Whether an error condition is safe to retry and, if so, after what delay.
///
/// Returned by infrastructure error types to let the retry wrapper decide
/// whether to re-invoke an operation.
///
/// - `Retryable` errors: rate limits, transient network failures, timeouts.
/// - `NonRetryable` errors: authentication failures, malformed responses,
///   cancellation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RetryPolicy {
    /// The operation may be retried.
    ///
    /// `after` optionally specifies the minimum delay before retrying (e.g.
    /// derived from a `Retry-After` response header).
    Retryable {
        /// Minimum back-off before the next attempt. `None` means apply the
        /// caller's own back-off schedule.
        after: Option<Duration>,
    },
    /// The operation must not be retried.
    NonRetryable,
}

impl RetryPolicy {
    /// Returns `true` for [`RetryPolicy::Retryable`].
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// ---------------------------------------------------------------------------
// Provider failures
// ---------------------------------------------------------------------------

/// Coarse classification of a provider failure.
///
/// Carried into stage results and request outcomes so callers can tell a bad
/// credential apart from an overloaded provider without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Authentication,
    RateLimit,
    Timeout,
    Transient,
    MalformedResponse,
    Cancelled,
}

impl FailureClass {
    /// Short classification string for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Transient => "transient",
            Self::MalformedResponse => "malformed_response",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a completion or generation provider.
///
/// Every variant states what the provider billed for the failed call through
/// [`ProviderError::billed`] and [`ProviderError::usage`]; nothing is assumed
/// to be free unless the failure class guarantees the provider rejected the
/// call before doing any work.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProviderError {
    /// Credentials were rejected (HTTP 401/403). Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The provider asked us to slow down (HTTP 429).
    #[error("rate limited")]
    RateLimited {
        /// Server-suggested delay before the next attempt.
        retry_after: Option<Duration>,
    },

    /// The call did not complete within the transport deadline.
    #[error("provider call timed out after {0:?}")]
    Timeout(Duration),

    /// Network failure or 5xx response.
    #[error("transient provider failure: {0}")]
    Transient(String),

    /// The provider answered but the body could not be decoded.
    ///
    /// Tokens may already have been consumed; `usage` carries whatever the
    /// provider reported.
    #[error("malformed provider response: {message}")]
    MalformedResponse {
        message: String,
        usage: TokenUsage,
    },

    /// The provider failed after doing (and billing) part of the work.
    #[error("provider failed after partial work: {message}")]
    Incomplete {
        message: String,
        /// Amount the provider reported as billed for the partial work.
        billed: TokenCost,
    },

    /// Any other failure for which the provider still reported a billed
    /// amount. Classification and retry policy are those of `error`.
    #[error("{error} (billed {billed})")]
    Billed {
        #[source]
        error: Box<ProviderError>,
        billed: TokenCost,
    },

    /// The call was abandoned because the request's cancellation token fired.
    #[error("provider call cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Classification of this failure.
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Authentication(_) => FailureClass::Authentication,
            Self::RateLimited { .. } => FailureClass::RateLimit,
            Self::Timeout(_) => FailureClass::Timeout,
            Self::Transient(_) | Self::Incomplete { .. } => FailureClass::Transient,
            Self::MalformedResponse { .. } => FailureClass::MalformedResponse,
            Self::Cancelled => FailureClass::Cancelled,
            Self::Billed { error, .. } => error.class(),
        }
    }

    /// Whether the operation that produced this error may be retried.
    pub fn retry_policy(&self) -> RetryPolicy {
        match self {
            Self::RateLimited { retry_after } => RetryPolicy::Retryable {
                after: *retry_after,
            },
            Self::Timeout(_) | Self::Transient(_) | Self::Incomplete { .. } => {
                RetryPolicy::Retryable { after: None }
            }
            Self::Authentication(_) | Self::MalformedResponse { .. } | Self::Cancelled => {
                RetryPolicy::NonRetryable
            }
            Self::Billed { error, .. } => error.retry_policy(),
        }
    }

    /// Token usage the provider reported for the failed call.
    pub fn usage(&self) -> TokenUsage {
        match self {
            Self::MalformedResponse { usage, .. } => *usage,
            Self::Billed { error, .. } => error.usage(),
            _ => TokenUsage::default(),
        }
    }

    /// Monetary amount the provider reported as billed for the failed call.
    ///
    /// Authentication and rate-limit rejections happen before any work is
    /// done and bill nothing. Token-metered failures report through
    /// [`ProviderError::usage`] instead and are priced by the caller.
    pub fn billed(&self) -> TokenCost {
        match self {
            Self::Incomplete { billed, .. } => *billed,
            Self::Billed { error, billed } => *billed + error.billed(),
            _ => TokenCost::zero(),
        }
    }

    /// Attaches an amount the provider reported as billed for this failure.
    ///
    /// Transient failures become [`ProviderError::Incomplete`]; other classes
    /// keep their classification. Authentication failures are returned
    /// unchanged since the provider did no work.
    pub fn with_billed(self, billed: TokenCost) -> Self {
        if billed.is_zero() {
            return self;
        }
        match self {
            auth @ Self::Authentication(_) => auth,
            Self::Transient(message) => Self::Incomplete { message, billed },
            Self::Incomplete {
                message,
                billed: earlier,
            } => Self::Incomplete {
                message,
                billed: earlier + billed,
            },
            other => Self::Billed {
                error: Box::new(other),
                billed,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Request-level errors
// ---------------------------------------------------------------------------

/// Machine-readable outcome code exposed at the request boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ValidationError,
    BudgetExceeded,
    RequestTimeout,
    StageFailed,
    ProviderError,
}

impl ErrorCode {
    /// Returns the wire form of the code (e.g. `"BUDGET_EXCEEDED"`).
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "VALIDATION_ERROR",
            Self::BudgetExceeded => "BUDGET_EXCEEDED",
            Self::RequestTimeout => "REQUEST_TIMEOUT",
            Self::StageFailed => "STAGE_FAILED",
            Self::ProviderError => "PROVIDER_ERROR",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every way a request can end other than success.
///
/// No outcome is ever swallowed: the orchestrator converts each variant into a
/// [`crate::RequestFailure`] carrying the stage, cost incurred so far, and the
/// caller's remaining budget.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    /// The request was malformed; rejected before any cost is incurred.
    #[error("invalid request: {message}")]
    Validation { message: String },

    /// The caller's spend window is exhausted. Zero cost; remaining is zero.
    #[error("budget exceeded for caller '{caller}': spent {spent}, limit {limit}")]
    BudgetExceeded {
        caller: CallerId,
        spent: TokenCost,
        limit: CostBudget,
    },

    /// The deadline fired before the pipeline finished.
    ///
    /// Whatever the run eventually costs is still committed.
    #[error("request timed out after {after:?}")]
    RequestTimeout { after: Duration },

    /// A stage reported failure and the pipeline halted.
    #[error("stage '{stage}' failed ({kind}): {reason}")]
    StageFailed {
        stage: StageKind,
        kind: StageFailureKind,
        reason: String,
        cost_incurred: TokenCost,
    },

    /// The generation call failed terminally or exhausted its retries.
    #[error("generation failed ({class}) after {attempts} attempt(s): {message}")]
    Provider {
        class: FailureClass,
        attempts: u32,
        message: String,
        cost_incurred: TokenCost,
    },
}

impl PipelineError {
    /// The boundary code for this outcome.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Validation { .. } => ErrorCode::ValidationError,
            Self::BudgetExceeded { .. } => ErrorCode::BudgetExceeded,
            Self::RequestTimeout { .. } => ErrorCode::RequestTimeout,
            Self::StageFailed { .. } => ErrorCode::StageFailed,
            Self::Provider { .. } => ErrorCode::ProviderError,
        }
    }

    /// The stage that failed, when the outcome is stage-specific.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            Self::StageFailed { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Cost known to have been incurred when this outcome was produced.
    ///
    /// `None` for a timeout: the run is still settling when the caller is told.
    pub fn cost_incurred(&self) -> Option<TokenCost> {
        match self {
            Self::Validation { .. } | Self::BudgetExceeded { .. } => Some(TokenCost::zero()),
            Self::RequestTimeout { .. } => None,
            Self::StageFailed { cost_incurred, .. } | Self::Provider { cost_incurred, .. } => {
                Some(*cost_incurred)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authentication_is_never_retried() {
        let err = ProviderError::Authentication("bad key".into());
        assert_eq!(err.retry_policy(), RetryPolicy::NonRetryable);
        assert_eq!(err.class(), FailureClass::Authentication);
        assert!(err.billed().is_zero());
    }

    #[test]
    fn rate_limit_carries_hint() {
        let err = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
        };
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(3))
            }
        );
    }

    #[test]
    fn incomplete_reports_billed_cost() {
        let err = ProviderError::Incomplete {
            message: "stream reset".into(),
            billed: TokenCost::new(0.25).unwrap(),
        };
        assert!(err.retry_policy().is_retryable());
        assert_eq!(err.billed().as_f64(), 0.25);
        assert_eq!(err.class(), FailureClass::Transient);
    }

    #[test]
    fn billed_amount_survives_every_class_but_authentication() {
        let billed = TokenCost::new(0.3).unwrap();

        let malformed = ProviderError::MalformedResponse {
            message: "aborted mid-generation".into(),
            usage: TokenUsage::default(),
        }
        .with_billed(billed);
        assert_eq!(malformed.class(), FailureClass::MalformedResponse);
        assert!(!malformed.retry_policy().is_retryable());
        assert_eq!(malformed.billed(), billed);

        let limited = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(2)),
        }
        .with_billed(billed);
        assert_eq!(limited.class(), FailureClass::RateLimit);
        assert_eq!(
            limited.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(2))
            }
        );
        assert_eq!(limited.billed(), billed);

        let transient = ProviderError::Transient("502".into()).with_billed(billed);
        assert!(matches!(transient, ProviderError::Incomplete { .. }));
        assert_eq!(transient.billed(), billed);

        let auth = ProviderError::Authentication("revoked".into()).with_billed(billed);
        assert!(auth.billed().is_zero());
    }

    #[test]
    fn malformed_response_keeps_usage() {
        let err = ProviderError::MalformedResponse {
            message: "truncated json".into(),
            usage: TokenUsage::new(120, 40),
        };
        assert!(!err.retry_policy().is_retryable());
        assert_eq!(err.usage(), TokenUsage::new(120, 40));
    }

    #[test]
    fn error_codes_use_screaming_snake_case() {
        let json = serde_json::to_string(&ErrorCode::BudgetExceeded).unwrap();
        assert_eq!(json, "\"BUDGET_EXCEEDED\"");
        assert_eq!(ErrorCode::RequestTimeout.as_str(), "REQUEST_TIMEOUT");
    }

    #[test]
    fn timeout_has_no_settled_cost() {
        let err = PipelineError::RequestTimeout {
            after: Duration::from_millis(100),
        };
        assert_eq!(err.code(), ErrorCode::RequestTimeout);
        assert!(err.cost_incurred().is_none());
        assert!(err.stage().is_none());
    }
}
