//! Core domain for Forgeflow.
//!
//! This crate contains every domain concept, newtype identifier, shared value
//! type, and cross-cutting error type used by the agent pipeline, plus the port
//! traits for the two external capabilities it consumes. Infrastructure crates
//! implement the traits defined here; they never add domain rules.
//!
//! ## Architectural Layer
//!
//! **Business logic + port definitions.** This crate has no I/O dependencies.
//! It defines *what* is needed; infrastructure crates define *how* to supply it.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`identifiers`] | Newtype domain identifiers (`CallerId`, `RequestId`, etc.) |
//! | [`types`] | Shared value types (`TokenCost`, `CostBudget`, `Timestamp`, etc.) |
//! | [`errors`] | Provider failure taxonomy, request errors, retry policy |
//! | [`run`] | Stages, stage results, and sealed pipeline runs |
//! | [`pricing`] | Static per-provider price table |
//! | [`ports`] | `CompletionProvider` and `GenerationProvider` traits |
//! | [`request`] | Request/response types exposed to callers |

pub mod errors;
pub mod identifiers;
pub mod ports;
pub mod pricing;
pub mod request;
pub mod run;
pub mod types;

// Re-export everything at the crate root for ergonomic usage by downstream crates.
pub use errors::{ErrorCode, FailureClass, PipelineError, ProviderError, RetryPolicy};
pub use identifiers::{CallerId, GenerationId, ModelName, PipelineRunId, ProviderName, RequestId};
pub use ports::{
    Completion, CompletionProvider, CompletionRequest, GeneratedFile, Generation,
    GenerationProvider, GenerationRequest,
};
pub use pricing::{ModelPrice, PriceTable};
pub use request::{
    PipelineRequest, PipelineResponse, RequestFailure, RequestOutcome, ValidatedRequest,
    MAX_PROMPT_CHARS,
};
pub use run::{
    PipelineRun, RunRecorder, StageFailure, StageFailureKind, StageInput, StageKind, StageResult,
};
pub use types::{CostBudget, ModelTier, Timestamp, TokenCost, TokenCount, TokenUsage};
