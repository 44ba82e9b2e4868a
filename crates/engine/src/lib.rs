//! Forgeflow orchestration engine.
//!
//! This crate runs the five analysis stages, guards each request with a
//! per-caller spend window and a deadline, and wraps the downstream
//! generation call in bounded retries.
//!
//! ## Architectural Layer
//!
//! **Orchestration layer.** The engine sequences calls between the domain
//! types in [`pipeline`] and the provider traits it defines. Concrete
//! providers live in the `llm` crate.
//!
//! ## Module Layout
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`stages`] | The five stage definitions and the shared `LlmStage` runner |
//! | [`executor`] | Sequential `Pipeline` and the in-flight policy |
//! | [`budget`] | `BudgetGuard` and per-caller `SpendWindow`s |
//! | [`timeout`] | `TimeoutGuard` with exactly-one-outcome delivery |
//! | [`retry`] | `with_retry` and its backoff configuration |
//! | [`orchestrator`] | Request boundary tying everything together |
//! | [`mock`] | Scripted providers for tests |

pub mod budget;
pub mod executor;
pub mod mock;
pub mod orchestrator;
pub mod retry;
pub mod stages;
pub mod timeout;

pub use budget::{BudgetConfig, BudgetDecision, BudgetGuard, SpendWindow};
pub use executor::{InFlightPolicy, Pipeline};
pub use orchestrator::{Orchestrator, OrchestratorConfig};
pub use retry::{with_retry, RetryConfig, RetryError, Retried};
pub use stages::{standard_stages, LlmStage, Stage, StageDefinition};
pub use timeout::{Delivery, PendingRequest, TimeoutGuard};
