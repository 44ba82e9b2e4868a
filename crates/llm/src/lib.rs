//! Forgeflow provider adapters.
//!
//! Implements [`pipeline::CompletionProvider`] for Anthropic's Messages API
//! and [`pipeline::GenerationProvider`] for the component-generation service.
//! Further providers are added as new implementations in this crate without
//! any change to `pipeline` or `engine`.
//!
//! ## Architectural Layer
//!
//! **Infrastructure.** HTTP transport, request formatting, response parsing
//! and the mapping of HTTP statuses onto [`pipeline::ProviderError`] live
//! here. Retries do not: adapters report each failure once and the engine
//! decides whether to try again.

pub mod anthropic;
pub mod generation;
mod status;

pub use anthropic::{AnthropicConfig, AnthropicProvider};
pub use generation::{GenerationClientConfig, HttpGenerationClient};

/// Errors raised while constructing an adapter.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    #[error("invalid provider configuration: {0}")]
    InvalidConfig(String),
}
