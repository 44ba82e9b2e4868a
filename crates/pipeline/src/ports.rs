//! Port traits for the external capabilities the pipeline consumes.
//!
//! Infrastructure crates (see `llm`) implement these; the orchestration crate
//! depends only on the traits. Implementations must be cancel-safe: the
//! orchestrator aborts an in-flight call by dropping its future when a
//! request's deadline fires.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{GenerationId, ModelName, ModelTier, ProviderError, ProviderName, TokenCost, TokenUsage};

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// One text-completion call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: f32,
}

/// Reply to a [`CompletionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    pub usage: TokenUsage,
    /// Model that actually served the call, used for pricing.
    pub model: ModelName,
}

/// Text-completion capability used by every analysis stage.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name used as the price-table key (e.g. `"anthropic"`).
    fn name(&self) -> &ProviderName;

    /// Model requests are sent to. Used to price failed calls, whose reply
    /// does not name the serving model.
    fn model(&self) -> &ModelName;

    /// Runs one completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError>;
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// One call to the downstream component-generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub model_tier: ModelTier,
}

/// A file produced by the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub name: String,
    pub content: String,
}

/// Deliverable returned by the generation service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub id: GenerationId,
    pub preview_url: Option<String>,
    pub files: Vec<GeneratedFile>,
    /// Amount the service billed for this generation.
    pub cost: TokenCost,
}

/// Component-generation capability wrapped by the retry wrapper.
#[async_trait]
pub trait GenerationProvider: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError>;
}
