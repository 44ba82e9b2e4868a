//! Completion provider backed by Anthropic's Messages API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use pipeline::{
    Completion, CompletionProvider, CompletionRequest, ModelName, ProviderError, ProviderName,
    TokenUsage,
};

use crate::status::{classify_status, transport_error};
use crate::LlmError;

pub const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
pub const DEFAULT_MAX_TOKENS: u32 = 4_096;
const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

#[derive(Debug, Clone)]
pub struct AnthropicConfig {
    pub api_key: String,
    pub model: ModelName,
    pub base_url: String,
    pub max_tokens: u32,
    pub request_timeout: Duration,
}

pub struct AnthropicProvider {
    client: Client,
    name: ProviderName,
    config: AnthropicConfig,
    endpoint: String,
}

impl AnthropicProvider {
    pub fn new(config: AnthropicConfig) -> Result<Self, LlmError> {
        if config.api_key.trim().is_empty() {
            return Err(LlmError::InvalidConfig("anthropic api key is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(LlmError::HttpClient)?;
        let name = ProviderName::new(PROVIDER)
            .ok_or_else(|| LlmError::InvalidConfig("provider name".into()))?;
        let endpoint = format!("{}/v1/messages", config.base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            name,
            config,
            endpoint,
        })
    }
}

#[derive(Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    temperature: f32,
    messages: [Message<'a>; 1],
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct MessagesResponse {
    model: Option<String>,
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize, Default, Clone, Copy)]
struct Usage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

impl From<Usage> for TokenUsage {
    fn from(u: Usage) -> Self {
        TokenUsage::new(u.input_tokens, u.output_tokens)
    }
}

/// Decodes a successful Messages API body.
///
/// A body that does not decode still has its `usage` block salvaged where
/// possible, since the tokens were billed either way.
fn parse_body(body: &str, requested: &ModelName) -> Result<Completion, ProviderError> {
    let parsed: MessagesResponse = match serde_json::from_str(body) {
        Ok(p) => p,
        Err(e) => {
            let usage = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| serde_json::from_value::<Usage>(v.get("usage")?.clone()).ok())
                .unwrap_or_default();
            return Err(ProviderError::MalformedResponse {
                message: format!("undecodable messages response: {e}"),
                usage: usage.into(),
            });
        }
    };

    let text: String = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect();
    let usage = TokenUsage::from(parsed.usage);
    if text.is_empty() {
        return Err(ProviderError::MalformedResponse {
            message: "response has no text content".into(),
            usage,
        });
    }
    let model = parsed
        .model
        .and_then(ModelName::new)
        .unwrap_or_else(|| requested.clone());
    Ok(Completion { text, usage, model })
}

#[async_trait]
impl CompletionProvider for AnthropicProvider {
    fn name(&self) -> &ProviderName {
        &self.name
    }

    fn model(&self) -> &ModelName {
        &self.config.model
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        let body = MessagesRequest {
            model: self.config.model.as_str(),
            max_tokens: self.config.max_tokens,
            system: &request.system_prompt,
            temperature: request.temperature,
            messages: [Message {
                role: "user",
                content: &request.user_prompt,
            }],
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(&e, self.config.request_timeout))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&e, self.config.request_timeout))?;

        if !status.is_success() {
            let err = classify_status(status.as_u16(), retry_after.as_deref(), &text);
            warn!(status = status.as_u16(), class = %err.class(), "messages request failed");
            return Err(err);
        }

        let completion = parse_body(&text, &self.config.model)?;
        debug!(
            input_tokens = completion.usage.input.as_u64(),
            output_tokens = completion.usage.output.as_u64(),
            "completion received"
        );
        Ok(completion)
    }
}
