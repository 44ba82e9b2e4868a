//! HTTP client for the downstream component-generation service.
//!
//! The service accepts `POST {base_url}/v1/generations` with
//! `{"prompt", "modelTier"}` and answers with the generated files, an
//! optional preview URL, and the amount it billed. A failed generation may
//! still report `billedCost` for the work done before it failed.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use pipeline::{
    GeneratedFile, Generation, GenerationId, GenerationProvider, GenerationRequest, ModelTier,
    ProviderError, TokenCost, TokenUsage,
};

use crate::status::{classify_status, transport_error};
use crate::LlmError;

#[derive(Debug, Clone)]
pub struct GenerationClientConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
}

pub struct HttpGenerationClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    request_timeout: Duration,
}

impl HttpGenerationClient {
    pub fn new(config: GenerationClientConfig) -> Result<Self, LlmError> {
        let base = config.base_url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(LlmError::InvalidConfig("generation base url is empty".into()));
        }
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(LlmError::HttpClient)?;
        Ok(Self {
            client,
            endpoint: format!("{base}/v1/generations"),
            api_key: config.api_key.filter(|k| !k.trim().is_empty()),
            request_timeout: config.request_timeout,
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateBody<'a> {
    prompt: &'a str,
    model_tier: ModelTier,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    id: String,
    #[serde(default)]
    preview_url: Option<String>,
    #[serde(default)]
    files: Vec<FileBody>,
    #[serde(default)]
    cost: f64,
}

#[derive(Deserialize)]
struct FileBody {
    name: String,
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    billed_cost: Option<f64>,
}

fn parse_success(body: &str) -> Result<Generation, ProviderError> {
    let parsed: GenerateResponse =
        serde_json::from_str(body).map_err(|e| ProviderError::MalformedResponse {
            message: format!("undecodable generation response: {e}"),
            usage: TokenUsage::default(),
        })?;
    let id = GenerationId::new(parsed.id).ok_or_else(|| ProviderError::MalformedResponse {
        message: "generation response has an empty id".into(),
        usage: TokenUsage::default(),
    })?;
    Ok(Generation {
        id,
        preview_url: parsed.preview_url,
        files: parsed
            .files
            .into_iter()
            .map(|f| GeneratedFile {
                name: f.name,
                content: f.content,
            })
            .collect(),
        cost: TokenCost::new(parsed.cost).unwrap_or_default(),
    })
}

/// Maps a failed response. A billed amount reported in the body is kept on
/// the error whatever its class; see [`ProviderError::with_billed`].
fn parse_failure(status: u16, retry_after: Option<&str>, body: &str) -> ProviderError {
    let parsed: Option<ErrorBody> = serde_json::from_str(body).ok();
    let detail = parsed
        .as_ref()
        .and_then(|b| b.error.as_deref())
        .unwrap_or(body);
    let err = classify_status(status, retry_after, detail);
    match parsed
        .and_then(|b| b.billed_cost)
        .and_then(TokenCost::new)
    {
        Some(billed) => err.with_billed(billed),
        None => err,
    }
}

#[async_trait]
impl GenerationProvider for HttpGenerationClient {
    #[instrument(skip_all, fields(tier = request.model_tier.as_str()))]
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError> {
        let mut builder = self.client.post(&self.endpoint).json(&GenerateBody {
            prompt: &request.prompt,
            model_tier: request.model_tier,
        });
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&e, self.request_timeout))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response
            .text()
            .await
            .map_err(|e| transport_error(&e, self.request_timeout))?;

        if !status.is_success() {
            let err = parse_failure(status.as_u16(), retry_after.as_deref(), &body);
            warn!(status = status.as_u16(), class = %err.class(), billed = %err.billed(), "generation request failed");
            return Err(err);
        }

        let generation = parse_success(&body)?;
        info!(
            generation_id = %generation.id,
            files = generation.files.len(),
            cost = %generation.cost,
            "generation completed"
        );
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline::{FailureClass, RetryPolicy};
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(base_url: String) -> HttpGenerationClient {
        HttpGenerationClient::new(GenerationClientConfig {
            base_url,
            api_key: Some("gen-key".into()),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    fn request() -> GenerationRequest {
        GenerationRequest {
            prompt: "Build a dark todo app".into(),
            model_tier: ModelTier::Mini,
        }
    }

    #[test]
    fn transient_failure_with_billed_cost_is_incomplete() {
        let body = json!({ "error": "worker crashed", "billedCost": 0.02 }).to_string();
        let err = parse_failure(502, None, &body);
        assert!(matches!(err, ProviderError::Incomplete { .. }));
        assert!((err.billed().as_f64() - 0.02).abs() < 1e-9);
        assert!(err.retry_policy().is_retryable());
        assert!(err.to_string().contains("worker crashed"));
    }

    #[test]
    fn auth_failure_ignores_billed_cost() {
        let body = json!({ "error": "bad key", "billedCost": 0.5 }).to_string();
        let err = parse_failure(401, None, &body);
        assert_eq!(err.class(), FailureClass::Authentication);
        assert!(err.billed().is_zero());
    }

    #[test]
    fn rejected_request_keeps_billed_cost() {
        let body = json!({ "error": "aborted mid-generation", "billedCost": 0.3 }).to_string();
        for status in [400, 422] {
            let err = parse_failure(status, None, &body);
            assert_eq!(err.class(), FailureClass::MalformedResponse);
            assert!(!err.retry_policy().is_retryable());
            assert!((err.billed().as_f64() - 0.3).abs() < 1e-9);
            assert!(err.to_string().contains("aborted mid-generation"));
        }
    }

    #[tokio::test]
    async fn rate_limit_keeps_billed_cost_and_hint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(429)
                    .insert_header("retry-after", "2")
                    .set_body_json(json!({ "error": "slow down", "billedCost": 0.3 })),
            )
            .mount(&server)
            .await;

        let err = client(server.uri()).generate(&request()).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::RateLimit);
        assert_eq!(
            err.retry_policy(),
            RetryPolicy::Retryable {
                after: Some(Duration::from_secs(2))
            }
        );
        assert!((err.billed().as_f64() - 0.3).abs() < 1e-9);
    }

    #[test]
    fn missing_id_is_malformed() {
        let err = parse_success(r#"{"id":"","files":[]}"#).unwrap_err();
        assert_eq!(err.class(), FailureClass::MalformedResponse);
    }

    #[tokio::test]
    async fn posts_prompt_and_tier() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/generations"))
            .and(header("authorization", "Bearer gen-key"))
            .and(body_json(json!({ "prompt": "Build a dark todo app", "modelTier": "mini" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "gen-42",
                "previewUrl": "https://preview.example/gen-42",
                "files": [{ "name": "App.tsx", "content": "export {}" }],
                "cost": 0.05
            })))
            .expect(1)
            .mount(&server)
            .await;

        let generation = client(server.uri()).generate(&request()).await.unwrap();
        assert_eq!(generation.id.as_str(), "gen-42");
        assert_eq!(generation.files.len(), 1);
        assert!((generation.cost.as_f64() - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let err = client(server.uri()).generate(&request()).await.unwrap_err();
        assert_eq!(err.class(), FailureClass::Transient);
        assert!(err.billed().is_zero());
    }
}
