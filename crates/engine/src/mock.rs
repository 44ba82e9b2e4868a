//! Scripted providers for deterministic tests without network calls.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use pipeline::{
    Completion, CompletionProvider, CompletionRequest, Generation, GenerationId,
    GenerationProvider, GenerationRequest, GeneratedFile, ModelName, ModelPrice, PriceTable,
    ProviderError, ProviderName, TokenCost, TokenUsage,
};

pub const MOCK_PROVIDER: &str = "mock";
pub const MOCK_MODEL: &str = "mock-model";

/// Pre-programmed reply for [`MockCompletionProvider`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Text { text: String, usage: TokenUsage },
    Error(ProviderError),
    /// Wait, then produce the inner reply.
    Delay(Duration, Box<MockReply>),
}

impl MockReply {
    pub fn json(value: Value, usage: TokenUsage) -> Self {
        Self::Text {
            text: value.to_string(),
            usage,
        }
    }

    pub fn text(text: &str, usage: TokenUsage) -> Self {
        Self::Text {
            text: text.to_string(),
            usage,
        }
    }

    pub fn delayed(delay: Duration, inner: MockReply) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Completion provider that answers from a queue of scripted replies.
///
/// Once the queue is empty every call fails with a transient error.
pub struct MockCompletionProvider {
    name: ProviderName,
    model: ModelName,
    replies: Mutex<VecDeque<MockReply>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockCompletionProvider {
    pub fn new(replies: Vec<MockReply>) -> Self {
        Self {
            name: ProviderName::new(MOCK_PROVIDER).expect("static name"),
            model: ModelName::new(MOCK_MODEL).expect("static name"),
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of calls made so far.
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every request received, in call order.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for MockCompletionProvider {
    fn name(&self) -> &ProviderName {
        &self.name
    }

    fn model(&self) -> &ModelName {
        &self.model
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, ProviderError> {
        self.requests.lock().push(request.clone());
        let mut reply = self.replies.lock().pop_front();
        loop {
            match reply {
                None => {
                    return Err(ProviderError::Transient(
                        "mock provider has no reply configured".into(),
                    ))
                }
                Some(MockReply::Text { text, usage }) => {
                    return Ok(Completion {
                        text,
                        usage,
                        model: self.model.clone(),
                    })
                }
                Some(MockReply::Error(e)) => return Err(e),
                Some(MockReply::Delay(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    reply = Some(*inner);
                }
            }
        }
    }
}

/// Pre-programmed result for [`MockGenerationProvider`].
#[derive(Debug, Clone)]
pub enum MockGeneration {
    Ok(Generation),
    Error(ProviderError),
    Delay(Duration, Box<MockGeneration>),
}

impl MockGeneration {
    pub fn delayed(delay: Duration, inner: MockGeneration) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Generation provider that answers from a queue of scripted results.
pub struct MockGenerationProvider {
    results: Mutex<VecDeque<MockGeneration>>,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl MockGenerationProvider {
    pub fn new(results: Vec<MockGeneration>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl GenerationProvider for MockGenerationProvider {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, ProviderError> {
        self.requests.lock().push(request.clone());
        let mut next = self.results.lock().pop_front();
        loop {
            match next {
                None => {
                    return Err(ProviderError::Transient(
                        "mock generator has no result configured".into(),
                    ))
                }
                Some(MockGeneration::Ok(g)) => return Ok(g),
                Some(MockGeneration::Error(e)) => return Err(e),
                Some(MockGeneration::Delay(delay, inner)) => {
                    tokio::time::sleep(delay).await;
                    next = Some(*inner);
                }
            }
        }
    }
}

/// Prices the mock model at $10 per million input tokens and nothing for
/// output, so 1 000 input tokens cost exactly $0.01.
pub fn mock_prices() -> PriceTable {
    PriceTable::new(ModelPrice::new(0.0, 0.0)).with_model(
        MOCK_PROVIDER,
        MOCK_MODEL,
        ModelPrice::new(10.0, 0.0),
    )
}

/// Valid replies for all five stages costing $0.01, $0.02, $0.01, $0.03 and
/// $0.02 under [`mock_prices`].
pub fn happy_path_replies() -> Vec<MockReply> {
    vec![
        MockReply::json(
            serde_json::json!({
                "category": "web_app",
                "summary": "A todo list application with a dark theme",
                "features": ["add tasks", "complete tasks", "dark mode"],
                "complexity": "simple"
            }),
            TokenUsage::new(1_000, 0),
        ),
        MockReply::json(
            serde_json::json!({
                "patterns": [
                    { "name": "single-page list", "rationale": "one view suffices" },
                    { "name": "dark theme tokens", "rationale": "requested explicitly" }
                ],
                "layout": "centered column"
            }),
            TokenUsage::new(2_000, 0),
        ),
        MockReply::json(
            serde_json::json!({ "approved": true, "reason": "supported request", "issues": [] }),
            TokenUsage::new(1_000, 0),
        ),
        MockReply::json(
            serde_json::json!({
                "requirements": ["add a task", "mark a task done", "dark colour scheme"],
                "components": ["TaskList", "TaskInput"],
                "constraints": ["no backend"]
            }),
            TokenUsage::new(3_000, 0),
        ),
        MockReply::json(
            serde_json::json!({
                "title": "Dark todo app",
                "prompt": "Build a single-page todo app with a dark theme.",
                "model_tier": "mini"
            }),
            TokenUsage::new(2_000, 0),
        ),
    ]
}

/// A finished generation billed at `cost` USD.
pub fn sample_generation(cost: f64) -> Generation {
    Generation {
        id: GenerationId::new("gen-1").expect("static id"),
        preview_url: Some("https://preview.invalid/gen-1".into()),
        files: vec![GeneratedFile {
            name: "App.tsx".into(),
            content: "export default function App() { return null; }".into(),
        }],
        cost: TokenCost::new(cost).unwrap_or_default(),
    }
}
