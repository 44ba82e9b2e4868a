//! Stage 1: work out what the caller is asking for.

use serde::{Deserialize, Serialize};

use pipeline::{StageInput, StageKind};

use super::{ReplyError, StageDefinition};

const INSTRUCTIONS: &str = "You analyse requests for user-interface components and small web \
applications. Identify the category of thing being asked for, summarise it in one sentence, \
list the concrete features requested, and rate its complexity. Reply with a single JSON object: \
{\"category\": string, \"summary\": string, \"features\": [string], \"complexity\": \
\"simple\"|\"moderate\"|\"complex\"}. Use one of these categories when it fits: web_app, \
component, landing_page, dashboard, form, game, tool.";

/// How much work the request implies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    #[default]
    Moderate,
    Complex,
}

/// Output of the intent analysis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentAnalysis {
    pub category: String,
    pub summary: String,
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub complexity: Complexity,
}

pub struct IntentAnalysisStage;

impl StageDefinition for IntentAnalysisStage {
    type Output = IntentAnalysis;

    fn kind(&self) -> StageKind {
        StageKind::IntentAnalysis
    }

    fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn build_prompt(&self, input: &StageInput) -> String {
        format!("Request:\n{}", input.prompt())
    }

    fn check(&self, output: &IntentAnalysis, _input: &StageInput) -> Result<(), ReplyError> {
        if output.category.trim().is_empty() {
            return Err(ReplyError::Malformed("intent category is empty".into()));
        }
        if output.summary.trim().is_empty() {
            return Err(ReplyError::Malformed("intent summary is empty".into()));
        }
        Ok(())
    }
}
