//! Stage 2: choose the UI and architecture patterns the result should follow.

use serde::{Deserialize, Serialize};

use pipeline::{StageInput, StageKind};

use super::{render_output, ReplyError, StageDefinition};

const INSTRUCTIONS: &str = "You are a front-end architect. Given a request and its intent \
analysis, choose the design and architecture patterns the implementation should use (layout, \
state management, navigation, theming). Reply with a single JSON object: {\"patterns\": \
[{\"name\": string, \"rationale\": string}], \"layout\": string|null}.";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedPattern {
    pub name: String,
    #[serde(default)]
    pub rationale: String,
}

/// Output of the pattern selection stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternSelection {
    pub patterns: Vec<SelectedPattern>,
    #[serde(default)]
    pub layout: Option<String>,
}

pub struct PatternSelectionStage;

impl StageDefinition for PatternSelectionStage {
    type Output = PatternSelection;

    fn kind(&self) -> StageKind {
        StageKind::PatternSelection
    }

    fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn build_prompt(&self, input: &StageInput) -> String {
        format!(
            "Request:\n{}\n\nIntent analysis:\n{}",
            input.prompt(),
            render_output(input, StageKind::IntentAnalysis)
        )
    }

    fn check(&self, output: &PatternSelection, _input: &StageInput) -> Result<(), ReplyError> {
        if output.patterns.is_empty() {
            return Err(ReplyError::Malformed("no patterns selected".into()));
        }
        if output.patterns.iter().any(|p| p.name.trim().is_empty()) {
            return Err(ReplyError::Malformed("pattern without a name".into()));
        }
        Ok(())
    }
}
