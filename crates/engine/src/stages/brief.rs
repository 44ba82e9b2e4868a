//! Stage 5: write the prompt handed to the generation service.
//!
//! The payload of this stage is the run's final artifact.

use serde::{Deserialize, Serialize};

use pipeline::{ModelTier, StageInput, StageKind};

use super::{render_output, ReplyError, StageDefinition};

const INSTRUCTIONS: &str = "You write prompts for a user-interface code generator. Produce a \
single, self-contained prompt that fully specifies what to build from the requirements given, \
and pick the generator tier: \"mini\" for a single small component, \"standard\" for typical \
apps, \"max\" for complex multi-view applications. Reply with a single JSON object: \
{\"title\": string, \"prompt\": string, \"model_tier\": string}.";

/// Output of the prompt building stage and final artifact of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationBrief {
    #[serde(default)]
    pub title: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub model_tier: Option<String>,
}

impl GenerationBrief {
    /// Tier to request; unknown or missing tiers fall back to the default.
    pub fn tier(&self) -> ModelTier {
        self.model_tier
            .as_deref()
            .and_then(ModelTier::parse)
            .unwrap_or_default()
    }
}

pub struct PromptBuilding;

impl StageDefinition for PromptBuilding {
    type Output = GenerationBrief;

    fn kind(&self) -> StageKind {
        StageKind::PromptBuilding
    }

    fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn temperature(&self) -> f32 {
        0.4
    }

    fn build_prompt(&self, input: &StageInput) -> String {
        format!(
            "Original request:\n{}\n\nIntent analysis:\n{}\n\nSelected patterns:\n{}\n\nRequirements:\n{}",
            input.prompt(),
            render_output(input, StageKind::IntentAnalysis),
            render_output(input, StageKind::PatternSelection),
            render_output(input, StageKind::RequirementSynthesis)
        )
    }

    fn check(&self, brief: &GenerationBrief, _input: &StageInput) -> Result<(), ReplyError> {
        if brief.prompt.trim().is_empty() {
            return Err(ReplyError::Malformed("generation prompt is empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_falls_back_to_standard() {
        let brief = GenerationBrief {
            title: None,
            prompt: "build it".into(),
            model_tier: Some("enormous".into()),
        };
        assert_eq!(brief.tier(), ModelTier::Standard);

        let brief = GenerationBrief {
            model_tier: Some("max".into()),
            ..brief
        };
        assert_eq!(brief.tier(), ModelTier::Max);
    }
}
