//! Stage 4: turn intent, patterns and the validation verdict into concrete
//! requirements.

use serde::{Deserialize, Serialize};

use pipeline::{StageInput, StageKind};

use super::{render_output, ReplyError, StageDefinition};

const INSTRUCTIONS: &str = "You write implementation requirements for a user-interface \
generator. Combine the request, its intent analysis, the selected patterns and the validation \
notes into a precise list of requirements, the components to build, and any constraints. Reply \
with a single JSON object: {\"requirements\": [string], \"components\": [string], \
\"constraints\": [string]}.";

/// Output of the requirement synthesis stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementSet {
    pub requirements: Vec<String>,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

pub struct RequirementSynthesis;

impl StageDefinition for RequirementSynthesis {
    type Output = RequirementSet;

    fn kind(&self) -> StageKind {
        StageKind::RequirementSynthesis
    }

    fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn temperature(&self) -> f32 {
        0.3
    }

    fn build_prompt(&self, input: &StageInput) -> String {
        format!(
            "Request:\n{}\n\nIntent analysis:\n{}\n\nSelected patterns:\n{}\n\nValidation notes:\n{}",
            input.prompt(),
            render_output(input, StageKind::IntentAnalysis),
            render_output(input, StageKind::PatternSelection),
            render_output(input, StageKind::Validation)
        )
    }

    fn check(&self, output: &RequirementSet, _input: &StageInput) -> Result<(), ReplyError> {
        if output.requirements.iter().all(|r| r.trim().is_empty()) {
            return Err(ReplyError::Malformed("no requirements produced".into()));
        }
        Ok(())
    }
}
