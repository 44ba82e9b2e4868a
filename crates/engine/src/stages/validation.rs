//! Stage 3: decide whether the request is something the pipeline should build.
//!
//! A well-formed verdict that rejects the request is a stage failure, not a
//! success: downstream stages never see a rejected request.

use serde::{Deserialize, Serialize};

use pipeline::{StageInput, StageKind};

use super::{render_output, IntentAnalysis, ReplyError, StageDefinition};

/// Intent categories the generation service can deliver.
pub const SUPPORTED_CATEGORIES: &[&str] = &[
    "web_app",
    "component",
    "landing_page",
    "dashboard",
    "form",
    "game",
    "tool",
];

const INSTRUCTIONS: &str = "You review requests before any code is generated. Reject requests \
that are harmful, that ask for something other than a user interface or small web application, \
or whose chosen patterns cannot satisfy them. Reply with a single JSON object: {\"approved\": \
boolean, \"reason\": string, \"issues\": [string]}.";

/// Output of the validation stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    pub approved: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub issues: Vec<String>,
}

pub struct Validation;

impl StageDefinition for Validation {
    type Output = ValidationVerdict;

    fn kind(&self) -> StageKind {
        StageKind::Validation
    }

    fn instructions(&self) -> &'static str {
        INSTRUCTIONS
    }

    fn temperature(&self) -> f32 {
        0.0
    }

    fn build_prompt(&self, input: &StageInput) -> String {
        format!(
            "Request:\n{}\n\nIntent analysis:\n{}\n\nSelected patterns:\n{}",
            input.prompt(),
            render_output(input, StageKind::IntentAnalysis),
            render_output(input, StageKind::PatternSelection)
        )
    }

    fn check(&self, verdict: &ValidationVerdict, input: &StageInput) -> Result<(), ReplyError> {
        if !verdict.approved {
            let reason = if verdict.reason.trim().is_empty() {
                "request rejected by validation".to_string()
            } else {
                verdict.reason.clone()
            };
            return Err(ReplyError::Rejected(reason));
        }
        if let Some(intent) = input.output_as::<IntentAnalysis>(StageKind::IntentAnalysis) {
            let category = intent.category.trim().to_ascii_lowercase();
            if !SUPPORTED_CATEGORIES.contains(&category.as_str()) {
                return Err(ReplyError::Rejected(format!(
                    "unsupported intent category '{}'",
                    intent.category
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn input_with_category(category: &str) -> StageInput {
        let mut input = StageInput::new("p");
        input.insert(
            StageKind::IntentAnalysis,
            json!({ "category": category, "summary": "s" }),
        );
        input
    }

    fn approved() -> ValidationVerdict {
        ValidationVerdict {
            approved: true,
            reason: String::new(),
            issues: vec![],
        }
    }

    #[test]
    fn approved_supported_request_passes() {
        assert!(Validation
            .check(&approved(), &input_with_category("Dashboard"))
            .is_ok());
    }

    #[test]
    fn disapproval_is_a_rejection() {
        let verdict = ValidationVerdict {
            approved: false,
            reason: "asks for a backend service".into(),
            issues: vec![],
        };
        assert_eq!(
            Validation.check(&verdict, &input_with_category("web_app")),
            Err(ReplyError::Rejected("asks for a backend service".into()))
        );
    }

    #[test]
    fn unsupported_category_is_rejected_even_when_approved() {
        let result = Validation.check(&approved(), &input_with_category("mobile_native_app"));
        assert!(matches!(result, Err(ReplyError::Rejected(r)) if r.contains("mobile_native_app")));
    }
}
