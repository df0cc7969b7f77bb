//! Step verification by the large tier.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::model::{CompletionOptions, SharedModel};
use crate::util::extract_first_json;

use super::executor::StepResult;
use super::planner::PlanStep;

/// Verification temperature.
const VERIFY_TEMPERATURE: f32 = 0.1;

/// What to do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Move on to the next step.
    Proceed,
    /// Run the step again.
    Retry,
    /// Hand the task to a human.
    Escalate,
    /// Stop the task entirely.
    Abort,
}

/// A change to the remaining plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum PlanAdjustment {
    /// Skip a later step.
    Skip {
        /// The step to skip.
        step: usize,
    },
    /// Rewrite a later step's description.
    Modify {
        /// The step to modify.
        step: usize,
        /// The new description.
        description: String,
    },
    /// Add a step after the given one.
    Add {
        /// Insert after this step.
        after: usize,
        /// What the new step does.
        description: String,
    },
}

/// The verifier's decision on a step result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationDecision {
    /// What to do next.
    pub verdict: Verdict,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Why.
    pub reasoning: String,
    /// How to retry, when the verdict is retry.
    #[serde(default)]
    pub retry_strategy: Option<String>,
    /// Changes to the remaining plan.
    #[serde(default)]
    pub adjustments: Vec<PlanAdjustment>,
}

impl VerificationDecision {
    /// The decision taken when verification itself cannot be trusted.
    #[must_use]
    pub fn escalate(reasoning: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Escalate,
            confidence: 0.0,
            reasoning: reasoning.into(),
            retry_strategy: None,
            adjustments: Vec::new(),
        }
    }
}

/// Reads step results and decides whether to proceed, retry, escalate, or
/// abort. When in doubt (transport failure, unparsable reply) it escalates.
pub struct Verifier {
    model: SharedModel,
}

impl Verifier {
    /// Create a verifier over the verification model.
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    /// Verify one step result against the remaining plan.
    pub async fn verify(
        &self,
        result: &StepResult,
        remaining: &[PlanStep],
    ) -> VerificationDecision {
        let prompt = format!(
            "A task step just finished. Decide what happens next.\n\
             Reply with only JSON: {{\"verdict\": \"proceed\"|\"retry\"|\"escalate\"|\"abort\",\n\
             \"confidence\": number in [0,1], \"reasoning\": string,\n\
             \"retry_strategy\": string or null,\n\
             \"adjustments\": [{{\"action\": \"skip\", \"step\": int}} |\n\
             {{\"action\": \"modify\", \"step\": int, \"description\": string}} |\n\
             {{\"action\": \"add\", \"after\": int, \"description\": string}}]}}.\n\
             If you are not sure, escalate.\n\n\
             Step {} finished with status {:?}.\nSummary: {}\nErrors: {}\n\n\
             Remaining steps:\n{}",
            result.step_number,
            result.status,
            result.summary,
            result.errors.join("; "),
            remaining
                .iter()
                .map(|s| format!("{}. {}", s.number, s.description))
                .collect::<Vec<_>>()
                .join("\n"),
        );

        let response = match self
            .model
            .complete(
                &prompt,
                CompletionOptions::default().with_temperature(VERIFY_TEMPERATURE),
            )
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "verifier call failed");
                return VerificationDecision::escalate(format!(
                    "verifier unavailable: {error}"
                ));
            }
        };

        let Some(value) = extract_first_json(&response.content) else {
            return VerificationDecision::escalate("verifier returned no JSON decision");
        };
        match serde_json::from_value(value) {
            Ok(decision) => decision,
            Err(error) => {
                VerificationDecision::escalate(format!("malformed verifier decision: {error}"))
            }
        }
    }
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier").finish_non_exhaustive()
    }
}
