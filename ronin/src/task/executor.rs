//! Single-step execution for the task runner.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::model::{CompletionOptions, SharedModel};

use super::planner::PlanStep;

/// Step execution temperature.
const STEP_TEMPERATURE: f32 = 0.1;

/// Estimated cost per thousand tokens, in USD.
const COST_PER_1K_TOKENS: f64 = 0.01;

/// How a step went.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Every success criterion was met.
    Success,
    /// Some criteria were met.
    Partial,
    /// No criteria were met, or the step errored.
    Failed,
}

/// The outcome of executing one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// The step that ran.
    pub step_number: usize,
    /// Outcome classification.
    pub status: StepStatus,
    /// The agent's summary of what happened.
    pub summary: String,
    /// Errors encountered along the way.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Estimated cost in USD.
    pub cost: f64,
}

/// Runs one plan step and reports a summary.
#[async_trait]
pub trait StepAgent: Send + Sync {
    /// Execute the step described by the prompt; returns a summary and a
    /// token count for cost accounting.
    async fn run_step(&self, prompt: &str) -> Result<(String, u64)>;
}

/// Default step agent: a medium-tier model at low temperature.
pub struct ModelStepAgent {
    model: SharedModel,
}

impl ModelStepAgent {
    /// Create the agent over a model.
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }
}

#[async_trait]
impl StepAgent for ModelStepAgent {
    async fn run_step(&self, prompt: &str) -> Result<(String, u64)> {
        let response = self
            .model
            .complete(
                prompt,
                CompletionOptions::default().with_temperature(STEP_TEMPERATURE),
            )
            .await?;
        Ok((response.content, response.usage.total_tokens))
    }
}

impl std::fmt::Debug for ModelStepAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelStepAgent").finish_non_exhaustive()
    }
}

/// Executes plan steps one at a time.
pub struct StepExecutor {
    agent: Arc<dyn StepAgent>,
}

impl StepExecutor {
    /// Create an executor over a step agent.
    #[must_use]
    pub fn new(agent: Arc<dyn StepAgent>) -> Self {
        Self { agent }
    }

    /// Execute one step; failures land in the result, never in `Err`.
    pub async fn execute(&self, step: &PlanStep, task: &str) -> StepResult {
        let started = Instant::now();
        let prompt = build_prompt(step, task);

        match self.agent.run_step(&prompt).await {
            Ok((summary, tokens)) => {
                let status = classify(&summary, &step.success_criteria);
                debug!(step = step.number, status = ?status, "step executed");
                StepResult {
                    step_number: step.number,
                    status,
                    summary,
                    errors: Vec::new(),
                    duration_ms: started.elapsed().as_millis() as u64,
                    cost: tokens as f64 / 1000.0 * COST_PER_1K_TOKENS,
                }
            }
            Err(error) => StepResult {
                step_number: step.number,
                status: StepStatus::Failed,
                summary: String::new(),
                errors: vec![error.to_string()],
                duration_ms: started.elapsed().as_millis() as u64,
                cost: 0.0,
            },
        }
    }
}

impl std::fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepExecutor").finish_non_exhaustive()
    }
}

fn build_prompt(step: &PlanStep, task: &str) -> String {
    format!(
        "You are executing step {} of a larger task.\n\n\
         Overall task: {task}\n\nStep: {}\nActions:\n{}\n\n\
         Success criteria:\n{}\n\n\
         Do the work and end with a concise summary of what was accomplished.",
        step.number,
        step.description,
        step.actions
            .iter()
            .map(|a| format!("- {a}"))
            .collect::<Vec<_>>()
            .join("\n"),
        step.success_criteria
            .iter()
            .map(|c| format!("- {c}"))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}

/// Match success criteria against the summary: all matched is success, some
/// is partial, none is failed.
fn classify(summary: &str, criteria: &[String]) -> StepStatus {
    if criteria.is_empty() {
        return if summary.is_empty() {
            StepStatus::Failed
        } else {
            StepStatus::Success
        };
    }
    let summary = summary.to_lowercase();
    let matched = criteria
        .iter()
        .filter(|criterion| criterion_matches(&summary, criterion))
        .count();
    if matched == criteria.len() {
        StepStatus::Success
    } else if matched > 0 {
        StepStatus::Partial
    } else {
        StepStatus::Failed
    }
}

/// A criterion matches when at least half of its significant words appear.
fn criterion_matches(summary: &str, criterion: &str) -> bool {
    let keywords: Vec<String> = criterion
        .to_lowercase()
        .split_whitespace()
        .filter(|w| w.len() > 3)
        .map(ToString::to_string)
        .collect();
    if keywords.is_empty() {
        return summary.contains(&criterion.to_lowercase());
    }
    let hits = keywords.iter().filter(|w| summary.contains(w.as_str())).count();
    hits * 2 >= keywords.len()
}
