//! Multi-step plan production and validation.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{CompletionOptions, SharedModel};
use crate::util::extract_first_json;

/// Allowed plan sizes.
pub const MIN_STEPS: usize = 3;
/// Allowed plan sizes.
pub const MAX_STEPS: usize = 7;

/// One step of an execution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Step number, sequential from 1.
    pub number: usize,
    /// What the step accomplishes.
    pub description: String,
    /// Explicit actions to take.
    #[serde(default)]
    pub actions: Vec<String>,
    /// Criteria that mark the step as done.
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Steps this one depends on; all strictly earlier.
    #[serde(default)]
    pub depends_on: Vec<usize>,
    /// Rough duration estimate.
    #[serde(default)]
    pub estimated_minutes: u32,
}

/// An ordered, validated plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    /// The steps, in execution order.
    pub steps: Vec<PlanStep>,
}

impl ExecutionPlan {
    /// Validate plan shape: 3-7 steps, sequential numbering from 1, and no
    /// forward or circular dependencies.
    pub fn validate(&self) -> Result<()> {
        if self.steps.len() < MIN_STEPS || self.steps.len() > MAX_STEPS {
            return Err(Error::planning(format!(
                "plan must have {MIN_STEPS}-{MAX_STEPS} steps, got {}",
                self.steps.len()
            )));
        }
        for (index, step) in self.steps.iter().enumerate() {
            let expected = index + 1;
            if step.number != expected {
                return Err(Error::planning(format!(
                    "step numbers must be sequential from 1; position {expected} has number {}",
                    step.number
                )));
            }
            for &dep in &step.depends_on {
                if dep >= step.number {
                    return Err(Error::planning(format!(
                        "step {} depends on step {dep}; dependencies must point backward",
                        step.number
                    )));
                }
                if dep == 0 {
                    return Err(Error::planning(format!(
                        "step {} depends on step 0, which does not exist",
                        step.number
                    )));
                }
            }
        }
        Ok(())
    }

    /// The steps after the given step number.
    #[must_use]
    pub fn remaining_after(&self, number: usize) -> &[PlanStep] {
        let index = self
            .steps
            .iter()
            .position(|s| s.number > number)
            .unwrap_or(self.steps.len());
        &self.steps[index..]
    }

    /// The whole plan as one text, for pattern checks.
    #[must_use]
    pub fn render(&self) -> String {
        self.steps
            .iter()
            .map(|s| format!("{}. {} [{}]", s.number, s.description, s.actions.join("; ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Produces plans by prompting the large tier.
pub struct Planner {
    model: SharedModel,
}

impl Planner {
    /// Create a planner over the planning model.
    #[must_use]
    pub fn new(model: SharedModel) -> Self {
        Self { model }
    }

    /// Plan the task. Validation failures surface as planning errors.
    pub async fn plan(&self, task: &str, context: &str) -> Result<ExecutionPlan> {
        let prompt = format!(
            "Break this task into {MIN_STEPS}-{MAX_STEPS} concrete steps.\n\
             Respond with only JSON: {{\"steps\": [{{\"number\": int starting at 1,\n\
             \"description\": string, \"actions\": [string], \"success_criteria\": [string],\n\
             \"depends_on\": [earlier step numbers], \"estimated_minutes\": int}}]}}.\n\n\
             Task: {task}\n\nContext:\n{context}"
        );
        let response = self
            .model
            .complete(&prompt, CompletionOptions::default().with_temperature(0.2))
            .await?;

        let value = extract_first_json(&response.content)
            .ok_or_else(|| Error::planning("planner returned no JSON plan"))?;
        let plan: ExecutionPlan = serde_json::from_value(value)
            .map_err(|error| Error::planning(format!("malformed plan: {error}")))?;
        plan.validate()?;
        Ok(plan)
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModel;
    use std::sync::Arc;

    fn step(number: usize, depends_on: Vec<usize>) -> PlanStep {
        PlanStep {
            number,
            description: format!("step {number}"),
            actions: vec![],
            success_criteria: vec![],
            depends_on,
            estimated_minutes: 5,
        }
    }

    #[test]
    fn valid_plan_passes() {
        let plan = ExecutionPlan {
            steps: vec![step(1, vec![]), step(2, vec![1]), step(3, vec![1, 2])],
        };
        assert!(plan.validate().is_ok());
    }

    #[test]
    fn too_few_or_many_steps_fail() {
        let small = ExecutionPlan {
            steps: vec![step(1, vec![]), step(2, vec![])],
        };
        assert!(small.validate().is_err());

        let big = ExecutionPlan {
            steps: (1..=8).map(|n| step(n, vec![])).collect(),
        };
        assert!(big.validate().is_err());
    }

    #[test]
    fn non_sequential_numbering_fails() {
        let plan = ExecutionPlan {
            steps: vec![step(1, vec![]), step(3, vec![]), step(4, vec![])],
        };
        assert!(plan.validate().is_err());
    }

    #[test]
    fn forward_dependency_fails() {
        let plan = ExecutionPlan {
            steps: vec![step(1, vec![3]), step(2, vec![]), step(3, vec![])],
        };
        assert!(plan.validate().is_err());

        let self_dep = ExecutionPlan {
            steps: vec![step(1, vec![]), step(2, vec![2]), step(3, vec![])],
        };
        assert!(self_dep.validate().is_err());
    }

    #[tokio::test]
    async fn planner_parses_and_validates() {
        let model: SharedModel = Arc::new(MockModel::new().with_completion(
            r#"Here is the plan:
            {"steps": [
              {"number": 1, "description": "survey", "actions": ["read"], "success_criteria": ["files listed"], "depends_on": [], "estimated_minutes": 5},
              {"number": 2, "description": "change", "depends_on": [1]},
              {"number": 3, "description": "verify", "depends_on": [2]}
            ]}"#,
        ));
        let planner = Planner::new(model);
        let plan = planner.plan("do the thing", "").await.unwrap();
        assert_eq!(plan.steps.len(), 3);
        assert_eq!(plan.steps[1].depends_on, vec![1]);
    }

    #[tokio::test]
    async fn planner_rejects_invalid_model_output() {
        let model: SharedModel = Arc::new(MockModel::new().with_completion("no plan here"));
        let planner = Planner::new(model);
        let error = planner.plan("task", "").await.unwrap_err();
        assert!(matches!(error, Error::Planning { .. }));
    }

    #[test]
    fn remaining_after_slices_later_steps() {
        let plan = ExecutionPlan {
            steps: vec![step(1, vec![]), step(2, vec![]), step(3, vec![])],
        };
        assert_eq!(plan.remaining_after(1).len(), 2);
        assert_eq!(plan.remaining_after(3).len(), 0);
    }
}
