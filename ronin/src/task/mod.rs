//! The plan / execute / verify task runner.
//!
//! The adaptive loop and this runner share one escalation core; an
//! adaptive orchestration is a thin shell that feeds loop outcomes through
//! the same verifier and escalation policy.

mod checkpoint;
mod escalation;
mod executor;
mod planner;
mod verifier;

pub use checkpoint::{CheckpointManager, TaskCheckpoint};
pub use escalation::{EscalationManager, EscalationReason};
pub use executor::{ModelStepAgent, StepAgent, StepExecutor, StepResult, StepStatus};
pub use planner::{ExecutionPlan, PlanStep, Planner, MAX_STEPS, MIN_STEPS};
pub use verifier::{PlanAdjustment, Verdict, VerificationDecision, Verifier};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::config::EscalationConfig;
use crate::run::AbortSignal;

/// How a task run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskRunStatus {
    /// Every step completed and verified.
    Completed,
    /// The task was handed to a human.
    Escalated(EscalationReason),
    /// The task stopped without completing.
    Aborted {
        /// Why it stopped.
        reason: String,
    },
}

/// The task runner's final report.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    /// The task identifier.
    pub task_id: String,
    /// Final status.
    pub status: TaskRunStatus,
    /// The plan as last adjusted; empty when planning itself failed.
    pub plan: Option<ExecutionPlan>,
    /// Results of the steps that ran.
    pub results: Vec<StepResult>,
    /// Accumulated cost in USD.
    pub cost: f64,
    /// Wall-clock duration.
    pub elapsed: Duration,
}

impl TaskReport {
    /// Whether the task completed cleanly.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.status == TaskRunStatus::Completed
    }
}

/// Plans a task, executes it step by step, verifies each step, checkpoints
/// at boundaries, and escalates per policy.
pub struct TaskRunner {
    planner: Planner,
    executor: StepExecutor,
    verifier: Verifier,
    escalation: EscalationManager,
    checkpoints: Arc<CheckpointManager>,
}

impl TaskRunner {
    /// Create a task runner.
    #[must_use]
    pub fn new(
        planner: Planner,
        executor: StepExecutor,
        verifier: Verifier,
        escalation_config: EscalationConfig,
    ) -> Self {
        Self {
            planner,
            executor,
            verifier,
            escalation: EscalationManager::new(escalation_config),
            checkpoints: Arc::new(CheckpointManager::new()),
        }
    }

    /// Share a checkpoint store (e.g. for resuming across runners).
    #[must_use]
    pub fn with_checkpoints(mut self, checkpoints: Arc<CheckpointManager>) -> Self {
        self.checkpoints = checkpoints;
        self
    }

    /// The checkpoint store.
    #[must_use]
    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Run a task to completion, escalation, or abort.
    ///
    /// Planner and verifier validation failures come back as abort results
    /// with an explanatory reason, never as `Err`.
    pub async fn run(
        &self,
        task_id: &str,
        task: &str,
        context: &str,
        abort: &AbortSignal,
    ) -> TaskReport {
        let started = Instant::now();

        let mut plan = match self.planner.plan(task, context).await {
            Ok(plan) => plan,
            Err(error) => {
                return TaskReport {
                    task_id: task_id.to_string(),
                    status: TaskRunStatus::Aborted {
                        reason: error.to_string(),
                    },
                    plan: None,
                    results: Vec::new(),
                    cost: 0.0,
                    elapsed: started.elapsed(),
                };
            }
        };

        if let Some(reason) = self.escalation.plan_check(&plan.render()) {
            warn!(%reason, "plan escalated before execution");
            return self.report(
                task_id,
                TaskRunStatus::Escalated(reason),
                plan,
                Vec::new(),
                0.0,
                started,
            );
        }

        let mut results: Vec<StepResult> = Vec::new();
        let mut cost = 0.0;
        let mut skipped: HashSet<usize> = HashSet::new();
        let mut index = 0;

        while index < plan.steps.len() {
            let step = plan.steps[index].clone();
            index += 1;

            if abort.is_aborted() {
                self.checkpoint(task_id, &plan, &results, Some(step.number), cost, started, true);
                self.checkpoints.mark_aborted(task_id);
                return self.report(
                    task_id,
                    TaskRunStatus::Aborted {
                        reason: "abort signal fired".to_string(),
                    },
                    plan,
                    results,
                    cost,
                    started,
                );
            }
            if skipped.contains(&step.number) {
                info!(step = step.number, "step skipped by plan adjustment");
                continue;
            }

            self.checkpoint(task_id, &plan, &results, Some(step.number), cost, started, true);

            let mut retries = 0;
            loop {
                let result = self.executor.execute(&step, task).await;
                cost += result.cost;

                if let Some(reason) = self.escalation.pre_verification(&result) {
                    results.push(result);
                    self.checkpoint(task_id, &plan, &results, None, cost, started, true);
                    return self.report(
                        task_id,
                        TaskRunStatus::Escalated(reason),
                        plan,
                        results,
                        cost,
                        started,
                    );
                }

                let decision = self
                    .verifier
                    .verify(&result, plan.remaining_after(step.number))
                    .await;
                if let Some(reason) =
                    self.escalation
                        .check(&decision, retries, cost, started.elapsed())
                {
                    results.push(result);
                    self.checkpoint(task_id, &plan, &results, None, cost, started, true);
                    return self.report(
                        task_id,
                        TaskRunStatus::Escalated(reason),
                        plan,
                        results,
                        cost,
                        started,
                    );
                }

                if !decision.adjustments.is_empty() {
                    apply_adjustments(&mut plan, &mut skipped, &decision.adjustments);
                    self.checkpoint(
                        task_id,
                        &plan,
                        &results,
                        Some(step.number),
                        cost,
                        started,
                        true,
                    );
                }

                match decision.verdict {
                    Verdict::Proceed => {
                        results.push(result);
                        break;
                    }
                    Verdict::Retry => {
                        retries += 1;
                        info!(
                            step = step.number,
                            retries,
                            strategy = decision.retry_strategy.as_deref().unwrap_or("none"),
                            "retrying step"
                        );
                    }
                    Verdict::Abort => {
                        results.push(result);
                        self.checkpoint(task_id, &plan, &results, None, cost, started, true);
                        self.checkpoints.mark_aborted(task_id);
                        return self.report(
                            task_id,
                            TaskRunStatus::Aborted {
                                reason: decision.reasoning,
                            },
                            plan,
                            results,
                            cost,
                            started,
                        );
                    }
                    Verdict::Escalate => {
                        // Already caught by the policy check above.
                        results.push(result);
                        return self.report(
                            task_id,
                            TaskRunStatus::Escalated(EscalationReason::VerifierRequested {
                                reasoning: decision.reasoning,
                            }),
                            plan,
                            results,
                            cost,
                            started,
                        );
                    }
                }
            }
        }

        self.checkpoint(task_id, &plan, &results, None, cost, started, true);
        self.report(task_id, TaskRunStatus::Completed, plan, results, cost, started)
    }

    #[allow(clippy::too_many_arguments)]
    fn checkpoint(
        &self,
        task_id: &str,
        plan: &ExecutionPlan,
        results: &[StepResult],
        current_step: Option<usize>,
        cost: f64,
        started: Instant,
        resumable: bool,
    ) {
        self.checkpoints.save(TaskCheckpoint {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            plan: plan.clone(),
            completed: results.to_vec(),
            current_step,
            elapsed_ms: started.elapsed().as_millis() as u64,
            cost,
            resumable,
        });
    }

    fn report(
        &self,
        task_id: &str,
        status: TaskRunStatus,
        plan: ExecutionPlan,
        results: Vec<StepResult>,
        cost: f64,
        started: Instant,
    ) -> TaskReport {
        TaskReport {
            task_id: task_id.to_string(),
            status,
            plan: Some(plan),
            results,
            cost,
            elapsed: started.elapsed(),
        }
    }
}

impl std::fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRunner").finish_non_exhaustive()
    }
}

fn apply_adjustments(
    plan: &mut ExecutionPlan,
    skipped: &mut HashSet<usize>,
    adjustments: &[PlanAdjustment],
) {
    for adjustment in adjustments {
        match adjustment {
            PlanAdjustment::Skip { step } => {
                skipped.insert(*step);
            }
            PlanAdjustment::Modify { step, description } => {
                if let Some(target) = plan.steps.iter_mut().find(|s| s.number == *step) {
                    target.description = description.clone();
                }
            }
            PlanAdjustment::Add { after: _, description } => {
                let number = plan.steps.len() + 1;
                plan.steps.push(PlanStep {
                    number,
                    description: description.clone(),
                    actions: Vec::new(),
                    success_criteria: Vec::new(),
                    depends_on: Vec::new(),
                    estimated_minutes: 0,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MockModel, SharedModel};
    use crate::run::AbortController;

    const PLAN_JSON: &str = r#"{"steps": [
        {"number": 1, "description": "survey the code", "success_criteria": ["modules listed"], "depends_on": []},
        {"number": 2, "description": "make the change", "success_criteria": ["change applied"], "depends_on": [1]},
        {"number": 3, "description": "verify the change", "success_criteria": ["tests green"], "depends_on": [2]}
    ]}"#;

    const PROCEED: &str =
        r#"{"verdict": "proceed", "confidence": 0.9, "reasoning": "looks right"}"#;

    fn runner(
        planner_replies: &[&str],
        step_replies: &[&str],
        verifier_replies: &[&str],
    ) -> TaskRunner {
        let mut planner_model = MockModel::new();
        for reply in planner_replies {
            planner_model = planner_model.with_completion(*reply);
        }
        let mut step_model = MockModel::new();
        for reply in step_replies {
            step_model = step_model.with_completion(*reply);
        }
        let mut verifier_model = MockModel::new();
        for reply in verifier_replies {
            verifier_model = verifier_model.with_completion(*reply);
        }

        let step_model: SharedModel = Arc::new(step_model);
        TaskRunner::new(
            Planner::new(Arc::new(planner_model)),
            StepExecutor::new(Arc::new(ModelStepAgent::new(step_model))),
            Verifier::new(Arc::new(verifier_model)),
            EscalationConfig::default(),
        )
    }

    fn signal() -> AbortSignal {
        AbortController::new().signal()
    }

    #[tokio::test]
    async fn clean_run_completes_all_steps() {
        let runner = runner(
            &[PLAN_JSON],
            &[
                "modules listed: core, tool, run",
                "change applied to the loop",
                "tests green across the board",
            ],
            &[PROCEED, PROCEED, PROCEED],
        );

        let report = runner.run("t1", "improve the loop", "", &signal()).await;
        assert!(report.is_completed());
        assert_eq!(report.results.len(), 3);
        assert!(runner.checkpoints().is_resumable("t1"));
        let checkpoint = runner.checkpoints().load("t1").unwrap();
        assert_eq!(checkpoint.current_step, None);
    }

    #[tokio::test]
    async fn planning_failure_aborts_with_reason() {
        let runner = runner(&["not a plan"], &[], &[]);
        let report = runner.run("t1", "task", "", &signal()).await;
        assert!(matches!(report.status, TaskRunStatus::Aborted { .. }));
        assert!(report.plan.is_none());
    }

    #[tokio::test]
    async fn destructive_plan_escalates_before_execution() {
        let plan = r#"{"steps": [
            {"number": 1, "description": "backup", "depends_on": []},
            {"number": 2, "description": "rm -rf the data directory", "depends_on": [1]},
            {"number": 3, "description": "restore", "depends_on": [2]}
        ]}"#;
        let runner = runner(&[plan], &[], &[]);
        let report = runner.run("t1", "cleanup", "", &signal()).await;
        assert!(matches!(
            report.status,
            TaskRunStatus::Escalated(EscalationReason::DestructivePattern { .. })
        ));
        assert!(report.results.is_empty());
    }

    #[tokio::test]
    async fn verifier_escalation_stops_the_run() {
        let runner = runner(
            &[PLAN_JSON],
            &["modules listed ok"],
            &[r#"{"verdict": "escalate", "confidence": 0.3, "reasoning": "uncertain"}"#],
        );
        let report = runner.run("t1", "task", "", &signal()).await;
        assert!(matches!(
            report.status,
            TaskRunStatus::Escalated(EscalationReason::VerifierRequested { .. })
        ));
        assert_eq!(report.results.len(), 1);
    }

    #[tokio::test]
    async fn abort_verdict_marks_checkpoint_non_resumable() {
        let runner = runner(
            &[PLAN_JSON],
            &["modules listed ok"],
            &[r#"{"verdict": "abort", "confidence": 0.9, "reasoning": "wrong repo"}"#],
        );
        let report = runner.run("t1", "task", "", &signal()).await;
        assert!(matches!(report.status, TaskRunStatus::Aborted { .. }));
        assert!(!runner.checkpoints().is_resumable("t1"));
    }

    #[tokio::test]
    async fn fatal_step_error_escalates_before_verification() {
        let planner_model: SharedModel = Arc::new(MockModel::new().with_completion(PLAN_JSON));
        let step_model: SharedModel = Arc::new(MockModel::new().with_failure("fatal: repo corrupt"));
        let verifier_model: SharedModel = Arc::new(MockModel::new());
        let runner = TaskRunner::new(
            Planner::new(planner_model),
            StepExecutor::new(Arc::new(ModelStepAgent::new(step_model))),
            Verifier::new(verifier_model),
            EscalationConfig::default(),
        );

        let report = runner.run("t1", "task", "", &signal()).await;
        assert!(matches!(
            report.status,
            TaskRunStatus::Escalated(EscalationReason::FatalStepError { .. })
        ));
    }

    #[tokio::test]
    async fn skip_adjustment_skips_later_step() {
        let proceed_with_skip = r#"{"verdict": "proceed", "confidence": 0.9,
            "reasoning": "step 3 is redundant",
            "adjustments": [{"action": "skip", "step": 3}]}"#;
        let runner = runner(
            &[PLAN_JSON],
            &["modules listed ok", "change applied cleanly"],
            &[proceed_with_skip, PROCEED],
        );

        let report = runner.run("t1", "task", "", &signal()).await;
        assert!(report.is_completed());
        // Step 3 never executed.
        assert_eq!(report.results.len(), 2);
    }

    #[tokio::test]
    async fn pre_aborted_signal_stops_before_any_step() {
        let runner = runner(&[PLAN_JSON], &[], &[]);
        let controller = AbortController::new();
        controller.abort();
        let report = runner.run("t1", "task", "", &controller.signal()).await;
        assert!(matches!(report.status, TaskRunStatus::Aborted { .. }));
        assert!(report.results.is_empty());
    }
}
