//! Task checkpoints at step boundaries.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::executor::StepResult;
use super::planner::ExecutionPlan;

/// A snapshot of task progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskCheckpoint {
    /// The task this checkpoint belongs to.
    pub task_id: String,
    /// When the checkpoint was taken.
    pub timestamp: DateTime<Utc>,
    /// The current plan, including adjustments.
    pub plan: ExecutionPlan,
    /// Results of completed steps.
    pub completed: Vec<StepResult>,
    /// Step currently in flight, if any.
    pub current_step: Option<usize>,
    /// Elapsed wall-clock time in milliseconds.
    pub elapsed_ms: u64,
    /// Accumulated cost in USD.
    pub cost: f64,
    /// Whether the task can be resumed from here.
    pub resumable: bool,
}

/// Stores the latest checkpoint per task.
///
/// Checkpoints are taken on each step boundary and on plan adjustments.
/// Any abort flips `resumable` off; only clean progress stays resumable.
#[derive(Debug, Default)]
pub struct CheckpointManager {
    store: Mutex<HashMap<String, TaskCheckpoint>>,
}

impl CheckpointManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Save a checkpoint, replacing any earlier one for the task.
    pub fn save(&self, checkpoint: TaskCheckpoint) {
        self.store
            .lock()
            .expect("checkpoint store poisoned")
            .insert(checkpoint.task_id.clone(), checkpoint);
    }

    /// The latest checkpoint for a task.
    #[must_use]
    pub fn load(&self, task_id: &str) -> Option<TaskCheckpoint> {
        self.store
            .lock()
            .expect("checkpoint store poisoned")
            .get(task_id)
            .cloned()
    }

    /// Mark the task's checkpoint non-resumable after an abort.
    pub fn mark_aborted(&self, task_id: &str) {
        if let Some(checkpoint) = self
            .store
            .lock()
            .expect("checkpoint store poisoned")
            .get_mut(task_id)
        {
            checkpoint.resumable = false;
        }
    }

    /// Whether the task has a resumable checkpoint.
    #[must_use]
    pub fn is_resumable(&self, task_id: &str) -> bool {
        self.load(task_id).is_some_and(|c| c.resumable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::planner::PlanStep;

    fn checkpoint(task_id: &str) -> TaskCheckpoint {
        TaskCheckpoint {
            task_id: task_id.to_string(),
            timestamp: Utc::now(),
            plan: ExecutionPlan {
                steps: vec![PlanStep {
                    number: 1,
                    description: "only step".to_string(),
                    actions: vec![],
                    success_criteria: vec![],
                    depends_on: vec![],
                    estimated_minutes: 1,
                }],
            },
            completed: vec![],
            current_step: Some(1),
            elapsed_ms: 100,
            cost: 0.01,
            resumable: true,
        }
    }

    #[test]
    fn save_and_load() {
        let manager = CheckpointManager::new();
        manager.save(checkpoint("task-1"));
        let loaded = manager.load("task-1").unwrap();
        assert_eq!(loaded.current_step, Some(1));
        assert!(manager.is_resumable("task-1"));
    }

    #[test]
    fn abort_marks_non_resumable() {
        let manager = CheckpointManager::new();
        manager.save(checkpoint("task-1"));
        manager.mark_aborted("task-1");
        assert!(!manager.is_resumable("task-1"));
        assert!(manager.load("task-1").is_some());
    }

    #[test]
    fn newer_checkpoint_replaces_older() {
        let manager = CheckpointManager::new();
        manager.save(checkpoint("task-1"));
        let mut newer = checkpoint("task-1");
        newer.current_step = None;
        newer.elapsed_ms = 500;
        manager.save(newer);
        assert_eq!(manager.load("task-1").unwrap().elapsed_ms, 500);
    }

    #[test]
    fn serde_round_trip() {
        let original = checkpoint("task-1");
        let json = serde_json::to_string(&original).unwrap();
        let restored: TaskCheckpoint = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, original);
    }
}
