//! The discriminated event stream exposed per run.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    /// An orchestration started.
    OrchestratorStart,
    /// An orchestration finished.
    OrchestratorEnd,
    /// A subtask started.
    SubtaskStart,
    /// A subtask finished.
    SubtaskEnd,
    /// An agent attempt started.
    AgentStart,
    /// An agent attempt finished.
    AgentEnd,
    /// An agent attempt failed.
    AgentError,
    /// An iteration started.
    IterationStart,
    /// An iteration finished.
    IterationEnd,
    /// A model call started.
    LlmStart,
    /// A model call finished.
    LlmEnd,
    /// A tool call started.
    ToolStart,
    /// A tool call finished.
    ToolEnd,
    /// A tool call failed.
    ToolError,
    /// Working memory was written.
    MemoryWrite,
    /// The run status changed.
    StatusChange,
    /// A snapshot of the effective prompt context.
    ContextSnapshot,
}

/// One event in a run's stream.
///
/// `seq` is strictly monotonic per run; late subscribers can replay from the
/// bounded buffer by asking for events after a given sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Event kind.
    #[serde(rename = "type")]
    pub kind: RunEventKind,
    /// When the event was emitted.
    pub timestamp: DateTime<Utc>,
    /// The agent that produced the event.
    pub agent_id: String,
    /// Strictly monotonic per-run sequence number.
    pub seq: u64,
    /// The run this event belongs to.
    pub run_id: String,
    /// Event-specific payload.
    pub data: Value,
}

/// Lifecycle status of a run as seen by external consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Registered but not yet running.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped on request.
    Stopped,
}

impl RunStatus {
    /// Whether the run has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stopped)
    }
}

/// The externally visible, persistable view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// The run identifier.
    pub run_id: String,
    /// The task being executed.
    pub task: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished, if it has.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock duration in milliseconds, once finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Final summary text, once finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    /// Error text for failed runs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Create a fresh pending state.
    #[must_use]
    pub fn pending(run_id: impl Into<String>, task: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            task: task.into(),
            status: RunStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
            summary: None,
            error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_kind_as_type() {
        let event = RunEvent {
            kind: RunEventKind::ToolStart,
            timestamp: Utc::now(),
            agent_id: "agent_1".to_string(),
            seq: 3,
            run_id: "run_1".to_string(),
            data: serde_json::json!({"tool": "fs_read"}),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool_start");
        assert_eq!(json["seq"], 3);
    }

    #[test]
    fn terminal_statuses() {
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Completed.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(RunStatus::Stopped.is_terminal());
    }
}
