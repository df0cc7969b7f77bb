//! Built-in tools every run carries.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::memory::ArchiveMemory;
use crate::message::InputMap;

use super::{Tool, ToolExecCtx, ToolResponse};

/// Tool names that finish a run when called.
pub const FINISHING_TOOLS: [&str; 2] = ["report", "submit_result"];

#[derive(Debug, Deserialize, JsonSchema)]
struct ReportArgs {
    /// Final answer or summary of the completed work.
    summary: String,
}

/// The finishing tool: the agent calls it to deliver its final answer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportTool;

#[async_trait]
impl Tool for ReportTool {
    fn name(&self) -> &str {
        "report"
    }

    fn description(&self) -> String {
        "Deliver the final result of the task. Call this exactly once, when the task is done."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ReportArgs)).unwrap_or_default()
    }

    async fn call(&self, _ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        match serde_json::from_value::<ReportArgs>(Value::Object(input)) {
            Ok(args) => ToolResponse::ok(args.summary),
            Err(error) => ToolResponse::fail(format!("invalid report arguments: {error}")),
        }
    }
}

#[derive(Debug, Deserialize, JsonSchema)]
struct ArchiveRecallArgs {
    /// Archive entry id to reload.
    #[serde(default)]
    id: Option<u64>,
    /// File path to reload the most recent archived output for.
    #[serde(default)]
    path: Option<String>,
}

/// Reload a previously archived tool output instead of re-reading the source.
pub struct ArchiveRecallTool {
    archive: Arc<Mutex<ArchiveMemory>>,
}

impl ArchiveRecallTool {
    /// Create the tool over a run's archive.
    #[must_use]
    pub fn new(archive: Arc<Mutex<ArchiveMemory>>) -> Self {
        Self { archive }
    }
}

#[async_trait]
impl Tool for ArchiveRecallTool {
    fn name(&self) -> &str {
        "archive_recall"
    }

    fn description(&self) -> String {
        "Reload the full text of an earlier tool output from the archive, by entry id or file path."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(ArchiveRecallArgs)).unwrap_or_default()
    }

    async fn call(&self, _ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        let args: ArchiveRecallArgs = match serde_json::from_value(Value::Object(input)) {
            Ok(args) => args,
            Err(error) => return ToolResponse::fail(format!("invalid arguments: {error}")),
        };

        let archive = self.archive.lock().expect("archive poisoned");
        let entry = match (args.id, args.path.as_deref()) {
            (Some(id), _) => archive.recall(id),
            (None, Some(path)) => archive.recall_by_path(path),
            (None, None) => {
                return ToolResponse::fail("provide either 'id' or 'path'");
            }
        };

        match entry {
            Some(entry) => ToolResponse::ok(entry.content.clone()).with_meta_field(
                "archive_id",
                Value::from(entry.id),
            ),
            None => ToolResponse::fail("no matching archive entry"),
        }
    }
}

impl std::fmt::Debug for ArchiveRecallTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveRecallTool").finish_non_exhaustive()
    }
}
