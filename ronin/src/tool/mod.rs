//! The tool subsystem: packs, registry, normalization, guards, and the
//! execution pipeline.
//!
//! Tools never return `Err` to the loop. Every failure mode (bad arguments,
//! guard rejection, execution error, abort) is rendered into a failed
//! [`ToolOutput`](crate::message::ToolOutput) that the agent reads as
//! ordinary tool output.

mod builtin;
mod executor;
mod guard;
mod manager;
mod normalizer;
mod pack;

pub use builtin::{ArchiveRecallTool, ReportTool, FINISHING_TOOLS};
pub use executor::ToolExecutor;
pub use guard::{InputVerdict, OutputProcessor, OutputVerdict, ToolGuard};
pub use manager::ToolManager;
pub use normalizer::{InputNormalizer, PathNormalizer};
pub use pack::{AuditHook, ConflictPolicy, PackPermissions, ToolPack, ToolPackBuilder};

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::message::InputMap;
use crate::model::ToolDefinition;
use crate::run::{AbortSignal, RunContext};

/// What a tool hands back to the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResponse {
    /// Textual output shown to the model.
    pub output: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error text when `success` is false.
    pub error: Option<String>,
    /// Optional structured metadata.
    pub metadata: Option<InputMap>,
}

impl ToolResponse {
    /// A successful response.
    #[must_use]
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            error: None,
            metadata: None,
        }
    }

    /// A failed response; the error text doubles as the visible output.
    #[must_use]
    pub fn fail(error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            output: error.clone(),
            success: false,
            error: Some(error),
            metadata: None,
        }
    }

    /// Attach metadata to the response.
    #[must_use]
    pub fn with_metadata(mut self, metadata: InputMap) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Attach one metadata field to the response.
    #[must_use]
    pub fn with_meta_field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata
            .get_or_insert_with(InputMap::new)
            .insert(key.into(), value);
        self
    }
}

/// Execution context handed to normalizers, guards, and tools.
#[derive(Debug, Clone)]
pub struct ToolExecCtx {
    /// The run this call belongs to.
    pub run: RunContext,
    /// Exposed name of the tool being called.
    pub tool_name: String,
    /// Identifier of the tool call.
    pub call_id: String,
}

impl ToolExecCtx {
    /// Create a context for one call.
    #[must_use]
    pub fn new(run: RunContext, tool_name: impl Into<String>, call_id: impl Into<String>) -> Self {
        Self {
            run,
            tool_name: tool_name.into(),
            call_id: call_id.into(),
        }
    }

    /// The iteration the call was issued in.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.run.iteration()
    }

    /// The run's request identifier.
    #[must_use]
    pub fn request_id(&self) -> &str {
        self.run.request_id()
    }

    /// The run's abort signal.
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.run.abort_signal()
    }
}

/// A capability an agent can invoke.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Name of the tool within its pack (unprefixed).
    fn name(&self) -> &str;

    /// What the tool does.
    fn description(&self) -> String;

    /// JSON schema for the tool's input mapping.
    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object"})
    }

    /// The definition offered to the model, under the unprefixed name.
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(self.name(), self.description(), self.input_schema())
    }

    /// Execute the tool. Failures are in-band; implementations should only
    /// panic on broken internal invariants.
    async fn call(&self, ctx: &ToolExecCtx, input: InputMap) -> ToolResponse;
}

/// A shared dynamic tool handle.
pub type SharedTool = Arc<dyn Tool>;

/// Strip the pack namespace from an exposed tool name.
///
/// `fs.fs_read` and `fs_read` both yield `fs_read`; tools are matched on the
/// final segment so normalizers and the loop are indifferent to prefixing.
#[must_use]
pub fn base_name(exposed: &str) -> &str {
    exposed.rsplit('.').next().unwrap_or(exposed)
}
