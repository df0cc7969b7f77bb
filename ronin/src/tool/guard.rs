//! Tool guards and output processors.

use async_trait::async_trait;

use crate::message::InputMap;

use super::{ToolExecCtx, ToolResponse};

/// Verdict on a tool's input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputVerdict {
    /// Let the call proceed.
    Allow,
    /// Short-circuit the call with an error output tagged with the guard name.
    Reject {
        /// Why the call was rejected.
        reason: String,
    },
}

/// Verdict on a tool's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputVerdict {
    /// Let the output through unchanged.
    Allow,
    /// Short-circuit with an error output tagged with the guard name.
    Reject {
        /// Why the output was rejected.
        reason: String,
    },
    /// Replace the output text and continue.
    Sanitize {
        /// The replacement text.
        replacement: String,
    },
}

/// Validates tool inputs and outputs.
///
/// Both methods default to `Allow`, so guards implement only the side they
/// care about.
#[async_trait]
pub trait ToolGuard: Send + Sync {
    /// Name of the guard, used to tag rejections.
    fn name(&self) -> &str;

    /// Validate the normalized input before dispatch.
    async fn validate_input(&self, _ctx: &ToolExecCtx, _input: &InputMap) -> InputVerdict {
        InputVerdict::Allow
    }

    /// Validate the tool's output before processors run.
    async fn validate_output(&self, _ctx: &ToolExecCtx, _output: &ToolResponse) -> OutputVerdict {
        OutputVerdict::Allow
    }
}

/// Transforms the final output text after guards pass.
#[async_trait]
pub trait OutputProcessor: Send + Sync {
    /// Name of the processor, for diagnostics.
    fn name(&self) -> &str;

    /// Rewrite the output text.
    async fn process(&self, ctx: &ToolExecCtx, text: String) -> String;
}
