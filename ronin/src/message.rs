//! Message types shared between the loop, the model interface, and tools.
//!
//! Messages are immutable once appended to a run's log; the iteration index
//! is stamped at append time and never changes afterwards.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured tool input: a mapping from field name to opaque JSON value.
pub type InputMap = serde_json::Map<String, Value>;

/// Role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User (task) input.
    User,
    /// Model output, possibly carrying tool-call requests.
    Assistant,
    /// A tool result replying to one tool-call request.
    Tool,
}

/// A tool-call request issued by an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Unique identifier for this call.
    pub id: String,
    /// Exposed name of the tool to invoke.
    pub name: String,
    /// Structured input for the tool.
    pub input: InputMap,
}

impl ToolCall {
    /// Create a new tool call.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>, input: InputMap) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    /// Create a tool call with a freshly generated identifier.
    #[must_use]
    pub fn with_fresh_id(name: impl Into<String>, input: InputMap) -> Self {
        Self::new(
            format!("call_{}", uuid::Uuid::new_v4().simple()),
            name,
            input,
        )
    }
}

/// The result of executing one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Identifier of the tool call this output answers.
    pub call_id: String,
    /// Textual output shown to the model.
    pub output: String,
    /// Whether the call succeeded.
    pub success: bool,
    /// Error text when `success` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Optional structured metadata attached by the tool.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<InputMap>,
}

impl ToolOutput {
    /// Create a successful output.
    #[must_use]
    pub fn success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: output.into(),
            success: true,
            error: None,
            metadata: None,
        }
    }

    /// Create a failed output; the error text doubles as the visible output.
    #[must_use]
    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            call_id: call_id.into(),
            output: error.clone(),
            success: false,
            error: Some(error),
            metadata: None,
        }
    }

    /// Attach metadata to this output.
    #[must_use]
    pub fn with_metadata(mut self, metadata: InputMap) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Annotation carried by a tool message whose content was cut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Truncation {
    /// Number of characters removed from the original content.
    pub dropped_chars: usize,
    /// Whether the full text can be reloaded from the archive.
    pub retrievable: bool,
}

/// A single message in a run's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role of the message.
    pub role: Role,
    /// Textual content.
    pub content: String,
    /// Tool-call requests (assistant messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Identifier of the call this message answers (tool messages only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Iteration index assigned when the message was appended.
    #[serde(default)]
    pub iteration: usize,
    /// Present when the content was truncated for prompting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncation: Option<Truncation>,
}

impl Message {
    /// Create a system message.
    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self::bare(Role::System, content)
    }

    /// Create a user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self::bare(Role::User, content)
    }

    /// Create an assistant message without tool calls.
    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::bare(Role::Assistant, content)
    }

    /// Create an assistant message carrying tool-call requests.
    #[must_use]
    pub fn assistant_with_tools(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::bare(Role::Assistant, content)
        }
    }

    /// Create a tool message answering the given call.
    #[must_use]
    pub fn tool(call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            ..Self::bare(Role::Tool, content)
        }
    }

    /// Create a tool message from a [`ToolOutput`].
    #[must_use]
    pub fn from_tool_output(output: &ToolOutput) -> Self {
        Self::tool(output.call_id.clone(), output.output.clone())
    }

    /// Set the iteration index.
    #[must_use]
    pub const fn with_iteration(mut self, iteration: usize) -> Self {
        self.iteration = iteration;
        self
    }

    /// Whether this assistant message requested any tool calls.
    #[must_use]
    pub fn has_tool_calls(&self) -> bool {
        self.tool_calls.as_ref().is_some_and(|c| !c.is_empty())
    }

    fn bare(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
            iteration: 0,
            truncation: None,
        }
    }
}
