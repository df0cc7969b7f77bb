//! The abstract language-model interface consumed by the runtime.
//!
//! Providers live outside this crate; the runtime only ever sees
//! [`LanguageModel`]. A scripted [`MockModel`] is included for tests.

mod mock;

pub use mock::MockModel;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::message::{Message, ToolCall};
use crate::usage::TokenUsage;

/// Model size tier.
///
/// Selects a model family and also governs normalizer baselines such as the
/// adaptive read limit.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// The cheapest, fastest model family.
    Small,
    /// The default model family.
    #[default]
    Medium,
    /// The most capable model family.
    Large,
}

impl Tier {
    /// The string representation of the tier.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Small => "small",
            Self::Medium => "medium",
            Self::Large => "large",
        }
    }

    /// The next larger tier, or `None` at the top.
    #[must_use]
    pub const fn next(&self) -> Option<Self> {
        match self {
            Self::Small => Some(Self::Medium),
            Self::Medium => Some(Self::Large),
            Self::Large => None,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Definition of a tool for model function calling.
///
/// The schema is JSON-Schema-shaped and travels on the wire as `inputSchema`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Exposed name of the tool.
    pub name: String,
    /// What the tool does; helps the model decide when to call it.
    pub description: String,
    /// JSON schema for the tool's input mapping.
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Create a new tool definition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }

    /// Return a copy exposed under a different name.
    #[must_use]
    pub fn renamed(&self, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..self.clone()
        }
    }
}

/// Options for a plain completion call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompletionOptions {
    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl CompletionOptions {
    /// Set the maximum number of tokens to generate.
    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// Options for a chat call with tools.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatOptions {
    /// Tool definitions offered to the model.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

impl ChatOptions {
    /// Create options offering the given tools.
    #[must_use]
    pub fn with_tools(tools: Vec<ToolDefinition>) -> Self {
        Self {
            tools,
            temperature: None,
        }
    }

    /// Set the sampling temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

/// The result of a plain completion call.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    /// Generated text.
    pub content: String,
    /// Token usage for the call.
    pub usage: TokenUsage,
}

/// The result of a chat call with tools.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatResponse {
    /// Assistant text content.
    pub content: String,
    /// Tool-call requests issued by the model.
    pub tool_calls: Vec<ToolCall>,
    /// Token usage for the call.
    pub usage: TokenUsage,
    /// Provider stop reason, when reported.
    pub stop_reason: Option<String>,
}

impl ChatResponse {
    /// Create a plain text response.
    #[must_use]
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Create a response requesting the given tool calls.
    #[must_use]
    pub fn with_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            content: content.into(),
            tool_calls,
            ..Self::default()
        }
    }

    /// Attach token usage to this response.
    #[must_use]
    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = usage;
        self
    }
}

/// A language model as consumed by the runtime.
///
/// Two operations: plain completion and tool-calling chat. Transport
/// failures are surfaced as [`Error::Model`]; the loop decides whether to
/// retry or escalate.
#[async_trait]
pub trait LanguageModel: Send + Sync + fmt::Debug {
    /// Identifier of the underlying model, for logging.
    fn id(&self) -> &str;

    /// Complete a single prompt.
    async fn complete(&self, prompt: &str, options: CompletionOptions)
    -> Result<CompletionResponse>;

    /// Run one chat turn against the conversation, offering tools.
    async fn chat_with_tools(
        &self,
        messages: &[Message],
        options: ChatOptions,
    ) -> Result<ChatResponse>;
}

/// A shared language model handle.
pub type SharedModel = Arc<dyn LanguageModel>;

/// Maps tiers to configured models.
#[derive(Clone, Default)]
pub struct ModelSelector {
    models: HashMap<Tier, SharedModel>,
}

impl ModelSelector {
    /// Create an empty selector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a model for a tier.
    #[must_use]
    pub fn with_model(mut self, tier: Tier, model: SharedModel) -> Self {
        self.models.insert(tier, model);
        self
    }

    /// Register the same model for every tier.
    #[must_use]
    pub fn with_model_for_all(mut self, model: &SharedModel) -> Self {
        for tier in [Tier::Small, Tier::Medium, Tier::Large] {
            self.models.insert(tier, Arc::clone(model));
        }
        self
    }

    /// Whether a model is configured for the tier.
    #[must_use]
    pub fn has(&self, tier: Tier) -> bool {
        self.models.contains_key(&tier)
    }

    /// The model for the tier, or a fatal configuration error.
    pub fn select(&self, tier: Tier) -> Result<SharedModel> {
        self.models
            .get(&tier)
            .cloned()
            .ok_or(Error::TierUnavailable { tier })
    }

    /// The highest tier with a configured model.
    #[must_use]
    pub fn highest(&self) -> Option<Tier> {
        self.models.keys().max().copied()
    }
}

impl fmt::Debug for ModelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tiers: Vec<&Tier> = self.models.keys().collect();
        tiers.sort();
        f.debug_struct("ModelSelector")
            .field("tiers", &tiers)
            .finish_non_exhaustive()
    }
}
