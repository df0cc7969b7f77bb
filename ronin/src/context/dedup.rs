//! Tool-call deduplication keyed on canonicalized arguments.
//!
//! The message log is never rewritten; a duplicate call is answered with a
//! synthetic output pointing at the prior result.

use std::collections::HashMap;

use serde_json::Value;

use crate::message::InputMap;
use crate::util::canonical_json;

/// A previously executed tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenToolCall {
    /// Iteration the call originally ran in.
    pub iteration: usize,
    /// The result it produced.
    pub result: String,
}

/// Tracks executed tool calls by (name, canonical args).
#[derive(Debug, Clone, Default)]
pub struct ToolCallDeduper {
    seen: HashMap<String, SeenToolCall>,
}

impl ToolCallDeduper {
    /// Create an empty deduper.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an identical call (any key order) has been seen.
    #[must_use]
    pub fn is_duplicate(&self, name: &str, input: &InputMap) -> bool {
        self.seen.contains_key(&key(name, input))
    }

    /// Record a call and its result.
    pub fn mark_seen(
        &mut self,
        name: &str,
        input: &InputMap,
        iteration: usize,
        result: impl Into<String>,
    ) {
        self.seen.insert(
            key(name, input),
            SeenToolCall {
                iteration,
                result: result.into(),
            },
        );
    }

    /// The recorded call matching name and args, if any.
    #[must_use]
    pub fn lookup(&self, name: &str, input: &InputMap) -> Option<&SeenToolCall> {
        self.seen.get(&key(name, input))
    }

    /// Synthetic tool output for a duplicate call.
    #[must_use]
    pub fn format_duplicate(&self, name: &str, input: &InputMap) -> Option<String> {
        self.lookup(name, input).map(|seen| {
            format!(
                "Duplicate call: '{name}' already ran with these arguments in iteration {}. \
                 Prior result:\n{}",
                seen.iteration, seen.result
            )
        })
    }

    /// Number of distinct recorded calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn key(name: &str, input: &InputMap) -> String {
    format!("{name}:{}", canonical_json(&Value::Object(input.clone())))
}
