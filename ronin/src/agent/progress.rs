//! Stuck- and loop-detection over recent tool activity.

use std::collections::VecDeque;

use crate::message::InputMap;
use crate::util::canonical_json;

/// Default size of the recent-call window.
pub const DEFAULT_WINDOW: usize = 10;

/// How many identical calls inside the window count as looping.
const LOOP_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
struct CallRecord {
    key: String,
    iteration: usize,
    output_len: usize,
    success: bool,
    has_evidence: bool,
}

/// Watches the last N tool calls for repetition and dwindling output.
#[derive(Debug, Clone)]
pub struct ProgressTracker {
    window: VecDeque<CallRecord>,
    capacity: usize,
}

impl ProgressTracker {
    /// Create a tracker with the default window size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    /// Create a tracker keeping the last `capacity` calls.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record one executed tool call.
    pub fn record(
        &mut self,
        tool_name: &str,
        input: &InputMap,
        iteration: usize,
        output: &str,
        success: bool,
    ) {
        if self.window.len() >= self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(CallRecord {
            key: format!(
                "{tool_name}:{}",
                canonical_json(&serde_json::Value::Object(input.clone()))
            ),
            iteration,
            output_len: output.chars().count(),
            success,
            has_evidence: has_evidence(output),
        });
    }

    /// Whether the same call keeps being repeated inside the window.
    #[must_use]
    pub fn is_looping(&self) -> bool {
        let Some(last) = self.window.back() else {
            return false;
        };
        self.window.iter().filter(|r| r.key == last.key).count() >= LOOP_THRESHOLD
    }

    /// Whether recent activity stopped producing anything useful: every
    /// call in a full window failed or came back empty.
    #[must_use]
    pub fn is_stuck(&self) -> bool {
        self.window.len() >= self.capacity
            && self
                .window
                .iter()
                .all(|r| !r.success || r.output_len == 0)
    }

    /// Fraction of windowed calls whose output carried concrete evidence
    /// (paths, line references).
    #[must_use]
    pub fn evidence_score(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let hits = self.window.iter().filter(|r| r.has_evidence).count();
        hits as f64 / self.window.len() as f64
    }

    /// Iteration of the oldest call still in the window.
    #[must_use]
    pub fn oldest_iteration(&self) -> Option<usize> {
        self.window.front().map(|r| r.iteration)
    }

    /// Number of calls currently tracked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Whether no calls have been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// File paths or line references count as evidence of real progress.
fn has_evidence(output: &str) -> bool {
    output.split_whitespace().any(|token| {
        token.contains('/') && token.len() > 2
            || token.contains(':') && token.rsplit(':').next().is_some_and(|n| n.parse::<u32>().is_ok())
    })
}
