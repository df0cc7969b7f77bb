//! Runtime configuration.
//!
//! Front-ends own file parsing; the runtime consumes this plain struct.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::Tier;

/// How a parent token budget is split across sub-agent requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPartition {
    /// Every request receives `floor(total / N)`.
    #[default]
    Equal,
    /// Every request receives `floor(weight / sum_of_weights * total)`.
    Weighted,
}

/// Token budget middleware behavior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBudgetConfig {
    /// Whether the budget is enforced at all.
    pub enabled: bool,
    /// Total token cap for one attempt.
    pub max_tokens: u64,
    /// Fraction of the cap at which a warning is recorded.
    pub soft_ratio: f64,
    /// Fraction of the cap at which the loop is stopped or escalated.
    pub hard_ratio: f64,
    /// Stop (rather than escalate) when the hard threshold is crossed.
    pub hard_stop: bool,
    /// Grant one final synthesis iteration before stopping at the hard mark.
    pub force_synthesis_on_hard: bool,
}

impl Default for TokenBudgetConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_tokens: 200_000,
            soft_ratio: 0.8,
            hard_ratio: 0.95,
            hard_stop: true,
            force_synthesis_on_hard: true,
        }
    }
}

/// Context filter behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextFilterConfig {
    /// Maximum characters of tool output kept in the prompt.
    pub max_output_length: usize,
    /// Number of distinct recent iterations kept in the window.
    pub sliding_window_size: usize,
}

impl Default for ContextFilterConfig {
    fn default() -> Self {
        Self {
            max_output_length: 8000,
            sliding_window_size: 10,
        }
    }
}

/// Fact sheet limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactSheetConfig {
    /// Token budget for the rendered sheet (~4 chars per token).
    pub max_tokens: usize,
    /// Maximum number of entries.
    pub max_entries: usize,
    /// Facts below this confidence are dropped on add.
    pub min_confidence: f64,
}

impl Default for FactSheetConfig {
    fn default() -> Self {
        Self {
            max_tokens: 5000,
            max_entries: 60,
            min_confidence: 0.5,
        }
    }
}

/// Archive memory limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Maximum number of archived entries.
    pub max_entries: usize,
    /// Maximum total characters across all entries.
    pub max_total_chars: usize,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            max_entries: 200,
            max_total_chars: 2_000_000,
        }
    }
}

/// Background summarizer behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizerConfig {
    /// Summarize every N iterations.
    pub interval: usize,
    /// Token cap for the extraction call.
    pub max_tokens: u32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            interval: 5,
            max_tokens: 800,
        }
    }
}

/// Parallel sub-agent executor behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    /// Maximum concurrently running sub-agents.
    pub max_concurrent: usize,
    /// Maximum parked runners before submissions fail with `queue full`.
    pub max_queue_size: usize,
    /// Maximum spawn depth.
    pub max_depth: usize,
    /// Deadline for joining all sub-agents, in milliseconds.
    pub join_timeout_ms: u64,
    /// How the parent budget is split.
    pub token_partition: TokenPartition,
    /// Parent token budget; 0 means unlimited.
    pub parent_token_budget: u64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 5,
            max_queue_size: 20,
            max_depth: 3,
            join_timeout_ms: 120_000,
            token_partition: TokenPartition::Equal,
            parent_token_budget: 0,
        }
    }
}

/// Escalation policy for the task runner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationConfig {
    /// Retries of one step before escalating.
    pub max_retries: u32,
    /// Accumulated cost (USD) at which to escalate.
    pub cost_threshold: f64,
    /// Elapsed wall-clock time at which to escalate.
    pub duration_threshold: Duration,
    /// Verifier confidence below which to escalate.
    pub min_confidence: f64,
    /// Plan text patterns that always escalate to a human.
    pub always_escalate: Vec<String>,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            cost_threshold: 5.0,
            duration_threshold: Duration::from_secs(30 * 60),
            min_confidence: 0.7,
            always_escalate: [
                "rm -rf",
                "drop table",
                "drop database",
                "force push",
                "delete all",
                "truncate",
                "credential",
                "production deploy",
            ]
            .iter()
            .map(ToString::to_string)
            .collect(),
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Per-attempt iteration cap.
    pub max_iterations: usize,
    /// Starting tier.
    pub tier: Tier,
    /// Token budget middleware behavior.
    pub token_budget: TokenBudgetConfig,
    /// Context filter behavior.
    pub context_filter: ContextFilterConfig,
    /// Fact sheet limits.
    pub fact_sheet: FactSheetConfig,
    /// Archive memory limits.
    pub archive: ArchiveConfig,
    /// Background summarizer behavior.
    pub summarizer: SummarizerConfig,
    /// Parallel executor behavior.
    pub parallel: ParallelConfig,
    /// Task-runner escalation policy.
    pub escalation: EscalationConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: Self::DEFAULT_MAX_ITERATIONS,
            tier: Tier::Medium,
            token_budget: TokenBudgetConfig::default(),
            context_filter: ContextFilterConfig::default(),
            fact_sheet: FactSheetConfig::default(),
            archive: ArchiveConfig::default(),
            summarizer: SummarizerConfig::default(),
            parallel: ParallelConfig::default(),
            escalation: EscalationConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Default per-attempt iteration cap.
    pub const DEFAULT_MAX_ITERATIONS: usize = 20;

    /// Create a config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-attempt iteration cap.
    #[must_use]
    pub const fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the starting tier.
    #[must_use]
    pub const fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the token budget behavior.
    #[must_use]
    pub const fn with_token_budget(mut self, token_budget: TokenBudgetConfig) -> Self {
        self.token_budget = token_budget;
        self
    }

    /// Set the context filter behavior.
    #[must_use]
    pub const fn with_context_filter(mut self, context_filter: ContextFilterConfig) -> Self {
        self.context_filter = context_filter;
        self
    }

    /// Set the fact sheet limits.
    #[must_use]
    pub const fn with_fact_sheet(mut self, fact_sheet: FactSheetConfig) -> Self {
        self.fact_sheet = fact_sheet;
        self
    }

    /// Set the parallel executor behavior.
    #[must_use]
    pub fn with_parallel(mut self, parallel: ParallelConfig) -> Self {
        self.parallel = parallel;
        self
    }

    /// Set the escalation policy.
    #[must_use]
    pub fn with_escalation(mut self, escalation: EscalationConfig) -> Self {
        self.escalation = escalation;
        self
    }
}
