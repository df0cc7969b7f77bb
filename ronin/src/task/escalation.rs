//! When the task runner hands work to a human.

use std::time::Duration;

use crate::config::EscalationConfig;

use super::executor::StepResult;
use super::verifier::{Verdict, VerificationDecision};

/// Step error fragments that escalate before verification even runs.
const FATAL_ERROR_MARKERS: [&str; 4] =
    ["fatal", "critical", "unrecoverable", "permission denied"];

/// Why a task escalated to a human.
#[derive(Debug, Clone, PartialEq)]
pub enum EscalationReason {
    /// The verifier said escalate.
    VerifierRequested {
        /// The verifier's reasoning.
        reasoning: String,
    },
    /// The step was retried too many times.
    RetriesExhausted {
        /// Retries performed.
        retries: u32,
    },
    /// The verifier was not confident enough.
    LowConfidence {
        /// The reported confidence.
        confidence: f64,
    },
    /// Accumulated cost crossed the threshold.
    CostExceeded {
        /// Cost so far, in USD.
        cost: f64,
    },
    /// Elapsed time crossed the threshold.
    DurationExceeded {
        /// Elapsed wall-clock time.
        elapsed: Duration,
    },
    /// The plan mentions an always-escalate pattern.
    DestructivePattern {
        /// The matching pattern.
        pattern: String,
    },
    /// A step reported a fatal error.
    FatalStepError {
        /// The error text.
        error: String,
    },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::VerifierRequested { reasoning } => {
                write!(f, "verifier requested escalation: {reasoning}")
            }
            Self::RetriesExhausted { retries } => {
                write!(f, "step retried {retries} times without success")
            }
            Self::LowConfidence { confidence } => {
                write!(f, "verifier confidence {confidence:.2} below threshold")
            }
            Self::CostExceeded { cost } => write!(f, "accumulated cost ${cost:.2} over budget"),
            Self::DurationExceeded { elapsed } => {
                write!(f, "task running for {}s, over budget", elapsed.as_secs())
            }
            Self::DestructivePattern { pattern } => {
                write!(f, "plan contains a destructive pattern: {pattern}")
            }
            Self::FatalStepError { error } => write!(f, "fatal step error: {error}"),
        }
    }
}

/// Applies the escalation policy.
#[derive(Debug, Clone)]
pub struct EscalationManager {
    config: EscalationConfig,
}

impl EscalationManager {
    /// Create a manager from the policy.
    #[must_use]
    pub fn new(config: EscalationConfig) -> Self {
        Self { config }
    }

    /// Check a plan's text against the always-escalate patterns.
    #[must_use]
    pub fn plan_check(&self, plan_text: &str) -> Option<EscalationReason> {
        let text = plan_text.to_lowercase();
        self.config
            .always_escalate
            .iter()
            .find(|pattern| text.contains(&pattern.to_lowercase()))
            .map(|pattern| EscalationReason::DestructivePattern {
                pattern: pattern.clone(),
            })
    }

    /// Check a step result for fatal errors before verification.
    #[must_use]
    pub fn pre_verification(&self, result: &StepResult) -> Option<EscalationReason> {
        for error in &result.errors {
            let lower = error.to_lowercase();
            if FATAL_ERROR_MARKERS
                .iter()
                .any(|marker| lower.contains(marker) || lower.contains(&marker.replace(' ', "-")))
            {
                return Some(EscalationReason::FatalStepError {
                    error: error.clone(),
                });
            }
        }
        None
    }

    /// Check a verification decision against the full policy.
    #[must_use]
    pub fn check(
        &self,
        decision: &VerificationDecision,
        retry_count: u32,
        cost: f64,
        elapsed: Duration,
    ) -> Option<EscalationReason> {
        if decision.verdict == Verdict::Escalate {
            return Some(EscalationReason::VerifierRequested {
                reasoning: decision.reasoning.clone(),
            });
        }
        if retry_count >= self.config.max_retries {
            return Some(EscalationReason::RetriesExhausted {
                retries: retry_count,
            });
        }
        if decision.confidence < self.config.min_confidence {
            return Some(EscalationReason::LowConfidence {
                confidence: decision.confidence,
            });
        }
        if cost >= self.config.cost_threshold {
            return Some(EscalationReason::CostExceeded { cost });
        }
        if elapsed >= self.config.duration_threshold {
            return Some(EscalationReason::DurationExceeded { elapsed });
        }
        None
    }
}
