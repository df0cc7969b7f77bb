//! The iteration state machine driving one tier attempt.
//!
//! Phases per iteration: prepare (middleware decision) → model call →
//! tool calls → termination check. The loop never mutates messages
//! directly; everything goes through the [`LoopContext`].

use tracing::{debug, warn};

use crate::message::Message;
use crate::middleware::{IterationDecision, TerminationReason};
use crate::run::LoopContext;
use crate::tool::{base_name, FINISHING_TOOLS};
use crate::usage::TokenUsage;

/// How one attempt ended, with its final content and accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct LoopOutcome {
    /// Why the attempt terminated.
    pub reason: TerminationReason,
    /// Final content: the report summary or last assistant text.
    pub content: String,
    /// Iterations consumed.
    pub iterations: usize,
    /// Tokens consumed by this attempt.
    pub usage: TokenUsage,
}

impl LoopOutcome {
    /// Whether the attempt finished its task.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Success
    }

    /// Whether the attempt asked for a larger tier.
    #[must_use]
    pub fn is_escalated(&self) -> bool {
        self.reason == TerminationReason::Escalated
    }
}

/// Runs the iteration loop over a prepared [`LoopContext`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecutionLoop;

impl ExecutionLoop {
    /// Create the loop.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Seed the conversation and iterate until termination.
    ///
    /// `system` and `task` are appended once when the log is empty, so an
    /// escalated attempt re-seeds a fresh log the same way.
    pub async fn run(&self, ctx: &LoopContext, system: Message, task: Message) -> LoopOutcome {
        let run = ctx.run().clone();
        if run.messages().is_empty() {
            ctx.seed(system, task);
        }
        ctx.pipeline().on_start(&run).await;

        let mut last_content = String::new();
        let reason = loop {
            // Abort and cap are checked at the iteration boundary.
            if run.is_aborted() {
                break TerminationReason::Aborted;
            }
            if run.iteration() >= run.max_iterations() {
                break TerminationReason::OutOfIterations;
            }

            match ctx.pipeline().before_iteration(&run).await {
                IterationDecision::Continue => {}
                IterationDecision::Stop => break TerminationReason::Success,
                IterationDecision::Escalate => break TerminationReason::Escalated,
                IterationDecision::Handoff => break TerminationReason::Handoff,
            }

            if run.advance_iteration().is_err() {
                break TerminationReason::OutOfIterations;
            }
            debug!(iteration = run.iteration(), "starting iteration");

            let response = match ctx.call_model().await {
                Ok(response) => response,
                Err(first_error) => {
                    warn!(
                        iteration = run.iteration(),
                        error = %first_error,
                        "model call failed; retrying once"
                    );
                    match ctx.call_model().await {
                        Ok(response) => response,
                        Err(error) => {
                            warn!(iteration = run.iteration(), error = %error, "model call failed again");
                            last_content = error.to_string();
                            break TerminationReason::Failed;
                        }
                    }
                }
            };

            if !response.content.is_empty() {
                last_content = response.content.clone();
            }

            if response.tool_calls.is_empty() {
                break TerminationReason::Success;
            }

            let outputs = ctx.run_tool_calls(&response.tool_calls).await;

            let finishing = response
                .tool_calls
                .iter()
                .zip(&outputs)
                .find(|(call, output)| {
                    FINISHING_TOOLS.contains(&base_name(&call.name)) && output.success
                });
            if let Some((_, output)) = finishing {
                last_content = output.output.clone();
                break TerminationReason::Success;
            }

            if run.is_aborted() {
                break TerminationReason::Aborted;
            }
        };

        ctx.pipeline().on_stop(&run, &reason).await;
        if reason == TerminationReason::Success {
            ctx.pipeline().on_complete(&run).await;
        }

        LoopOutcome {
            reason,
            content: last_content,
            iterations: run.iteration(),
            usage: run.usage(),
        }
    }
}
