//! The per-call execution pipeline.
//!
//! Phases per call: normalizers (fail-open) → input guards (short-circuit)
//! → dispatch → output guards (sanitize or short-circuit) → output
//! processors. Calls within one turn run in parallel; phases within one
//! call are sequential.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, warn};

use crate::error::ToolError;
use crate::message::{ToolCall, ToolOutput};
use crate::run::RunContext;

use super::guard::{InputVerdict, OutputVerdict};
use super::{InputNormalizer, OutputProcessor, ToolExecCtx, ToolGuard, ToolManager};

/// Executes tool calls through the full pipeline.
pub struct ToolExecutor {
    manager: Arc<ToolManager>,
    normalizers: Vec<Arc<dyn InputNormalizer>>,
    guards: Vec<Arc<dyn ToolGuard>>,
    processors: Vec<Arc<dyn OutputProcessor>>,
}

impl ToolExecutor {
    /// Create an executor over a tool registry.
    #[must_use]
    pub fn new(manager: Arc<ToolManager>) -> Self {
        Self {
            manager,
            normalizers: Vec::new(),
            guards: Vec::new(),
            processors: Vec::new(),
        }
    }

    /// The underlying registry.
    #[must_use]
    pub fn manager(&self) -> &Arc<ToolManager> {
        &self.manager
    }

    /// Append an input normalizer.
    #[must_use]
    pub fn with_normalizer(mut self, normalizer: Arc<dyn InputNormalizer>) -> Self {
        self.normalizers.push(normalizer);
        self
    }

    /// Append a guard.
    #[must_use]
    pub fn with_guard(mut self, guard: Arc<dyn ToolGuard>) -> Self {
        self.guards.push(guard);
        self
    }

    /// Append an output processor.
    #[must_use]
    pub fn with_processor(mut self, processor: Arc<dyn OutputProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    /// Execute every call of one turn in parallel, preserving order.
    pub async fn execute_all(&self, run: &RunContext, calls: &[ToolCall]) -> Vec<ToolOutput> {
        join_all(calls.iter().map(|call| self.execute(run, call))).await
    }

    /// Execute a single call through all phases.
    pub async fn execute(&self, run: &RunContext, call: &ToolCall) -> ToolOutput {
        let ctx = ToolExecCtx::new(run.clone(), call.name.clone(), call.id.clone());

        if run.is_aborted() {
            return ToolOutput::failure(&call.id, ToolError::Aborted.to_string());
        }

        let mut input = call.input.clone();
        for normalizer in &self.normalizers {
            match normalizer.normalize(&ctx, input.clone()).await {
                Ok(rewritten) => input = rewritten,
                Err(error) => {
                    warn!(
                        normalizer = normalizer.name(),
                        tool = %call.name,
                        error = %error,
                        "input normalizer failed; keeping last good input"
                    );
                }
            }
        }

        for guard in &self.guards {
            if let InputVerdict::Reject { reason } = guard.validate_input(&ctx, &input).await {
                let error = ToolError::Rejected {
                    guard: guard.name().to_string(),
                    reason,
                };
                debug!(tool = %call.name, guard = guard.name(), "input rejected");
                return ToolOutput::failure(&call.id, error.to_string());
            }
        }

        if run.is_aborted() {
            return ToolOutput::failure(&call.id, ToolError::Aborted.to_string());
        }

        let mut response = match self.manager.execute(&call.name, &ctx, input).await {
            Ok(response) => response,
            Err(error) => return ToolOutput::failure(&call.id, error.to_string()),
        };

        for guard in &self.guards {
            match guard.validate_output(&ctx, &response).await {
                OutputVerdict::Allow => {}
                OutputVerdict::Sanitize { replacement } => {
                    debug!(tool = %call.name, guard = guard.name(), "output sanitized");
                    response.output = replacement;
                }
                OutputVerdict::Reject { reason } => {
                    let error = ToolError::Rejected {
                        guard: guard.name().to_string(),
                        reason,
                    };
                    return ToolOutput::failure(&call.id, error.to_string());
                }
            }
        }

        for processor in &self.processors {
            response.output = processor.process(&ctx, response.output).await;
        }

        let mut output = if response.success {
            ToolOutput::success(&call.id, response.output)
        } else {
            let mut failed = ToolOutput::failure(
                &call.id,
                response
                    .error
                    .unwrap_or_else(|| "tool reported failure".to_string()),
            );
            failed.output = response.output;
            failed
        };
        if let Some(metadata) = response.metadata {
            output = output.with_metadata(metadata);
        }
        output
    }
}

impl std::fmt::Debug for ToolExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolExecutor")
            .field("normalizers", &self.normalizers.len())
            .field("guards", &self.guards.len())
            .field("processors", &self.processors.len())
            .finish_non_exhaustive()
    }
}
