//! Built-in middlewares, at fixed pipeline positions 5 through 50.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::agent::ProgressTracker;
use crate::config::TokenBudgetConfig;
use crate::context::{ContextFilter, ToolCallDeduper};
use crate::error::Result;
use crate::memory::{ArchiveMemory, FactSheet, Summarizer};
use crate::message::{Message, Role, ToolCall, ToolOutput};
use crate::model::ChatResponse;
use crate::run::{RunContext, RunEventKind, RunManager};
use crate::tool::base_name;

use super::{IterationDecision, LlmCall, LlmPatch, Middleware, TerminationReason, ToolDecision};

/// Metadata namespace for tracked file operations.
pub(crate) const FILES_META_NS: &str = "files";
/// Metadata namespace for budget state.
pub(crate) const BUDGET_META_NS: &str = "budget";
/// Metadata namespace for progress state.
pub(crate) const PROGRESS_META_NS: &str = "progress";

// ============================================================================
// Observability (order 5)
// ============================================================================

/// Emits lifecycle events and tracks file operations into run metadata.
pub struct ObservabilityMiddleware {
    manager: Option<Arc<RunManager>>,
    run_id: Option<String>,
}

impl ObservabilityMiddleware {
    /// Create an observability middleware without an event sink.
    #[must_use]
    pub fn new() -> Self {
        Self {
            manager: None,
            run_id: None,
        }
    }

    /// Emit events through a run manager under the given run id.
    #[must_use]
    pub fn with_manager(mut self, manager: Arc<RunManager>, run_id: impl Into<String>) -> Self {
        self.manager = Some(manager);
        self.run_id = Some(run_id.into());
        self
    }

    async fn emit(&self, run: &RunContext, kind: RunEventKind, data: Value) {
        if let (Some(manager), Some(run_id)) = (&self.manager, &self.run_id) {
            manager.broadcast(run_id, run.agent_id(), kind, data).await;
        }
    }
}

impl Default for ObservabilityMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ObservabilityMiddleware {
    fn name(&self) -> &str {
        "observability"
    }

    fn order(&self) -> i32 {
        5
    }

    async fn on_start(&self, run: &RunContext) -> Result<()> {
        self.emit(
            run,
            RunEventKind::AgentStart,
            json!({"task": run.task(), "tier": run.tier().as_str()}),
        )
        .await;
        Ok(())
    }

    async fn before_iteration(&self, run: &RunContext) -> Result<IterationDecision> {
        self.emit(
            run,
            RunEventKind::IterationStart,
            json!({"iteration": run.iteration() + 1}),
        )
        .await;
        Ok(IterationDecision::Continue)
    }

    async fn after_llm_call(&self, run: &RunContext, response: &ChatResponse) -> Result<()> {
        self.emit(
            run,
            RunEventKind::LlmEnd,
            json!({
                "tool_calls": response.tool_calls.len(),
                "tokens": response.usage.total_tokens,
            }),
        )
        .await;
        Ok(())
    }

    async fn after_tool_exec(
        &self,
        run: &RunContext,
        call: &ToolCall,
        output: &ToolOutput,
    ) -> Result<()> {
        let kind = if output.success {
            RunEventKind::ToolEnd
        } else {
            RunEventKind::ToolError
        };
        self.emit(run, kind, json!({"tool": call.name, "success": output.success}))
            .await;

        if output.success {
            if let Some(path) = call.input.get("path").and_then(Value::as_str) {
                let slot = match base_name(&call.name) {
                    "fs_read" => Some("read"),
                    "fs_write" => Some("written"),
                    "fs_create" => Some("created"),
                    _ => None,
                };
                if let Some(slot) = slot {
                    run.meta_push(FILES_META_NS, slot, Value::from(path));
                }
            }
        }
        Ok(())
    }

    async fn on_stop(&self, run: &RunContext, reason: &TerminationReason) -> Result<()> {
        let kind = if matches!(reason, TerminationReason::Failed) {
            RunEventKind::AgentError
        } else {
            RunEventKind::AgentEnd
        };
        self.emit(run, kind, json!({"reason": format!("{reason:?}")})).await;
        Ok(())
    }
}

impl std::fmt::Debug for ObservabilityMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObservabilityMiddleware")
            .field("run_id", &self.run_id)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Budget (order 10)
// ============================================================================

/// Enforces the token budget with soft and hard thresholds.
///
/// Crossing the soft threshold records a warning flag; crossing the hard
/// threshold grants one final synthesis iteration (when configured), then
/// stops or escalates. Exhaustion is a decision, never an error.
#[derive(Debug, Clone)]
pub struct BudgetMiddleware {
    config: TokenBudgetConfig,
}

impl BudgetMiddleware {
    /// Create the middleware from budget configuration.
    #[must_use]
    pub const fn new(config: TokenBudgetConfig) -> Self {
        Self { config }
    }

    fn effective_cap(&self, run: &RunContext) -> Option<u64> {
        let child_budget = run.token_budget();
        if child_budget > 0 {
            return Some(if self.config.enabled {
                child_budget.min(self.config.max_tokens)
            } else {
                child_budget
            });
        }
        self.config.enabled.then_some(self.config.max_tokens)
    }
}

#[async_trait]
impl Middleware for BudgetMiddleware {
    fn name(&self) -> &str {
        "budget"
    }

    fn order(&self) -> i32 {
        10
    }

    async fn before_iteration(&self, run: &RunContext) -> Result<IterationDecision> {
        let Some(cap) = self.effective_cap(run) else {
            return Ok(IterationDecision::Continue);
        };
        let spent = run.usage().total_tokens;
        let soft = (cap as f64 * self.config.soft_ratio) as u64;
        let hard = (cap as f64 * self.config.hard_ratio) as u64;

        if spent >= hard {
            if self.config.force_synthesis_on_hard
                && run.meta_get(BUDGET_META_NS, "synthesis_requested").is_none()
            {
                run.meta_set(BUDGET_META_NS, "synthesis_requested", Value::Bool(true));
                warn!(spent, cap, "token budget hard threshold crossed; one synthesis iteration");
                return Ok(IterationDecision::Continue);
            }
            return Ok(if self.config.hard_stop {
                IterationDecision::Stop
            } else {
                IterationDecision::Escalate
            });
        }

        if spent >= soft && run.meta_get(BUDGET_META_NS, "soft_warned").is_none() {
            run.meta_set(BUDGET_META_NS, "soft_warned", Value::Bool(true));
            warn!(spent, cap, "token budget soft threshold crossed");
        }
        Ok(IterationDecision::Continue)
    }
}

// ============================================================================
// Context (order 15)
// ============================================================================

/// Wraps the context filter and tool-call dedup around model calls.
pub struct ContextMiddleware {
    filter: ContextFilter,
    deduper: Mutex<ToolCallDeduper>,
    dedup_enabled: bool,
    summaries: Mutex<Vec<String>>,
}

impl ContextMiddleware {
    /// Create the middleware over a run's context filter.
    #[must_use]
    pub fn new(filter: ContextFilter) -> Self {
        Self {
            filter,
            deduper: Mutex::new(ToolCallDeduper::new()),
            dedup_enabled: false,
            summaries: Mutex::new(Vec::new()),
        }
    }

    /// Enable tool-call deduplication.
    #[must_use]
    pub fn with_dedup(mut self) -> Self {
        self.dedup_enabled = true;
        self
    }

    /// Add a progress summary carried as a synthetic system message.
    pub fn add_summary(&self, summary: impl Into<String>) {
        self.summaries
            .lock()
            .expect("summaries poisoned")
            .push(summary.into());
    }
}

#[async_trait]
impl Middleware for ContextMiddleware {
    fn name(&self) -> &str {
        "context-filter"
    }

    fn order(&self) -> i32 {
        15
    }

    async fn before_llm_call(&self, _run: &RunContext, _call: &LlmCall) -> Result<LlmPatch> {
        let history = self.filter.snapshot();
        let system = history
            .iter()
            .find(|m| m.role == Role::System)
            .cloned()
            .unwrap_or_else(|| Message::system(""));
        let task = history
            .iter()
            .find(|m| m.role == Role::User)
            .cloned()
            .unwrap_or_else(|| Message::user(""));
        let summaries = self.summaries.lock().expect("summaries poisoned").clone();

        let windowed = self.filter.build_default_context(&system, &task, &summaries);
        Ok(LlmPatch::unchanged().with_messages(windowed))
    }

    async fn before_tool_exec(&self, _run: &RunContext, call: &ToolCall) -> Result<ToolDecision> {
        if !self.dedup_enabled {
            return Ok(ToolDecision::Proceed);
        }
        let deduper = self.deduper.lock().expect("deduper poisoned");
        match deduper.format_duplicate(&call.name, &call.input) {
            Some(output) => {
                debug!(tool = %call.name, "duplicate tool call answered from cache");
                Ok(ToolDecision::Skip { output })
            }
            None => Ok(ToolDecision::Proceed),
        }
    }

    async fn after_tool_exec(
        &self,
        run: &RunContext,
        call: &ToolCall,
        output: &ToolOutput,
    ) -> Result<()> {
        if self.dedup_enabled && output.success {
            self.deduper.lock().expect("deduper poisoned").mark_seen(
                &call.name,
                &call.input,
                run.iteration(),
                output.output.clone(),
            );
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContextMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextMiddleware")
            .field("dedup_enabled", &self.dedup_enabled)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Fact sheet (order 20)
// ============================================================================

/// Injects the rendered fact sheet into the system prompt, archives tool
/// outputs, and drives the background summarizer.
pub struct FactSheetMiddleware {
    sheet: Arc<Mutex<FactSheet>>,
    archive: Arc<Mutex<ArchiveMemory>>,
    summarizer: Option<Arc<Summarizer>>,
}

impl FactSheetMiddleware {
    /// Create the middleware over a run's working memory.
    #[must_use]
    pub fn new(sheet: Arc<Mutex<FactSheet>>, archive: Arc<Mutex<ArchiveMemory>>) -> Self {
        Self {
            sheet,
            archive,
            summarizer: None,
        }
    }

    /// Drive a background summarizer from the iteration cadence.
    #[must_use]
    pub fn with_summarizer(mut self, summarizer: Arc<Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }
}

#[async_trait]
impl Middleware for FactSheetMiddleware {
    fn name(&self) -> &str {
        "fact-sheet"
    }

    fn order(&self) -> i32 {
        20
    }

    async fn before_iteration(&self, run: &RunContext) -> Result<IterationDecision> {
        if let Some(summarizer) = &self.summarizer {
            summarizer.maybe_submit(run.iteration(), &run.messages());
        }
        Ok(IterationDecision::Continue)
    }

    async fn before_llm_call(&self, _run: &RunContext, call: &LlmCall) -> Result<LlmPatch> {
        let rendered = self.sheet.lock().expect("fact sheet poisoned").render();
        if rendered.is_empty() {
            return Ok(LlmPatch::unchanged());
        }

        let mut messages = call.messages.clone();
        match messages.iter_mut().find(|m| m.role == Role::System) {
            Some(system) => {
                system.content = format!("{}\n\n# Working facts\n{rendered}", system.content);
            }
            None => messages.insert(0, Message::system(format!("# Working facts\n{rendered}"))),
        }
        Ok(LlmPatch::unchanged().with_messages(messages))
    }

    async fn after_tool_exec(
        &self,
        _run: &RunContext,
        call: &ToolCall,
        output: &ToolOutput,
    ) -> Result<()> {
        if !output.success || output.output.is_empty() {
            return Ok(());
        }
        let file_path = call
            .input
            .get("path")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        self.archive.lock().expect("archive poisoned").store(
            base_name(&call.name),
            file_path,
            output.output.clone(),
            0,
        );
        Ok(())
    }
}

impl std::fmt::Debug for FactSheetMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactSheetMiddleware").finish_non_exhaustive()
    }
}

// ============================================================================
// Progress (order 50)
// ============================================================================

/// Tracks recent tool calls to flag stuck or looping behavior.
#[derive(Debug)]
pub struct ProgressMiddleware {
    tracker: Mutex<ProgressTracker>,
}

impl ProgressMiddleware {
    /// Create the middleware with a default window.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tracker: Mutex::new(ProgressTracker::new()),
        }
    }
}

impl Default for ProgressMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Middleware for ProgressMiddleware {
    fn name(&self) -> &str {
        "progress"
    }

    fn order(&self) -> i32 {
        50
    }

    async fn before_iteration(&self, run: &RunContext) -> Result<IterationDecision> {
        let tracker = self.tracker.lock().expect("tracker poisoned");
        if tracker.is_looping() {
            warn!(agent = run.agent_id(), "repeating the same tool call");
            run.meta_set(PROGRESS_META_NS, "looping", Value::Bool(true));
        }
        if tracker.is_stuck() {
            warn!(agent = run.agent_id(), "no useful tool output in the recent window");
            run.meta_set(PROGRESS_META_NS, "stuck", Value::Bool(true));
        }
        Ok(IterationDecision::Continue)
    }

    async fn after_tool_exec(
        &self,
        run: &RunContext,
        call: &ToolCall,
        output: &ToolOutput,
    ) -> Result<()> {
        self.tracker.lock().expect("tracker poisoned").record(
            &call.name,
            &call.input,
            run.iteration(),
            &output.output,
            output.success,
        );
        Ok(())
    }
}
