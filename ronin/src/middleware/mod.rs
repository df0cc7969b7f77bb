//! The ordered hook pipeline around iterations, model calls, and tool calls.
//!
//! The pipeline is fail-open: a hook that returns `Err` is logged, handed
//! to the error hook, and skipped, and the next middleware still runs.
//! Control flow is expressed through tagged decision types, never
//! exceptions.

mod builtins;

pub use builtins::{
    BudgetMiddleware, ContextMiddleware, FactSheetMiddleware, ObservabilityMiddleware,
    ProgressMiddleware,
};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::error::{Error, Result};
use crate::message::{Message, ToolCall, ToolOutput};
use crate::model::{ChatResponse, ToolDefinition};
use crate::run::RunContext;

/// Decision returned by [`Middleware::before_iteration`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationDecision {
    /// Run the iteration.
    Continue,
    /// Terminate the attempt successfully with the last assistant content.
    Stop,
    /// Terminate the attempt and ask the runner for a larger tier.
    Escalate,
    /// Terminate the attempt and hand control elsewhere.
    Handoff,
}

/// Decision returned by [`Middleware::before_tool_exec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolDecision {
    /// Execute the tool.
    Proceed,
    /// Skip execution and answer the call with the given synthetic output.
    Skip {
        /// Text appended as the tool's output.
        output: String,
    },
}

/// The model call about to be made.
#[derive(Debug, Clone)]
pub struct LlmCall {
    /// Messages to send.
    pub messages: Vec<Message>,
    /// Tools to offer.
    pub tools: Vec<ToolDefinition>,
    /// Sampling temperature.
    pub temperature: Option<f32>,
}

/// A patch to the pending model call.
#[derive(Debug, Clone, Default)]
pub struct LlmPatch {
    /// Replacement messages, if any.
    pub messages: Option<Vec<Message>>,
    /// Replacement tool list, if any.
    pub tools: Option<Vec<ToolDefinition>>,
    /// Replacement temperature, if any.
    pub temperature: Option<f32>,
}

impl LlmPatch {
    /// A patch that changes nothing.
    #[must_use]
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Replace the messages.
    #[must_use]
    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = Some(messages);
        self
    }

    /// Replace the tool list.
    #[must_use]
    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Replace the temperature.
    #[must_use]
    pub const fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Apply this patch onto a pending call.
    pub fn apply(self, call: &mut LlmCall) {
        if let Some(messages) = self.messages {
            call.messages = messages;
        }
        if let Some(tools) = self.tools {
            call.tools = tools;
        }
        if let Some(temperature) = self.temperature {
            call.temperature = Some(temperature);
        }
    }
}

/// Why an attempt terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The agent finished its task.
    Success,
    /// The attempt asked for a larger tier.
    Escalated,
    /// Control was handed off.
    Handoff,
    /// The iteration cap was reached.
    OutOfIterations,
    /// The abort signal fired.
    Aborted,
    /// The attempt failed (model transport, fatal configuration).
    Failed,
}

/// A hook set observing and steering one run.
///
/// Every method has a no-op default, so implementations override only the
/// hooks they need. Errors are swallowed by the pipeline's fail-open policy.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in diagnostics and the error hook.
    fn name(&self) -> &str;

    /// Pipeline position; built-ins use 5-50, user middlewares default to 100.
    fn order(&self) -> i32 {
        100
    }

    /// Called once when the attempt starts.
    async fn on_start(&self, _run: &RunContext) -> Result<()> {
        Ok(())
    }

    /// Called before each iteration; the first non-continue decision wins.
    async fn before_iteration(&self, _run: &RunContext) -> Result<IterationDecision> {
        Ok(IterationDecision::Continue)
    }

    /// Called before each model call; patches apply in pipeline order.
    async fn before_llm_call(&self, _run: &RunContext, _call: &LlmCall) -> Result<LlmPatch> {
        Ok(LlmPatch::unchanged())
    }

    /// Called after each model call.
    async fn after_llm_call(&self, _run: &RunContext, _response: &ChatResponse) -> Result<()> {
        Ok(())
    }

    /// Called before each tool execution; the first skip wins.
    async fn before_tool_exec(&self, _run: &RunContext, _call: &ToolCall) -> Result<ToolDecision> {
        Ok(ToolDecision::Proceed)
    }

    /// Called after each tool execution with its output.
    async fn after_tool_exec(
        &self,
        _run: &RunContext,
        _call: &ToolCall,
        _output: &ToolOutput,
    ) -> Result<()> {
        Ok(())
    }

    /// Called when the attempt terminates, with the reason.
    async fn on_stop(&self, _run: &RunContext, _reason: &TerminationReason) -> Result<()> {
        Ok(())
    }

    /// Called after `on_stop` for successful attempts.
    async fn on_complete(&self, _run: &RunContext) -> Result<()> {
        Ok(())
    }
}

/// Receives middleware failures: (middleware name, hook name, error).
pub type MiddlewareErrorHook = Arc<dyn Fn(&str, &str, &Error) + Send + Sync>;

/// Ordered, fail-open middleware collection.
#[derive(Clone)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
    error_hook: Option<MiddlewareErrorHook>,
}

impl MiddlewarePipeline {
    /// Build a pipeline, sorting by [`Middleware::order`] (stable).
    #[must_use]
    pub fn new(mut middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        middlewares.sort_by_key(|m| m.order());
        Self {
            middlewares,
            error_hook: None,
        }
    }

    /// Attach an error hook for swallowed failures.
    #[must_use]
    pub fn with_error_hook(mut self, hook: MiddlewareErrorHook) -> Self {
        self.error_hook = Some(hook);
        self
    }

    /// Names in pipeline order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.middlewares.iter().map(|m| m.name()).collect()
    }

    fn report(&self, middleware: &str, hook: &str, error: &Error) {
        warn!(middleware, hook, error = %error, "middleware hook failed; continuing");
        if let Some(error_hook) = &self.error_hook {
            error_hook(middleware, hook, error);
        }
    }

    /// Run every `on_start` hook.
    pub async fn on_start(&self, run: &RunContext) {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.on_start(run).await {
                self.report(middleware.name(), "on_start", &error);
            }
        }
    }

    /// Run `before_iteration` hooks; the first non-continue decision wins.
    pub async fn before_iteration(&self, run: &RunContext) -> IterationDecision {
        for middleware in &self.middlewares {
            match middleware.before_iteration(run).await {
                Ok(IterationDecision::Continue) => {}
                Ok(decision) => return decision,
                Err(error) => self.report(middleware.name(), "before_iteration", &error),
            }
        }
        IterationDecision::Continue
    }

    /// Run `before_llm_call` hooks, folding patches into the call.
    pub async fn before_llm_call(&self, run: &RunContext, call: &mut LlmCall) {
        for middleware in &self.middlewares {
            match middleware.before_llm_call(run, call).await {
                Ok(patch) => patch.apply(call),
                Err(error) => self.report(middleware.name(), "before_llm_call", &error),
            }
        }
    }

    /// Run every `after_llm_call` hook.
    pub async fn after_llm_call(&self, run: &RunContext, response: &ChatResponse) {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.after_llm_call(run, response).await {
                self.report(middleware.name(), "after_llm_call", &error);
            }
        }
    }

    /// Run `before_tool_exec` hooks; the first skip wins.
    pub async fn before_tool_exec(&self, run: &RunContext, call: &ToolCall) -> ToolDecision {
        for middleware in &self.middlewares {
            match middleware.before_tool_exec(run, call).await {
                Ok(ToolDecision::Proceed) => {}
                Ok(decision) => return decision,
                Err(error) => self.report(middleware.name(), "before_tool_exec", &error),
            }
        }
        ToolDecision::Proceed
    }

    /// Run every `after_tool_exec` hook.
    pub async fn after_tool_exec(&self, run: &RunContext, call: &ToolCall, output: &ToolOutput) {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.after_tool_exec(run, call, output).await {
                self.report(middleware.name(), "after_tool_exec", &error);
            }
        }
    }

    /// Run every `on_stop` hook.
    pub async fn on_stop(&self, run: &RunContext, reason: &TerminationReason) {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.on_stop(run, reason).await {
                self.report(middleware.name(), "on_stop", &error);
            }
        }
    }

    /// Run every `on_complete` hook.
    pub async fn on_complete(&self, run: &RunContext) {
        for middleware in &self.middlewares {
            if let Err(error) = middleware.on_complete(run).await {
                self.report(middleware.name(), "on_complete", &error);
            }
        }
    }
}

impl std::fmt::Debug for MiddlewarePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiddlewarePipeline")
            .field("middlewares", &self.names())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        order: i32,
        log: Arc<Mutex<Vec<String>>>,
        decision: IterationDecision,
        fail: bool,
    }

    impl Recording {
        fn new(name: &'static str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name,
                order,
                log: Arc::clone(log),
                decision: IterationDecision::Continue,
                fail: false,
            }
        }
    }

    #[async_trait]
    impl Middleware for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn order(&self) -> i32 {
            self.order
        }

        async fn before_iteration(&self, _run: &RunContext) -> Result<IterationDecision> {
            self.log.lock().unwrap().push(self.name.to_string());
            if self.fail {
                return Err(Error::invalid_state("hook blew up"));
            }
            Ok(self.decision.clone())
        }
    }

    fn run() -> RunContext {
        RunContext::builder("t").build()
    }

    #[tokio::test]
    async fn hooks_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(vec![
            Arc::new(Recording::new("user", 100, &log)),
            Arc::new(Recording::new("budget", 10, &log)),
            Arc::new(Recording::new("observability", 5, &log)),
        ]);

        pipeline.before_iteration(&run()).await;
        assert_eq!(
            log.lock().unwrap().as_slice(),
            ["observability", "budget", "user"]
        );
    }

    #[tokio::test]
    async fn first_non_continue_decision_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut stopper = Recording::new("stopper", 10, &log);
        stopper.decision = IterationDecision::Stop;
        let pipeline = MiddlewarePipeline::new(vec![
            Arc::new(stopper),
            Arc::new(Recording::new("later", 20, &log)),
        ]);

        let decision = pipeline.before_iteration(&run()).await;
        assert_eq!(decision, IterationDecision::Stop);
        assert_eq!(log.lock().unwrap().as_slice(), ["stopper"]);
    }

    #[tokio::test]
    async fn failures_are_swallowed_and_reported() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut broken = Recording::new("broken", 10, &log);
        broken.fail = true;
        let reported: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&reported);

        let pipeline = MiddlewarePipeline::new(vec![
            Arc::new(broken),
            Arc::new(Recording::new("after", 20, &log)),
        ])
        .with_error_hook(Arc::new(move |middleware, hook, _error| {
            sink.lock()
                .unwrap()
                .push((middleware.to_string(), hook.to_string()));
        }));

        let decision = pipeline.before_iteration(&run()).await;
        assert_eq!(decision, IterationDecision::Continue);
        // The failing middleware did not stop the one after it.
        assert_eq!(log.lock().unwrap().as_slice(), ["broken", "after"]);
        assert_eq!(
            reported.lock().unwrap().as_slice(),
            [("broken".to_string(), "before_iteration".to_string())]
        );
    }

    #[tokio::test]
    async fn llm_patches_fold_in_order() {
        struct Patcher(&'static str, i32, f32);

        #[async_trait]
        impl Middleware for Patcher {
            fn name(&self) -> &str {
                self.0
            }

            fn order(&self) -> i32 {
                self.1
            }

            async fn before_llm_call(
                &self,
                _run: &RunContext,
                _call: &LlmCall,
            ) -> Result<LlmPatch> {
                Ok(LlmPatch::unchanged().with_temperature(self.2))
            }
        }

        let pipeline = MiddlewarePipeline::new(vec![
            Arc::new(Patcher("late", 20, 0.9)),
            Arc::new(Patcher("early", 10, 0.1)),
        ]);

        let mut call = LlmCall {
            messages: vec![],
            tools: vec![],
            temperature: None,
        };
        pipeline.before_llm_call(&run(), &mut call).await;
        // The later middleware's patch lands last.
        assert_eq!(call.temperature, Some(0.9));
    }
}
