//! Tier escalation: retry the whole loop against progressively larger
//! models, carrying working memory across attempts.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tracing::{info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::memory::{ArchiveMemory, FactSheet, FactSink, Summarizer};
use crate::message::Message;
use crate::middleware::{
    BudgetMiddleware, ContextMiddleware, FactSheetMiddleware, Middleware, MiddlewarePipeline,
    ObservabilityMiddleware, ProgressMiddleware, TerminationReason,
};
use crate::context::ContextFilter;
use crate::model::{ModelSelector, Tier};
use crate::parallel::{SubAgentRequest, SubAgentResult, SubAgentRunner};
use crate::run::{
    AbortController, LoopContext, RunContext, RunManager, RunStatus,
};
use crate::tool::{
    ArchiveRecallTool, ConflictPolicy, OutputProcessor, PathNormalizer, ReportTool, ToolExecutor,
    ToolGuard, ToolManager, ToolPack,
};
use crate::usage::TokenUsage;

use super::execution_loop::{ExecutionLoop, LoopOutcome};
use super::prompt::SystemPromptBuilder;

const BUILTIN_PACK_ID: &str = "runtime-builtins";

/// The final result of a tiered run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    /// Tier of the attempt that produced this result.
    pub tier: Tier,
    /// Why the final attempt terminated.
    pub reason: TerminationReason,
    /// Final content.
    pub content: String,
    /// Iterations of the final attempt.
    pub iterations: usize,
    /// Tokens of the final attempt.
    pub usage: TokenUsage,
    /// Number of tier attempts made.
    pub attempts: usize,
    /// The run identifier.
    pub run_id: String,
}

impl RunOutcome {
    /// Whether the run finished its task.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.reason == TerminationReason::Success
    }
}

/// Builds and drives tier attempts over a shared tool registry.
pub struct Runner {
    config: RuntimeConfig,
    models: ModelSelector,
    tools: Arc<ToolManager>,
    guards: Vec<Arc<dyn ToolGuard>>,
    processors: Vec<Arc<dyn OutputProcessor>>,
    middlewares: Vec<Arc<dyn Middleware>>,
    run_manager: Option<Arc<RunManager>>,
    session_id: Option<String>,
    working_dir: Option<PathBuf>,
    dedup_enabled: bool,
}

impl Runner {
    /// Create a runner.
    #[must_use]
    pub fn new(config: RuntimeConfig, models: ModelSelector, tools: Arc<ToolManager>) -> Self {
        Self {
            config,
            models,
            tools,
            guards: Vec::new(),
            processors: Vec::new(),
            middlewares: Vec::new(),
            run_manager: None,
            session_id: None,
            working_dir: None,
            dedup_enabled: true,
        }
    }

    /// The shared tool registry.
    #[must_use]
    pub fn tools(&self) -> &Arc<ToolManager> {
        &self.tools
    }

    /// Append a tool guard.
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

    /// Append a user middleware (runs after the built-ins).
    #[must_use]
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Register runs and broadcast events through a run manager.
    #[must_use]
    pub fn with_run_manager(mut self, manager: Arc<RunManager>) -> Self {
        self.run_manager = Some(manager);
        self
    }

    /// Attach runs to a session.
    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the working directory for path normalization and prompts.
    #[must_use]
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Disable tool-call deduplication.
    #[must_use]
    pub const fn without_dedup(mut self) -> Self {
        self.dedup_enabled = false;
        self
    }

    /// Run the task, escalating small → medium → large as requested.
    ///
    /// Working memory survives escalation: the fact sheet replays into the
    /// next tier's prompts while the message log is seeded fresh. A failed
    /// attempt also escalates when a larger tier is configured; only the
    /// highest tier's failure is final.
    pub async fn run(&self, task: &str) -> Result<RunOutcome> {
        let run_id = format!("run_{}", uuid::Uuid::new_v4().simple());
        let abort = AbortController::new();

        if let Some(manager) = &self.run_manager {
            manager
                .register(&run_id, task, self.session_id.clone(), abort.clone())
                .await;
            manager
                .update_status(&run_id, RunStatus::Running, None, None)
                .await;
        }

        let sheet = Arc::new(Mutex::new(FactSheet::new(self.config.fact_sheet)));
        let archive = Arc::new(Mutex::new(ArchiveMemory::new(self.config.archive)));
        self.register_builtin_pack(&archive)?;

        let mut tier = self.config.tier;
        let mut attempts = 0;
        loop {
            attempts += 1;
            let model = match self.models.select(tier) {
                Ok(model) => model,
                Err(error) => match tier.next().filter(|next| self.models.has(*next)) {
                    Some(next) => {
                        warn!(tier = %tier, error = %error, "tier unavailable; escalating");
                        tier = next;
                        continue;
                    }
                    None => {
                        self.finish(&run_id, RunStatus::Failed, None, Some(error.to_string()))
                            .await;
                        return Err(error);
                    }
                },
            };

            let outcome = self
                .run_attempt(task, tier, &run_id, &abort, &sheet, &archive, model)
                .await;
            info!(
                tier = %tier,
                reason = ?outcome.reason,
                iterations = outcome.iterations,
                "attempt finished"
            );

            // Escalate on request, and on a failed attempt (e.g. a model
            // transport that keeps erroring) while a larger tier remains.
            if matches!(
                outcome.reason,
                TerminationReason::Escalated | TerminationReason::Failed
            ) {
                if let Some(next) = tier.next().filter(|next| self.models.has(*next)) {
                    if outcome.reason == TerminationReason::Failed {
                        warn!(tier = %tier, error = %outcome.content, "attempt failed; escalating tier");
                    }
                    tier = next;
                    continue;
                }
            }

            let (status, summary, error) = match outcome.reason {
                TerminationReason::Success => {
                    (RunStatus::Completed, Some(outcome.content.clone()), None)
                }
                TerminationReason::Aborted => (RunStatus::Stopped, None, None),
                _ => (RunStatus::Failed, None, Some(outcome.content.clone())),
            };
            self.finish(&run_id, status, summary, error).await;

            return Ok(RunOutcome {
                tier,
                reason: outcome.reason,
                content: outcome.content,
                iterations: outcome.iterations,
                usage: outcome.usage,
                attempts,
                run_id,
            });
        }
    }

    /// A runner closure for the parallel executor: each request becomes a
    /// single-tier child attempt with fresh memory and the given budget.
    #[must_use]
    pub fn sub_agent_runner(self: &Arc<Self>) -> SubAgentRunner {
        let runner = Arc::clone(self);
        Arc::new(move |request, budget, abort| {
            let runner = Arc::clone(&runner);
            async move { runner.run_sub_agent(request, budget, abort).await }.boxed()
        })
    }

    async fn run_sub_agent(
        &self,
        request: SubAgentRequest,
        budget: u64,
        abort: AbortController,
    ) -> SubAgentResult {
        let sheet = Arc::new(Mutex::new(FactSheet::new(self.config.fact_sheet)));
        let archive = Arc::new(Mutex::new(ArchiveMemory::new(self.config.archive)));

        let tier = self.config.tier;
        let model = match self.models.select(tier) {
            Ok(model) => model,
            Err(error) => return SubAgentResult::failure(&request, error.to_string()),
        };

        let mut builder = RunContext::builder(&request.task)
            .tier(tier)
            .max_iterations(request.max_iterations.unwrap_or(self.config.max_iterations))
            .token_budget(budget)
            .abort(abort);
        if let Some(parent) = &request.parent_agent_id {
            builder = builder.parent_agent_id(parent.clone());
        }
        if let Some(dir) = &request.working_dir {
            builder = builder.working_dir(dir.clone());
        }
        let run = builder.build();
        run.meta_set(
            crate::parallel::PARALLEL_META_NS,
            "depth",
            serde_json::json!(request.depth),
        );

        let ctx = self.loop_context(run, &sheet, &archive, model, None);
        let system = self.system_prompt(&request.task);
        let outcome = ExecutionLoop::new()
            .run(&ctx, Message::system(system), Message::user(&request.task))
            .await;

        SubAgentResult {
            task: request.task.clone(),
            agent_type: request.agent_type.clone(),
            success: outcome.is_success(),
            result: outcome.content.clone(),
            iterations: outcome.iterations,
            tokens_used: outcome.usage.total_tokens,
            deduped: false,
            error: (!outcome.is_success()).then(|| outcome.content),
            timed_out: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_attempt(
        &self,
        task: &str,
        tier: Tier,
        run_id: &str,
        abort: &AbortController,
        sheet: &Arc<Mutex<FactSheet>>,
        archive: &Arc<Mutex<ArchiveMemory>>,
        model: crate::model::SharedModel,
    ) -> LoopOutcome {
        let run = RunContext::builder(task)
            .tier(tier)
            .max_iterations(self.config.max_iterations)
            .request_id(run_id)
            .abort(abort.clone())
            .build();

        let ctx = self.loop_context(run, sheet, archive, model, Some(run_id));
        let system = self.system_prompt(task);
        ExecutionLoop::new()
            .run(&ctx, Message::system(system), Message::user(task))
            .await
    }

    fn loop_context(
        &self,
        run: RunContext,
        sheet: &Arc<Mutex<FactSheet>>,
        archive: &Arc<Mutex<ArchiveMemory>>,
        model: crate::model::SharedModel,
        run_id: Option<&str>,
    ) -> LoopContext {
        let workdir = self
            .working_dir
            .clone()
            .or_else(|| run.working_dir().cloned())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut executor = ToolExecutor::new(Arc::clone(&self.tools))
            .with_normalizer(Arc::new(PathNormalizer::new(run.tier(), workdir)));
        for guard in &self.guards {
            executor = executor.with_guard(Arc::clone(guard));
        }
        for processor in &self.processors {
            executor = executor.with_processor(Arc::clone(processor));
        }

        let filter = ContextFilter::new(run.log().clone(), self.config.context_filter);
        let mut context_mw = ContextMiddleware::new(filter);
        if self.dedup_enabled {
            context_mw = context_mw.with_dedup();
        }

        let mut fact_mw = FactSheetMiddleware::new(Arc::clone(sheet), Arc::clone(archive));
        if let Ok(small) = self.models.select(Tier::Small) {
            let sink_sheet = Arc::clone(sheet);
            let sink: FactSink = Arc::new(move |facts| {
                let mut sheet = sink_sheet.lock().expect("fact sheet poisoned");
                for fact in facts {
                    sheet.add(fact.category, fact.fact, fact.confidence, fact.source, 0, None);
                }
            });
            fact_mw = fact_mw.with_summarizer(Arc::new(Summarizer::new(
                small,
                self.config.summarizer,
                sink,
            )));
        }

        let observability = match (&self.run_manager, run_id) {
            (Some(manager), Some(run_id)) => {
                ObservabilityMiddleware::new().with_manager(Arc::clone(manager), run_id)
            }
            _ => ObservabilityMiddleware::new(),
        };

        let mut middlewares: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(observability),
            Arc::new(BudgetMiddleware::new(self.config.token_budget)),
            Arc::new(context_mw),
            Arc::new(fact_mw),
            Arc::new(ProgressMiddleware::new()),
        ];
        middlewares.extend(self.middlewares.iter().map(Arc::clone));

        LoopContext::new(
            run,
            Arc::new(MiddlewarePipeline::new(middlewares)),
            Arc::new(executor),
            model,
        )
    }

    fn system_prompt(&self, task: &str) -> String {
        let mut builder = SystemPromptBuilder::new(task);
        if let Some(dir) = &self.working_dir {
            builder = builder.working_dir(dir.clone());
        }
        builder.build()
    }

    fn register_builtin_pack(&self, archive: &Arc<Mutex<ArchiveMemory>>) -> Result<()> {
        self.tools.unregister(BUILTIN_PACK_ID);
        self.tools
            .register(
                ToolPack::builder(BUILTIN_PACK_ID, "runtime")
                    .conflict_policy(ConflictPolicy::FirstWins)
                    .priority(-10)
                    .tool(Arc::new(ReportTool))
                    .tool(Arc::new(ArchiveRecallTool::new(Arc::clone(archive))))
                    .build(),
            )
            .map_err(|error| Error::configuration(format!("builtin pack: {error}")))
    }

    async fn finish(
        &self,
        run_id: &str,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) {
        if let Some(manager) = &self.run_manager {
            manager.update_status(run_id, status, summary, error).await;
        }
    }
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .field("models", &self.models)
            .field("dedup_enabled", &self.dedup_enabled)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InputMap, ToolCall};
    use crate::model::{ChatResponse, MockModel};
    use crate::usage::TokenUsage;

    fn report_call(summary: &str) -> ToolCall {
        let mut input = InputMap::new();
        input.insert("summary".to_string(), serde_json::Value::from(summary));
        ToolCall::new("finish", "report", input)
    }

    #[tokio::test]
    async fn successful_run_at_starting_tier() {
        let medium = Arc::new(
            MockModel::new().with_turn(
                ChatResponse::with_tool_calls("", vec![report_call("answer ready")])
                    .with_usage(TokenUsage::new(40, 8)),
            ),
        );
        let models = ModelSelector::new().with_model(Tier::Medium, medium);
        let runner = Runner::new(RuntimeConfig::default(), models, Arc::new(ToolManager::new()));

        let outcome = runner.run("answer the question").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.tier, Tier::Medium);
        assert_eq!(outcome.content, "answer ready");
        assert_eq!(outcome.attempts, 1);
    }

    fn recall_call() -> ToolCall {
        let mut input = InputMap::new();
        input.insert("id".to_string(), serde_json::Value::from(1));
        ToolCall::new("lookup", "archive_recall", input)
    }

    #[tokio::test]
    async fn escalation_moves_to_next_tier_and_reports_its_usage() {
        // Small tier burns its budget on one tool turn; medium succeeds.
        let small = Arc::new(MockModel::new().with_turn(
            ChatResponse::with_tool_calls("looking", vec![recall_call()])
                .with_usage(TokenUsage::new(900, 100)),
        ));
        let medium = Arc::new(
            MockModel::new().with_turn(
                ChatResponse::with_tool_calls("", vec![report_call("done at medium")])
                    .with_usage(TokenUsage::new(50, 10)),
            ),
        );

        let config = RuntimeConfig::default()
            .with_tier(Tier::Small)
            .with_token_budget(crate::config::TokenBudgetConfig {
                enabled: true,
                max_tokens: 500,
                soft_ratio: 0.5,
                hard_ratio: 0.8,
                hard_stop: false,
                force_synthesis_on_hard: false,
            });
        let models = ModelSelector::new()
            .with_model(Tier::Small, small)
            .with_model(Tier::Medium, medium);
        let runner = Runner::new(config, models, Arc::new(ToolManager::new()));

        let outcome = runner.run("hard task").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.tier, Tier::Medium);
        assert_eq!(outcome.content, "done at medium");
        assert_eq!(outcome.attempts, 2);
        // Usage is the medium attempt's alone.
        assert_eq!(outcome.usage.total_tokens, 60);
    }

    #[tokio::test]
    async fn persistent_transport_failure_escalates_tier() {
        // Small fails the call and its retry; medium picks the task up.
        let small = Arc::new(
            MockModel::new()
                .with_failure("socket closed")
                .with_failure("socket closed again"),
        );
        let medium = Arc::new(
            MockModel::new().with_turn(
                ChatResponse::with_tool_calls("", vec![report_call("recovered at medium")])
                    .with_usage(TokenUsage::new(30, 6)),
            ),
        );
        let models = ModelSelector::new()
            .with_model(Tier::Small, small)
            .with_model(Tier::Medium, medium);
        let runner = Runner::new(
            RuntimeConfig::default().with_tier(Tier::Small),
            models,
            Arc::new(ToolManager::new()),
        );

        let outcome = runner.run("flaky transport task").await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(outcome.tier, Tier::Medium);
        assert_eq!(outcome.content, "recovered at medium");
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn failure_at_the_highest_tier_is_final() {
        let large = Arc::new(
            MockModel::new()
                .with_failure("socket closed")
                .with_failure("socket closed again"),
        );
        let models = ModelSelector::new().with_model(Tier::Large, large);
        let runner = Runner::new(
            RuntimeConfig::default().with_tier(Tier::Large),
            models,
            Arc::new(ToolManager::new()),
        );

        let outcome = runner.run("doomed task").await.unwrap();
        assert_eq!(outcome.reason, TerminationReason::Failed);
        assert_eq!(outcome.tier, Tier::Large);
        assert_eq!(outcome.attempts, 1);
    }

    #[tokio::test]
    async fn missing_every_tier_is_a_configuration_error() {
        let runner = Runner::new(
            RuntimeConfig::default().with_tier(Tier::Large),
            ModelSelector::new(),
            Arc::new(ToolManager::new()),
        );
        let error = runner.run("task").await.unwrap_err();
        assert!(matches!(error, Error::TierUnavailable { .. }));
    }
}
