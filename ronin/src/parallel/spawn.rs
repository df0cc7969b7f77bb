//! The `spawn_agent` tool: fan a task list out to child agents.

use std::sync::Arc;

use async_trait::async_trait;
use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;

use crate::message::InputMap;
use crate::tool::{ConflictPolicy, Tool, ToolExecCtx, ToolPack, ToolResponse};

use super::{ParallelExecutor, SubAgentRequest};

/// Metadata namespace tracking spawn depth.
pub(crate) const PARALLEL_META_NS: &str = "parallel";

#[derive(Debug, Deserialize, JsonSchema)]
struct SpawnTaskArgs {
    /// Task for the child agent.
    task: String,
    /// Agent type tag.
    #[serde(default)]
    agent_type: Option<String>,
    /// Iteration cap override.
    #[serde(default)]
    max_iterations: Option<usize>,
    /// Coalescing key; identical keys share one run.
    #[serde(default)]
    dedupe_key: Option<String>,
    /// Weight for weighted budget partition.
    #[serde(default)]
    weight: Option<f64>,
}

#[derive(Debug, Deserialize, JsonSchema)]
struct SpawnAgentArgs {
    /// The child tasks to run in parallel.
    tasks: Vec<SpawnTaskArgs>,
}

/// Runs child agents through the [`ParallelExecutor`].
///
/// Each child gets a fresh agent id, this agent as its parent, an abort
/// controller linked to this run, and a partitioned share of the token
/// budget. The runner behind the executor owns child construction, which
/// keeps this tool free of a dependency on the runtime that registers it.
pub struct SpawnAgentTool {
    executor: Arc<ParallelExecutor>,
}

impl SpawnAgentTool {
    /// Create the tool over an executor.
    #[must_use]
    pub fn new(executor: Arc<ParallelExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl Tool for SpawnAgentTool {
    fn name(&self) -> &str {
        "spawn_agent"
    }

    fn description(&self) -> String {
        "Run one or more sub-agents in parallel, each on its own task. \
         Returns a result per task in order."
            .to_string()
    }

    fn input_schema(&self) -> Value {
        serde_json::to_value(schemars::schema_for!(SpawnAgentArgs)).unwrap_or_default()
    }

    async fn call(&self, ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        let args: SpawnAgentArgs = match serde_json::from_value(Value::Object(input)) {
            Ok(args) => args,
            Err(error) => return ToolResponse::fail(format!("invalid arguments: {error}")),
        };
        if args.tasks.is_empty() {
            return ToolResponse::fail("no tasks given");
        }

        let depth = ctx
            .run
            .meta_get(PARALLEL_META_NS, "depth")
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;
        let child_depth = depth + 1;

        let requests: Vec<SubAgentRequest> = args
            .tasks
            .into_iter()
            .map(|task| {
                let mut request = SubAgentRequest::new(task.task);
                if let Some(agent_type) = task.agent_type {
                    request = request.agent_type(agent_type);
                }
                if let Some(key) = task.dedupe_key {
                    request = request.dedupe_key(key);
                }
                if let Some(weight) = task.weight {
                    request = request.weight(weight);
                }
                request.max_iterations = task.max_iterations;
                request.working_dir = ctx.run.working_dir().cloned();
                request.parent_agent_id = Some(ctx.run.agent_id().to_string());
                request.depth = child_depth;
                request
            })
            .collect();

        let parent = ctx.run.abort_controller();
        let results = self
            .executor
            .execute_all(requests, child_depth, &parent, ctx.run.token_budget())
            .await;

        let any_success = results.iter().any(|r| r.success);
        let rendered = serde_json::to_string_pretty(&results)
            .unwrap_or_else(|_| "failed to render results".to_string());
        if any_success {
            ToolResponse::ok(rendered)
        } else {
            let mut response = ToolResponse::fail("all sub-agents failed");
            response.output = rendered;
            response
        }
    }
}

impl std::fmt::Debug for SpawnAgentTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpawnAgentTool").finish_non_exhaustive()
    }
}

/// Package the spawn tool as a registrable pack.
#[must_use]
pub fn spawn_pack(executor: Arc<ParallelExecutor>) -> ToolPack {
    ToolPack::builder("parallel", "parallel")
        .conflict_policy(ConflictPolicy::FirstWins)
        .capability("sub-agents")
        .tool(Arc::new(SpawnAgentTool::new(executor)))
        .build()
}
