//! The only legal mutation surface for a run's messages.
//!
//! `LoopContext` stamps the current iteration onto every appended message
//! and fans model calls and tool executions through the middleware
//! pipeline. Ordering guarantee: the assistant message lands first, then
//! one tool message per call, in call order.

use std::sync::Arc;

use tracing::debug;

use crate::error::Result;
use crate::message::{Message, ToolCall, ToolOutput};
use crate::middleware::{LlmCall, MiddlewarePipeline, ToolDecision};
use crate::model::{ChatOptions, ChatResponse, SharedModel};
use crate::tool::ToolExecutor;

use super::context::RunContext;

/// Drives one attempt's messages, model calls, and tool calls.
pub struct LoopContext {
    run: RunContext,
    pipeline: Arc<MiddlewarePipeline>,
    executor: Arc<ToolExecutor>,
    model: SharedModel,
}

impl LoopContext {
    /// Create the loop context for one attempt.
    #[must_use]
    pub fn new(
        run: RunContext,
        pipeline: Arc<MiddlewarePipeline>,
        executor: Arc<ToolExecutor>,
        model: SharedModel,
    ) -> Self {
        Self {
            run,
            pipeline,
            executor,
            model,
        }
    }

    /// The run this context drives.
    #[must_use]
    pub fn run(&self) -> &RunContext {
        &self.run
    }

    /// The middleware pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &MiddlewarePipeline {
        &self.pipeline
    }

    /// The tool executor.
    #[must_use]
    pub fn executor(&self) -> &Arc<ToolExecutor> {
        &self.executor
    }

    /// Append messages, stamping the current iteration on each.
    pub fn append(&self, messages: Vec<Message>) {
        let iteration = self.run.iteration();
        let stamped = messages
            .into_iter()
            .map(|m| m.with_iteration(iteration))
            .collect();
        self.run.log().append(stamped);
    }

    /// Seed the log with the system and task messages at iteration zero.
    pub fn seed(&self, system: Message, task: Message) {
        self.run
            .log()
            .append(vec![system.with_iteration(0), task.with_iteration(0)]);
    }

    /// An immutable copy of the current messages.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.run.messages()
    }

    /// Call the model through the middleware pipeline, append the assistant
    /// message, and account usage.
    pub async fn call_model(&self) -> Result<ChatResponse> {
        let mut call = LlmCall {
            messages: self.run.messages(),
            tools: self.executor.manager().definitions(),
            temperature: None,
        };
        self.pipeline.before_llm_call(&self.run, &mut call).await;

        debug!(
            iteration = self.run.iteration(),
            messages = call.messages.len(),
            tools = call.tools.len(),
            "calling model"
        );
        let mut options = ChatOptions::with_tools(call.tools);
        if let Some(temperature) = call.temperature {
            options = options.with_temperature(temperature);
        }
        let response = self.model.chat_with_tools(&call.messages, options).await?;

        let assistant = if response.tool_calls.is_empty() {
            Message::assistant(response.content.clone())
        } else {
            Message::assistant_with_tools(response.content.clone(), response.tool_calls.clone())
        };
        self.append(vec![assistant]);
        self.run.add_usage(response.usage);
        self.pipeline.after_llm_call(&self.run, &response).await;
        Ok(response)
    }

    /// Execute the turn's tool calls and append their results in call order.
    ///
    /// Skipped calls get a synthetic output; every call gets exactly one
    /// tool message.
    pub async fn run_tool_calls(&self, calls: &[ToolCall]) -> Vec<ToolOutput> {
        let mut outputs: Vec<Option<ToolOutput>> = vec![None; calls.len()];
        let mut to_execute: Vec<(usize, ToolCall)> = Vec::with_capacity(calls.len());

        for (index, call) in calls.iter().enumerate() {
            match self.pipeline.before_tool_exec(&self.run, call).await {
                ToolDecision::Proceed => to_execute.push((index, call.clone())),
                ToolDecision::Skip { output } => {
                    debug!(tool = %call.name, "tool call skipped by middleware");
                    outputs[index] = Some(ToolOutput::success(&call.id, output));
                }
            }
        }

        let executable: Vec<ToolCall> = to_execute.iter().map(|(_, c)| c.clone()).collect();
        let executed = self.executor.execute_all(&self.run, &executable).await;
        for ((index, _), output) in to_execute.into_iter().zip(executed) {
            outputs[index] = Some(output);
        }

        let outputs: Vec<ToolOutput> = outputs
            .into_iter()
            .map(|o| o.expect("every tool call produces exactly one output"))
            .collect();

        for (call, output) in calls.iter().zip(&outputs) {
            self.pipeline.after_tool_exec(&self.run, call, output).await;
        }
        self.append(outputs.iter().map(Message::from_tool_output).collect());
        outputs
    }
}

impl std::fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopContext")
            .field("run", &self.run)
            .finish_non_exhaustive()
    }
}
