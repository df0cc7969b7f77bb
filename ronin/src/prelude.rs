//! Convenience re-exports for the common surface.

pub use crate::agent::{
    CompletionEvaluator, CompletionVerdict, ExecutionLoop, LoopOutcome, ProgressTracker,
    RunOutcome, Runner, RunSummary, SystemPromptBuilder, TaskIntent,
};
pub use crate::config::{
    ArchiveConfig, ContextFilterConfig, EscalationConfig, FactSheetConfig, ParallelConfig,
    RuntimeConfig, SummarizerConfig, TokenBudgetConfig, TokenPartition,
};
pub use crate::context::{ContextFilter, SeenToolCall, ToolCallDeduper};
pub use crate::error::{Error, Result, ToolError};
pub use crate::memory::{
    AddOutcome, ArchiveEntry, ArchiveMemory, ExtractedFact, FactCategory, FactEntry, FactSheet,
    FactSink, Summarizer,
};
pub use crate::message::{InputMap, Message, Role, ToolCall, ToolOutput, Truncation};
pub use crate::middleware::{
    BudgetMiddleware, ContextMiddleware, FactSheetMiddleware, IterationDecision, LlmCall,
    LlmPatch, Middleware, MiddlewarePipeline, ObservabilityMiddleware, ProgressMiddleware,
    TerminationReason, ToolDecision,
};
pub use crate::model::{
    ChatOptions, ChatResponse, CompletionOptions, CompletionResponse, LanguageModel, MockModel,
    ModelSelector, SharedModel, Tier, ToolDefinition,
};
pub use crate::parallel::{
    spawn_pack, ParallelExecutor, SpawnAgentTool, SubAgentRequest, SubAgentResult, SubAgentRunner,
};
pub use crate::run::{
    AbortController, AbortSignal, Cache, EventBus, LoopContext, MessageLog, RunContext, RunEvent,
    RunEventKind, RunManager, RunState, RunStatus, TraceSink,
};
pub use crate::task::{
    CheckpointManager, EscalationManager, EscalationReason, ExecutionPlan, ModelStepAgent,
    PlanAdjustment, PlanStep, Planner, StepAgent, StepExecutor, StepResult, StepStatus,
    TaskCheckpoint, TaskReport, TaskRunner, TaskRunStatus, Verdict, VerificationDecision,
    Verifier,
};
pub use crate::tool::{
    base_name, ArchiveRecallTool, ConflictPolicy, InputNormalizer, InputVerdict,
    OutputProcessor, OutputVerdict, PackPermissions, PathNormalizer, ReportTool, Tool,
    ToolExecCtx, ToolExecutor, ToolGuard, ToolManager, ToolPack, ToolResponse,
};
pub use crate::usage::TokenUsage;

#[cfg(feature = "rmcp")]
pub use crate::mcp::{McpBridge, McpServerConfig, McpTransport};
