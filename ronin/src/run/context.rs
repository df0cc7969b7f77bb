//! Per-attempt run state.
//!
//! [`RunContext`] is a cheaply cloneable handle shared by the loop,
//! middleware, and tools. The message log it exposes is read-only here;
//! the only append path is [`LoopContext`](crate::run::LoopContext).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use serde_json::Value;

use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::message::Message;
use crate::model::Tier;
use crate::usage::TokenUsage;

use super::abort::{AbortController, AbortSignal};

/// The shared, append-only message store backing a run.
///
/// Appends are serialized by an exclusive gate; reads take snapshots. The
/// list never shrinks.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    inner: Arc<RwLock<Vec<Message>>>,
}

impl MessageLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a batch of messages under the exclusive gate.
    pub(crate) fn append(&self, batch: Vec<Message>) {
        let mut guard = self.inner.write().expect("message log poisoned");
        guard.extend(batch);
    }

    /// An immutable copy of the full log.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.inner.read().expect("message log poisoned").clone()
    }

    /// Number of messages in the log.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().expect("message log poisoned").len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct RunInner {
    task: String,
    tier: Tier,
    agent_id: String,
    parent_agent_id: Option<String>,
    request_id: String,
    session_id: Option<String>,
    working_dir: Option<PathBuf>,
    max_iterations: usize,
    token_budget: u64,
    iteration: AtomicUsize,
    abort: AbortController,
    log: MessageLog,
    metadata: RwLock<HashMap<String, HashMap<String, Value>>>,
    usage: Mutex<TokenUsage>,
}

/// Per-tier-attempt run state, shared across the loop, middleware, and tools.
#[derive(Clone)]
pub struct RunContext {
    inner: Arc<RunInner>,
}

impl RunContext {
    /// Start building a run context for the given task.
    #[must_use]
    pub fn builder(task: impl Into<String>) -> RunContextBuilder {
        RunContextBuilder::new(task)
    }

    /// The task text.
    #[must_use]
    pub fn task(&self) -> &str {
        &self.inner.task
    }

    /// The tier of this attempt.
    #[must_use]
    pub fn tier(&self) -> Tier {
        self.inner.tier
    }

    /// This agent's identifier.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    /// The parent agent's identifier for spawned sub-agents.
    #[must_use]
    pub fn parent_agent_id(&self) -> Option<&str> {
        self.inner.parent_agent_id.as_deref()
    }

    /// The request identifier.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.inner.request_id
    }

    /// The session identifier, if the run belongs to a session.
    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.inner.session_id.as_deref()
    }

    /// The working directory for this run.
    #[must_use]
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.inner.working_dir.as_ref()
    }

    /// The current iteration counter.
    #[must_use]
    pub fn iteration(&self) -> usize {
        self.inner.iteration.load(Ordering::SeqCst)
    }

    /// The iteration cap for this attempt.
    #[must_use]
    pub fn max_iterations(&self) -> usize {
        self.inner.max_iterations
    }

    /// This attempt's token budget; 0 means unlimited.
    #[must_use]
    pub fn token_budget(&self) -> u64 {
        self.inner.token_budget
    }

    /// Advance the iteration counter, upholding `iteration <= max_iterations`.
    pub(crate) fn advance_iteration(&self) -> Result<usize> {
        let current = self.inner.iteration.load(Ordering::SeqCst);
        if current >= self.inner.max_iterations {
            return Err(Error::invalid_state(format!(
                "iteration {} would exceed cap {}",
                current + 1,
                self.inner.max_iterations
            )));
        }
        Ok(self.inner.iteration.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// The abort signal for this run.
    #[must_use]
    pub fn abort_signal(&self) -> AbortSignal {
        self.inner.abort.signal()
    }

    /// A handle to the abort controller, for wiring stop requests.
    #[must_use]
    pub fn abort_controller(&self) -> AbortController {
        self.inner.abort.clone()
    }

    /// Whether the abort signal has fired.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.inner.abort.is_aborted()
    }

    /// An immutable copy of the message log.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.inner.log.snapshot()
    }

    /// The shared log handle; appends go through `LoopContext` only.
    pub(crate) fn log(&self) -> &MessageLog {
        &self.inner.log
    }

    /// Read a metadata value.
    #[must_use]
    pub fn meta_get(&self, namespace: &str, key: &str) -> Option<Value> {
        self.inner
            .metadata
            .read()
            .expect("metadata poisoned")
            .get(namespace)
            .and_then(|ns| ns.get(key))
            .cloned()
    }

    /// Write a metadata value.
    pub fn meta_set(&self, namespace: &str, key: &str, value: Value) {
        self.inner
            .metadata
            .write()
            .expect("metadata poisoned")
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Append a value to a metadata array, creating it if missing.
    pub fn meta_push(&self, namespace: &str, key: &str, value: Value) {
        let mut guard = self.inner.metadata.write().expect("metadata poisoned");
        let slot = guard
            .entry(namespace.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(items) = slot {
            items.push(value);
        }
    }

    /// A copy of one metadata namespace.
    #[must_use]
    pub fn meta_namespace(&self, namespace: &str) -> HashMap<String, Value> {
        self.inner
            .metadata
            .read()
            .expect("metadata poisoned")
            .get(namespace)
            .cloned()
            .unwrap_or_default()
    }

    /// Accumulate token usage for this attempt.
    pub fn add_usage(&self, usage: TokenUsage) {
        *self.inner.usage.lock().expect("usage poisoned") += usage;
    }

    /// Cumulative token usage for this attempt.
    #[must_use]
    pub fn usage(&self) -> TokenUsage {
        *self.inner.usage.lock().expect("usage poisoned")
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("agent_id", &self.inner.agent_id)
            .field("tier", &self.inner.tier)
            .field("iteration", &self.iteration())
            .field("max_iterations", &self.inner.max_iterations)
            .field("aborted", &self.is_aborted())
            .finish_non_exhaustive()
    }
}

/// Builder for [`RunContext`].
#[derive(Debug)]
pub struct RunContextBuilder {
    task: String,
    tier: Tier,
    agent_id: Option<String>,
    parent_agent_id: Option<String>,
    request_id: Option<String>,
    session_id: Option<String>,
    working_dir: Option<PathBuf>,
    max_iterations: usize,
    token_budget: u64,
    abort: Option<AbortController>,
}

impl RunContextBuilder {
    fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            tier: Tier::default(),
            agent_id: None,
            parent_agent_id: None,
            request_id: None,
            session_id: None,
            working_dir: None,
            max_iterations: RuntimeConfig::DEFAULT_MAX_ITERATIONS,
            token_budget: 0,
            abort: None,
        }
    }

    /// Set the tier for this attempt.
    #[must_use]
    pub const fn tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    /// Set the agent identifier (a fresh one is generated otherwise).
    #[must_use]
    pub fn agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Mark this run as a child of another agent.
    #[must_use]
    pub fn parent_agent_id(mut self, parent: impl Into<String>) -> Self {
        self.parent_agent_id = Some(parent.into());
        self
    }

    /// Set the request identifier (a fresh one is generated otherwise).
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Attach the run to a session.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the iteration cap.
    #[must_use]
    pub const fn max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Set the token budget; 0 means unlimited.
    #[must_use]
    pub const fn token_budget(mut self, token_budget: u64) -> Self {
        self.token_budget = token_budget;
        self
    }

    /// Use an existing abort controller (e.g. one linked to a parent).
    #[must_use]
    pub fn abort(mut self, abort: AbortController) -> Self {
        self.abort = Some(abort);
        self
    }

    /// Build the run context.
    #[must_use]
    pub fn build(self) -> RunContext {
        RunContext {
            inner: Arc::new(RunInner {
                task: self.task,
                tier: self.tier,
                agent_id: self
                    .agent_id
                    .unwrap_or_else(|| format!("agent_{}", uuid::Uuid::new_v4().simple())),
                parent_agent_id: self.parent_agent_id,
                request_id: self
                    .request_id
                    .unwrap_or_else(|| format!("req_{}", uuid::Uuid::new_v4().simple())),
                session_id: self.session_id,
                working_dir: self.working_dir,
                max_iterations: self.max_iterations,
                token_budget: self.token_budget,
                iteration: AtomicUsize::new(0),
                abort: self.abort.unwrap_or_default(),
                log: MessageLog::new(),
                metadata: RwLock::new(HashMap::new()),
                usage: Mutex::new(TokenUsage::zero()),
            }),
        }
    }
}
