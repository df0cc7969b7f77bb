//! Process-wide run registry.
//!
//! [`RunManager`] is a constructed object with explicit init and teardown:
//! callers register one instance in a well-known location instead of
//! reaching for module-local globals. State is mirrored into an optional
//! key-value cache and broadcast to an optional cross-process event bus;
//! absence of either degrades to in-memory only.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use super::abort::AbortController;
use super::events::{RunEvent, RunEventKind, RunState, RunStatus};

/// Mirrored state TTL in the external cache.
pub const CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// Default capacity of the per-run replay buffer.
pub const DEFAULT_REPLAY_CAPACITY: usize = 256;

/// A key-value cache with TTL, consumed if available.
#[async_trait]
pub trait Cache: Send + Sync {
    /// Store a value under the key for at most `ttl`.
    async fn set(&self, key: &str, value: Value, ttl: Duration);

    /// Fetch a value if present and unexpired.
    async fn get(&self, key: &str) -> Option<Value>;
}

/// A cross-process event bus with topic-based publish, consumed if available.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event on the given topic.
    async fn publish(&self, topic: &str, event: &RunEvent);
}

/// A session trace that appends newline-delimited JSON records, consumed if
/// available.
#[async_trait]
pub trait TraceSink: Send + Sync {
    /// Append one serialized record; the line carries no trailing newline.
    async fn append(&self, line: &str);
}

/// A local event listener.
pub type RunListener = Arc<dyn Fn(&RunEvent) + Send + Sync>;

struct ActiveRun {
    state: RunState,
    abort: AbortController,
    next_seq: u64,
    replay: VecDeque<RunEvent>,
    listeners: Vec<RunListener>,
}

/// Registry of active runs with event fan-out and replay.
pub struct RunManager {
    runs: Mutex<HashMap<String, ActiveRun>>,
    session_listeners: Mutex<HashMap<String, Vec<RunListener>>>,
    run_sessions: Mutex<HashMap<String, String>>,
    cache: Option<Arc<dyn Cache>>,
    bus: Option<Arc<dyn EventBus>>,
    trace: Option<Arc<dyn TraceSink>>,
    replay_capacity: usize,
}

impl RunManager {
    /// Create a manager with no external cache, bus, or trace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: Mutex::new(HashMap::new()),
            session_listeners: Mutex::new(HashMap::new()),
            run_sessions: Mutex::new(HashMap::new()),
            cache: None,
            bus: None,
            trace: None,
            replay_capacity: DEFAULT_REPLAY_CAPACITY,
        }
    }

    /// Mirror run state into the given cache.
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Broadcast events onto the given bus (topic `run:<run_id>`).
    #[must_use]
    pub fn with_bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Append every event to the given session trace.
    #[must_use]
    pub fn with_trace_sink(mut self, trace: Arc<dyn TraceSink>) -> Self {
        self.trace = Some(trace);
        self
    }

    /// Set the replay buffer capacity.
    #[must_use]
    pub const fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    /// Register a new run.
    pub async fn register(
        &self,
        run_id: impl Into<String>,
        task: impl Into<String>,
        session_id: Option<String>,
        abort: AbortController,
    ) -> RunState {
        let run_id = run_id.into();
        let state = RunState::pending(run_id.clone(), task);
        {
            let mut runs = self.runs.lock().expect("run map poisoned");
            runs.insert(
                run_id.clone(),
                ActiveRun {
                    state: state.clone(),
                    abort,
                    next_seq: 0,
                    replay: VecDeque::with_capacity(self.replay_capacity.min(64)),
                    listeners: Vec::new(),
                },
            );
        }
        if let Some(session_id) = session_id {
            self.run_sessions
                .lock()
                .expect("session map poisoned")
                .insert(run_id.clone(), session_id);
        }
        self.mirror(&state).await;
        state
    }

    /// Transition a run's status, broadcasting a status-change event.
    pub async fn update_status(
        &self,
        run_id: &str,
        status: RunStatus,
        summary: Option<String>,
        error: Option<String>,
    ) -> Option<RunState> {
        let state = {
            let mut runs = self.runs.lock().expect("run map poisoned");
            let run = runs.get_mut(run_id)?;
            run.state.status = status;
            if status.is_terminal() {
                let now = Utc::now();
                run.state.completed_at = Some(now);
                run.state.duration_ms =
                    Some((now - run.state.started_at).num_milliseconds().max(0) as u64);
            }
            if summary.is_some() {
                run.state.summary = summary;
            }
            if error.is_some() {
                run.state.error = error;
            }
            run.state.clone()
        };
        self.broadcast(
            run_id,
            run_id,
            RunEventKind::StatusChange,
            serde_json::to_value(&state).unwrap_or(Value::Null),
        )
        .await;
        self.mirror(&state).await;
        Some(state)
    }

    /// Broadcast an event for a run, assigning the next sequence number.
    ///
    /// Returns the assigned `seq`, or `None` for unknown runs.
    pub async fn broadcast(
        &self,
        run_id: &str,
        agent_id: &str,
        kind: RunEventKind,
        data: Value,
    ) -> Option<u64> {
        let (event, listeners) = {
            let mut runs = self.runs.lock().expect("run map poisoned");
            let run = runs.get_mut(run_id)?;
            run.next_seq += 1;
            let event = RunEvent {
                kind,
                timestamp: Utc::now(),
                agent_id: agent_id.to_string(),
                seq: run.next_seq,
                run_id: run_id.to_string(),
                data,
            };
            if run.replay.len() >= self.replay_capacity {
                run.replay.pop_front();
            }
            run.replay.push_back(event.clone());
            (event, run.listeners.clone())
        };

        for listener in &listeners {
            listener(&event);
        }
        let session_listeners = {
            let sessions = self.run_sessions.lock().expect("session map poisoned");
            sessions.get(run_id).map(|session_id| {
                self.session_listeners
                    .lock()
                    .expect("session listeners poisoned")
                    .get(session_id)
                    .cloned()
                    .unwrap_or_default()
            })
        };
        if let Some(listeners) = session_listeners {
            for listener in &listeners {
                listener(&event);
            }
        }

        if let Some(bus) = &self.bus {
            bus.publish(&format!("run:{run_id}"), &event).await;
        }
        if let Some(trace) = &self.trace {
            if let Ok(line) = serde_json::to_string(&event) {
                trace.append(&line).await;
            }
        }
        Some(event.seq)
    }

    /// Replay buffered events with `seq > after_seq`.
    #[must_use]
    pub fn events_after(&self, run_id: &str, after_seq: u64) -> Vec<RunEvent> {
        let runs = self.runs.lock().expect("run map poisoned");
        runs.get(run_id)
            .map(|run| {
                run.replay
                    .iter()
                    .filter(|e| e.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Attach a listener to one run.
    pub fn add_listener(&self, run_id: &str, listener: RunListener) {
        if let Some(run) = self
            .runs
            .lock()
            .expect("run map poisoned")
            .get_mut(run_id)
        {
            run.listeners.push(listener);
        }
    }

    /// Attach a listener to every run in a session.
    pub fn add_session_listener(&self, session_id: &str, listener: RunListener) {
        self.session_listeners
            .lock()
            .expect("session listeners poisoned")
            .entry(session_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Fire the run's abort controller; the loop exits at the next boundary.
    pub fn request_stop(&self, run_id: &str) -> bool {
        let runs = self.runs.lock().expect("run map poisoned");
        runs.get(run_id).is_some_and(|run| {
            run.abort.abort();
            true
        })
    }

    /// The current state of a run.
    #[must_use]
    pub fn state(&self, run_id: &str) -> Option<RunState> {
        self.runs
            .lock()
            .expect("run map poisoned")
            .get(run_id)
            .map(|run| run.state.clone())
    }

    /// States of all registered runs.
    #[must_use]
    pub fn list(&self) -> Vec<RunState> {
        self.runs
            .lock()
            .expect("run map poisoned")
            .values()
            .map(|run| run.state.clone())
            .collect()
    }

    /// Drop a run from the registry.
    pub fn remove(&self, run_id: &str) {
        self.runs.lock().expect("run map poisoned").remove(run_id);
        self.run_sessions
            .lock()
            .expect("session map poisoned")
            .remove(run_id);
    }

    /// Clear all registry state at process end.
    pub fn teardown(&self) {
        self.runs.lock().expect("run map poisoned").clear();
        self.run_sessions
            .lock()
            .expect("session map poisoned")
            .clear();
        self.session_listeners
            .lock()
            .expect("session listeners poisoned")
            .clear();
    }

    async fn mirror(&self, state: &RunState) {
        if let Some(cache) = &self.cache {
            if let Ok(value) = serde_json::to_value(state) {
                cache
                    .set(&format!("run:{}", state.run_id), value, CACHE_TTL)
                    .await;
            }
        }
    }
}

impl Default for RunManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RunManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunManager")
            .field("runs", &self.runs.lock().expect("run map poisoned").len())
            .field("replay_capacity", &self.replay_capacity)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn seq_is_strictly_monotonic() {
        let manager = RunManager::new();
        manager
            .register("run_1", "task", None, AbortController::new())
            .await;

        let mut last = 0;
        for _ in 0..5 {
            let seq = manager
                .broadcast("run_1", "agent", RunEventKind::IterationStart, Value::Null)
                .await
                .unwrap();
            assert!(seq > last);
            last = seq;
        }
    }

    #[tokio::test]
    async fn replay_returns_events_after_seq() {
        let manager = RunManager::new();
        manager
            .register("run_1", "task", None, AbortController::new())
            .await;
        for _ in 0..4 {
            manager
                .broadcast("run_1", "agent", RunEventKind::LlmStart, Value::Null)
                .await;
        }

        let replayed = manager.events_after("run_1", 2);
        assert_eq!(replayed.len(), 2);
        assert!(replayed.iter().all(|e| e.seq > 2));
    }

    #[tokio::test]
    async fn replay_buffer_is_bounded() {
        let manager = RunManager::new().with_replay_capacity(3);
        manager
            .register("run_1", "task", None, AbortController::new())
            .await;
        for _ in 0..10 {
            manager
                .broadcast("run_1", "agent", RunEventKind::ToolStart, Value::Null)
                .await;
        }
        assert_eq!(manager.events_after("run_1", 0).len(), 3);
    }

    #[tokio::test]
    async fn request_stop_fires_abort() {
        let manager = RunManager::new();
        let abort = AbortController::new();
        manager
            .register("run_1", "task", None, abort.clone())
            .await;

        assert!(manager.request_stop("run_1"));
        assert!(abort.is_aborted());
        assert!(!manager.request_stop("missing"));
    }

    #[tokio::test]
    async fn session_listeners_receive_all_session_events() {
        let manager = RunManager::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        manager.add_session_listener(
            "session_a",
            Arc::new(move |_event| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        manager
            .register("run_1", "t1", Some("session_a".to_string()), AbortController::new())
            .await;
        manager
            .register("run_2", "t2", Some("session_a".to_string()), AbortController::new())
            .await;

        manager
            .broadcast("run_1", "a", RunEventKind::AgentStart, Value::Null)
            .await;
        manager
            .broadcast("run_2", "a", RunEventKind::AgentStart, Value::Null)
            .await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn trace_sink_receives_ndjson_records() {
        struct MemoryTrace(Mutex<Vec<String>>);

        #[async_trait]
        impl TraceSink for MemoryTrace {
            async fn append(&self, line: &str) {
                self.0.lock().unwrap().push(line.to_string());
            }
        }

        let trace = Arc::new(MemoryTrace(Mutex::new(Vec::new())));
        let manager = RunManager::new().with_trace_sink(Arc::clone(&trace) as Arc<dyn TraceSink>);
        manager
            .register("run_1", "task", None, AbortController::new())
            .await;
        manager
            .broadcast("run_1", "agent", RunEventKind::ToolStart, Value::Null)
            .await;

        let lines = trace.0.lock().unwrap();
        assert_eq!(lines.len(), 1);
        let parsed: RunEvent = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(parsed.kind, RunEventKind::ToolStart);
        assert!(!lines[0].contains('\n'));
    }

    #[tokio::test]
    async fn terminal_status_sets_duration() {
        let manager = RunManager::new();
        manager
            .register("run_1", "task", None, AbortController::new())
            .await;
        let state = manager
            .update_status("run_1", RunStatus::Completed, Some("ok".to_string()), None)
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.completed_at.is_some());
        assert!(state.duration_ms.is_some());
    }
}
