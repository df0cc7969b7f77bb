//! Parallel sub-agent execution: budget partition, dedup, backpressure,
//! cancel tree, and join timeout.

mod spawn;

pub use spawn::{spawn_pack, SpawnAgentTool};
pub(crate) use spawn::PARALLEL_META_NS;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::{ParallelConfig, TokenPartition};
use crate::run::AbortController;

/// A request to run one sub-agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentRequest {
    /// The task text.
    pub task: String,
    /// Agent type tag (informational; selects behavior in the runner).
    pub agent_type: String,
    /// Iteration cap override for the child.
    #[serde(default)]
    pub max_iterations: Option<usize>,
    /// Working directory override for the child.
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Coalescing key; defaults to the task text.
    #[serde(default)]
    pub dedupe_key: Option<String>,
    /// Weight for weighted budget partition.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Identifier of the spawning agent.
    #[serde(default)]
    pub parent_agent_id: Option<String>,
    /// Spawn depth of the child (root children are depth 1).
    #[serde(default)]
    pub depth: usize,
}

const fn default_weight() -> f64 {
    1.0
}

impl SubAgentRequest {
    /// Create a request with defaults.
    #[must_use]
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            agent_type: "general".to_string(),
            max_iterations: None,
            working_dir: None,
            dedupe_key: None,
            weight: 1.0,
            parent_agent_id: None,
            depth: 0,
        }
    }

    /// Set the agent type tag.
    #[must_use]
    pub fn agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    /// Set the dedup key.
    #[must_use]
    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }

    /// Set the partition weight.
    #[must_use]
    pub const fn weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// The effective coalescing key.
    #[must_use]
    pub fn key(&self) -> String {
        self.dedupe_key.clone().unwrap_or_else(|| self.task.clone())
    }
}

/// The result of one sub-agent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubAgentResult {
    /// The task that ran.
    pub task: String,
    /// Agent type tag.
    pub agent_type: String,
    /// Whether the child finished its task.
    pub success: bool,
    /// Result text.
    pub result: String,
    /// Iterations the child used.
    pub iterations: usize,
    /// Tokens the child used.
    pub tokens_used: u64,
    /// True when this caller shared another caller's run.
    pub deduped: bool,
    /// Error text for failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the result missed the join deadline.
    pub timed_out: bool,
}

impl SubAgentResult {
    /// A synthetic failure for a request that never ran.
    #[must_use]
    pub fn failure(request: &SubAgentRequest, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            task: request.task.clone(),
            agent_type: request.agent_type.clone(),
            success: false,
            result: error.clone(),
            iterations: 0,
            tokens_used: 0,
            deduped: false,
            error: Some(error),
            timed_out: false,
        }
    }

    /// A synthetic result for a request that missed the join deadline.
    #[must_use]
    pub fn timed_out(request: &SubAgentRequest) -> Self {
        Self {
            timed_out: true,
            ..Self::failure(request, "join timeout")
        }
    }
}

/// Runs one sub-agent request: `(request, token_budget, child_abort)`.
pub type SubAgentRunner = Arc<
    dyn Fn(SubAgentRequest, u64, AbortController) -> BoxFuture<'static, SubAgentResult>
        + Send
        + Sync,
>;

type SharedRun = Shared<BoxFuture<'static, SubAgentResult>>;

/// Bounded-concurrency executor for sub-agent requests.
pub struct ParallelExecutor {
    config: ParallelConfig,
    runner: SubAgentRunner,
    semaphore: Arc<Semaphore>,
    /// Requests submitted and not yet settled; anything beyond
    /// `max_concurrent` of these is parked in the queue.
    active: Arc<AtomicUsize>,
    in_flight: Arc<Mutex<HashMap<String, SharedRun>>>,
}

impl ParallelExecutor {
    /// Create an executor over a runner.
    #[must_use]
    pub fn new(config: ParallelConfig, runner: SubAgentRunner) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            config,
            runner,
            semaphore,
            active: Arc::new(AtomicUsize::new(0)),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The executor's configuration.
    #[must_use]
    pub const fn config(&self) -> &ParallelConfig {
        &self.config
    }

    /// Split a parent budget across requests; 0 passes 0 (unlimited) to all.
    fn partition(&self, requests: &[SubAgentRequest], total: u64) -> Vec<u64> {
        if total == 0 || requests.is_empty() {
            return vec![0; requests.len()];
        }
        match self.config.token_partition {
            TokenPartition::Equal => {
                let share = total / requests.len() as u64;
                vec![share; requests.len()]
            }
            TokenPartition::Weighted => {
                let total_weight: f64 = requests.iter().map(|r| r.weight.max(0.0)).sum();
                if total_weight <= 0.0 {
                    let share = total / requests.len() as u64;
                    return vec![share; requests.len()];
                }
                requests
                    .iter()
                    .map(|r| ((r.weight.max(0.0) / total_weight) * total as f64) as u64)
                    .collect()
            }
        }
    }

    /// Run every request, returning one result per request in order.
    ///
    /// `depth` is the spawn depth of the children; `parent_budget` of 0
    /// falls back to the configured parent budget. Never blocks past the
    /// join deadline: stragglers come back marked `timed_out`.
    pub async fn execute_all(
        &self,
        requests: Vec<SubAgentRequest>,
        depth: usize,
        parent: &AbortController,
        parent_budget: u64,
    ) -> Vec<SubAgentResult> {
        if requests.is_empty() {
            return Vec::new();
        }
        if depth > self.config.max_depth {
            let message = format!(
                "max depth exceeded ({depth} > {})",
                self.config.max_depth
            );
            return requests
                .iter()
                .map(|r| SubAgentResult::failure(r, &message))
                .collect();
        }
        if parent.is_aborted() {
            return requests
                .iter()
                .map(|r| SubAgentResult::failure(r, "aborted"))
                .collect();
        }

        let budget = if parent_budget > 0 {
            parent_budget
        } else {
            self.config.parent_token_budget
        };
        let budgets = self.partition(&requests, budget);
        let deadline = tokio::time::Instant::now()
            + Duration::from_millis(self.config.join_timeout_ms);

        enum Slot {
            Fresh(SharedRun),
            Deduped(SharedRun),
            Failed(SubAgentResult),
        }

        let mut slots = Vec::with_capacity(requests.len());
        for (request, child_budget) in requests.iter().zip(&budgets) {
            let key = request.key();
            let existing = {
                let in_flight = self.in_flight.lock().expect("in-flight map poisoned");
                in_flight.get(&key).cloned()
            };
            if let Some(shared) = existing {
                debug!(task = %request.task, "coalescing duplicate sub-agent request");
                slots.push(Slot::Deduped(shared));
                continue;
            }

            // Backpressure: refuse when the park queue is already full.
            let active = self.active.load(Ordering::SeqCst);
            if active >= self.config.max_concurrent + self.config.max_queue_size {
                warn!(task = %request.task, "sub-agent queue full");
                slots.push(Slot::Failed(SubAgentResult::failure(request, "queue full")));
                continue;
            }
            self.active.fetch_add(1, Ordering::SeqCst);

            let runner = Arc::clone(&self.runner);
            let semaphore = Arc::clone(&self.semaphore);
            let child = parent.child();
            let request_clone = request.clone();
            let child_budget = *child_budget;

            let shared: SharedRun = async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return SubAgentResult::failure(&request_clone, "executor closed"),
                };
                if child.is_aborted() {
                    return SubAgentResult::failure(&request_clone, "aborted");
                }
                runner(request_clone, child_budget, child).await
            }
            .boxed()
            .shared();

            {
                let mut in_flight = self.in_flight.lock().expect("in-flight map poisoned");
                in_flight.insert(key.clone(), shared.clone());
            }
            // Drive to completion regardless of join timeouts, and drop the
            // dedup entry once settled.
            let driver = shared.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let active = Arc::clone(&self.active);
            tokio::spawn(async move {
                let _ = driver.await;
                active.fetch_sub(1, Ordering::SeqCst);
                in_flight
                    .lock()
                    .expect("in-flight map poisoned")
                    .remove(&key);
            });

            slots.push(Slot::Fresh(shared));
        }

        let mut results = Vec::with_capacity(slots.len());
        for (slot, request) in slots.into_iter().zip(&requests) {
            let result = match slot {
                Slot::Failed(result) => result,
                Slot::Fresh(shared) => match tokio::time::timeout_at(deadline, shared).await {
                    Ok(result) => result,
                    Err(_) => SubAgentResult::timed_out(request),
                },
                Slot::Deduped(shared) => match tokio::time::timeout_at(deadline, shared).await {
                    Ok(mut result) => {
                        result.deduped = true;
                        result
                    }
                    Err(_) => SubAgentResult::timed_out(request),
                },
            };
            results.push(result);
        }
        results
    }
}

impl std::fmt::Debug for ParallelExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParallelExecutor")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn echo_runner(calls: Arc<AtomicUsize>) -> SubAgentRunner {
        Arc::new(move |request, budget, abort| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if abort.is_aborted() {
                    return SubAgentResult::failure(&request, "aborted");
                }
                SubAgentResult {
                    task: request.task.clone(),
                    agent_type: request.agent_type.clone(),
                    success: true,
                    result: format!("done with budget {budget}"),
                    iterations: 1,
                    tokens_used: budget,
                    deduped: false,
                    error: None,
                    timed_out: false,
                }
            }
            .boxed()
        })
    }

    fn executor(config: ParallelConfig, calls: &Arc<AtomicUsize>) -> ParallelExecutor {
        ParallelExecutor::new(config, echo_runner(Arc::clone(calls)))
    }

    #[tokio::test]
    async fn equal_partition_gives_floor_share() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(ParallelConfig::default(), &calls);
        let requests = vec![
            SubAgentRequest::new("a"),
            SubAgentRequest::new("b"),
            SubAgentRequest::new("c"),
        ];

        let results = exec
            .execute_all(requests, 1, &AbortController::new(), 3000)
            .await;
        assert_eq!(results.len(), 3);
        for result in &results {
            assert!(result.success);
            assert_eq!(result.tokens_used, 1000);
        }
    }

    #[tokio::test]
    async fn weighted_partition_follows_weights() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(
            ParallelConfig {
                token_partition: TokenPartition::Weighted,
                ..ParallelConfig::default()
            },
            &calls,
        );
        let requests = vec![
            SubAgentRequest::new("a").weight(3.0),
            SubAgentRequest::new("b").weight(1.0),
        ];

        let results = exec
            .execute_all(requests, 1, &AbortController::new(), 1000)
            .await;
        assert_eq!(results[0].tokens_used, 750);
        assert_eq!(results[1].tokens_used, 250);
    }

    #[tokio::test]
    async fn zero_budget_means_unlimited() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(ParallelConfig::default(), &calls);
        let results = exec
            .execute_all(
                vec![SubAgentRequest::new("a")],
                1,
                &AbortController::new(),
                0,
            )
            .await;
        assert_eq!(results[0].tokens_used, 0);
    }

    #[tokio::test]
    async fn depth_guard_fails_without_invoking_runner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(ParallelConfig::default(), &calls);
        let results = exec
            .execute_all(
                vec![SubAgentRequest::new("a"), SubAgentRequest::new("b")],
                4,
                &AbortController::new(),
                0,
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        for result in &results {
            assert!(!result.success);
            assert!(result.error.as_deref().unwrap().contains("max depth"));
        }
    }

    #[tokio::test]
    async fn aborted_parent_fails_without_invoking_runner() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exec = executor(ParallelConfig::default(), &calls);
        let parent = AbortController::new();
        parent.abort();

        let results = exec
            .execute_all(vec![SubAgentRequest::new("a")], 1, &parent, 0)
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(results[0].error.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn identical_keys_share_one_run() {
        let calls = Arc::new(AtomicUsize::new(0));
        let started = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        let runner: SubAgentRunner = {
            let calls = Arc::clone(&calls);
            let started = Arc::clone(&started);
            let release = Arc::clone(&release);
            Arc::new(move |request, _budget, _abort| {
                calls.fetch_add(1, Ordering::SeqCst);
                let started = Arc::clone(&started);
                let release = Arc::clone(&release);
                async move {
                    started.notify_one();
                    release.notified().await;
                    SubAgentResult {
                        task: request.task.clone(),
                        agent_type: request.agent_type.clone(),
                        success: true,
                        result: "shared".to_string(),
                        iterations: 1,
                        tokens_used: 0,
                        deduped: false,
                        error: None,
                        timed_out: false,
                    }
                }
                .boxed()
            })
        };
        let exec = Arc::new(ParallelExecutor::new(ParallelConfig::default(), runner));

        let requests = vec![
            SubAgentRequest::new("same task"),
            SubAgentRequest::new("same task"),
        ];
        let parent = AbortController::new();
        let handle = {
            let exec = Arc::clone(&exec);
            let parent = parent.clone();
            tokio::spawn(async move { exec.execute_all(requests, 1, &parent, 0).await })
        };

        started.notified().await;
        release.notify_one();
        let results = handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!results[0].deduped);
        assert!(results[1].deduped);
        assert_eq!(results[1].result, "shared");
    }

    #[tokio::test]
    async fn concurrency_is_capped() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let runner: SubAgentRunner = {
            let running = Arc::clone(&running);
            let peak = Arc::clone(&peak);
            Arc::new(move |request, _budget, _abort| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    SubAgentResult {
                        task: request.task.clone(),
                        agent_type: request.agent_type.clone(),
                        success: true,
                        result: String::new(),
                        iterations: 0,
                        tokens_used: 0,
                        deduped: false,
                        error: None,
                        timed_out: false,
                    }
                }
                .boxed()
            })
        };
        let exec = ParallelExecutor::new(
            ParallelConfig {
                max_concurrent: 2,
                ..ParallelConfig::default()
            },
            runner,
        );

        let requests: Vec<SubAgentRequest> = (0..6)
            .map(|i| SubAgentRequest::new(format!("task {i}")))
            .collect();
        let results = exec
            .execute_all(requests, 1, &AbortController::new(), 0)
            .await;

        assert!(results.iter().all(|r| r.success));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn queue_overflow_returns_synthetic_failure() {
        let runner: SubAgentRunner = Arc::new(move |request, _budget, _abort| {
            async move {
                tokio::time::sleep(Duration::from_millis(30)).await;
                SubAgentResult {
                    task: request.task.clone(),
                    agent_type: request.agent_type.clone(),
                    success: true,
                    result: String::new(),
                    iterations: 0,
                    tokens_used: 0,
                    deduped: false,
                    error: None,
                    timed_out: false,
                }
            }
            .boxed()
        });
        let exec = ParallelExecutor::new(
            ParallelConfig {
                max_concurrent: 1,
                max_queue_size: 1,
                join_timeout_ms: 2000,
                ..ParallelConfig::default()
            },
            runner,
        );

        // One permit, one queue slot: the third submission overflows.
        let requests = vec![
            SubAgentRequest::new("runs"),
            SubAgentRequest::new("parks"),
            SubAgentRequest::new("overflows"),
        ];
        let results = exec
            .execute_all(requests, 1, &AbortController::new(), 0)
            .await;

        assert!(results[0].success);
        assert!(results[1].success);
        assert!(!results[2].success);
        assert_eq!(results[2].error.as_deref(), Some("queue full"));
    }

    #[tokio::test]
    async fn join_timeout_marks_stragglers() {
        let runner: SubAgentRunner = Arc::new(move |request, _budget, _abort| {
            let slow = request.task == "slow";
            async move {
                if slow {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                }
                SubAgentResult {
                    task: request.task.clone(),
                    agent_type: request.agent_type.clone(),
                    success: true,
                    result: "fast done".to_string(),
                    iterations: 1,
                    tokens_used: 0,
                    deduped: false,
                    error: None,
                    timed_out: false,
                }
            }
            .boxed()
        });
        let exec = ParallelExecutor::new(
            ParallelConfig {
                join_timeout_ms: 50,
                ..ParallelConfig::default()
            },
            runner,
        );

        let results = exec
            .execute_all(
                vec![SubAgentRequest::new("fast"), SubAgentRequest::new("slow")],
                1,
                &AbortController::new(),
                0,
            )
            .await;

        assert!(results[0].success);
        assert!(!results[0].timed_out);
        assert!(results[1].timed_out);
        assert!(!results[1].success);
    }

    #[tokio::test]
    async fn parent_abort_cancels_children() {
        let runner: SubAgentRunner = Arc::new(move |request, _budget, abort| {
            async move {
                abort.signal().cancelled().await;
                SubAgentResult::failure(&request, "aborted")
            }
            .boxed()
        });
        let exec = Arc::new(ParallelExecutor::new(
            ParallelConfig {
                join_timeout_ms: 5000,
                ..ParallelConfig::default()
            },
            runner,
        ));

        let parent = AbortController::new();
        let handle = {
            let exec = Arc::clone(&exec);
            let parent = parent.clone();
            tokio::spawn(async move {
                exec.execute_all(vec![SubAgentRequest::new("a")], 1, &parent, 0)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        parent.abort();
        let results = handle.await.unwrap();
        assert_eq!(results[0].error.as_deref(), Some("aborted"));
    }
}
