//! End-to-end scenarios driving the loop, the runner, and the parallel
//! executor against a scripted model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use ronin::prelude::*;

/// A file-reading stub that counts its invocations.
struct StubFsRead {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for StubFsRead {
    fn name(&self) -> &str {
        "fs_read"
    }

    fn description(&self) -> String {
        "Read a file".to_string()
    }

    async fn call(&self, _ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let path = input
            .get("path")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        ToolResponse::ok(format!("export const foo = 1; // {path}"))
    }
}

/// A search stub that counts its invocations.
struct StubGrep {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Tool for StubGrep {
    fn name(&self) -> &str {
        "grep_search"
    }

    fn description(&self) -> String {
        "Search file contents".to_string()
    }

    async fn call(&self, _ctx: &ToolExecCtx, input: InputMap) -> ToolResponse {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let pattern = input
            .get("pattern")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("?");
        ToolResponse::ok(format!("src/lib.rs:12: {pattern}"))
    }
}

fn tool_manager(
    fs_calls: &Arc<AtomicUsize>,
    grep_calls: &Arc<AtomicUsize>,
) -> Arc<ToolManager> {
    let manager = Arc::new(ToolManager::new());
    manager
        .register(
            ToolPack::builder("workspace", "fs")
                .conflict_policy(ConflictPolicy::FirstWins)
                .tool(Arc::new(StubFsRead {
                    calls: Arc::clone(fs_calls),
                }))
                .tool(Arc::new(StubGrep {
                    calls: Arc::clone(grep_calls),
                }))
                .build(),
        )
        .unwrap();
    manager
}

fn call(id: &str, name: &str, fields: &[(&str, &str)]) -> ToolCall {
    let input: InputMap = fields
        .iter()
        .map(|(k, v)| ((*k).to_string(), serde_json::Value::from(*v)))
        .collect();
    ToolCall::new(id, name, input)
}

fn report(id: &str, summary: &str) -> ToolCall {
    call(id, "report", &[("summary", summary)])
}

#[tokio::test]
async fn read_and_report() {
    let fs_calls = Arc::new(AtomicUsize::new(0));
    let grep_calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(
        MockModel::new()
            .with_turn(
                ChatResponse::with_tool_calls(
                    "reading the file",
                    vec![call("c1", "fs_read", &[("path", "src/foo.ts")])],
                )
                .with_usage(TokenUsage::new(80, 10)),
            )
            .with_turn(
                ChatResponse::with_tool_calls(
                    "",
                    vec![report("c2", "src/foo.ts exports `foo`")],
                )
                .with_usage(TokenUsage::new(90, 12)),
            ),
    );
    let models = ModelSelector::new().with_model(Tier::Medium, model);
    let runner = Runner::new(
        RuntimeConfig::default(),
        models,
        tool_manager(&fs_calls, &grep_calls),
    );

    let outcome = runner.run("What is in src/foo.ts?").await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.content, "src/foo.ts exports `foo`");
    assert!(outcome.iterations <= 2);
    assert_eq!(fs_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn sliding_window_boundary() {
    // 15 search iterations, then a report; the 16th prompt must cover only
    // iterations 6-15 plus the seeded system and task messages.
    let fs_calls = Arc::new(AtomicUsize::new(0));
    let grep_calls = Arc::new(AtomicUsize::new(0));
    let mut mock = MockModel::new();
    for i in 1..=15 {
        mock = mock.with_turn(ChatResponse::with_tool_calls(
            format!("searching round {i}"),
            vec![call(
                &format!("c{i}"),
                "grep_search",
                &[("pattern", format!("needle{i}").as_str())],
            )],
        ));
    }
    let mock = mock.with_turn(ChatResponse::with_tool_calls(
        "",
        vec![report("finish", "nothing found")],
    ));
    let model = Arc::new(mock);

    let models = ModelSelector::new().with_model(Tier::Medium, Arc::clone(&model) as SharedModel);
    let runner = Runner::new(
        RuntimeConfig::default().with_max_iterations(20),
        models,
        tool_manager(&fs_calls, &grep_calls),
    );
    let outcome = runner.run("find the needle").await.unwrap();
    assert!(outcome.is_success());

    let chats = model.recorded_chats();
    assert_eq!(chats.len(), 16);
    let final_prompt = &chats[15].messages;

    assert_eq!(final_prompt[0].role, Role::System);
    assert_eq!(final_prompt[1].role, Role::User);
    let windowed: Vec<&Message> = final_prompt[2..].iter().collect();
    let min_iteration = windowed.iter().map(|m| m.iteration).min().unwrap();
    assert_eq!(min_iteration, 6);

    // No orphan tool messages anywhere in the prompt.
    for (index, message) in final_prompt.iter().enumerate() {
        if message.role == Role::Tool {
            let id = message.tool_call_id.as_deref().unwrap();
            let parented = final_prompt[..index].iter().any(|m| {
                m.tool_calls
                    .as_ref()
                    .is_some_and(|calls| calls.iter().any(|c| c.id == id))
            });
            assert!(parented, "orphan tool message {id}");
        }
    }
}

#[tokio::test]
async fn duplicate_tool_calls_are_answered_from_cache() {
    let fs_calls = Arc::new(AtomicUsize::new(0));
    let grep_calls = Arc::new(AtomicUsize::new(0));
    let model = Arc::new(
        MockModel::new()
            // Iterations 1-2: unrelated reads; 3 and 5: the same search.
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![call("c1", "fs_read", &[("path", "a.rs")])],
            ))
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![call("c2", "fs_read", &[("path", "b.rs")])],
            ))
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![call("c3", "grep_search", &[("pattern", "foo")])],
            ))
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![call("c4", "fs_read", &[("path", "c.rs")])],
            ))
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![call("c5", "grep_search", &[("pattern", "foo")])],
            ))
            .with_turn(ChatResponse::with_tool_calls(
                "",
                vec![report("finish", "done")],
            )),
    );
    let models = ModelSelector::new().with_model(Tier::Medium, Arc::clone(&model) as SharedModel);
    let runner = Runner::new(
        RuntimeConfig::default(),
        models,
        tool_manager(&fs_calls, &grep_calls),
    );

    let outcome = runner.run("look around").await.unwrap();
    assert!(outcome.is_success());

    // The underlying tool ran once; the repeat was answered synthetically.
    assert_eq!(grep_calls.load(Ordering::SeqCst), 1);
    let sixth_prompt = &model.recorded_chats()[5].messages;
    let duplicate_reply = sixth_prompt
        .iter()
        .find(|m| m.tool_call_id.as_deref() == Some("c5"))
        .expect("reply for the duplicate call");
    assert!(duplicate_reply.content.contains("iteration 3"));
    assert!(duplicate_reply.content.contains("Duplicate call"));
}

#[tokio::test]
async fn parallel_spawn_partitions_budget_and_cascades_abort() {
    // Runner: task "aborter" aborts its parent mid-flight; the others wait
    // on their abort signals and report how they ended.
    let parent = AbortController::new();
    let trigger = parent.clone();
    let runner: SubAgentRunner = Arc::new(move |request, budget, abort| {
        let trigger = trigger.clone();
        async move {
            if request.task == "aborter" {
                trigger.abort();
                SubAgentResult {
                    task: request.task.clone(),
                    agent_type: request.agent_type.clone(),
                    success: true,
                    result: format!("aborted the parent; budget {budget}"),
                    iterations: 1,
                    tokens_used: budget,
                    deduped: false,
                    error: None,
                    timed_out: false,
                }
            } else {
                abort.signal().cancelled().await;
                SubAgentResult::failure(&request, "aborted")
            }
        }
        .boxed()
    });

    let executor = ParallelExecutor::new(ParallelConfig::default(), runner);
    let requests = vec![
        SubAgentRequest::new("waiter a"),
        SubAgentRequest::new("aborter"),
        SubAgentRequest::new("waiter b"),
    ];
    let results = executor.execute_all(requests, 1, &parent, 3000).await;

    // Equal partition of 3000 across three children.
    assert_eq!(results[1].tokens_used, 1000);
    // The waiters were cancelled through the parent's abort tree.
    assert_eq!(results[0].error.as_deref(), Some("aborted"));
    assert_eq!(results[2].error.as_deref(), Some("aborted"));
}

#[tokio::test]
async fn tier_escalation_reports_final_tier_usage() {
    let fs_calls = Arc::new(AtomicUsize::new(0));
    let grep_calls = Arc::new(AtomicUsize::new(0));

    // Small burns its whole budget on one search turn; medium finishes.
    let small = Arc::new(MockModel::new().with_turn(
        ChatResponse::with_tool_calls(
            "searching",
            vec![call("s1", "grep_search", &[("pattern", "foo")])],
        )
        .with_usage(TokenUsage::new(950, 50)),
    ));
    let medium = Arc::new(
        MockModel::new().with_turn(
            ChatResponse::with_tool_calls("", vec![report("m1", "solved at medium")])
                .with_usage(TokenUsage::new(70, 15)),
        ),
    );

    let config = RuntimeConfig::default()
        .with_tier(Tier::Small)
        .with_token_budget(TokenBudgetConfig {
            enabled: true,
            max_tokens: 800,
            soft_ratio: 0.5,
            hard_ratio: 0.9,
            hard_stop: false,
            force_synthesis_on_hard: false,
        });
    let models = ModelSelector::new()
        .with_model(Tier::Small, small)
        .with_model(Tier::Medium, medium);
    let runner = Runner::new(config, models, tool_manager(&fs_calls, &grep_calls));

    let outcome = runner.run("hard question").await.unwrap();

    assert!(outcome.is_success());
    assert_eq!(outcome.tier, Tier::Medium);
    assert_eq!(outcome.content, "solved at medium");
    assert_eq!(outcome.attempts, 2);
    // Iterations and tokens come from the medium attempt alone.
    assert_eq!(outcome.iterations, 1);
    assert_eq!(outcome.usage.total_tokens, 85);
}

#[tokio::test]
async fn protected_facts_survive_eviction_pressure() {
    let mut sheet = FactSheet::new(FactSheetConfig {
        max_entries: 2,
        min_confidence: 0.05,
        ..FactSheetConfig::default()
    });

    sheet.add(
        FactCategory::Correction,
        "the entry point is main.rs not lib.rs",
        0.1,
        "test",
        1,
        None,
    );
    sheet.add(
        FactCategory::Blocker,
        "no network access from the sandbox",
        0.1,
        "test",
        1,
        None,
    );
    sheet.add(
        FactCategory::Finding,
        "the scheduler uses a binary heap",
        0.9,
        "test",
        2,
        None,
    );

    assert_eq!(sheet.len(), 2);
    let categories: Vec<FactCategory> = sheet.entries().iter().map(|e| e.category).collect();
    assert!(categories.contains(&FactCategory::Correction));
    assert!(categories.contains(&FactCategory::Blocker));
    assert!(!categories.contains(&FactCategory::Finding));
}
