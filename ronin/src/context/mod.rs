//! Prompt-context shaping: sliding window, output truncation, and
//! tool-call deduplication.
//!
//! Everything here is a read transform over the monotone message log; the
//! log itself is only ever appended to by the loop.

mod dedup;

pub use dedup::{SeenToolCall, ToolCallDeduper};

use crate::config::ContextFilterConfig;
use crate::message::{Message, Role, Truncation};
use crate::run::MessageLog;

/// Shapes the effective prompt from the full message history.
#[derive(Debug, Clone)]
pub struct ContextFilter {
    log: MessageLog,
    config: ContextFilterConfig,
}

impl ContextFilter {
    /// Create a filter over a run's message log.
    #[must_use]
    pub fn new(log: MessageLog, config: ContextFilterConfig) -> Self {
        Self { log, config }
    }

    /// The filter's configuration.
    #[must_use]
    pub const fn config(&self) -> &ContextFilterConfig {
        &self.config
    }

    /// An immutable copy of the full history.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.log.snapshot()
    }

    /// Cut an over-long tool output down to the configured maximum.
    ///
    /// The returned message carries the number of discarded characters and
    /// a flag marking the full text as retrievable from the archive. Other
    /// roles and short outputs pass through unchanged.
    #[must_use]
    pub fn truncate(&self, message: &Message) -> Message {
        if message.role != Role::Tool {
            return message.clone();
        }
        let max = self.config.max_output_length;
        let total = message.content.chars().count();
        if total <= max {
            return message.clone();
        }

        let dropped = total - max;
        let mut content: String = message.content.chars().take(max).collect();
        content.push_str(&format!(
            "\n[... {dropped} chars truncated; recall the full output via archive_recall]"
        ));
        Message {
            content,
            truncation: Some(Truncation {
                dropped_chars: dropped,
                retrievable: true,
            }),
            ..message.clone()
        }
    }

    /// Assemble the effective prompt: system and task messages, one
    /// synthetic system message per summary, then a pair-aware sliding
    /// window over recent iterations.
    ///
    /// The window keeps the last `sliding_window_size` distinct iteration
    /// indices. When the cutoff would land inside a tool-result block it
    /// walks backward until the assistant message that issued those calls
    /// is included, so no tool reply is ever orphaned.
    #[must_use]
    pub fn build_default_context(
        &self,
        system: &Message,
        task: &Message,
        summaries: &[String],
    ) -> Vec<Message> {
        let history = self.snapshot();
        let body = seeded_body(&history);

        let mut iterations: Vec<usize> = body.iter().map(|m| m.iteration).collect();
        iterations.dedup();
        let kept = self.config.sliding_window_size.max(1);
        let cutoff = if iterations.len() > kept {
            iterations[iterations.len() - kept]
        } else {
            iterations.first().copied().unwrap_or(0)
        };

        let mut start = body
            .iter()
            .position(|m| m.iteration >= cutoff)
            .unwrap_or(body.len());

        while start < body.len() && start > 0 && body[start].role == Role::Tool {
            let mut back = start;
            while back > 0 {
                back -= 1;
                if body[back].role == Role::Assistant && body[back].has_tool_calls() {
                    break;
                }
            }
            start = back;
        }

        let mut context = Vec::with_capacity(2 + summaries.len() + body.len() - start);
        context.push(system.clone());
        context.push(task.clone());
        for summary in summaries {
            context.push(Message::system(format!("Earlier progress summary:\n{summary}")));
        }
        context.extend(body[start..].iter().map(|m| self.truncate(m)));
        context
    }
}

/// Strip the seeded system/task pair off the front of the history.
fn seeded_body(history: &[Message]) -> &[Message] {
    if history.len() >= 2 && history[0].role == Role::System && history[1].role == Role::User {
        &history[2..]
    } else {
        history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{InputMap, ToolCall};

    fn filter_with(messages: Vec<Message>, config: ContextFilterConfig) -> ContextFilter {
        let log = MessageLog::new();
        log.append(messages);
        ContextFilter::new(log, config)
    }

    fn seed() -> Vec<Message> {
        vec![
            Message::system("system prompt"),
            Message::user("the task").with_iteration(0),
        ]
    }

    /// One assistant/tool pair per iteration.
    fn turn(iteration: usize) -> Vec<Message> {
        let call = ToolCall::new(format!("call_{iteration}"), "grep_search", InputMap::new());
        vec![
            Message::assistant_with_tools(format!("thinking {iteration}"), vec![call])
                .with_iteration(iteration),
            Message::tool(format!("call_{iteration}"), format!("result {iteration}"))
                .with_iteration(iteration),
        ]
    }

    #[test]
    fn truncation_law() {
        let config = ContextFilterConfig {
            max_output_length: 100,
            ..ContextFilterConfig::default()
        };
        let filter = filter_with(seed(), config);

        let long = Message::tool("c1", "x".repeat(250));
        let truncated = filter.truncate(&long);
        let annotation = truncated.truncation.unwrap();
        assert_eq!(annotation.dropped_chars, 150);
        assert!(annotation.retrievable);
        assert!(truncated.content.starts_with(&"x".repeat(100)));
        assert!(truncated.content.contains("150 chars truncated"));

        let short = Message::tool("c2", "small");
        assert_eq!(filter.truncate(&short), short);

        let assistant = Message::assistant("x".repeat(250));
        assert!(filter.truncate(&assistant).truncation.is_none());
    }

    #[test]
    fn window_keeps_last_n_iterations() {
        let mut messages = seed();
        for i in 1..=15 {
            messages.extend(turn(i));
        }
        let filter = filter_with(messages, ContextFilterConfig::default());

        let context = filter.build_default_context(
            &Message::system("system prompt"),
            &Message::user("the task"),
            &[],
        );

        assert_eq!(context[0].role, Role::System);
        assert_eq!(context[1].role, Role::User);
        let min_iteration = context[2..].iter().map(|m| m.iteration).min().unwrap();
        assert_eq!(min_iteration, 6);
        let max_iteration = context.iter().map(|m| m.iteration).max().unwrap();
        assert_eq!(max_iteration, 15);
    }

    #[test]
    fn window_never_orphans_tool_messages() {
        let mut messages = seed();
        for i in 1..=15 {
            messages.extend(turn(i));
        }
        let filter = filter_with(messages, ContextFilterConfig::default());
        let context = filter.build_default_context(
            &Message::system("s"),
            &Message::user("t"),
            &[],
        );

        for (index, message) in context.iter().enumerate() {
            if message.role == Role::Tool {
                let call_id = message.tool_call_id.as_deref().unwrap();
                let has_parent = context[..index].iter().any(|m| {
                    m.role == Role::Assistant
                        && m.tool_calls
                            .as_ref()
                            .is_some_and(|calls| calls.iter().any(|c| c.id == call_id))
                });
                assert!(has_parent, "tool message {call_id} has no assistant parent");
            }
        }
    }

    #[test]
    fn cutoff_inside_tool_block_walks_back_to_assistant() {
        // Tool replies stamped past their assistant: the cutoff lands on a
        // tool message and the window must walk back to the issuing
        // assistant rather than orphan the replies.
        let calls: Vec<ToolCall> = (0..3)
            .map(|i| ToolCall::new(format!("c{i}"), "fs_read", InputMap::new()))
            .collect();
        let mut messages = seed();
        messages.push(Message::assistant_with_tools("batch", calls.clone()).with_iteration(1));
        for call in &calls {
            messages.push(Message::tool(&call.id, "out").with_iteration(2));
        }
        for i in 3..=4 {
            messages.extend(turn(i));
        }

        let filter = filter_with(
            messages,
            ContextFilterConfig {
                sliding_window_size: 3,
                ..ContextFilterConfig::default()
            },
        );
        let context =
            filter.build_default_context(&Message::system("s"), &Message::user("t"), &[]);

        // Window cutoff is iteration 2, which starts with tool replies.
        assert!(context.iter().any(|m| m.content == "batch"));
        let batch_index = context.iter().position(|m| m.content == "batch").unwrap();
        assert!(context[batch_index + 1].role == Role::Tool);
    }

    #[test]
    fn summaries_become_synthetic_system_messages() {
        let filter = filter_with(seed(), ContextFilterConfig::default());
        let context = filter.build_default_context(
            &Message::system("s"),
            &Message::user("t"),
            &["found the bug".to_string(), "fixed the bug".to_string()],
        );
        assert_eq!(context.len(), 4);
        assert_eq!(context[2].role, Role::System);
        assert!(context[2].content.contains("found the bug"));
        assert!(context[3].content.contains("fixed the bug"));
    }
}
