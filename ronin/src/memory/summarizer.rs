//! Background fact extraction over iteration ranges.
//!
//! Every N iterations the loop snapshots a message range and queues it
//! here. A single worker drains the queue in FIFO order, asks a small-tier
//! model for structured facts, and hands them to a sink (typically the
//! fact sheet). Submission never blocks and no range is summarized twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::SummarizerConfig;
use crate::message::{Message, Role};
use crate::model::{CompletionOptions, SharedModel};
use crate::util::extract_first_json;

use super::fact_sheet::FactCategory;

/// A fact extracted by the summarizer model.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ExtractedFact {
    /// Category of the fact.
    pub category: FactCategory,
    /// The fact text.
    pub fact: String,
    /// Model-assigned confidence in [0, 1].
    pub confidence: f64,
    /// Where the fact came from.
    #[serde(default)]
    pub source: String,
}

/// Receives extracted facts.
pub type FactSink = Arc<dyn Fn(Vec<ExtractedFact>) + Send + Sync>;

struct SummarizeJob {
    range: (usize, usize),
    messages: Vec<Message>,
}

/// Queued, non-blocking fact extraction.
pub struct Summarizer {
    tx: mpsc::UnboundedSender<SummarizeJob>,
    submitted: Mutex<HashSet<(usize, usize)>>,
    interval: usize,
    worker: JoinHandle<()>,
}

impl Summarizer {
    /// Create a summarizer with its background worker.
    #[must_use]
    pub fn new(model: SharedModel, config: SummarizerConfig, sink: FactSink) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<SummarizeJob>();
        let max_tokens = config.max_tokens;
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                process(&model, max_tokens, job, &sink).await;
            }
        });
        Self {
            tx,
            submitted: Mutex::new(HashSet::new()),
            interval: config.interval.max(1),
            worker,
        }
    }

    /// Queue a range when the iteration lands on the configured interval.
    ///
    /// The range covers the `interval` iterations ending at `iteration`.
    pub fn maybe_submit(&self, iteration: usize, messages: &[Message]) -> bool {
        if iteration == 0 || iteration % self.interval != 0 {
            return false;
        }
        let start = iteration + 1 - self.interval;
        self.submit((start, iteration), messages)
    }

    /// Queue a message range for extraction.
    ///
    /// Returns false when the range was already submitted or the worker is
    /// gone. Never blocks.
    pub fn submit(&self, range: (usize, usize), messages: &[Message]) -> bool {
        {
            let mut submitted = self.submitted.lock().expect("summarizer poisoned");
            if !submitted.insert(range) {
                return false;
            }
        }
        let window: Vec<Message> = messages
            .iter()
            .filter(|m| m.iteration >= range.0 && m.iteration <= range.1)
            .cloned()
            .collect();
        if window.is_empty() {
            return false;
        }
        self.tx
            .send(SummarizeJob {
                range,
                messages: window,
            })
            .is_ok()
    }

    /// Stop accepting work and wait for the queue to drain.
    pub async fn join(self) {
        drop(self.tx);
        let _ = self.worker.await;
    }
}

impl std::fmt::Debug for Summarizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Summarizer")
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

async fn process(model: &SharedModel, max_tokens: u32, job: SummarizeJob, sink: &FactSink) {
    let prompt = build_prompt(job.range, &job.messages);
    let options = CompletionOptions::default()
        .with_max_tokens(max_tokens)
        .with_temperature(0.0);

    let response = match model.complete(&prompt, options).await {
        Ok(response) => response,
        Err(error) => {
            warn!(range = ?job.range, error = %error, "fact extraction call failed");
            return;
        }
    };

    let facts = parse_facts(&response.content);
    debug!(range = ?job.range, count = facts.len(), "extracted facts");
    if !facts.is_empty() {
        sink(facts);
    }
}

fn build_prompt(range: (usize, usize), messages: &[Message]) -> String {
    let mut transcript = String::new();
    for message in messages {
        let role = match message.role {
            Role::System => continue,
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        transcript.push_str(&format!("[{role}] {}\n", message.content));
    }

    format!(
        "Extract durable facts from iterations {}-{} of an agent transcript.\n\
         Respond with only a JSON array; each element is\n\
         {{\"category\": one of correction|blocker|decision|finding|file_content|architecture|tool_result|environment,\n\
          \"fact\": string, \"confidence\": number in [0,1], \"source\": string}}.\n\
         Skip transient chatter; keep facts that stay true for the rest of the task.\n\n\
         Transcript:\n{transcript}",
        range.0, range.1
    )
}

fn parse_facts(text: &str) -> Vec<ExtractedFact> {
    let Some(serde_json::Value::Array(items)) = extract_first_json(text) else {
        return Vec::new();
    };
    items
        .into_iter()
        .filter_map(|item| serde_json::from_value(item).ok())
        .collect()
}
