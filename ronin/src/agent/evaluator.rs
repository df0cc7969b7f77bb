//! Decides whether a finished run actually satisfied its task.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::model::{CompletionOptions, SharedModel};
use crate::util::extract_first_json;

/// Files read before an informational task counts as evidenced.
const FAST_PATH_FILES_READ: usize = 3;

/// Evidence markers per hundred words for the fast path without reads.
const FAST_PATH_EVIDENCE_DENSITY: f64 = 1.0;

/// What kind of work the task asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskIntent {
    /// Find something out.
    Discovery,
    /// Explain or assess something.
    Analysis,
    /// Change something.
    Mutation,
    /// Confirm something works.
    Verification,
    /// Could not tell.
    Unknown,
}

impl TaskIntent {
    /// Classify a task from its phrasing.
    #[must_use]
    pub fn classify(task: &str) -> Self {
        let task = task.to_lowercase();
        let has = |words: &[&str]| words.iter().any(|w| task.contains(w));
        if has(&["what", "where", "which", "find", "list", "locate", "show me"]) {
            Self::Discovery
        } else if has(&["why", "how does", "explain", "analyze", "review", "compare"]) {
            Self::Analysis
        } else if has(&["fix", "add", "implement", "write", "create", "update", "refactor", "remove"]) {
            Self::Mutation
        } else if has(&["verify", "check that", "ensure", "confirm", "test that"]) {
            Self::Verification
        } else {
            Self::Unknown
        }
    }

    /// Whether the task only asks for information.
    #[must_use]
    pub const fn is_informational(&self) -> bool {
        matches!(self, Self::Discovery | Self::Analysis)
    }
}

/// Everything known about a finished run.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    /// The task text.
    pub task: String,
    /// The final response.
    pub response: String,
    /// Files read during the run.
    pub files_read: Vec<String>,
    /// Files written during the run.
    pub files_written: Vec<String>,
    /// Files created during the run.
    pub files_created: Vec<String>,
    /// Tool invocation counts by name.
    pub tools_used: HashMap<String, u32>,
    /// Whether verification commands ran (tests, builds).
    pub ran_verification: bool,
}

impl RunSummary {
    /// Whether the run changed any files.
    #[must_use]
    pub fn made_changes(&self) -> bool {
        !self.files_written.is_empty() || !self.files_created.is_empty()
    }
}

/// The evaluator's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionVerdict {
    /// Whether the run satisfied the task.
    pub success: bool,
    /// One-line explanation.
    pub summary: String,
}

#[derive(Debug, Deserialize)]
struct ValidatorReply {
    success: bool,
    #[serde(default)]
    summary: String,
}

#[derive(Debug, Clone)]
struct HistoricalRun {
    made_changes: bool,
    summary: String,
}

/// Heuristic-plus-model completion evaluation, aware of earlier runs of the
/// same task.
pub struct CompletionEvaluator {
    validator: Option<SharedModel>,
    history: Mutex<HashMap<String, HistoricalRun>>,
}

impl CompletionEvaluator {
    /// Create a purely heuristic evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self {
            validator: None,
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Use a small-tier model as the validator.
    #[must_use]
    pub fn with_validator(mut self, model: SharedModel) -> Self {
        self.validator = Some(model);
        self
    }

    /// Evaluate a finished run.
    pub async fn evaluate(&self, run: &RunSummary) -> CompletionVerdict {
        let intent = TaskIntent::classify(&run.task);

        // Fast path: informational tasks with concrete evidence.
        if intent.is_informational()
            && has_evidence(&run.response)
            && (run.files_read.len() >= FAST_PATH_FILES_READ
                || evidence_density(&run.response) >= FAST_PATH_EVIDENCE_DENSITY)
        {
            self.record(run, true);
            return CompletionVerdict {
                success: true,
                summary: "informational task answered with cited evidence".to_string(),
            };
        }

        // Retry-aware: no changes this time, but an earlier run of the same
        // task changed files and this run re-verified them.
        if !run.made_changes() && run.ran_verification {
            let history = self.history.lock().expect("history poisoned");
            if let Some(prior) = history.get(&normalize_task(&run.task)) {
                if prior.made_changes {
                    return CompletionVerdict {
                        success: true,
                        summary: format!(
                            "verified artifacts from an earlier run: {}",
                            prior.summary
                        ),
                    };
                }
            }
        }

        if let Some(model) = &self.validator {
            match self.ask_validator(model, run).await {
                Some(verdict) => {
                    self.record(run, verdict.success);
                    return verdict;
                }
                None => debug!("validator unavailable; falling back to heuristics"),
            }
        }

        let verdict = heuristic_verdict(run, intent);
        self.record(run, verdict.success);
        verdict
    }

    async fn ask_validator(
        &self,
        model: &SharedModel,
        run: &RunSummary,
    ) -> Option<CompletionVerdict> {
        let prompt = format!(
            "Did this agent run satisfy its task? Reply with only \
             {{\"success\": bool, \"summary\": string}}.\n\n\
             Task: {}\n\nFinal response: {}\n\n\
             Files read: {}; written: {}; created: {}.",
            run.task,
            run.response,
            run.files_read.len(),
            run.files_written.len(),
            run.files_created.len(),
        );
        let response = match model
            .complete(&prompt, CompletionOptions::default().with_temperature(0.0))
            .await
        {
            Ok(response) => response,
            Err(error) => {
                warn!(error = %error, "validator call failed");
                return None;
            }
        };
        let value = extract_first_json(&response.content)?;
        let reply: ValidatorReply = serde_json::from_value(value).ok()?;
        Some(CompletionVerdict {
            success: reply.success,
            summary: if reply.summary.is_empty() {
                "validator verdict".to_string()
            } else {
                reply.summary
            },
        })
    }

    fn record(&self, run: &RunSummary, success: bool) {
        if success {
            self.history.lock().expect("history poisoned").insert(
                normalize_task(&run.task),
                HistoricalRun {
                    made_changes: run.made_changes(),
                    summary: truncate(&run.response, 120),
                },
            );
        }
    }
}

impl Default for CompletionEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompletionEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionEvaluator")
            .field("has_validator", &self.validator.is_some())
            .finish_non_exhaustive()
    }
}

fn heuristic_verdict(run: &RunSummary, intent: TaskIntent) -> CompletionVerdict {
    let no_result_phrases = [
        "could not find",
        "couldn't find",
        "no results",
        "unable to",
        "not found",
        "gave up",
    ];
    let response = run.response.to_lowercase();
    if no_result_phrases.iter().any(|p| response.contains(p)) {
        return CompletionVerdict {
            success: false,
            summary: "response reports no result".to_string(),
        };
    }

    let success = match intent {
        TaskIntent::Mutation => run.made_changes(),
        TaskIntent::Verification => run.ran_verification,
        _ => has_evidence(&run.response) || run.made_changes(),
    };
    CompletionVerdict {
        success,
        summary: if success {
            "heuristic: work products match the task intent".to_string()
        } else {
            "heuristic: no work products matching the task intent".to_string()
        },
    }
}

fn normalize_task(task: &str) -> String {
    task.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

fn truncate(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// File paths, symbols in backticks, or line references.
fn has_evidence(text: &str) -> bool {
    text.contains('`')
        || text.split_whitespace().any(|token| {
            token.contains('/')
                || token
                    .rsplit_once(':')
                    .is_some_and(|(_, line)| line.trim_end_matches([',', '.', ')']).parse::<u32>().is_ok())
        })
}

fn evidence_density(text: &str) -> f64 {
    let words = text.split_whitespace().count();
    if words == 0 {
        return 0.0;
    }
    let markers = text
        .split_whitespace()
        .filter(|token| token.contains('/') || token.contains('`'))
        .count();
    markers as f64 * 100.0 / words as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MockModel;
    use std::sync::Arc;

    fn informational_run() -> RunSummary {
        RunSummary {
            task: "What is in src/foo.ts?".to_string(),
            response: "src/foo.ts exports `foo` at src/foo.ts:3".to_string(),
            files_read: vec![
                "src/foo.ts".to_string(),
                "src/bar.ts".to_string(),
                "src/baz.ts".to_string(),
            ],
            ..RunSummary::default()
        }
    }

    #[test]
    fn intent_classification() {
        assert_eq!(TaskIntent::classify("What is in src/foo.ts?"), TaskIntent::Discovery);
        assert_eq!(TaskIntent::classify("Explain the locking scheme"), TaskIntent::Analysis);
        assert_eq!(TaskIntent::classify("Fix the race in the loop"), TaskIntent::Mutation);
        assert_eq!(TaskIntent::classify("Verify the build passes"), TaskIntent::Verification);
    }

    #[tokio::test]
    async fn informational_fast_path_succeeds_without_validator() {
        let evaluator = CompletionEvaluator::new();
        let verdict = evaluator.evaluate(&informational_run()).await;
        assert!(verdict.success);
        assert!(verdict.summary.contains("evidence"));
    }

    #[tokio::test]
    async fn mutation_without_changes_fails_heuristically() {
        let evaluator = CompletionEvaluator::new();
        let run = RunSummary {
            task: "Fix the flaky test".to_string(),
            response: "I believe it is fixed".to_string(),
            ..RunSummary::default()
        };
        let verdict = evaluator.evaluate(&run).await;
        assert!(!verdict.success);
    }

    #[tokio::test]
    async fn no_result_phrases_fail() {
        let evaluator = CompletionEvaluator::new();
        let run = RunSummary {
            task: "Fix the parser".to_string(),
            response: "I was unable to reproduce the issue".to_string(),
            files_written: vec!["src/parser.rs".to_string()],
            ..RunSummary::default()
        };
        let verdict = evaluator.evaluate(&run).await;
        assert!(!verdict.success);
    }

    #[tokio::test]
    async fn validator_verdict_is_used() {
        let model: SharedModel = Arc::new(
            MockModel::new()
                .with_completion(r#"{"success": false, "summary": "tests not run"}"#),
        );
        let evaluator = CompletionEvaluator::new().with_validator(model);
        let run = RunSummary {
            task: "Fix the flaky test".to_string(),
            response: "patched src/test.rs".to_string(),
            files_written: vec!["src/test.rs".to_string()],
            ..RunSummary::default()
        };
        let verdict = evaluator.evaluate(&run).await;
        assert!(!verdict.success);
        assert_eq!(verdict.summary, "tests not run");
    }

    #[tokio::test]
    async fn validator_failure_falls_back_to_heuristics() {
        let model: SharedModel = Arc::new(MockModel::new().with_failure("offline"));
        let evaluator = CompletionEvaluator::new().with_validator(model);
        let run = RunSummary {
            task: "Fix the flaky test".to_string(),
            response: "patched the retry logic in src/test.rs".to_string(),
            files_written: vec!["src/test.rs".to_string()],
            ..RunSummary::default()
        };
        let verdict = evaluator.evaluate(&run).await;
        assert!(verdict.success);
    }

    #[tokio::test]
    async fn retry_aware_success_uses_historical_artifacts() {
        let evaluator = CompletionEvaluator::new();

        // First run changed files and succeeded.
        let first = RunSummary {
            task: "Fix the parser bug".to_string(),
            response: "rewrote src/parser.rs lexer loop".to_string(),
            files_written: vec!["src/parser.rs".to_string()],
            ..RunSummary::default()
        };
        assert!(evaluator.evaluate(&first).await.success);

        // Second run changed nothing but re-verified.
        let second = RunSummary {
            task: "fix the PARSER bug".to_string(),
            response: "everything already in place".to_string(),
            ran_verification: true,
            ..RunSummary::default()
        };
        let verdict = evaluator.evaluate(&second).await;
        assert!(verdict.success);
        assert!(verdict.summary.contains("earlier run"));
    }
}
