//! The hot tier of working memory: categorized, deduplicated facts rendered
//! into the system prompt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::FactSheetConfig;
use crate::util::{estimate_tokens, word_overlap};

/// Overlap ratio above which two facts in the same category are merged.
const MERGE_OVERLAP: f64 = 0.6;

/// Confidence at or below which a fact is annotated inline when rendered.
const LOW_CONFIDENCE: f64 = 0.7;

/// Category of a fact; the order here is both render and eviction priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactCategory {
    /// A correction of something previously believed. Never evicted.
    Correction,
    /// A blocking problem. Never evicted.
    Blocker,
    /// A decision that was made.
    Decision,
    /// A finding about the task or codebase.
    Finding,
    /// The content (or gist) of a specific file.
    FileContent,
    /// Architectural knowledge.
    Architecture,
    /// A notable tool result.
    ToolResult,
    /// Environment details.
    Environment,
}

impl FactCategory {
    /// All categories in priority order.
    pub const ALL: [Self; 8] = [
        Self::Correction,
        Self::Blocker,
        Self::Decision,
        Self::Finding,
        Self::FileContent,
        Self::Architecture,
        Self::ToolResult,
        Self::Environment,
    ];

    /// Whether entries in this category are protected from eviction.
    #[must_use]
    pub const fn is_protected(&self) -> bool {
        matches!(self, Self::Correction | Self::Blocker)
    }

    /// The render heading for this category.
    #[must_use]
    pub const fn heading(&self) -> &'static str {
        match self {
            Self::Correction => "Corrections",
            Self::Blocker => "Blockers",
            Self::Decision => "Decisions",
            Self::Finding => "Findings",
            Self::FileContent => "File contents",
            Self::Architecture => "Architecture",
            Self::ToolResult => "Tool results",
            Self::Environment => "Environment",
        }
    }
}

/// One fact on the sheet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactEntry {
    /// Sheet-local identifier.
    pub id: u64,
    /// Iteration the fact was last confirmed in.
    pub iteration: usize,
    /// Category of the fact.
    pub category: FactCategory,
    /// The fact text.
    pub fact: String,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Where the fact came from.
    pub source: String,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
    /// How many times the fact was independently confirmed.
    pub confirmations: u32,
    /// Identifier of an entry this fact replaced, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supersedes: Option<u64>,
}

/// Outcome of [`FactSheet::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new entry was inserted under the given id.
    Inserted(u64),
    /// The fact was merged into an existing entry.
    Merged(u64),
    /// The fact was below the confidence floor and discarded.
    Dropped,
}

/// Categorized working facts with merge, supersede, and bounded eviction.
///
/// Serializes losslessly: ids, confirmation counts, and the id counter all
/// survive a round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactSheet {
    entries: Vec<FactEntry>,
    next_id: u64,
    config: FactSheetConfig,
}

impl FactSheet {
    /// Create an empty sheet.
    #[must_use]
    pub fn new(config: FactSheetConfig) -> Self {
        Self {
            entries: Vec::new(),
            next_id: 1,
            config,
        }
    }

    /// Number of facts on the sheet.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the sheet is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries, in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[FactEntry] {
        &self.entries
    }

    /// Look up an entry by id.
    #[must_use]
    pub fn get(&self, id: u64) -> Option<&FactEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Add a fact, merging with a similar one when present.
    ///
    /// Facts below the configured minimum confidence are dropped. When
    /// `supersedes` is given, that entry is removed first. Merging keeps
    /// the longer text, the maximum confidence of the pair, and bumps the
    /// confirmation count.
    pub fn add(
        &mut self,
        category: FactCategory,
        fact: impl Into<String>,
        confidence: f64,
        source: impl Into<String>,
        iteration: usize,
        supersedes: Option<u64>,
    ) -> AddOutcome {
        if confidence < self.config.min_confidence {
            return AddOutcome::Dropped;
        }
        let fact = fact.into();

        if let Some(old_id) = supersedes {
            self.entries.retain(|e| e.id != old_id);
        }

        if let Some(index) = self.find_similar(category, &fact) {
            let entry = &mut self.entries[index];
            if fact.len() > entry.fact.len() {
                entry.fact = fact;
            }
            entry.confidence = entry.confidence.max(confidence);
            entry.confirmations += 1;
            entry.iteration = iteration;
            entry.updated_at = Utc::now();
            return AddOutcome::Merged(entry.id);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.entries.push(FactEntry {
            id,
            iteration,
            category,
            fact,
            confidence,
            source: source.into(),
            updated_at: Utc::now(),
            confirmations: 1,
            supersedes,
        });
        self.enforce_limits();
        AddOutcome::Inserted(id)
    }

    /// Rough token cost of the rendered sheet.
    #[must_use]
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(self.entries.iter().map(|e| e.fact.len() + 8).sum())
    }

    /// Render the sheet as compact markdown, grouped by category priority,
    /// newest iteration first within each group.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for category in FactCategory::ALL {
            let mut group: Vec<&FactEntry> = self
                .entries
                .iter()
                .filter(|e| e.category == category)
                .collect();
            if group.is_empty() {
                continue;
            }
            group.sort_by(|a, b| b.iteration.cmp(&a.iteration));

            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("## ");
            out.push_str(category.heading());
            out.push('\n');
            for entry in group {
                out.push_str("- ");
                out.push_str(&entry.fact);
                if entry.confidence <= LOW_CONFIDENCE {
                    out.push_str(&format!(" (confidence: {:.2})", entry.confidence));
                }
                out.push('\n');
            }
        }
        out
    }

    fn find_similar(&self, category: FactCategory, fact: &str) -> Option<usize> {
        if category == FactCategory::FileContent {
            let path = extract_path(fact)?;
            return self.entries.iter().position(|e| {
                e.category == category && extract_path(&e.fact).as_deref() == Some(&*path)
            });
        }
        self.entries.iter().position(|e| {
            e.category == category && word_overlap(&e.fact, fact) >= MERGE_OVERLAP
        })
    }

    /// Drop worst candidates above the entry cap, then above the token cap.
    /// Protected categories are never picked.
    fn enforce_limits(&mut self) {
        while self.entries.len() > self.config.max_entries {
            if !self.evict_worst() {
                break;
            }
        }
        while self.estimated_tokens() > self.config.max_tokens {
            if !self.evict_worst() {
                break;
            }
        }
    }

    fn evict_worst(&mut self) -> bool {
        let worst = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.category.is_protected())
            .min_by(|(_, a), (_, b)| {
                a.confidence
                    .partial_cmp(&b.confidence)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.confirmations.cmp(&b.confirmations))
                    .then(a.iteration.cmp(&b.iteration))
            })
            .map(|(index, _)| index);
        match worst {
            Some(index) => {
                let evicted = self.entries.remove(index);
                tracing::debug!(id = evicted.id, category = ?evicted.category, "evicted fact");
                true
            }
            None => false,
        }
    }
}

/// Pull the first path-looking token out of a fact text.
fn extract_path(fact: &str) -> Option<String> {
    fact.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '_' && c != '-'))
        .find(|token| {
            token.contains('/')
                || (token.contains('.')
                    && !token.starts_with('.')
                    && !token.ends_with('.')
                    && token.chars().next().is_some_and(char::is_alphanumeric))
        })
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sheet() -> FactSheet {
        FactSheet::new(FactSheetConfig::default())
    }

    #[test]
    fn low_confidence_facts_are_dropped() {
        let mut s = sheet();
        let outcome = s.add(FactCategory::Finding, "maybe", 0.3, "test", 1, None);
        assert_eq!(outcome, AddOutcome::Dropped);
        assert!(s.is_empty());
    }

    #[test]
    fn supersedes_removes_the_old_entry() {
        let mut s = sheet();
        let AddOutcome::Inserted(old) =
            s.add(FactCategory::Decision, "use sqlite for storage", 0.9, "t", 1, None)
        else {
            panic!("expected insert");
        };
        s.add(
            FactCategory::Decision,
            "switched to a log-structured store",
            0.9,
            "t",
            2,
            Some(old),
        );
        assert!(s.get(old).is_none());
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn merge_keeps_longer_text_and_max_confidence() {
        let mut s = sheet();
        s.add(
            FactCategory::Finding,
            "parser fails on empty input lines",
            0.9,
            "t",
            1,
            None,
        );
        let outcome = s.add(
            FactCategory::Finding,
            "parser fails on empty input lines in the lexer stage",
            0.6,
            "t",
            3,
            None,
        );
        assert!(matches!(outcome, AddOutcome::Merged(_)));
        assert_eq!(s.len(), 1);
        let entry = &s.entries()[0];
        assert!(entry.fact.contains("lexer stage"));
        assert!((entry.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(entry.confirmations, 2);
        assert_eq!(entry.iteration, 3);
    }

    #[test]
    fn file_content_dedupes_by_path() {
        let mut s = sheet();
        s.add(
            FactCategory::FileContent,
            "src/main.rs defines the CLI entry point",
            0.9,
            "t",
            1,
            None,
        );
        let outcome = s.add(
            FactCategory::FileContent,
            "src/main.rs wires subcommands into the runtime",
            0.8,
            "t",
            2,
            None,
        );
        assert!(matches!(outcome, AddOutcome::Merged(_)));
        assert_eq!(s.len(), 1);
    }

    #[test]
    fn eviction_never_removes_protected_categories() {
        let mut s = FactSheet::new(FactSheetConfig {
            max_entries: 2,
            min_confidence: 0.05,
            ..FactSheetConfig::default()
        });
        s.add(FactCategory::Correction, "the port is 8081 not 8080", 0.1, "t", 1, None);
        s.add(FactCategory::Blocker, "no write access to /etc", 0.1, "t", 1, None);
        s.add(FactCategory::Finding, "uses tokio for async io", 0.9, "t", 2, None);

        assert_eq!(s.len(), 2);
        let categories: Vec<FactCategory> = s.entries().iter().map(|e| e.category).collect();
        assert!(categories.contains(&FactCategory::Correction));
        assert!(categories.contains(&FactCategory::Blocker));
    }

    #[test]
    fn token_cap_evicts_worst_first() {
        let mut s = FactSheet::new(FactSheetConfig {
            max_tokens: 30,
            ..FactSheetConfig::default()
        });
        s.add(
            FactCategory::Finding,
            "a long but shaky observation about module layout and naming",
            0.55,
            "t",
            1,
            None,
        );
        s.add(
            FactCategory::Finding,
            "a solid observation concerning the central dispatch table",
            0.95,
            "t",
            2,
            None,
        );
        assert_eq!(s.len(), 1);
        assert!((s.entries()[0].confidence - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn render_orders_by_priority_then_recency() {
        let mut s = sheet();
        s.add(FactCategory::Environment, "linux host", 0.9, "t", 1, None);
        s.add(FactCategory::Finding, "older finding", 0.9, "t", 2, None);
        s.add(FactCategory::Finding, "newer different discovery entirely", 0.9, "t", 5, None);
        s.add(FactCategory::Correction, "actually the flag is --fast", 0.9, "t", 3, None);

        let rendered = s.render();
        let corrections = rendered.find("## Corrections").unwrap();
        let findings = rendered.find("## Findings").unwrap();
        let environment = rendered.find("## Environment").unwrap();
        assert!(corrections < findings && findings < environment);

        let newer = rendered.find("newer different discovery").unwrap();
        let older = rendered.find("older finding").unwrap();
        assert!(newer < older);
    }

    #[test]
    fn render_annotates_low_confidence() {
        let mut s = sheet();
        s.add(FactCategory::Finding, "possibly flaky test", 0.6, "t", 1, None);
        s.add(FactCategory::Decision, "ship it", 0.95, "t", 1, None);
        let rendered = s.render();
        assert!(rendered.contains("possibly flaky test (confidence: 0.60)"));
        assert!(!rendered.contains("ship it (confidence"));
    }

    #[test]
    fn serde_round_trip_preserves_everything() {
        let mut s = sheet();
        s.add(FactCategory::Finding, "first fact about the loop", 0.8, "a", 1, None);
        s.add(FactCategory::Blocker, "cannot reach registry", 0.9, "b", 2, None);
        s.add(FactCategory::Finding, "first fact about the loop", 0.85, "a", 3, None);

        let json = serde_json::to_string(&s).unwrap();
        let restored: FactSheet = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, s);
        assert_eq!(restored.next_id, s.next_id);
    }

    #[test]
    fn extract_path_finds_paths() {
        assert_eq!(
            extract_path("the file src/loop.rs drives everything").as_deref(),
            Some("src/loop.rs")
        );
        assert_eq!(extract_path("main.ts exports run()").as_deref(), Some("main.ts"));
        assert_eq!(extract_path("no paths here at all"), None);
    }
}
