//! The cold tier of working memory: full tool outputs, recallable on demand.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::ArchiveConfig;
use crate::util::estimate_tokens;

/// One archived tool output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Archive-local identifier.
    pub id: u64,
    /// Name of the tool that produced the output.
    pub tool_name: String,
    /// File path the output concerns, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_path: Option<String>,
    /// The full output text.
    pub content: String,
    /// Character length of `content`.
    pub char_len: usize,
    /// Rough token estimate for `content`.
    pub estimated_tokens: usize,
    /// Number of key facts extracted from this output.
    pub key_facts: usize,
    /// When the entry was stored.
    pub created_at: DateTime<Utc>,
}

/// Append-only store of raw tool outputs with oldest-first eviction.
#[derive(Debug, Clone)]
pub struct ArchiveMemory {
    entries: VecDeque<ArchiveEntry>,
    next_id: u64,
    total_chars: usize,
    config: ArchiveConfig,
}

impl ArchiveMemory {
    /// Create an empty archive.
    #[must_use]
    pub fn new(config: ArchiveConfig) -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 1,
            total_chars: 0,
            config,
        }
    }

    /// Number of archived entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the archive is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total characters currently held.
    #[must_use]
    pub const fn total_chars(&self) -> usize {
        self.total_chars
    }

    /// Store a tool output, evicting oldest entries to stay within caps.
    ///
    /// Returns the new entry's id.
    pub fn store(
        &mut self,
        tool_name: impl Into<String>,
        file_path: Option<String>,
        content: impl Into<String>,
        key_facts: usize,
    ) -> u64 {
        let content = content.into();
        let char_len = content.chars().count();
        let id = self.next_id;
        self.next_id += 1;

        self.entries.push_back(ArchiveEntry {
            id,
            tool_name: tool_name.into(),
            file_path,
            estimated_tokens: estimate_tokens(char_len),
            char_len,
            content,
            key_facts,
            created_at: Utc::now(),
        });
        self.total_chars += char_len;

        while self.entries.len() > self.config.max_entries
            || self.total_chars > self.config.max_total_chars
        {
            match self.entries.pop_front() {
                Some(evicted) => self.total_chars -= evicted.char_len,
                None => break,
            }
        }
        id
    }

    /// Recall an entry by id.
    #[must_use]
    pub fn recall(&self, id: u64) -> Option<&ArchiveEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Recall the most recent entry for a file path.
    #[must_use]
    pub fn recall_by_path(&self, path: &str) -> Option<&ArchiveEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| e.file_path.as_deref() == Some(path))
    }

    /// Entries whose tool name or path contains the query, newest first.
    #[must_use]
    pub fn search(&self, query: &str) -> Vec<&ArchiveEntry> {
        self.entries
            .iter()
            .rev()
            .filter(|e| {
                e.tool_name.contains(query)
                    || e.file_path.as_deref().is_some_and(|p| p.contains(query))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn archive(max_entries: usize, max_total_chars: usize) -> ArchiveMemory {
        ArchiveMemory::new(ArchiveConfig {
            max_entries,
            max_total_chars,
        })
    }

    #[test]
    fn store_and_recall() {
        let mut a = archive(10, 10_000);
        let id = a.store("fs_read", Some("src/foo.ts".to_string()), "file body", 2);
        let entry = a.recall(id).unwrap();
        assert_eq!(entry.tool_name, "fs_read");
        assert_eq!(entry.content, "file body");
        assert_eq!(entry.key_facts, 2);
    }

    #[test]
    fn entry_cap_evicts_oldest_first() {
        let mut a = archive(2, 10_000);
        let first = a.store("fs_read", None, "one", 0);
        a.store("fs_read", None, "two", 0);
        a.store("fs_read", None, "three", 0);

        assert_eq!(a.len(), 2);
        assert!(a.recall(first).is_none());
    }

    #[test]
    fn char_cap_evicts_until_within_budget() {
        let mut a = archive(100, 10);
        a.store("t", None, "aaaaaa", 0);
        a.store("t", None, "bbbbbb", 0);
        assert_eq!(a.len(), 1);
        assert!(a.total_chars() <= 10);
    }

    #[test]
    fn recall_by_path_returns_newest() {
        let mut a = archive(10, 10_000);
        a.store("fs_read", Some("a.rs".to_string()), "old body", 0);
        a.store("fs_read", Some("a.rs".to_string()), "new body", 0);
        assert_eq!(a.recall_by_path("a.rs").unwrap().content, "new body");
        assert!(a.recall_by_path("missing.rs").is_none());
    }

    #[test]
    fn search_matches_tool_and_path() {
        let mut a = archive(10, 10_000);
        a.store("grep_search", None, "matches", 0);
        a.store("fs_read", Some("src/lib.rs".to_string()), "body", 0);
        assert_eq!(a.search("grep").len(), 1);
        assert_eq!(a.search("lib.rs").len(), 1);
        assert!(a.search("nothing").is_empty());
    }
}
