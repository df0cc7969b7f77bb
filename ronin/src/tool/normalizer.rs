//! Deterministic tool-input rewrites.
//!
//! Normalizers run before guards and never touch the registry. A failing
//! normalizer is swallowed by the executor; the next one sees the last good
//! input.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::error::Result;
use crate::message::InputMap;
use crate::model::Tier;

use super::{base_name, ToolExecCtx};

/// Rewrites tool inputs before validation and execution.
#[async_trait]
pub trait InputNormalizer: Send + Sync {
    /// Name of the normalizer, for diagnostics.
    fn name(&self) -> &str;

    /// Produce the rewritten input. Errors are swallowed by the executor.
    async fn normalize(&self, ctx: &ToolExecCtx, input: InputMap) -> Result<InputMap>;
}

const BACKUP_SUFFIXES: [&str; 4] = [".bak", ".backup", ".orig", ".tmp"];

/// Metadata namespace where flagged build-artifact paths are recorded.
pub(crate) const NORMALIZER_META_NS: &str = "normalizer";

/// Path resolution, glob wrapping, and adaptive read limits.
///
/// Stateful: the per-file read counter drives the reread boost, so one
/// instance belongs to exactly one run.
pub struct PathNormalizer {
    tier: Tier,
    working_dir: PathBuf,
    read_counts: Mutex<HashMap<PathBuf, u32>>,
}

impl PathNormalizer {
    /// Hard ceiling on the computed read limit.
    pub const MAX_READ_LIMIT: usize = 1000;

    /// Create a normalizer for one run.
    #[must_use]
    pub fn new(tier: Tier, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            tier,
            working_dir: working_dir.into(),
            read_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Baseline read limit for a tier, in lines.
    #[must_use]
    pub const fn baseline(tier: Tier) -> usize {
        match tier {
            Tier::Small => 180,
            Tier::Medium => 300,
            Tier::Large => 500,
        }
    }

    fn resolve(&self, raw: &str) -> PathBuf {
        let path = Path::new(raw);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.working_dir.join(path)
        }
    }

    /// Directory arguments pointing at files (or missing paths that look
    /// like files) are replaced with their parent.
    fn fix_directory(&self, input: &mut InputMap) {
        let Some(Value::String(raw)) = input.get("directory") else {
            return;
        };
        let resolved = self.resolve(raw);
        let looks_like_file = resolved.is_file()
            || (!resolved.exists() && resolved.extension().is_some());
        let fixed = if looks_like_file {
            resolved.parent().map_or(resolved.clone(), Path::to_path_buf)
        } else {
            resolved
        };
        input.insert(
            "directory".to_string(),
            Value::String(fixed.to_string_lossy().into_owned()),
        );
    }

    /// Bare substrings become recursive wildcard patterns.
    ///
    /// A pattern that survives [`glob::Pattern::escape`] unchanged carries
    /// no glob metacharacters and is treated as a literal to search for.
    fn fix_glob_pattern(input: &mut InputMap) {
        let Some(Value::String(pattern)) = input.get("pattern") else {
            return;
        };
        if glob::Pattern::escape(pattern) != *pattern {
            return;
        }
        let wrapped = format!("**/*{pattern}*");
        input.insert("pattern".to_string(), Value::String(wrapped));
    }

    /// Resolve backup and transpiled suffixes to the source file, and flag
    /// build-artifact paths in the run metadata for guards to consult.
    fn fix_read_path(&self, ctx: &ToolExecCtx, input: &mut InputMap) -> Option<PathBuf> {
        let raw = match input.get("path") {
            Some(Value::String(raw)) => raw.clone(),
            _ => return None,
        };
        let mut resolved = self.resolve(&raw);

        for suffix in BACKUP_SUFFIXES {
            if let Some(stem) = raw.strip_suffix(suffix) {
                let source = self.resolve(stem);
                if source.is_file() {
                    debug!(from = %raw, to = %source.display(), "resolved backup suffix to source");
                    resolved = source;
                }
                break;
            }
        }

        let as_text = resolved.to_string_lossy().into_owned();
        if let Some(stem) = as_text.strip_suffix(".js") {
            for ext in [".ts", ".tsx"] {
                let candidate = PathBuf::from(format!("{stem}{ext}"));
                if candidate.is_file() {
                    resolved = candidate;
                    break;
                }
            }
        }

        let text = resolved.to_string_lossy();
        let is_artifact = text.contains("/dist/")
            || text.contains("/build/")
            || text.ends_with(".map")
            || text.ends_with(".min.js")
            || BACKUP_SUFFIXES.iter().any(|s| text.ends_with(s));
        if is_artifact {
            ctx.run.meta_set(
                NORMALIZER_META_NS,
                &format!("artifact:{text}"),
                Value::Bool(true),
            );
        }

        input.insert(
            "path".to_string(),
            Value::String(resolved.to_string_lossy().into_owned()),
        );
        Some(resolved)
    }

    /// Compute the adaptive read limit for a file, in lines.
    fn read_limit(&self, path: &Path) -> usize {
        let attempts = {
            let mut counts = self.read_counts.lock().expect("read counts poisoned");
            let slot = counts.entry(path.to_path_buf()).or_insert(0);
            *slot += 1;
            *slot
        };

        let baseline = Self::baseline(self.tier);
        let file_lines = std::fs::read_to_string(path)
            .map(|text| text.lines().count())
            .ok();

        let mut limit = match file_lines {
            Some(lines) if lines <= 500 => lines.max(1),
            Some(lines) if lines >= 3000 => (baseline * 2).min(Self::MAX_READ_LIMIT),
            _ => baseline,
        };

        if attempts >= 5 {
            limit = (limit as f64 * 1.6) as usize;
        } else if attempts >= 3 {
            limit = (limit as f64 * 1.4) as usize;
        }
        limit.min(Self::MAX_READ_LIMIT)
    }
}

#[async_trait]
impl InputNormalizer for PathNormalizer {
    fn name(&self) -> &str {
        "path-normalizer"
    }

    async fn normalize(&self, ctx: &ToolExecCtx, mut input: InputMap) -> Result<InputMap> {
        match base_name(&ctx.tool_name) {
            "grep_search" => self.fix_directory(&mut input),
            "glob_search" => {
                self.fix_directory(&mut input);
                Self::fix_glob_pattern(&mut input);
            }
            "fs_read" => {
                if let Some(path) = self.fix_read_path(ctx, &mut input) {
                    if !input.contains_key("limit") {
                        let limit = self.read_limit(&path);
                        input.insert("limit".to_string(), Value::from(limit));
                    }
                }
            }
            "shell_exec" => {
                let empty = matches!(input.get("cwd"), None | Some(Value::String(_)))
                    && input
                        .get("cwd")
                        .and_then(Value::as_str)
                        .is_none_or(str::is_empty);
                if empty {
                    input.insert("cwd".to_string(), Value::String(".".to_string()));
                }
            }
            _ => {}
        }
        Ok(input)
    }
}

impl std::fmt::Debug for PathNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PathNormalizer")
            .field("tier", &self.tier)
            .field("working_dir", &self.working_dir)
            .finish_non_exhaustive()
    }
}
