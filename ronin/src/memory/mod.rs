//! Two-tier working memory.
//!
//! The [`FactSheet`] is the hot tier: small, categorized, rendered into the
//! system prompt every iteration. [`ArchiveMemory`] is the cold tier: full
//! tool outputs, reloadable through the `archive_recall` tool without
//! touching the filesystem again. The [`Summarizer`] moves knowledge from
//! transcript to sheet in the background.

mod archive;
mod fact_sheet;
mod summarizer;

pub use archive::{ArchiveEntry, ArchiveMemory};
pub use fact_sheet::{AddOutcome, FactCategory, FactEntry, FactSheet};
pub use summarizer::{ExtractedFact, FactSink, Summarizer};
