//! # tether-compaction
//!
//! Compaction engine for Tether session logs.
//!
//! This crate provides:
//! - Summarizer: the seam to an external summarization collaborator
//! - Engine: one compaction per request, with an explicit phase machine and
//!   a hard deadline on the summarizer call
//! - Auto policy: start a compaction when a session crosses a size threshold
//!
//! ## Architecture
//!
//! A compaction:
//! 1. Takes the session's writer lease, so appends queue behind it
//! 2. Counts the physical log before anything changes
//! 3. Asks the summarizer for a summary, bounded by a timeout
//! 4. Replaces the whole physical log with a boundary and the summary
//!
//! A failure at any step leaves the log exactly as it was.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use tether_compaction::{CompactionEngine, DigestSummarizer};
//! use tether_log::LogStore;
//!
//! let store = Arc::new(LogStore::in_memory());
//! let engine = CompactionEngine::new(store.clone(), Arc::new(DigestSummarizer::new()));
//!
//! let outcome = engine.compact("s1").await?;
//! assert_eq!(outcome.new_count, 2);
//! ```

mod engine;
mod error;
mod summarizer;

pub use engine::{
    CompactionConfig, CompactionConfigBuilder, CompactionEngine, CompactionOutcome,
    CompactionPhase, CompactionStats,
};
pub use error::{CompactionError, FailureReason, Result};
pub use summarizer::{DigestSummarizer, Summarizer, SummarizerError, Summary};
