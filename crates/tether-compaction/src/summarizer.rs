//! The external summarizer seam.
//!
//! Summarization is a black box: given a session it either returns a summary
//! text (and optionally the token count of the log it summarized) or fails.

use async_trait::async_trait;
use tether_log::{Entry, EntryKind};
use thiserror::Error;

/// What the summarizer hands back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Summary {
    pub text: String,
    /// Size of the summarized log in tokens, when the summarizer reports it.
    pub pre_tokens: Option<u64>,
}

/// Failures reported by a summarizer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SummarizerError {
    #[error("summarizer has no session {0}")]
    SessionNotFound(String),

    #[error("summarizer unavailable: {0}")]
    Unavailable(String),

    #[error("summarizer rejected the request: {0}")]
    Rejected(String),
}

/// An external summarization collaborator.
#[async_trait]
pub trait Summarizer: Send + Sync + 'static {
    /// Summarize the given session. `entries` is the full current physical log.
    async fn summarize(&self, session_id: &str, entries: &[Entry])
        -> Result<Summary, SummarizerError>;
}

/// Deterministic local summarizer.
///
/// Produces a digest of the log (entry counts per kind plus the most recent
/// user turn) and estimates tokens at four characters per token.
#[derive(Clone, Debug)]
pub struct DigestSummarizer {
    excerpt_chars: usize,
}

impl DigestSummarizer {
    pub fn new() -> Self {
        DigestSummarizer { excerpt_chars: 200 }
    }

    pub fn with_excerpt_chars(mut self, chars: usize) -> Self {
        self.excerpt_chars = chars;
        self
    }

    fn estimate_tokens(entries: &[Entry]) -> u64 {
        let chars: usize = entries.iter().map(|e| e.payload.to_string().len()).sum();
        (chars as u64).div_ceil(4)
    }
}

impl Default for DigestSummarizer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Summarizer for DigestSummarizer {
    async fn summarize(
        &self,
        session_id: &str,
        entries: &[Entry],
    ) -> Result<Summary, SummarizerError> {
        let count = |kind: EntryKind| entries.iter().filter(|e| e.kind == kind).count();

        let mut text = format!(
            "Summary of {} entries in session {} ({} user, {} assistant, {} system).",
            entries.len(),
            session_id,
            count(EntryKind::User),
            count(EntryKind::Assistant),
            count(EntryKind::System),
        );

        let last_user = entries
            .iter()
            .rev()
            .filter(|e| e.kind == EntryKind::User)
            .find_map(|e| e.text());
        if let Some(last) = last_user {
            let excerpt: String = last.chars().take(self.excerpt_chars).collect();
            text.push_str(&format!(" Last user turn: {}", excerpt));
        }

        Ok(Summary {
            text,
            pre_tokens: Some(Self::estimate_tokens(entries)),
        })
    }
}
