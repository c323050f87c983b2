//! High-level compaction orchestrator.
//!
//! The engine drives one compaction per request through
//! `Requested → Counting → Summarizing → Rewriting → Committed`, with
//! `Failed` reachable from every non-terminal phase. The session's writer
//! lease is held from `Counting` to the end of `Rewriting`, so no append can
//! slip in between the count and the rewrite.

use crate::error::{CompactionError, FailureReason, Result};
use crate::summarizer::{Summarizer, SummarizerError, Summary};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tether_log::{CompactionTrigger, EntryId, LogStore};
use tracing::{debug, info, warn};

/// Configuration for the compaction engine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Hard ceiling on the summarizer call (milliseconds).
    pub summarize_timeout_ms: u64,

    /// How long to wait for in-progress appends to release the writer lease
    /// (milliseconds).
    pub lease_wait_ms: u64,

    /// Entry count at which an automatic compaction is started.
    /// `None` disables automatic compaction.
    pub auto_compact_threshold: Option<usize>,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        CompactionConfig {
            summarize_timeout_ms: 60_000,
            lease_wait_ms: 5_000,
            auto_compact_threshold: None,
        }
    }
}

impl CompactionConfig {
    pub fn summarize_timeout(&self) -> Duration {
        Duration::from_millis(self.summarize_timeout_ms)
    }

    pub fn lease_wait(&self) -> Duration {
        Duration::from_millis(self.lease_wait_ms)
    }
}

/// Builder for compaction configuration.
pub struct CompactionConfigBuilder {
    config: CompactionConfig,
}

impl CompactionConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: CompactionConfig::default(),
        }
    }

    pub fn summarize_timeout(mut self, timeout: Duration) -> Self {
        self.config.summarize_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn lease_wait(mut self, wait: Duration) -> Self {
        self.config.lease_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn auto_compact_threshold(mut self, threshold: Option<usize>) -> Self {
        self.config.auto_compact_threshold = threshold;
        self
    }

    pub fn build(self) -> CompactionConfig {
        self.config
    }
}

impl Default for CompactionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Where a compaction request currently is.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompactionPhase {
    Requested,
    /// Entry count captured before mutation.
    Counting { pre: usize },
    Summarizing,
    Rewriting,
    Committed,
    Failed(FailureReason),
}

impl CompactionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CompactionPhase::Committed | CompactionPhase::Failed(_))
    }

    pub fn name(&self) -> &'static str {
        match self {
            CompactionPhase::Requested => "requested",
            CompactionPhase::Counting { .. } => "counting",
            CompactionPhase::Summarizing => "summarizing",
            CompactionPhase::Rewriting => "rewriting",
            CompactionPhase::Committed => "committed",
            CompactionPhase::Failed(_) => "failed",
        }
    }
}

/// Result of a committed compaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionOutcome {
    pub session_id: String,
    pub old_count: usize,
    /// Re-counted from the store after the rewrite.
    pub new_count: usize,
    pub messages_removed: usize,
    /// Token count reported by the summarizer, if any.
    pub pre_tokens: Option<u64>,
    pub boundary_id: EntryId,
    pub trigger: CompactionTrigger,
}

/// Statistics about compaction operations.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Requests that reached `Counting`.
    pub started: u64,
    pub committed: u64,
    pub failed: u64,
    /// Requests turned away because another compaction was in flight.
    pub rejected_in_progress: u64,
    /// Total entries removed from physical logs.
    pub entries_removed: u64,
}

/// Typed result of the deadline-bounded summarizer call.
enum SummarizeOutcome {
    Completed(Summary),
    TimedOut,
    Failed(SummarizerError),
}

/// Registration of an in-flight compaction. Removed on drop.
struct InFlight<'a> {
    table: &'a Mutex<HashMap<String, CompactionPhase>>,
    session_id: String,
}

impl InFlight<'_> {
    fn set(&self, phase: CompactionPhase) {
        debug!(session_id = %self.session_id, phase = phase.name(), "compaction phase");
        if let Some(current) = self.table.lock().get_mut(&self.session_id) {
            *current = phase;
        }
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.table.lock().remove(&self.session_id);
    }
}

/// Compaction engine over a log store and a summarizer.
pub struct CompactionEngine {
    store: Arc<LogStore>,
    summarizer: Arc<dyn Summarizer>,
    config: CompactionConfig,
    in_flight: Mutex<HashMap<String, CompactionPhase>>,
    stats: Mutex<CompactionStats>,
}

impl CompactionEngine {
    /// Create an engine with default configuration.
    pub fn new(store: Arc<LogStore>, summarizer: Arc<dyn Summarizer>) -> Self {
        Self::with_config(store, summarizer, CompactionConfig::default())
    }

    pub fn with_config(
        store: Arc<LogStore>,
        summarizer: Arc<dyn Summarizer>,
        config: CompactionConfig,
    ) -> Self {
        CompactionEngine {
            store,
            summarizer,
            config,
            in_flight: Mutex::new(HashMap::new()),
            stats: Mutex::new(CompactionStats::default()),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LogStore> {
        &self.store
    }

    pub fn stats(&self) -> CompactionStats {
        self.stats.lock().clone()
    }

    /// Phase of the compaction currently in flight for a session, if any.
    pub fn status(&self, session_id: &str) -> Option<CompactionPhase> {
        self.in_flight.lock().get(session_id).cloned()
    }

    pub fn is_compacting(&self, session_id: &str) -> bool {
        self.in_flight.lock().contains_key(session_id)
    }

    fn register(&self, session_id: &str) -> Result<InFlight<'_>> {
        let mut table = self.in_flight.lock();
        if table.contains_key(session_id) {
            self.stats.lock().rejected_in_progress += 1;
            return Err(CompactionError::InProgress(session_id.to_string()));
        }
        table.insert(session_id.to_string(), CompactionPhase::Requested);
        Ok(InFlight {
            table: &self.in_flight,
            session_id: session_id.to_string(),
        })
    }

    /// Compact a session on explicit request.
    pub async fn compact(&self, session_id: &str) -> Result<CompactionOutcome> {
        self.compact_with_trigger(session_id, CompactionTrigger::Manual)
            .await
    }

    /// Compact a session. A second request for the same session while one is
    /// in flight fails immediately with `InProgress`.
    pub async fn compact_with_trigger(
        &self,
        session_id: &str,
        trigger: CompactionTrigger,
    ) -> Result<CompactionOutcome> {
        if !self.store.exists(session_id) {
            return Err(CompactionError::SessionNotFound(session_id.to_string()));
        }
        let flight = self.register(session_id)?;
        info!(session_id = %session_id, trigger = ?trigger, "compaction requested");

        let result = self.run(&flight, session_id, trigger).await;

        let mut stats = self.stats.lock();
        match &result {
            Ok(outcome) => {
                stats.committed += 1;
                stats.entries_removed += outcome.messages_removed as u64;
            }
            Err(CompactionError::Failed { reason, detail }) => {
                stats.failed += 1;
                warn!(session_id = %session_id, reason = %reason, detail = %detail, "compaction failed");
            }
            Err(e) => {
                stats.failed += 1;
                warn!(session_id = %session_id, error = %e, "compaction failed");
            }
        }
        result
    }

    async fn run(
        &self,
        flight: &InFlight<'_>,
        session_id: &str,
        trigger: CompactionTrigger,
    ) -> Result<CompactionOutcome> {
        let lease = self
            .store
            .leases()
            .acquire(session_id, "compaction", self.config.lease_wait())
            .await
            .map_err(|e| {
                flight.set(CompactionPhase::Failed(FailureReason::StoreError));
                CompactionError::from(e)
            })?;

        let snapshot = self.store.snapshot(session_id).map_err(|e| {
            flight.set(CompactionPhase::Failed(FailureReason::StoreError));
            CompactionError::from(e)
        })?;
        let old_count = snapshot.len();
        flight.set(CompactionPhase::Counting { pre: old_count });
        self.stats.lock().started += 1;

        flight.set(CompactionPhase::Summarizing);
        let summary = match self.summarize(session_id, snapshot.entries()).await {
            SummarizeOutcome::Completed(summary) => summary,
            SummarizeOutcome::TimedOut => {
                flight.set(CompactionPhase::Failed(FailureReason::Timeout));
                return Err(CompactionError::failed(
                    FailureReason::Timeout,
                    format!(
                        "summarizer did not answer within {} ms",
                        self.config.summarize_timeout_ms
                    ),
                ));
            }
            SummarizeOutcome::Failed(SummarizerError::SessionNotFound(id)) => {
                flight.set(CompactionPhase::Failed(FailureReason::CollaboratorError));
                return Err(CompactionError::SessionNotFound(id));
            }
            SummarizeOutcome::Failed(e) => {
                flight.set(CompactionPhase::Failed(FailureReason::CollaboratorError));
                return Err(CompactionError::failed(
                    FailureReason::CollaboratorError,
                    e.to_string(),
                ));
            }
        };

        flight.set(CompactionPhase::Rewriting);
        let pre_size = summary.pre_tokens.unwrap_or(old_count as u64);
        let rewritten = self
            .store
            .compact_prefix(&lease, &summary.text, pre_size, trigger)
            .map_err(|e| {
                flight.set(CompactionPhase::Failed(FailureReason::StoreError));
                CompactionError::failed(FailureReason::StoreError, e.to_string())
            })?;

        // The summarizer reports no post-compaction size, so count again
        // before waiting appends can land
        let new_count = self.store.entry_count(session_id)?;
        drop(lease);
        flight.set(CompactionPhase::Committed);

        let outcome = CompactionOutcome {
            session_id: session_id.to_string(),
            old_count,
            new_count,
            messages_removed: old_count.saturating_sub(new_count),
            pre_tokens: summary.pre_tokens,
            boundary_id: rewritten.boundary.id,
            trigger,
        };
        info!(
            session_id = %session_id,
            old_count,
            new_count,
            messages_removed = outcome.messages_removed,
            pre_tokens = ?outcome.pre_tokens,
            "compaction committed"
        );
        Ok(outcome)
    }

    async fn summarize(
        &self,
        session_id: &str,
        entries: &[tether_log::Entry],
    ) -> SummarizeOutcome {
        let call = self.summarizer.summarize(session_id, entries);
        match tokio::time::timeout(self.config.summarize_timeout(), call).await {
            Ok(Ok(summary)) => SummarizeOutcome::Completed(summary),
            Ok(Err(e)) => SummarizeOutcome::Failed(e),
            Err(_) => SummarizeOutcome::TimedOut,
        }
    }

    /// Check whether a session has grown past the automatic threshold.
    pub fn should_auto_compact(&self, session_id: &str) -> bool {
        let Some(threshold) = self.config.auto_compact_threshold else {
            return false;
        };
        if self.is_compacting(session_id) {
            return false;
        }
        self.store
            .entry_count(session_id)
            .map(|count| count >= threshold)
            .unwrap_or(false)
    }

    /// Run an automatic compaction if the session is over the threshold.
    pub async fn maybe_auto_compact(&self, session_id: &str) -> Option<Result<CompactionOutcome>> {
        if !self.should_auto_compact(session_id) {
            return None;
        }
        Some(
            self.compact_with_trigger(session_id, CompactionTrigger::Auto)
                .await,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::summarizer::DigestSummarizer;

    #[test]
    fn test_config_builder() {
        let config = CompactionConfigBuilder::new()
            .summarize_timeout(Duration::from_secs(5))
            .lease_wait(Duration::from_millis(250))
            .auto_compact_threshold(Some(400))
            .build();

        assert_eq!(config.summarize_timeout(), Duration::from_secs(5));
        assert_eq!(config.lease_wait(), Duration::from_millis(250));
        assert_eq!(config.auto_compact_threshold, Some(400));
    }

    #[test]
    fn test_config_deserializes_with_defaults() {
        let config: CompactionConfig =
            serde_json::from_str(r#"{"auto_compact_threshold": 100}"#).unwrap();
        assert_eq!(config.summarize_timeout_ms, 60_000);
        assert_eq!(config.auto_compact_threshold, Some(100));
    }

    #[test]
    fn test_phase_names() {
        assert!(CompactionPhase::Committed.is_terminal());
        assert!(CompactionPhase::Failed(FailureReason::Timeout).is_terminal());
        assert!(!CompactionPhase::Counting { pre: 3 }.is_terminal());
        assert_eq!(CompactionPhase::Summarizing.name(), "summarizing");
    }

    #[tokio::test]
    async fn test_missing_session() {
        let engine = CompactionEngine::new(
            Arc::new(LogStore::in_memory()),
            Arc::new(DigestSummarizer::new()),
        );

        let result = engine.compact("nope").await;
        assert_eq!(result, Err(CompactionError::SessionNotFound("nope".into())));
        assert!(engine.status("nope").is_none());
    }
}
