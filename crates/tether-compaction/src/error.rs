//! Error types for the compaction engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use tether_log::StoreError;
use thiserror::Error;

/// Why a compaction ended in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// The summarizer did not answer before the deadline.
    Timeout,
    /// The summarizer failed or rejected the session.
    CollaboratorError,
    /// The log store could not rewrite the prefix.
    StoreError,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Timeout => "timeout",
            FailureReason::CollaboratorError => "collaborator_error",
            FailureReason::StoreError => "store_error",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during compaction.
///
/// Every variant leaves the session exactly as it was before the request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompactionError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Compaction already in progress for session {0}")]
    InProgress(String),

    #[error("Session {0} is locked by another writer")]
    SessionLocked(String),

    #[error("Compaction failed ({reason}): {detail}")]
    Failed {
        reason: FailureReason,
        detail: String,
    },
}

impl CompactionError {
    pub fn failed(reason: FailureReason, detail: impl Into<String>) -> Self {
        CompactionError::Failed {
            reason,
            detail: detail.into(),
        }
    }

    /// Stable machine-readable code, used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            CompactionError::SessionNotFound(_) => "session_not_found",
            CompactionError::InProgress(_) => "compaction_in_progress",
            CompactionError::SessionLocked(_) => "session_locked",
            CompactionError::Failed { reason, .. } => reason.as_str(),
        }
    }

    pub fn is_retriable(&self) -> bool {
        match self {
            CompactionError::SessionNotFound(_) => false,
            CompactionError::InProgress(_) | CompactionError::SessionLocked(_) => true,
            CompactionError::Failed { reason, .. } => *reason != FailureReason::StoreError,
        }
    }
}

impl From<StoreError> for CompactionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::SessionNotFound(id) => CompactionError::SessionNotFound(id),
            StoreError::SessionLocked { session_id, .. } => {
                CompactionError::SessionLocked(session_id)
            }
            other => CompactionError::failed(FailureReason::StoreError, other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, CompactionError>;
