//! Error types for the log store.

use thiserror::Error;

/// Errors that can occur in log store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Session {session_id} is locked by {holder}")]
    SessionLocked { session_id: String, holder: String },

    #[error("Invalid session id: {0:?}")]
    InvalidSessionId(String),

    #[error("Malformed entry: {0}")]
    MalformedEntry(String),

    #[error("Entry {entry_id} is not in the physical log of session {session_id}")]
    CursorNotFound { session_id: String, entry_id: String },

    #[error("Logical chain of session {session_id} is broken at {at}")]
    BrokenChain { session_id: String, at: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Stable machine-readable code, used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::SessionNotFound(_) => "session_not_found",
            StoreError::SessionLocked { .. } => "session_locked",
            StoreError::InvalidSessionId(_) | StoreError::MalformedEntry(_) => "malformed_entry",
            StoreError::CursorNotFound { .. } => "cursor_not_found",
            StoreError::BrokenChain { .. }
            | StoreError::Io(_)
            | StoreError::Serialization(_) => "store_error",
        }
    }

    /// Whether the caller may retry the same request after backing off.
    pub fn is_retriable(&self) -> bool {
        matches!(self, StoreError::SessionLocked { .. })
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
