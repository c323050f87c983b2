//! Error types for the sync transport and connection manager.

use thiserror::Error;

/// Failures of the underlying link.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum NetworkError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Disconnected")]
    Disconnected,
}

/// Error type for sync operations.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
pub enum SyncError {
    #[error("Authentication failed: {0}")]
    AuthFailure(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Session not watched: {0}")]
    NotWatched(String),

    #[error("Client is shut down")]
    Shutdown,

    #[error(transparent)]
    Network(#[from] NetworkError),
}

impl SyncError {
    /// Stable machine-readable code, used on the wire.
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::AuthFailure(_) => "auth_failure",
            SyncError::MalformedMessage(_) => "malformed_message",
            SyncError::NotWatched(_) => "not_watched",
            SyncError::Shutdown => "shutdown",
            SyncError::Network(_) => "network_failure",
        }
    }

    /// Network failures always retry; an auth failure never does.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SyncError::Network(_))
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::MalformedMessage(err.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            SyncError::AuthFailure("bad token".into()).code(),
            "auth_failure"
        );
        assert!(!SyncError::AuthFailure("bad token".into()).is_retriable());

        let err: SyncError = NetworkError::Disconnected.into();
        assert_eq!(err.code(), "network_failure");
        assert!(err.is_retriable());
    }
}
