//! Common error types for StudioSync.

use thiserror::Error;

use crate::types::Lock;

/// Top-level error type for StudioSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Fatal configuration problem (missing source dir, unreadable store).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Authentication is missing or was rejected twice; a re-login is needed.
    #[error("Authentication required: {0}")]
    Unauthenticated(String),

    /// Connection-level failure talking to the metadata service or bucket.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The metadata service answered with a non-success status.
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// A cooperative lock is held by someone else.
    #[error("Locked by {}", .0.holder())]
    LockDenied(Box<Lock>),

    /// Object-store operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Durable state store failure.
    #[error("State store error: {0}")]
    Store(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether this error came from the network rather than local state.
    ///
    /// Transport failures are environmental: the dispatcher turns them
    /// into task-level `error` events but does not forward them to the
    /// error reporter the way unexpected handler errors are.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::Transport(_) | Error::Api { status: 500..=599, .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::Transport("connection refused".into()).is_transport());
        assert!(Error::Api { status: 502, message: "bad gateway".into() }.is_transport());
        assert!(!Error::Api { status: 404, message: "missing".into() }.is_transport());
        assert!(!Error::Config("no source".into()).is_transport());
    }
}
