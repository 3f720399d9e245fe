//! Connection error types

use thiserror::Error;

/// Errors returned to callers of [`Connection`](super::Connection)
#[derive(Debug, Error)]
pub enum SessionError {
    /// The connection task has shut down
    #[error("Connection is closed")]
    Stopped,
}

/// Result type alias for connection operations
pub type SessionResult<T> = Result<T, SessionError>;
