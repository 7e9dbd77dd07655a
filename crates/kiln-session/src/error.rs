//! Error types for session operations.

use std::path::PathBuf;

/// Error type for session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No session is registered under the id.
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Reading or writing a session file failed.
    #[error("Session file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A session file could not be encoded or decoded.
    #[error("Session format error: {0}")]
    Format(#[from] serde_json::Error),
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, SessionError>;
