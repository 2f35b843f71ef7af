//! Error types for sessdex-core

use thiserror::Error;

/// Main error type for the sessdex-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error for a session log
    #[error("parse error in {path}: {message}")]
    Parse { path: String, message: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid discovery pattern
    #[error("invalid source pattern: {0}")]
    Glob(#[from] glob::PatternError),

    /// Session not found
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The refresh pass was superseded or cancelled
    #[error("refresh pass cancelled")]
    Cancelled,

    /// A background worker panicked or was aborted
    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl Error {
    /// Whether this is transient store contention that is safe to retry.
    pub fn is_busy(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

/// Result type alias for sessdex-core
pub type Result<T> = std::result::Result<T, Error>;
