//! Error types for timeclock-core operations.

use std::path::PathBuf;

/// All errors that can occur in timeclock-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TimeclockError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Configuration invalid: {0}")]
    ConfigInvalid(String),

    // ─────────────────────────────────────────────────────────────────────
    // State Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("State write failed: {path}: {source}")]
    StateWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Stored value for {key} is malformed: {source}")]
    StateValueMalformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Session Data Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session snapshot anomaly: {0}")]
    SnapshotAnomaly(#[from] SnapshotAnomaly),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A session snapshot that violates the break invariant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotAnomaly {
    #[error("{count} breaks are open at once")]
    MultipleOpenBreaks { count: usize },

    #[error("break {index} is open but is not the last break")]
    OpenBreakNotLast { index: usize },
}

/// Convenience type alias for Results using TimeclockError.
pub type Result<T> = std::result::Result<T, TimeclockError>;

impl From<TimeclockError> for String {
    fn from(err: TimeclockError) -> String {
        err.to_string()
    }
}
