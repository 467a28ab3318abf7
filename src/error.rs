// ⚠️ Error types for the resolution engine
// Library code returns ResolutionError; binaries wrap it in anyhow.

use thiserror::Error;

/// Result alias used across the library
pub type Result<T> = std::result::Result<T, ResolutionError>;

#[derive(Error, Debug)]
pub enum ResolutionError {
    /// The audit sink rejected or could not persist an entry.
    /// Fatal: the engine never acts on a decision it cannot audit.
    #[error("Audit sink unavailable: {0}")]
    AuditUnavailable(String),

    /// Underlying SQLite failure
    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    /// A cluster commit kept failing after every retry
    #[error("Commit of cluster {cluster_id} failed after {attempts} attempts: {message}")]
    CommitFailed {
        cluster_id: String,
        attempts: u32,
        message: String,
    },

    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested record, cluster, review or conflict does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// MatchDecision state machine violation
    #[error("Invalid decision transition for {pair}: {from} -> {to}")]
    InvalidTransition {
        pair: String,
        from: String,
        to: String,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ResolutionError {
    /// Errors that abort a run outright instead of being retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ResolutionError::AuditUnavailable(_) | ResolutionError::Config(_)
        )
    }
}
