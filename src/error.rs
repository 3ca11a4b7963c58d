//! Error types for the reconciliation library
//!
//! The binary wraps these in `anyhow` at the edges; library code returns
//! `Result<T>` so callers can match on the recoverable cases
//! (a corrupted correction map, a malformed key).

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A key column could not be located after source-specific renaming
    #[error("missing required column '{column}' (available: {available:?})")]
    MissingColumn {
        column: String,
        available: Vec<String>,
    },

    /// A concatenated key that does not split into PROJECT|ACTION|UNIT|YEAR
    #[error("malformed canonical key '{0}'")]
    MalformedKey(String),

    /// The correction map backing store exists but cannot be decoded
    #[error("correction map at '{location}' is corrupted: {reason}")]
    CorruptedCorrectionMap { location: String, reason: String },

    /// A correction target that is not present in the cost-center reference
    #[error("key '{0}' does not exist in the cost-center reference")]
    UnknownReferenceKey(String),

    /// A source extraction that produced no rows
    #[error("source '{0}' returned no rows")]
    EmptySource(String),

    /// The source cache file is readable but its contents are inconsistent
    #[error("source cache is inconsistent: {0}")]
    InconsistentCache(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;
