//! Error types

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Migration error
    #[error("Migration error: {0}")]
    Migration(String),

    /// Not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// A row that must exist is missing; the store is inconsistent
    #[error("Stale state: {0}")]
    StaleState(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),

    /// Table touched outside the lock set acquired for the transaction
    #[error("Table {0} is not part of the acquired lock set")]
    LockViolation(&'static str),

    /// Parameter error
    #[error("Params error: {0}")]
    Params(#[from] ledger_params::Error),
}

/// Result type
pub type Result<T> = std::result::Result<T, Error>;
