//! Error types for sync operations

/// Result type
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A row the merge relies on is missing; the store is inconsistent
    #[error("Stale state: {0}")]
    StaleState(String),

    /// The remote chain diverged from the locally recorded tip
    #[error("Rollback required: {0}")]
    RollbackRequired(String),

    /// Asset metadata could not be fetched
    #[error("Resolver error: {0}")]
    Resolver(String),

    /// Malformed remote data or a missing prerequisite row
    #[error("Validation error: {0}")]
    Validation(String),

    /// Network error
    #[error("Network error: {0}")]
    Network(String),

    /// Storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation cancelled
    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Whether repeating the same request may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(_) | Error::Resolver(_))
    }
}

impl From<ledger_storage_sqlite::Error> for Error {
    fn from(e: ledger_storage_sqlite::Error) -> Self {
        use ledger_storage_sqlite::Error as StorageError;
        match e {
            StorageError::StaleState(msg) => Error::StaleState(msg),
            StorageError::Validation(msg) => Error::Validation(msg),
            StorageError::NotFound(msg) => Error::Validation(msg),
            other => Error::Storage(format!("{}", other)),
        }
    }
}

impl From<ledger_params::Error> for Error {
    fn from(e: ledger_params::Error) -> Self {
        Error::Validation(format!("{}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_taxonomy_is_preserved() {
        let stale: Error = ledger_storage_sqlite::Error::StaleState("tx 4".into()).into();
        assert!(matches!(stale, Error::StaleState(_)));

        let invalid: Error = ledger_storage_sqlite::Error::Validation("bad".into()).into();
        assert!(matches!(invalid, Error::Validation(_)));

        let locked: Error = ledger_storage_sqlite::Error::LockViolation("tokens").into();
        assert!(matches!(locked, Error::Storage(_)));
    }

    #[test]
    fn test_only_remote_failures_are_retryable() {
        assert!(Error::Network("timeout".into()).is_retryable());
        assert!(!Error::StaleState("gone".into()).is_retryable());
        assert!(!Error::RollbackRequired("fork".into()).is_retryable());
    }
}
