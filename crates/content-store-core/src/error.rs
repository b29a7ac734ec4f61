use thiserror::Error;

/// Errors that can occur in the content store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Mirror error: {0}")]
    Mirror(String),

    #[error("Sync source missing: {0}")]
    SyncSourceMissing(String),

    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Whether this error was raised before any I/O because the input was rejected.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::Validation(_))
    }
}
