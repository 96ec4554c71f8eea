/// FlashDash error types

/// Main error type for workspace and project operations
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// A file could not be turned into a table by any parser
    #[error("Could not read {file}: {reason}")]
    Ingest { file: String, reason: String },
    /// Project archive could not be built or read back
    #[error("Archive error: {0}")]
    Archive(String),
    /// Object storage call failed
    #[error("Storage error in {operation}: {reason}")]
    Storage { operation: String, reason: String },
    /// Requested project or object does not exist
    #[error("Not found: {0}")]
    NotFound(String),
    /// Caller supplied something we cannot act on
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    /// CSV/XLSX/HTML export failed
    #[error("Export error: {0}")]
    Export(String),
    /// Background work did not finish
    #[error("Internal error: {0}")]
    Internal(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, FlashError>;

impl FlashError {
    pub fn storage(operation: &str, reason: impl ToString) -> Self {
        FlashError::Storage {
            operation: operation.to_string(),
            reason: reason.to_string(),
        }
    }
}
