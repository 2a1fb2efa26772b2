//! Error types for Tessera

use thiserror::Error;

/// Result type alias for Tessera operations
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Tessera error types
#[derive(Error, Debug)]
pub enum TesseraError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A segment, block or log failed a structural check
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Checksum mismatch
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Invalid data format
    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    /// Value or descriptor (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Malformed dimension or view descriptor
    #[error("Schema error: {0}")]
    Schema(String),

    /// Key does not match the dimensions it is used with
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Table not found
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// View not found
    #[error("View not found: {0}")]
    ViewNotFound(String),

    /// Table, view or row already exists
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Expected prior value did not match (optimistic concurrency)
    #[error("Out of date: {0}")]
    Conflict(String),

    /// Computed-column evaluation failed
    #[error("Evaluation error: {0}")]
    Evaluation(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, TesseraError::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            TesseraError::Corruption(_) | TesseraError::ChecksumMismatch { .. }
        )
    }

    pub(crate) fn corruption(msg: impl Into<String>) -> Self {
        TesseraError::Corruption(msg.into())
    }
}

impl From<bincode::Error> for TesseraError {
    fn from(e: bincode::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TesseraError {
    fn from(e: serde_json::Error) -> Self {
        TesseraError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let io = TesseraError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert!(io.is_retryable());
        assert!(!io.is_corruption());

        assert!(TesseraError::corruption("bad block").is_corruption());
        assert!(TesseraError::ChecksumMismatch { expected: 1, actual: 2 }.is_corruption());
        assert!(!TesseraError::Conflict("row".into()).is_retryable());
    }
}
