//! Error types for the ingestion pipeline.

use explorer_relational::RelationalError;
use explorer_search::SearchError;
use explorer_storage::StorageError;
use thiserror::Error;

/// Errors that can occur in the ingestion pipeline
#[derive(Error, Debug)]
pub enum IndexingError {
    /// Stream storage operation failed
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Relational store operation failed
    #[error("Relational error: {0}")]
    Relational(#[from] RelationalError),

    /// Search engine operation failed
    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    /// JSON encoding/decoding errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Blocking task was cancelled or panicked
    #[error("Task error: {0}")]
    Task(String),
}

impl From<serde_json::Error> for IndexingError {
    fn from(err: serde_json::Error) -> Self {
        IndexingError::Serialization(err.to_string())
    }
}

impl From<tokio::task::JoinError> for IndexingError {
    fn from(err: tokio::task::JoinError) -> Self {
        IndexingError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IndexingError::Serialization("invalid json".to_string());
        assert_eq!(err.to_string(), "Serialization error: invalid json");

        let err: IndexingError = StorageError::UnknownStream("x".into()).into();
        assert!(err.to_string().starts_with("Storage error:"));
    }

    #[test]
    fn test_from_serde_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let indexing_err: IndexingError = json_err.into();
        assert!(matches!(indexing_err, IndexingError::Serialization(_)));
    }
}
