//! Relational layer error types.

use thiserror::Error;

/// Errors that can occur in the relational layer
#[derive(Debug, Error)]
pub enum RelationalError {
    /// Database error from sqlx
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A folder or link references a parent that does not exist
    #[error("Invalid parent reference: {0}")]
    InvalidParent(String),

    /// Moving a folder under itself or one of its descendants
    #[error("Folder {folder} cannot move under {parent}: cycle")]
    Cycle { folder: i64, parent: i64 },

    /// The event targets a row that was never materialized
    #[error("Not materialized: {0}")]
    NotMaterialized(String),

    /// Payload is missing required fields or has the wrong shape
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for RelationalError {
    fn from(err: serde_json::Error) -> Self {
        RelationalError::Serialization(err.to_string())
    }
}
