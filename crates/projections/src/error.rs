//! Projection error types.

use thiserror::Error;

/// Errors that can occur while maintaining the saga read model.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row holds a value this version does not understand.
    #[error("Corrupt saga state row: {0}")]
    Corrupt(String),
}

/// Result type for projection operations.
pub type Result<T> = std::result::Result<T, ProjectionError>;
