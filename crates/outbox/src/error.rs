use thiserror::Error;
use uuid::Uuid;

use crate::OutboxStatus;

/// Errors raised by a service's datastore.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A unique key was violated on commit. For the ledger this means the
    /// event was already processed by a concurrent consumer.
    #[error("Unique constraint violated: {constraint}")]
    UniqueViolation { constraint: String },

    /// The state was changed by another transaction after this one began.
    #[error("Could not serialize access due to concurrent update")]
    SerializationFailure,

    /// No outbox row with this id.
    #[error("Outbox event not found: {0}")]
    NotFound(Uuid),

    /// The row is not in the state the operation requires.
    #[error("Outbox event {id} is {actual}, expected {expected}")]
    InvalidTransition {
        id: Uuid,
        expected: OutboxStatus,
        actual: OutboxStatus,
    },

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The envelope could not be encoded.
    #[error("Encoding error: {0}")]
    Encoding(#[from] messaging::MessagingError),
}

impl StoreError {
    /// Returns true if this is a unique-key violation on the idempotency ledger.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::UniqueViolation { constraint } if constraint == crate::LEDGER_CONSTRAINT)
    }

    /// Returns true if redelivering the triggering message may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::SerializationFailure | StoreError::Database(_)
        )
    }
}

/// Result type for datastore operations.
pub type Result<T> = std::result::Result<T, StoreError>;
