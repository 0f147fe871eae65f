use thiserror::Error;

/// Errors raised while encoding, decoding or transporting messages.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The envelope was written by a producer speaking a schema we do not know.
    #[error("Unsupported schema version {found} (supported: {supported})")]
    UnsupportedSchemaVersion { found: u16, supported: u16 },

    /// The declared event type disagrees with the decoded body.
    #[error("Event type mismatch: envelope declares {declared}, body is {actual}")]
    EventTypeMismatch {
        declared: String,
        actual: &'static str,
    },

    /// The broker refused or failed the publish call.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),
}

/// Result type for messaging operations.
pub type Result<T> = std::result::Result<T, MessagingError>;
