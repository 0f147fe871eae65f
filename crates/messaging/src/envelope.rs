//! The versioned wire envelope.

use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use serde::{Deserialize, Serialize};

use crate::error::{MessagingError, Result};
use crate::{EventKind, SagaEvent, Topic};

/// Schema version written by this build.
pub const SCHEMA_VERSION: u16 = 1;

/// An event together with the metadata every consumer relies on.
///
/// `event_id` is the idempotency key. It is assigned once, when the event is
/// enqueued in the producer's outbox, and survives every redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The kind name of the event (e.g., "OrderCreated").
    pub event_type: String,

    /// Envelope schema version.
    pub schema_version: u16,

    /// When the producing transaction created the event.
    pub occurred_at: DateTime<Utc>,

    /// The typed event body.
    pub payload: SagaEvent,
}

/// Envelope shape used to inspect version and type before decoding the body.
#[derive(Deserialize)]
struct RawEnvelope {
    event_id: EventId,
    event_type: String,
    schema_version: u16,
    occurred_at: DateTime<Utc>,
    payload: serde_json::Value,
}

impl EventEnvelope {
    /// Wraps an event with a fresh id and the current time.
    pub fn new(payload: SagaEvent) -> Self {
        Self::with_id(EventId::new(), payload)
    }

    /// Wraps an event with a known id.
    pub fn with_id(event_id: EventId, payload: SagaEvent) -> Self {
        Self {
            event_id,
            event_type: payload.kind().as_str().to_string(),
            schema_version: SCHEMA_VERSION,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// The event kind.
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// The correlation key of the saga.
    pub fn order_id(&self) -> OrderId {
        self.payload.order_id()
    }

    /// The topic the envelope belongs on.
    pub fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// Serializes the envelope for the broker.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes an envelope, rejecting unknown schema versions and bodies that
    /// disagree with the declared type.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_slice(bytes)?;
        if raw.schema_version != SCHEMA_VERSION {
            return Err(MessagingError::UnsupportedSchemaVersion {
                found: raw.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        let payload: SagaEvent = serde_json::from_value(raw.payload)?;
        let actual = payload.kind().as_str();
        if actual != raw.event_type {
            return Err(MessagingError::EventTypeMismatch {
                declared: raw.event_type,
                actual,
            });
        }

        Ok(Self {
            event_id: raw.event_id,
            event_type: raw.event_type,
            schema_version: raw.schema_version,
            occurred_at: raw.occurred_at,
            payload,
        })
    }
}
