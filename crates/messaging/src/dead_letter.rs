//! Dead-letter records and the log that keeps them for operators.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::EventId;
use serde::Serialize;
use tokio::sync::RwLock;

use crate::broker::Message;

/// Header naming the consumer group that gave up on the message.
pub const HEADER_GROUP: &str = "x-dlt-group";
/// Header carrying the last failure reason.
pub const HEADER_REASON: &str = "x-dlt-reason";
/// Header carrying the number of delivery attempts made.
pub const HEADER_ATTEMPTS: &str = "x-dlt-attempts";

/// A message that a consumer could not process.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Dead-letter channel name, e.g. `stock-reserved.DLT`.
    pub channel: String,
    pub group: String,
    /// Present when the payload could at least be read as an envelope.
    pub event_id: Option<EventId>,
    pub event_type: Option<String>,
    pub attempts: u32,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    /// Builds a record from a message received on a dead-letter channel.
    pub fn from_message(message: &Message) -> Self {
        let header = |name: &str| message.headers.get(name).cloned();
        let body: Option<serde_json::Value> = serde_json::from_slice(&message.payload).ok();
        let field = |name: &str| {
            body.as_ref()
                .and_then(|v| v.get(name))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };

        Self {
            channel: message.channel.to_string(),
            group: header(HEADER_GROUP).unwrap_or_default(),
            event_id: field("event_id")
                .and_then(|s| s.parse().ok())
                .map(EventId::from_uuid),
            event_type: field("event_type"),
            attempts: header(HEADER_ATTEMPTS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            reason: header(HEADER_REASON).unwrap_or_else(|| "unknown".to_string()),
            recorded_at: Utc::now(),
        }
    }
}

/// Append-only record of dead letters. Nothing is ever removed.
#[derive(Clone, Default)]
pub struct DeadLetterLog {
    entries: Arc<RwLock<Vec<DeadLetter>>>,
}

impl DeadLetterLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dead letter and flags it for an operator.
    pub async fn record(&self, letter: DeadLetter) {
        tracing::error!(
            channel = %letter.channel,
            group = %letter.group,
            event_id = ?letter.event_id,
            event_type = ?letter.event_type,
            attempts = letter.attempts,
            reason = %letter.reason,
            "Message dead-lettered; manual action required"
        );
        metrics::counter!("dead_letters_total", "topic" => letter.channel.clone()).increment(1);
        self.entries.write().await.push(letter);
    }

    /// Every recorded dead letter, oldest first.
    pub async fn list(&self) -> Vec<DeadLetter> {
        self.entries.read().await.clone()
    }

    /// Number of recorded dead letters.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    /// Returns true if nothing has been dead-lettered.
    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}
