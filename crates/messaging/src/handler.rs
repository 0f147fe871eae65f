//! The consumer contract.

use std::time::Duration;

use async_trait::async_trait;

use crate::{EventEnvelope, Topic};

/// What a handler decided about one message.
///
/// Handlers never signal redelivery by failing; they return one of these and
/// the dispatcher translates it into acknowledge, redeliver or dead-letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The effect was applied and committed.
    Ack,
    /// The event was already processed; nothing was applied.
    Duplicate,
    /// A transient failure; redeliver the message.
    Retry { reason: String },
    /// A dependency is unavailable; try again once `Duration` has passed.
    /// Does not count against the redelivery budget.
    Defer(Duration),
    /// The message can never succeed; send it to the dead-letter topic.
    Reject { reason: String },
}

impl Delivery {
    /// Creates a Retry outcome.
    pub fn retry(reason: impl Into<String>) -> Self {
        Delivery::Retry {
            reason: reason.into(),
        }
    }

    /// Creates a Reject outcome.
    pub fn reject(reason: impl Into<String>) -> Self {
        Delivery::Reject {
            reason: reason.into(),
        }
    }

    /// Whether the message is done with (acknowledged).
    pub fn is_settled(&self) -> bool {
        matches!(self, Delivery::Ack | Delivery::Duplicate)
    }

    /// Label used in metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Delivery::Ack => "ack",
            Delivery::Duplicate => "duplicate",
            Delivery::Retry { .. } => "retry",
            Delivery::Defer(_) => "defer",
            Delivery::Reject { .. } => "reject",
        }
    }
}

/// A consumer group bound to one or more topics.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Consumer group name. Each group receives its own copy of a message.
    fn name(&self) -> &str;

    /// Topics this handler consumes.
    fn topics(&self) -> Vec<Topic>;

    /// Processes one decoded message.
    async fn handle(&self, envelope: &EventEnvelope) -> Delivery;
}
