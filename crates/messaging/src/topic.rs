//! Topic names and the channels consumers subscribe to.

use serde::{Deserialize, Serialize};

/// Every topic the fulfillment saga produces to or consumes from.
///
/// Topic names are fixed here rather than derived from event type strings;
/// see [`crate::EventKind::topic`] for the event-to-topic mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Topic {
    OrderCreated,
    OrderApprove,
    OrderCancel,
    OrderCancelled,
    PaymentEvents,
    StockReserved,
    StockReservationFailed,
    StockConfirmed,
    StockReservationCancelled,
    DeliveryEvents,
}

impl Topic {
    /// All topics, in declaration order.
    pub const ALL: [Topic; 10] = [
        Topic::OrderCreated,
        Topic::OrderApprove,
        Topic::OrderCancel,
        Topic::OrderCancelled,
        Topic::PaymentEvents,
        Topic::StockReserved,
        Topic::StockReservationFailed,
        Topic::StockConfirmed,
        Topic::StockReservationCancelled,
        Topic::DeliveryEvents,
    ];

    /// Returns the broker-level topic name.
    pub fn name(&self) -> &'static str {
        match self {
            Topic::OrderCreated => "order.created",
            Topic::OrderApprove => "order.orderApprove",
            Topic::OrderCancel => "order.orderCancel",
            Topic::OrderCancelled => "order.cancelled",
            Topic::PaymentEvents => "payment-events",
            Topic::StockReserved => "stock-reserved",
            Topic::StockReservationFailed => "stock-reservation-failed",
            Topic::StockConfirmed => "stock-confirmed",
            Topic::StockReservationCancelled => "stock-reservation-cancelled",
            Topic::DeliveryEvents => "delivery-events",
        }
    }

    /// Looks up a topic by its broker-level name.
    pub fn from_name(name: &str) -> Option<Topic> {
        Topic::ALL.into_iter().find(|t| t.name() == name)
    }

    /// Returns the dead-letter channel paired with this topic.
    pub fn dead_letter(self) -> Channel {
        Channel::dead_letter(self)
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A subscribable channel: either a live topic or its `.DLT` companion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Channel {
    pub topic: Topic,
    pub dead_letter: bool,
}

impl Channel {
    /// The live channel for a topic.
    pub fn live(topic: Topic) -> Self {
        Self {
            topic,
            dead_letter: false,
        }
    }

    /// The dead-letter channel for a topic.
    pub fn dead_letter(topic: Topic) -> Self {
        Self {
            topic,
            dead_letter: true,
        }
    }

    /// Every dead-letter channel.
    pub fn all_dead_letters() -> Vec<Channel> {
        Topic::ALL.into_iter().map(Channel::dead_letter).collect()
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.dead_letter {
            write!(f, "{}.DLT", self.topic.name())
        } else {
            f.write_str(self.topic.name())
        }
    }
}
