//! Saga events exchanged between participants.
//!
//! Every event kind is a variant of [`SagaEvent`] with its own typed body.
//! The mapping from kind to topic lives in [`EventKind::topic`] and is an
//! exhaustive match, so adding a variant without a topic fails to compile.

use chrono::{DateTime, Utc};
use common::{HubId, OrderId, ProductId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Topic;

/// Events that move an order through the fulfillment saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// A new order was placed.
    OrderCreated(OrderCreatedData),

    /// Stock and payment are both secured; downstream may proceed.
    OrderApproved(OrderRef),

    /// The order service asks every participant to undo its work.
    OrderCancelRequested(OrderCancelData),

    /// The order itself is now cancelled.
    OrderCancelled(OrderCancelData),

    /// Payment was authorized by the gateway.
    PaymentApproved(PaymentData),

    /// Payment authorization was declined.
    PaymentApprovalFailed(FailureData),

    /// A previously authorized payment was voided.
    PaymentCanceled(PaymentData),

    /// Voiding the payment failed and needs an operator.
    PaymentCancelFailed(FailureData),

    /// Stock was reserved for every order line.
    StockReserved(StockData),

    /// Stock could not be reserved.
    StockReservationFailed(FailureData),

    /// A reservation was converted into a deduction.
    StockConfirmed(OrderRef),

    /// A reservation was released.
    StockReservationCancelled(OrderRef),

    /// A delivery with a planned route was created.
    DeliveryCreated(DeliveryCreatedData),

    /// A courier was assigned to the delivery.
    DeliveryAssigned(DeliveryAssignedData),

    /// No delivery could be created for the order.
    DeliveryCreationFailed(FailureData),

    /// The delivery was cancelled.
    DeliveryCancelled(OrderRef),
}

/// Discriminant of [`SagaEvent`], used where the body is not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    OrderCreated,
    OrderApproved,
    OrderCancelRequested,
    OrderCancelled,
    PaymentApproved,
    PaymentApprovalFailed,
    PaymentCanceled,
    PaymentCancelFailed,
    StockReserved,
    StockReservationFailed,
    StockConfirmed,
    StockReservationCancelled,
    DeliveryCreated,
    DeliveryAssigned,
    DeliveryCreationFailed,
    DeliveryCancelled,
}

impl EventKind {
    /// Every event kind.
    pub const ALL: [EventKind; 16] = [
        EventKind::OrderCreated,
        EventKind::OrderApproved,
        EventKind::OrderCancelRequested,
        EventKind::OrderCancelled,
        EventKind::PaymentApproved,
        EventKind::PaymentApprovalFailed,
        EventKind::PaymentCanceled,
        EventKind::PaymentCancelFailed,
        EventKind::StockReserved,
        EventKind::StockReservationFailed,
        EventKind::StockConfirmed,
        EventKind::StockReservationCancelled,
        EventKind::DeliveryCreated,
        EventKind::DeliveryAssigned,
        EventKind::DeliveryCreationFailed,
        EventKind::DeliveryCancelled,
    ];

    /// The type name carried in the envelope's `event_type` field.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderCreated => "OrderCreated",
            EventKind::OrderApproved => "OrderApproved",
            EventKind::OrderCancelRequested => "OrderCancelRequested",
            EventKind::OrderCancelled => "OrderCancelled",
            EventKind::PaymentApproved => "PaymentApproved",
            EventKind::PaymentApprovalFailed => "PaymentApprovalFailed",
            EventKind::PaymentCanceled => "PaymentCanceled",
            EventKind::PaymentCancelFailed => "PaymentCancelFailed",
            EventKind::StockReserved => "StockReserved",
            EventKind::StockReservationFailed => "StockReservationFailed",
            EventKind::StockConfirmed => "StockConfirmed",
            EventKind::StockReservationCancelled => "StockReservationCancelled",
            EventKind::DeliveryCreated => "DeliveryCreated",
            EventKind::DeliveryAssigned => "DeliveryAssigned",
            EventKind::DeliveryCreationFailed => "DeliveryCreationFailed",
            EventKind::DeliveryCancelled => "DeliveryCancelled",
        }
    }

    /// The topic this kind of event is published to.
    pub fn topic(&self) -> Topic {
        match self {
            EventKind::OrderCreated => Topic::OrderCreated,
            EventKind::OrderApproved => Topic::OrderApprove,
            EventKind::OrderCancelRequested => Topic::OrderCancel,
            EventKind::OrderCancelled => Topic::OrderCancelled,
            EventKind::PaymentApproved
            | EventKind::PaymentApprovalFailed
            | EventKind::PaymentCanceled
            | EventKind::PaymentCancelFailed => Topic::PaymentEvents,
            EventKind::StockReserved => Topic::StockReserved,
            EventKind::StockReservationFailed => Topic::StockReservationFailed,
            EventKind::StockConfirmed => Topic::StockConfirmed,
            EventKind::StockReservationCancelled => Topic::StockReservationCancelled,
            EventKind::DeliveryCreated
            | EventKind::DeliveryAssigned
            | EventKind::DeliveryCreationFailed
            | EventKind::DeliveryCancelled => Topic::DeliveryEvents,
        }
    }

    /// Whether this event reports a failed forward step.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            EventKind::PaymentApprovalFailed
                | EventKind::StockReservationFailed
                | EventKind::DeliveryCreationFailed
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Data for OrderCreated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub order_id: OrderId,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    /// Order total in minor currency units.
    pub amount_cents: i64,
    /// Hub the parcel leaves from.
    pub origin_hub: HubId,
    /// Hub closest to the recipient.
    pub destination_hub: HubId,
    pub created_at: DateTime<Utc>,
}

/// Body for events that only need to name the order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: OrderId,
}

/// Data for cancellation events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelData {
    pub order_id: OrderId,
    pub reason: String,
}

/// Data for payment approval and cancellation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentData {
    pub order_id: OrderId,
    pub payment_id: Uuid,
    pub amount_cents: i64,
}

/// Data for stock reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockData {
    pub order_id: OrderId,
    pub lines: Vec<OrderLine>,
}

/// Data for a created delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryCreatedData {
    pub order_id: OrderId,
    pub delivery_id: Uuid,
    pub legs: usize,
    pub total_distance_km: f64,
    pub total_minutes: u32,
}

/// Data for a courier assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAssignedData {
    pub order_id: OrderId,
    pub delivery_id: Uuid,
    pub courier: String,
}

/// Data for any failed step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureData {
    pub order_id: OrderId,
    pub reason: String,
}

impl SagaEvent {
    /// Returns the kind of this event.
    pub fn kind(&self) -> EventKind {
        match self {
            SagaEvent::OrderCreated(_) => EventKind::OrderCreated,
            SagaEvent::OrderApproved(_) => EventKind::OrderApproved,
            SagaEvent::OrderCancelRequested(_) => EventKind::OrderCancelRequested,
            SagaEvent::OrderCancelled(_) => EventKind::OrderCancelled,
            SagaEvent::PaymentApproved(_) => EventKind::PaymentApproved,
            SagaEvent::PaymentApprovalFailed(_) => EventKind::PaymentApprovalFailed,
            SagaEvent::PaymentCanceled(_) => EventKind::PaymentCanceled,
            SagaEvent::PaymentCancelFailed(_) => EventKind::PaymentCancelFailed,
            SagaEvent::StockReserved(_) => EventKind::StockReserved,
            SagaEvent::StockReservationFailed(_) => EventKind::StockReservationFailed,
            SagaEvent::StockConfirmed(_) => EventKind::StockConfirmed,
            SagaEvent::StockReservationCancelled(_) => EventKind::StockReservationCancelled,
            SagaEvent::DeliveryCreated(_) => EventKind::DeliveryCreated,
            SagaEvent::DeliveryAssigned(_) => EventKind::DeliveryAssigned,
            SagaEvent::DeliveryCreationFailed(_) => EventKind::DeliveryCreationFailed,
            SagaEvent::DeliveryCancelled(_) => EventKind::DeliveryCancelled,
        }
    }

    /// The order this event belongs to.
    pub fn order_id(&self) -> OrderId {
        match self {
            SagaEvent::OrderCreated(d) => d.order_id,
            SagaEvent::OrderApproved(d)
            | SagaEvent::StockConfirmed(d)
            | SagaEvent::StockReservationCancelled(d)
            | SagaEvent::DeliveryCancelled(d) => d.order_id,
            SagaEvent::OrderCancelRequested(d) | SagaEvent::OrderCancelled(d) => d.order_id,
            SagaEvent::PaymentApproved(d) | SagaEvent::PaymentCanceled(d) => d.order_id,
            SagaEvent::PaymentApprovalFailed(d)
            | SagaEvent::PaymentCancelFailed(d)
            | SagaEvent::StockReservationFailed(d)
            | SagaEvent::DeliveryCreationFailed(d) => d.order_id,
            SagaEvent::StockReserved(d) => d.order_id,
            SagaEvent::DeliveryCreated(d) => d.order_id,
            SagaEvent::DeliveryAssigned(d) => d.order_id,
        }
    }

    /// The topic this event is published to.
    pub fn topic(&self) -> Topic {
        self.kind().topic()
    }
}

// Convenience constructors
impl SagaEvent {
    /// Creates an OrderApproved event.
    pub fn order_approved(order_id: OrderId) -> Self {
        SagaEvent::OrderApproved(OrderRef { order_id })
    }

    /// Creates an OrderCancelRequested event.
    pub fn order_cancel_requested(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::OrderCancelRequested(OrderCancelData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates an OrderCancelled event.
    pub fn order_cancelled(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::OrderCancelled(OrderCancelData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates a PaymentApprovalFailed event.
    pub fn payment_approval_failed(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::PaymentApprovalFailed(FailureData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates a PaymentCancelFailed event.
    pub fn payment_cancel_failed(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::PaymentCancelFailed(FailureData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates a StockReservationFailed event.
    pub fn stock_reservation_failed(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::StockReservationFailed(FailureData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates a StockConfirmed event.
    pub fn stock_confirmed(order_id: OrderId) -> Self {
        SagaEvent::StockConfirmed(OrderRef { order_id })
    }

    /// Creates a StockReservationCancelled event.
    pub fn stock_reservation_cancelled(order_id: OrderId) -> Self {
        SagaEvent::StockReservationCancelled(OrderRef { order_id })
    }

    /// Creates a DeliveryCreationFailed event.
    pub fn delivery_creation_failed(order_id: OrderId, reason: impl Into<String>) -> Self {
        SagaEvent::DeliveryCreationFailed(FailureData {
            order_id,
            reason: reason.into(),
        })
    }

    /// Creates a DeliveryCancelled event.
    pub fn delivery_cancelled(order_id: OrderId) -> Self {
        SagaEvent::DeliveryCancelled(OrderRef { order_id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_kind_has_a_distinct_name() {
        let names: HashSet<_> = EventKind::ALL.iter().map(EventKind::as_str).collect();
        assert_eq!(names.len(), EventKind::ALL.len());
    }

    #[test]
    fn payment_kinds_share_payment_topic() {
        for kind in [
            EventKind::PaymentApproved,
            EventKind::PaymentApprovalFailed,
            EventKind::PaymentCanceled,
            EventKind::PaymentCancelFailed,
        ] {
            assert_eq!(kind.topic(), Topic::PaymentEvents);
        }
    }

    #[test]
    fn order_topics_are_distinct() {
        assert_eq!(EventKind::OrderCreated.topic().name(), "order.created");
        assert_eq!(EventKind::OrderApproved.topic().name(), "order.orderApprove");
        assert_eq!(EventKind::OrderCancelRequested.topic().name(), "order.orderCancel");
        assert_eq!(EventKind::OrderCancelled.topic().name(), "order.cancelled");
    }

    #[test]
    fn serializes_with_type_tag() {
        let order_id = OrderId::new();
        let event = SagaEvent::stock_confirmed(order_id);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "StockConfirmed");
        assert_eq!(json["data"]["order_id"], order_id.to_string());

        let back: SagaEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
        assert_eq!(back.order_id(), order_id);
    }

    #[test]
    fn failure_kinds() {
        assert!(EventKind::StockReservationFailed.is_failure());
        assert!(EventKind::DeliveryCreationFailed.is_failure());
        assert!(!EventKind::PaymentCancelFailed.is_failure());
        assert!(!EventKind::StockReserved.is_failure());
    }
}
