//! Cancellation intents recorded before the entity they cancel exists.
//!
//! Messages on different topics are not ordered relative to each other, so a
//! participant can see `OrderCancelRequested` before the event that would
//! make it create anything. It records a [`CancelRequest`] instead, and its
//! creation path consults [`CancelRequests::take`] before creating.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use serde::Serialize;
use uuid::Uuid;

/// Lifecycle of a cancellation intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelRequestStatus {
    /// Recorded; nothing has been created yet.
    Requested,
    /// A creation attempt found it and was suppressed.
    Applied,
}

/// A cancellation intent for one order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CancelRequest {
    pub id: Uuid,
    pub order_id: OrderId,
    pub cancel_event_id: EventId,
    pub reason: String,
    pub status: CancelRequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Cancel requests of one service, unique per order.
#[derive(Debug, Clone, Default)]
pub struct CancelRequests {
    by_order: HashMap<OrderId, CancelRequest>,
}

impl CancelRequests {
    /// Records an intent. Returns false if the order already has one.
    pub fn record(
        &mut self,
        order_id: OrderId,
        cancel_event_id: EventId,
        reason: impl Into<String>,
    ) -> bool {
        if self.by_order.contains_key(&order_id) {
            return false;
        }
        let now = Utc::now();
        self.by_order.insert(
            order_id,
            CancelRequest {
                id: Uuid::new_v4(),
                order_id,
                cancel_event_id,
                reason: reason.into(),
                status: CancelRequestStatus::Requested,
                created_at: now,
                updated_at: now,
            },
        );
        true
    }

    /// If the order has a pending intent, marks it APPLIED and returns it.
    /// The caller must then create nothing for the order.
    pub fn take(&mut self, order_id: OrderId) -> Option<&CancelRequest> {
        let request = self.by_order.get_mut(&order_id)?;
        if request.status == CancelRequestStatus::Requested {
            request.status = CancelRequestStatus::Applied;
            request.updated_at = Utc::now();
        }
        Some(request)
    }

    /// Whether the order has an intent not yet applied.
    pub fn is_pending(&self, order_id: OrderId) -> bool {
        self.by_order
            .get(&order_id)
            .is_some_and(|r| r.status == CancelRequestStatus::Requested)
    }

    /// Whether any intent, pending or applied, exists for the order.
    pub fn contains(&self, order_id: OrderId) -> bool {
        self.by_order.contains_key(&order_id)
    }

    pub fn get(&self, order_id: OrderId) -> Option<&CancelRequest> {
        self.by_order.get(&order_id)
    }
}
