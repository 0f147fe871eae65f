//! Per-order saga progress, derived from the event stream.
//!
//! Each participant's step only moves forward by rank, so a duplicate or an
//! event that arrives after a later one from another topic leaves the state
//! unchanged. The overall status is a pure function of the four steps.

use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::{EventEnvelope, SagaEvent};
use serde::Serialize;

/// Order service progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStep {
    Created,
    Approved,
    CancelRequested,
    Cancelled,
}

impl OrderStep {
    /// Returns the step as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStep::Created => "CREATED",
            OrderStep::Approved => "APPROVED",
            OrderStep::CancelRequested => "CANCEL_REQUESTED",
            OrderStep::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(OrderStep::Created),
            "APPROVED" => Some(OrderStep::Approved),
            "CANCEL_REQUESTED" => Some(OrderStep::CancelRequested),
            "CANCELLED" => Some(OrderStep::Cancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            OrderStep::Created => 0,
            OrderStep::Approved => 1,
            OrderStep::CancelRequested => 2,
            OrderStep::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for OrderStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payment service progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStep {
    Approved,
    ApprovalFailed,
    Canceled,
    CancelFailed,
}

impl PaymentStep {
    /// Returns the step as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStep::Approved => "APPROVED",
            PaymentStep::ApprovalFailed => "APPROVAL_FAILED",
            PaymentStep::Canceled => "CANCELED",
            PaymentStep::CancelFailed => "CANCEL_FAILED",
        }
    }

    /// Parses a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(PaymentStep::Approved),
            "APPROVAL_FAILED" => Some(PaymentStep::ApprovalFailed),
            "CANCELED" => Some(PaymentStep::Canceled),
            "CANCEL_FAILED" => Some(PaymentStep::CancelFailed),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            PaymentStep::Approved => 1,
            PaymentStep::ApprovalFailed | PaymentStep::Canceled => 2,
            PaymentStep::CancelFailed => 3,
        }
    }
}

impl std::fmt::Display for PaymentStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stock service progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockStep {
    Reserved,
    Confirmed,
    ReservationFailed,
    ReservationCancelled,
}

impl StockStep {
    /// Returns the step as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            StockStep::Reserved => "RESERVED",
            StockStep::Confirmed => "CONFIRMED",
            StockStep::ReservationFailed => "RESERVATION_FAILED",
            StockStep::ReservationCancelled => "RESERVATION_CANCELLED",
        }
    }

    /// Parses a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RESERVED" => Some(StockStep::Reserved),
            "CONFIRMED" => Some(StockStep::Confirmed),
            "RESERVATION_FAILED" => Some(StockStep::ReservationFailed),
            "RESERVATION_CANCELLED" => Some(StockStep::ReservationCancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            StockStep::Reserved => 1,
            StockStep::Confirmed => 2,
            StockStep::ReservationFailed | StockStep::ReservationCancelled => 3,
        }
    }
}

impl std::fmt::Display for StockStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery service progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStep {
    Created,
    Assigned,
    CreationFailed,
    Cancelled,
}

impl DeliveryStep {
    /// Returns the step as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStep::Created => "CREATED",
            DeliveryStep::Assigned => "ASSIGNED",
            DeliveryStep::CreationFailed => "CREATION_FAILED",
            DeliveryStep::Cancelled => "CANCELLED",
        }
    }

    /// Parses a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "CREATED" => Some(DeliveryStep::Created),
            "ASSIGNED" => Some(DeliveryStep::Assigned),
            "CREATION_FAILED" => Some(DeliveryStep::CreationFailed),
            "CANCELLED" => Some(DeliveryStep::Cancelled),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            DeliveryStep::Created => 1,
            DeliveryStep::Assigned => 2,
            DeliveryStep::CreationFailed | DeliveryStep::Cancelled => 3,
        }
    }
}

impl std::fmt::Display for DeliveryStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where the saga as a whole stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverallStatus {
    InProgress,
    Compensating,
    Recovering,
    Failed,
    Completed,
}

impl OverallStatus {
    /// Returns the status as stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            OverallStatus::InProgress => "IN_PROGRESS",
            OverallStatus::Compensating => "COMPENSATING",
            OverallStatus::Recovering => "RECOVERING",
            OverallStatus::Failed => "FAILED",
            OverallStatus::Completed => "COMPLETED",
        }
    }

    /// Parses a stored value.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "IN_PROGRESS" => Some(OverallStatus::InProgress),
            "COMPENSATING" => Some(OverallStatus::Compensating),
            "RECOVERING" => Some(OverallStatus::Recovering),
            "FAILED" => Some(OverallStatus::Failed),
            "COMPLETED" => Some(OverallStatus::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for OverallStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl OverallStatus {
    /// Statuses an operator has to look at once they stop changing.
    pub const NEEDS_ATTENTION: [OverallStatus; 3] = [
        OverallStatus::Compensating,
        OverallStatus::Recovering,
        OverallStatus::Failed,
    ];
}

/// Moves `slot` to `next` if `next` ranks above it.
fn advance<T: Copy>(slot: &mut Option<T>, next: T, rank: impl Fn(&T) -> u8) -> bool {
    if slot.as_ref().is_some_and(|current| rank(current) >= rank(&next)) {
        return false;
    }
    *slot = Some(next);
    true
}

/// Materialized progress of one order's saga.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaState {
    pub order_id: OrderId,
    pub order_status: Option<OrderStep>,
    pub payment_status: Option<PaymentStep>,
    pub stock_status: Option<StockStep>,
    pub delivery_status: Option<DeliveryStep>,
    pub overall_status: OverallStatus,
    /// Reason carried by the latest failure or cancellation.
    pub last_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaState {
    /// A saga with no steps yet, first seen at `at`.
    pub fn new(order_id: OrderId, at: DateTime<Utc>) -> Self {
        Self {
            order_id,
            order_status: None,
            payment_status: None,
            stock_status: None,
            delivery_status: None,
            overall_status: OverallStatus::InProgress,
            last_reason: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Folds one event into the state. Returns true if anything changed.
    pub fn apply(&mut self, envelope: &EventEnvelope) -> bool {
        let (changed, reason) = match &envelope.payload {
            SagaEvent::OrderCreated(_) => (self.order(OrderStep::Created), None),
            SagaEvent::OrderApproved(_) => (self.order(OrderStep::Approved), None),
            SagaEvent::OrderCancelRequested(d) => {
                (self.order(OrderStep::CancelRequested), Some(&d.reason))
            }
            SagaEvent::OrderCancelled(d) => (self.order(OrderStep::Cancelled), Some(&d.reason)),
            SagaEvent::PaymentApproved(_) => (self.payment(PaymentStep::Approved), None),
            SagaEvent::PaymentApprovalFailed(d) => {
                (self.payment(PaymentStep::ApprovalFailed), Some(&d.reason))
            }
            SagaEvent::PaymentCanceled(_) => (self.payment(PaymentStep::Canceled), None),
            SagaEvent::PaymentCancelFailed(d) => {
                (self.payment(PaymentStep::CancelFailed), Some(&d.reason))
            }
            SagaEvent::StockReserved(_) => (self.stock(StockStep::Reserved), None),
            SagaEvent::StockReservationFailed(d) => {
                (self.stock(StockStep::ReservationFailed), Some(&d.reason))
            }
            SagaEvent::StockConfirmed(_) => (self.stock(StockStep::Confirmed), None),
            SagaEvent::StockReservationCancelled(_) => {
                (self.stock(StockStep::ReservationCancelled), None)
            }
            SagaEvent::DeliveryCreated(_) => (self.delivery(DeliveryStep::Created), None),
            SagaEvent::DeliveryAssigned(_) => (self.delivery(DeliveryStep::Assigned), None),
            SagaEvent::DeliveryCreationFailed(d) => {
                (self.delivery(DeliveryStep::CreationFailed), Some(&d.reason))
            }
            SagaEvent::DeliveryCancelled(_) => (self.delivery(DeliveryStep::Cancelled), None),
        };
        if !changed {
            return false;
        }

        if let Some(reason) = reason {
            self.last_reason = Some(reason.clone());
        }
        self.overall_status = self.derive_overall();
        self.created_at = self.created_at.min(envelope.occurred_at);
        self.updated_at = self.updated_at.max(envelope.occurred_at);
        true
    }

    fn order(&mut self, step: OrderStep) -> bool {
        advance(&mut self.order_status, step, OrderStep::rank)
    }

    fn payment(&mut self, step: PaymentStep) -> bool {
        advance(&mut self.payment_status, step, PaymentStep::rank)
    }

    fn stock(&mut self, step: StockStep) -> bool {
        advance(&mut self.stock_status, step, StockStep::rank)
    }

    fn delivery(&mut self, step: DeliveryStep) -> bool {
        advance(&mut self.delivery_status, step, DeliveryStep::rank)
    }

    fn derive_overall(&self) -> OverallStatus {
        if self.payment_status == Some(PaymentStep::CancelFailed) {
            return OverallStatus::Recovering;
        }

        let failed = matches!(
            self.order_status,
            Some(OrderStep::CancelRequested | OrderStep::Cancelled)
        ) || self.payment_status == Some(PaymentStep::ApprovalFailed)
            || self.stock_status == Some(StockStep::ReservationFailed)
            || self.delivery_status == Some(DeliveryStep::CreationFailed);

        if failed {
            let holding = self.payment_status == Some(PaymentStep::Approved)
                || matches!(
                    self.stock_status,
                    Some(StockStep::Reserved | StockStep::Confirmed)
                )
                || matches!(
                    self.delivery_status,
                    Some(DeliveryStep::Created | DeliveryStep::Assigned)
                );
            return if holding {
                OverallStatus::Compensating
            } else {
                OverallStatus::Failed
            };
        }

        if self.delivery_status == Some(DeliveryStep::Assigned) {
            OverallStatus::Completed
        } else {
            OverallStatus::InProgress
        }
    }

    /// Whether the saga needs attention and has not changed for `threshold`.
    pub fn is_stuck(&self, threshold: chrono::Duration, now: DateTime<Utc>) -> bool {
        OverallStatus::NEEDS_ATTENTION.contains(&self.overall_status)
            && now - self.updated_at > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messaging::{OrderRef, PaymentData, StockData};
    use uuid::Uuid;

    fn envelope(event: SagaEvent) -> EventEnvelope {
        EventEnvelope::new(event)
    }

    fn payment_approved(order_id: OrderId) -> SagaEvent {
        SagaEvent::PaymentApproved(PaymentData {
            order_id,
            payment_id: Uuid::new_v4(),
            amount_cents: 100,
        })
    }

    fn stock_reserved(order_id: OrderId) -> SagaEvent {
        SagaEvent::StockReserved(StockData {
            order_id,
            lines: vec![],
        })
    }

    #[test]
    fn happy_path_completes() {
        let order_id = OrderId::new();
        let mut state = SagaState::new(order_id, Utc::now());

        for event in [
            payment_approved(order_id),
            stock_reserved(order_id),
            SagaEvent::order_approved(order_id),
            SagaEvent::stock_confirmed(order_id),
            SagaEvent::DeliveryAssigned(messaging::DeliveryAssignedData {
                order_id,
                delivery_id: Uuid::new_v4(),
                courier: "kim".into(),
            }),
        ] {
            assert!(state.apply(&envelope(event)));
        }

        assert_eq!(state.overall_status, OverallStatus::Completed);
        assert_eq!(state.stock_status, Some(StockStep::Confirmed));
    }

    #[test]
    fn late_lower_rank_event_is_ignored() {
        let order_id = OrderId::new();
        let mut state = SagaState::new(order_id, Utc::now());

        assert!(state.apply(&envelope(SagaEvent::stock_confirmed(order_id))));
        assert!(!state.apply(&envelope(stock_reserved(order_id))));
        assert_eq!(state.stock_status, Some(StockStep::Confirmed));
    }

    #[test]
    fn failure_with_live_payment_is_compensating_then_failed() {
        let order_id = OrderId::new();
        let mut state = SagaState::new(order_id, Utc::now());
        state.apply(&envelope(payment_approved(order_id)));
        state.apply(&envelope(SagaEvent::stock_reservation_failed(
            order_id,
            "insufficient stock",
        )));

        assert_eq!(state.overall_status, OverallStatus::Compensating);
        assert_eq!(state.last_reason.as_deref(), Some("insufficient stock"));

        state.apply(&envelope(SagaEvent::PaymentCanceled(PaymentData {
            order_id,
            payment_id: Uuid::new_v4(),
            amount_cents: 100,
        })));
        assert_eq!(state.overall_status, OverallStatus::Failed);
    }

    #[test]
    fn refused_void_is_recovering() {
        let order_id = OrderId::new();
        let mut state = SagaState::new(order_id, Utc::now());
        state.apply(&envelope(payment_approved(order_id)));
        state.apply(&envelope(SagaEvent::order_cancel_requested(order_id, "no route")));
        state.apply(&envelope(SagaEvent::payment_cancel_failed(order_id, "settled")));

        assert_eq!(state.overall_status, OverallStatus::Recovering);
    }

    #[test]
    fn duplicate_changes_nothing() {
        let order_id = OrderId::new();
        let mut state = SagaState::new(order_id, Utc::now());
        let approved = envelope(SagaEvent::OrderApproved(OrderRef { order_id }));

        assert!(state.apply(&approved));
        let snapshot = state.clone();
        assert!(!state.apply(&approved));
        assert_eq!(state, snapshot);
    }

    #[test]
    fn stuck_only_after_threshold() {
        let order_id = OrderId::new();
        let start = Utc::now();
        let mut state = SagaState::new(order_id, start);
        let mut failed = envelope(SagaEvent::payment_approval_failed(order_id, "declined"));
        failed.occurred_at = start;
        state.apply(&failed);
        assert_eq!(state.overall_status, OverallStatus::Failed);

        let threshold = chrono::Duration::minutes(10);
        assert!(!state.is_stuck(threshold, start + chrono::Duration::minutes(5)));
        assert!(state.is_stuck(threshold, start + chrono::Duration::minutes(11)));
    }

    #[test]
    fn step_names_round_trip() {
        for step in [
            StockStep::Reserved,
            StockStep::Confirmed,
            StockStep::ReservationFailed,
            StockStep::ReservationCancelled,
        ] {
            assert_eq!(StockStep::parse(step.as_str()), Some(step));
        }
        assert_eq!(OverallStatus::parse("RECOVERING"), Some(OverallStatus::Recovering));
        assert_eq!(OverallStatus::parse("nope"), None);
    }
}
