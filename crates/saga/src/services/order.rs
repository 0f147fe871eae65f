//! Order service: originates the saga and decides approval or cancellation.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{HubId, OrderId};
use messaging::{
    Delivery, EventEnvelope, MessageHandler, OrderCreatedData, OrderLine, SagaEvent, Topic,
};
use outbox::{Database, Transaction};
use serde::Serialize;

use crate::consumer::consume;
use crate::error::{Result, SagaError};

/// Consumer group and outbox owner name.
pub const ORDER_SERVICE: &str = "order-service";

const AGGREGATE: &str = "Order";

/// Order lifecycle as seen by the order service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Waiting for stock and payment.
    Pending,
    /// Stock and payment secured.
    Approved,
    /// A participant failed; compensation was requested.
    Cancelled,
}

/// An order owned by the order service.
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    pub id: OrderId,
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub amount_cents: i64,
    pub origin_hub: HubId,
    pub destination_hub: HubId,
    pub status: OrderStatus,
    pub stock_reserved: bool,
    pub payment_approved: bool,
    pub cancel_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Command to place an order.
#[derive(Debug, Clone)]
pub struct PlaceOrder {
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub amount_cents: i64,
    pub origin_hub: HubId,
    pub destination_hub: HubId,
}

impl PlaceOrder {
    fn validate(&self) -> Result<()> {
        if self.customer_id.trim().is_empty() {
            return Err(SagaError::InvalidOrder("customer id is required".into()));
        }
        if self.lines.is_empty() {
            return Err(SagaError::InvalidOrder("order has no lines".into()));
        }
        if self.lines.iter().any(|line| line.quantity == 0) {
            return Err(SagaError::InvalidOrder("quantity must be positive".into()));
        }
        let mut products = HashSet::new();
        if let Some(line) = self.lines.iter().find(|line| !products.insert(&line.product_id)) {
            return Err(SagaError::InvalidOrder(format!(
                "product {} appears on more than one line",
                line.product_id
            )));
        }
        if self.amount_cents < 0 {
            return Err(SagaError::InvalidOrder("amount must not be negative".into()));
        }
        Ok(())
    }
}

/// Order service state.
#[derive(Debug, Clone, Default)]
pub struct OrderState {
    orders: HashMap<OrderId, Order>,
}

/// Places orders and reacts to participant outcomes.
#[derive(Clone)]
pub struct OrderService {
    db: Database<OrderState>,
}

impl Default for OrderService {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderService {
    /// Creates the service with an empty datastore.
    pub fn new() -> Self {
        Self {
            db: Database::new(ORDER_SERVICE, OrderState::default()),
        }
    }

    /// The service's datastore (outbox included).
    pub fn database(&self) -> &Database<OrderState> {
        &self.db
    }

    /// Places an order and enqueues `OrderCreated` in the same transaction.
    #[tracing::instrument(skip(self, command), fields(customer_id = %command.customer_id))]
    pub async fn place_order(&self, command: PlaceOrder) -> Result<OrderId> {
        command.validate()?;

        let order_id = OrderId::new();
        let now = Utc::now();
        let mut tx = self.db.begin().await;
        tx.state_mut().orders.insert(
            order_id,
            Order {
                id: order_id,
                customer_id: command.customer_id.clone(),
                lines: command.lines.clone(),
                amount_cents: command.amount_cents,
                origin_hub: command.origin_hub,
                destination_hub: command.destination_hub,
                status: OrderStatus::Pending,
                stock_reserved: false,
                payment_approved: false,
                cancel_reason: None,
                created_at: now,
                updated_at: now,
            },
        );
        tx.enqueue(
            AGGREGATE,
            order_id.as_uuid(),
            SagaEvent::OrderCreated(OrderCreatedData {
                order_id,
                customer_id: command.customer_id,
                lines: command.lines,
                amount_cents: command.amount_cents,
                origin_hub: command.origin_hub,
                destination_hub: command.destination_hub,
                created_at: now,
            }),
        )?;
        tx.commit().await?;

        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(%order_id, "Order placed");
        Ok(order_id)
    }

    /// Loads an order.
    pub async fn get_order(&self, order_id: OrderId) -> Option<Order> {
        self.db.read(|s| s.orders.get(&order_id).cloned()).await
    }
}

fn order_mut(tx: &mut Transaction<OrderState>, order_id: OrderId) -> Result<&mut Order> {
    tx.state_mut()
        .orders
        .get_mut(&order_id)
        .ok_or(SagaError::OrderNotFound(order_id))
}

/// Records one half of the approval and approves once both halves are in.
fn progress(
    tx: &mut Transaction<OrderState>,
    order_id: OrderId,
    mark: impl FnOnce(&mut Order),
) -> Result<()> {
    let order = order_mut(tx, order_id)?;
    if order.status != OrderStatus::Pending {
        return Ok(());
    }
    mark(order);
    order.updated_at = Utc::now();
    if order.stock_reserved && order.payment_approved {
        order.status = OrderStatus::Approved;
        tx.enqueue(
            AGGREGATE,
            order_id.as_uuid(),
            SagaEvent::order_approved(order_id),
        )?;
        tracing::info!(%order_id, "Order approved");
    }
    Ok(())
}

/// Cancels the order and fans the cancellation out to participants.
fn cancel(tx: &mut Transaction<OrderState>, order_id: OrderId, reason: &str) -> Result<()> {
    let order = order_mut(tx, order_id)?;
    if order.status == OrderStatus::Cancelled {
        return Ok(());
    }
    order.status = OrderStatus::Cancelled;
    order.cancel_reason = Some(reason.to_string());
    order.updated_at = Utc::now();

    let aggregate_id = order_id.as_uuid();
    tx.enqueue(
        AGGREGATE,
        aggregate_id,
        SagaEvent::order_cancel_requested(order_id, reason),
    )?;
    tx.enqueue(
        AGGREGATE,
        aggregate_id,
        SagaEvent::order_cancelled(order_id, reason),
    )?;
    metrics::counter!("orders_cancelled_total").increment(1);
    tracing::warn!(%order_id, reason, "Order cancelled; compensation requested");
    Ok(())
}

#[async_trait]
impl MessageHandler for OrderService {
    fn name(&self) -> &str {
        ORDER_SERVICE
    }

    fn topics(&self) -> Vec<Topic> {
        vec![
            Topic::StockReserved,
            Topic::StockReservationFailed,
            Topic::PaymentEvents,
            Topic::DeliveryEvents,
        ]
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type, order_id = %envelope.order_id())
    )]
    async fn handle(&self, envelope: &EventEnvelope) -> Delivery {
        let order_id = envelope.order_id();
        match &envelope.payload {
            SagaEvent::StockReserved(_) => {
                consume(&self.db, envelope, |tx| {
                    progress(tx, order_id, |o| o.stock_reserved = true)
                })
                .await
            }
            SagaEvent::PaymentApproved(_) => {
                consume(&self.db, envelope, |tx| {
                    progress(tx, order_id, |o| o.payment_approved = true)
                })
                .await
            }
            SagaEvent::PaymentApprovalFailed(f)
            | SagaEvent::StockReservationFailed(f)
            | SagaEvent::DeliveryCreationFailed(f) => {
                let reason = format!("{}: {}", envelope.kind(), f.reason);
                consume(&self.db, envelope, |tx| cancel(tx, order_id, &reason)).await
            }
            // Other payment and delivery events need nothing from us.
            _ => Delivery::Ack,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::ProductId;
    use messaging::{FailureData, PaymentData, StockData};
    use uuid::Uuid;

    fn command() -> PlaceOrder {
        PlaceOrder {
            customer_id: "customer-1".into(),
            lines: vec![OrderLine {
                product_id: ProductId::new("SKU-001"),
                quantity: 2,
            }],
            amount_cents: 5000,
            origin_hub: HubId::new(),
            destination_hub: HubId::new(),
        }
    }

    fn stock_reserved(order_id: OrderId) -> EventEnvelope {
        EventEnvelope::new(SagaEvent::StockReserved(StockData {
            order_id,
            lines: vec![],
        }))
    }

    fn payment_approved(order_id: OrderId) -> EventEnvelope {
        EventEnvelope::new(SagaEvent::PaymentApproved(PaymentData {
            order_id,
            payment_id: Uuid::new_v4(),
            amount_cents: 5000,
        }))
    }

    fn event_types(rows: &[outbox::OutboxEvent]) -> Vec<&str> {
        rows.iter().map(|r| r.event_type.as_str()).collect()
    }

    #[tokio::test]
    async fn place_order_writes_order_and_outbox_row() {
        let service = OrderService::new();
        let order_id = service.place_order(command()).await.unwrap();

        let order = service.get_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Pending);
        let rows = service.database().outbox_rows().await;
        assert_eq!(event_types(&rows), vec!["OrderCreated"]);
        assert_eq!(rows[0].aggregate_id, order_id.as_uuid());
    }

    #[tokio::test]
    async fn rejects_invalid_orders() {
        let service = OrderService::new();
        let mut empty = command();
        empty.lines.clear();
        let mut zero = command();
        zero.lines[0].quantity = 0;
        let mut repeated = command();
        repeated.lines.push(repeated.lines[0].clone());

        assert!(matches!(
            service.place_order(empty).await,
            Err(SagaError::InvalidOrder(_))
        ));
        assert!(matches!(
            service.place_order(zero).await,
            Err(SagaError::InvalidOrder(_))
        ));
        assert!(matches!(
            service.place_order(repeated).await,
            Err(SagaError::InvalidOrder(reason)) if reason.contains("more than one line")
        ));
        assert!(service.database().outbox_rows().await.is_empty());
    }

    #[tokio::test]
    async fn approves_after_stock_and_payment_in_either_order() {
        let service = OrderService::new();
        let order_id = service.place_order(command()).await.unwrap();

        assert_eq!(service.handle(&payment_approved(order_id)).await, Delivery::Ack);
        assert_eq!(
            service.get_order(order_id).await.unwrap().status,
            OrderStatus::Pending
        );
        assert_eq!(service.handle(&stock_reserved(order_id)).await, Delivery::Ack);

        assert_eq!(
            service.get_order(order_id).await.unwrap().status,
            OrderStatus::Approved
        );
        let rows = service.database().outbox_rows().await;
        assert_eq!(event_types(&rows), vec!["OrderCreated", "OrderApproved"]);
    }

    #[tokio::test]
    async fn failure_cancels_once_and_emits_both_cancel_events() {
        let service = OrderService::new();
        let order_id = service.place_order(command()).await.unwrap();
        let failed = EventEnvelope::new(SagaEvent::StockReservationFailed(FailureData {
            order_id,
            reason: "insufficient stock".into(),
        }));

        assert_eq!(service.handle(&failed).await, Delivery::Ack);
        assert_eq!(service.handle(&failed).await, Delivery::Duplicate);
        let late = EventEnvelope::new(SagaEvent::payment_approval_failed(order_id, "declined"));
        assert_eq!(service.handle(&late).await, Delivery::Ack);

        let order = service.get_order(order_id).await.unwrap();
        assert_eq!(order.status, OrderStatus::Cancelled);
        assert!(order.cancel_reason.unwrap().contains("insufficient stock"));
        let rows = service.database().outbox_rows().await;
        assert_eq!(
            event_types(&rows),
            vec!["OrderCreated", "OrderCancelRequested", "OrderCancelled"]
        );
    }

    #[tokio::test]
    async fn unknown_order_is_rejected() {
        let service = OrderService::new();
        let delivery = service.handle(&stock_reserved(OrderId::new())).await;
        assert!(matches!(delivery, Delivery::Reject { .. }));
    }
}
