//! Stock service: reserves, confirms and releases inventory per order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use common::{OrderId, ProductId};
use messaging::{
    Delivery, EventEnvelope, MessageHandler, OrderCancelData, OrderCreatedData, OrderLine,
    SagaEvent, StockData, Topic,
};
use outbox::{Database, Transaction};
use serde::Serialize;

use crate::cancel::CancelRequests;
use crate::consumer::consume;
use crate::error::{Result, SagaError};

/// Consumer group and outbox owner name.
pub const STOCK_SERVICE: &str = "stock-service";

const AGGREGATE: &str = "Stock";

/// Stock held for one product.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StockLevel {
    /// Units that can still be reserved.
    pub available: u32,
    /// Units held by open reservations.
    pub reserved: u32,
}

/// Lifecycle of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Units moved from available to reserved.
    Reserved,
    /// Units deducted for good.
    Confirmed,
    /// Units returned to available.
    Cancelled,
    /// Not enough stock; nothing was held.
    Rejected,
}

/// Stock set aside for one order.
#[derive(Debug, Clone, Serialize)]
pub struct Reservation {
    pub order_id: OrderId,
    pub lines: Vec<OrderLine>,
    pub status: ReservationStatus,
}

/// Stock service state.
#[derive(Debug, Clone, Default)]
pub struct StockState {
    inventory: HashMap<ProductId, StockLevel>,
    reservations: HashMap<OrderId, Reservation>,
    cancel_requests: CancelRequests,
}

/// Owns inventory and reservations.
#[derive(Clone)]
pub struct StockService {
    db: Database<StockState>,
}

impl Default for StockService {
    fn default() -> Self {
        Self::new()
    }
}

impl StockService {
    /// Creates the service with no inventory.
    pub fn new() -> Self {
        Self {
            db: Database::new(STOCK_SERVICE, StockState::default()),
        }
    }

    /// The service's datastore (outbox included).
    pub fn database(&self) -> &Database<StockState> {
        &self.db
    }

    /// Adds available units of a product.
    ///
    /// Fails if the product's total (available plus reserved) would no
    /// longer fit in a `u32`.
    pub async fn restock(&self, product_id: ProductId, quantity: u32) -> Result<()> {
        let mut tx = self.db.begin().await;
        let level = tx.state_mut().inventory.entry(product_id.clone()).or_default();
        level
            .available
            .checked_add(level.reserved)
            .and_then(|total| total.checked_add(quantity))
            .ok_or_else(|| {
                SagaError::InvalidQuantity(format!(
                    "restocking {quantity} units of {product_id} exceeds the stock limit"
                ))
            })?;
        level.available += quantity;
        tx.commit().await?;
        Ok(())
    }

    /// Current stock of a product.
    pub async fn stock_level(&self, product_id: &ProductId) -> StockLevel {
        self.db
            .read(|s| s.inventory.get(product_id).copied().unwrap_or_default())
            .await
    }

    /// The reservation for an order, if any.
    pub async fn reservation(&self, order_id: OrderId) -> Option<Reservation> {
        self.db
            .read(|s| s.reservations.get(&order_id).cloned())
            .await
    }

    /// Whether a cancellation was recorded for an order before any reservation.
    pub async fn has_cancel_request(&self, order_id: OrderId) -> bool {
        self.db
            .read(|s| s.cancel_requests.contains(order_id))
            .await
    }
}

fn reserve(tx: &mut Transaction<StockState>, data: &OrderCreatedData) -> Result<()> {
    let order_id = data.order_id;
    let state = tx.state_mut();

    if let Some(request) = state.cancel_requests.take(order_id) {
        tracing::info!(
            %order_id,
            cancel_event_id = %request.cancel_event_id,
            "Cancellation already on record; not reserving"
        );
        return Ok(());
    }
    if state.reservations.contains_key(&order_id) {
        return Ok(());
    }

    // Lines naming the same product draw on the same units.
    let mut demand: BTreeMap<&ProductId, Option<u32>> = BTreeMap::new();
    for line in &data.lines {
        let total = demand.entry(&line.product_id).or_insert(Some(0));
        *total = total.and_then(|t| t.checked_add(line.quantity));
    }
    let shortage = demand.iter().find(|(product_id, wanted)| {
        let available = state
            .inventory
            .get(**product_id)
            .map_or(0, |level| level.available);
        wanted.is_none_or(|wanted| available < wanted)
    });
    if let Some((product_id, _)) = shortage {
        let reason = format!("insufficient stock for {product_id}");
        state.reservations.insert(
            order_id,
            Reservation {
                order_id,
                lines: data.lines.clone(),
                status: ReservationStatus::Rejected,
            },
        );
        tx.enqueue(
            AGGREGATE,
            order_id.as_uuid(),
            SagaEvent::stock_reservation_failed(order_id, &reason),
        )?;
        tracing::warn!(%order_id, %reason, "Stock reservation failed");
        return Ok(());
    }

    for (product_id, wanted) in demand {
        let wanted = wanted.unwrap_or_default();
        let level = state.inventory.entry(product_id.clone()).or_default();
        level.available = level.available.checked_sub(wanted).ok_or_else(|| {
            SagaError::InvalidQuantity(format!("stock of {product_id} went negative"))
        })?;
        level.reserved = level.reserved.checked_add(wanted).ok_or_else(|| {
            SagaError::InvalidQuantity(format!("reserved stock of {product_id} overflowed"))
        })?;
    }
    state.reservations.insert(
        order_id,
        Reservation {
            order_id,
            lines: data.lines.clone(),
            status: ReservationStatus::Reserved,
        },
    );
    tx.enqueue(
        AGGREGATE,
        order_id.as_uuid(),
        SagaEvent::StockReserved(StockData {
            order_id,
            lines: data.lines.clone(),
        }),
    )?;
    tracing::info!(%order_id, "Stock reserved");
    Ok(())
}

fn confirm(tx: &mut Transaction<StockState>, order_id: OrderId) -> Result<()> {
    let state = tx.state_mut();
    let reservation = state
        .reservations
        .get_mut(&order_id)
        .ok_or_else(|| SagaError::NotReady(format!("no reservation for order {order_id}")))?;
    if reservation.status != ReservationStatus::Reserved {
        return Ok(());
    }

    reservation.status = ReservationStatus::Confirmed;
    for line in &reservation.lines {
        if let Some(level) = state.inventory.get_mut(&line.product_id) {
            level.reserved = level.reserved.saturating_sub(line.quantity);
        }
    }
    tx.enqueue(
        AGGREGATE,
        order_id.as_uuid(),
        SagaEvent::stock_confirmed(order_id),
    )?;
    Ok(())
}

fn release(
    tx: &mut Transaction<StockState>,
    envelope: &EventEnvelope,
    data: &OrderCancelData,
) -> Result<()> {
    let order_id = data.order_id;
    let state = tx.state_mut();

    let Some(reservation) = state.reservations.get_mut(&order_id) else {
        state
            .cancel_requests
            .record(order_id, envelope.event_id, data.reason.clone());
        tracing::info!(%order_id, "Cancel arrived before reservation; recorded intent");
        return Ok(());
    };

    let previous = reservation.status;
    if !matches!(
        previous,
        ReservationStatus::Reserved | ReservationStatus::Confirmed
    ) {
        return Ok(());
    }
    reservation.status = ReservationStatus::Cancelled;
    for line in &reservation.lines {
        let level = state.inventory.entry(line.product_id.clone()).or_default();
        level.available = level.available.saturating_add(line.quantity);
        if previous == ReservationStatus::Reserved {
            level.reserved = level.reserved.saturating_sub(line.quantity);
        }
    }
    tx.enqueue(
        AGGREGATE,
        order_id.as_uuid(),
        SagaEvent::stock_reservation_cancelled(order_id),
    )?;
    tracing::info!(%order_id, "Stock released");
    Ok(())
}

#[async_trait]
impl MessageHandler for StockService {
    fn name(&self) -> &str {
        STOCK_SERVICE
    }

    fn topics(&self) -> Vec<Topic> {
        vec![Topic::OrderCreated, Topic::OrderApprove, Topic::OrderCancel]
    }

    #[tracing::instrument(
        skip(self, envelope),
        fields(event_id = %envelope.event_id, event_type = %envelope.event_type, order_id = %envelope.order_id())
    )]
    async fn handle(&self, envelope: &EventEnvelope) -> Delivery {
        match &envelope.payload {
            SagaEvent::OrderCreated(data) => {
                consume(&self.db, envelope, |tx| reserve(tx, data)).await
            }
            SagaEvent::OrderApproved(data) => {
                consume(&self.db, envelope, |tx| confirm(tx, data.order_id)).await
            }
            SagaEvent::OrderCancelRequested(data) => {
                consume(&self.db, envelope, |tx| release(tx, envelope, data)).await
            }
            _ => Delivery::Ack,
        }
    }
}
