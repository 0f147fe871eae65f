//! Delivery service: plans a hub route and assigns a courier once an order
//! is approved.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{HubId, OrderId};
use messaging::{
    Delivery, DeliveryAssignedData, DeliveryCreatedData, EventEnvelope, MessageHandler,
    OrderCancelData, SagaEvent, Topic,
};
use outbox::{Database, Transaction};
use route_planner::{HubDirectory, Route, RouteError, RoutePlanner};
use serde::Serialize;
use uuid::Uuid;

use crate::cancel::CancelRequests;
use crate::consumer::consume;
use crate::error::{Result, SagaError};

/// Consumer group and outbox owner name.
pub const DELIVERY_SERVICE: &str = "delivery-service";

const AGGREGATE: &str = "Delivery";

/// Lifecycle of a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    /// Route planned, no courier yet.
    Created,
    /// A courier is on it.
    Assigned,
    Cancelled,
    /// No route could be planned.
    Failed,
}

/// A delivery for one order.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub delivery_id: Uuid,
    pub order_id: OrderId,
    pub route: Option<Route>,
    pub courier: Option<String>,
    pub status: DeliveryStatus,
    pub created_at: DateTime<Utc>,
}

/// Where an order ships from and to, learned from `OrderCreated`.
#[derive(Debug, Clone, Copy)]
struct Shipment {
    origin: HubId,
    destination: HubId,
}

/// Delivery service state.
#[derive(Debug, Clone, Default)]
pub struct DeliveryState {
    shipments: HashMap<OrderId, Shipment>,
    deliveries: HashMap<OrderId, DeliveryRecord>,
    cancel_requests: CancelRequests,
    next_courier: usize,
}

/// Owns deliveries.
pub struct DeliveryService<D> {
    db: Database<DeliveryState>,
    planner: Arc<RoutePlanner<D>>,
    couriers: Vec<String>,
}

impl<D: HubDirectory> DeliveryService<D> {
    /// Creates the service. Couriers are assigned round-robin; with none,
    /// deliveries stay CREATED.
    pub fn new(planner: Arc<RoutePlanner<D>>, couriers: Vec<String>) -> Self {
        Self {
            db: Database::new(DELIVERY_SERVICE, DeliveryState::default()),
            planner,
            couriers,
        }
    }

    /// The service's datastore (outbox included).
    pub fn database(&self) -> &Database<DeliveryState> {
        &self.db
    }

    /// The delivery for an order, if any.
    pub async fn delivery(&self, order_id: OrderId) -> Option<DeliveryRecord> {
        self.db
            .read(|s| s.deliveries.get(&order_id).cloned())
            .await
    }

    async fn create(&self, envelope: &EventEnvelope, order_id: OrderId) -> Delivery {
        if self.db.has_processed(envelope.event_id).await {
            return Delivery::Duplicate;
        }
        let shipment = self
            .db
            .read(|s| s.shipments.get(&order_id).copied())
            .await;
        let Some(shipment) = shipment else {
            return SagaError::NotReady(format!("no shipment details for order {order_id}"))
                .into_delivery();
        };

        let route = self
            .planner
            .plan(shipment.origin, shipment.destination)
            .await;

        consume(&self.db, envelope, |tx| {
            record_delivery(tx, order_id, route, &self.couriers)
        })
        .await
    }
}

fn remember_shipment(
    tx: &mut Transaction<DeliveryState>,
    order_id: OrderId,
    shipment: Shipment,
) -> Result<()> {
    tx.state_mut().shipments.insert(order_id, shipment);
    Ok(())
}

fn record_delivery(
    tx: &mut Transaction<DeliveryState>,
    order_id: OrderId,
    route: std::result::Result<Route, RouteError>,
    couriers: &[String],
) -> Result<()> {
    let state = tx.state_mut();
    if let Some(request) = state.cancel_requests.take(order_id) {
        tracing::info!(
            %order_id,
            cancel_event_id = %request.cancel_event_id,
            "Cancellation already on record; not creating delivery"
        );
        return Ok(());
    }
    if state.deliveries.contains_key(&order_id) {
        return Ok(());
    }

    let delivery_id = Uuid::new_v4();
    let route = match route {
        Ok(route) => route,
        Err(e) => {
            state.deliveries.insert(
                order_id,
                DeliveryRecord {
                    delivery_id,
                    order_id,
                    route: None,
                    courier: None,
                    status: DeliveryStatus::Failed,
                    created_at: Utc::now(),
                },
            );
            tracing::warn!(%order_id, error = %e, "No route; delivery not created");
            tx.enqueue(
                AGGREGATE,
                delivery_id,
                SagaEvent::delivery_creation_failed(order_id, e.to_string()),
            )?;
            return Ok(());
        }
    };

    let courier = (!couriers.is_empty()).then(|| {
        let courier = couriers[state.next_courier % couriers.len()].clone();
        state.next_courier += 1;
        courier
    });
    let created = SagaEvent::DeliveryCreated(DeliveryCreatedData {
        order_id,
        delivery_id,
        legs: route.legs.len(),
        total_distance_km: route.total_distance_km,
        total_minutes: route.total_minutes,
    });
    state.deliveries.insert(
        order_id,
        DeliveryRecord {
            delivery_id,
            order_id,
            route: Some(route),
            courier: courier.clone(),
            status: if courier.is_some() {
                DeliveryStatus::Assigned
            } else {
                DeliveryStatus::Created
            },
            created_at: Utc::now(),
        },
    );

    tx.enqueue(AGGREGATE, delivery_id, created)?;
    if let Some(courier) = courier {
        tracing::info!(%order_id, %delivery_id, %courier, "Delivery created and assigned");
        tx.enqueue(
            AGGREGATE,
            delivery_id,
            SagaEvent::DeliveryAssigned(DeliveryAssignedData {
                order_id,
                delivery_id,
                courier,
            }),
        )?;
    }
    Ok(())
}

fn cancel_delivery(
    tx: &mut Transaction<DeliveryState>,
    envelope: &EventEnvelope,
    data: &OrderCancelData,
) -> Result<()> {
    let order_id = data.order_id;
    let state = tx.state_mut();

    let Some(delivery) = state.deliveries.get_mut(&order_id) else {
        state
            .cancel_requests
            .record(order_id, envelope.event_id, data.reason.clone());
        tracing::info!(%order_id, "Cancel arrived before delivery; recorded intent");
        return Ok(());
    };
    if !matches!(
        delivery.status,
        DeliveryStatus::Created | DeliveryStatus::Assigned
    ) {
        return Ok(());
    }
    delivery.status = DeliveryStatus::Cancelled;
    let aggregate_id = delivery.delivery_id;
    tx.enqueue(
        AGGREGATE,
        aggregate_id,
        SagaEvent::delivery_cancelled(order_id),
    )?;
    tracing::info!(%order_id, "Delivery cancelled");
    Ok(())
}

#[async_trait]
impl<D: HubDirectory> MessageHandler for DeliveryService<D> {
    fn name(&self) -> &str {
        DELIVERY_SERVICE
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
                let shipment = Shipment {
                    origin: data.origin_hub,
                    destination: data.destination_hub,
                };
                consume(&self.db, envelope, |tx| {
                    remember_shipment(tx, data.order_id, shipment)
                })
                .await
            }
            SagaEvent::OrderApproved(data) => self.create(envelope, data.order_id).await,
            SagaEvent::OrderCancelRequested(data) => {
                consume(&self.db, envelope, |tx| cancel_delivery(tx, envelope, data)).await
            }
            _ => Delivery::Ack,
        }
    }
}
