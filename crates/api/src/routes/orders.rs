//! Order placement and lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::{HubId, OrderId};
use messaging::OrderLine;
use saga::{Order, PlaceOrder};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    pub customer_id: String,
    pub lines: Vec<OrderLine>,
    pub amount_cents: i64,
    pub origin_hub: HubId,
    pub destination_hub: HubId,
}

#[derive(Serialize)]
pub struct OrderPlacedResponse {
    pub order_id: OrderId,
}

/// POST /orders starts a saga.
#[tracing::instrument(skip(state, req), fields(customer_id = %req.customer_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderPlacedResponse>), ApiError> {
    let order_id = state
        .orders
        .place_order(PlaceOrder {
            customer_id: req.customer_id,
            lines: req.lines,
            amount_cents: req.amount_cents,
            origin_hub: req.origin_hub,
            destination_hub: req.destination_hub,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(OrderPlacedResponse { order_id })))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let order = state
        .orders
        .get_order(order_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Order {id} not found")))?;
    Ok(Json(order))
}

pub(crate) fn parse_order_id(id: &str) -> Result<OrderId, ApiError> {
    let uuid = uuid::Uuid::parse_str(id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    Ok(OrderId::from_uuid(uuid))
}
