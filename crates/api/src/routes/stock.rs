//! Stock levels.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::ProductId;
use saga::StockLevel;
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct RestockRequest {
    pub quantity: u32,
}

/// POST /stock/{product_id} adds available units.
#[tracing::instrument(skip(state, req), fields(quantity = req.quantity))]
pub async fn restock(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<String>,
    Json(req): Json<RestockRequest>,
) -> Result<Json<StockLevel>, ApiError> {
    let product_id = ProductId::new(product_id);
    state.stock.restock(product_id.clone(), req.quantity).await?;
    Ok(Json(state.stock.stock_level(&product_id).await))
}

/// GET /stock/{product_id}
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(product_id): Path<String>,
) -> Json<StockLevel> {
    Json(state.stock.stock_level(&ProductId::new(product_id)).await)
}
