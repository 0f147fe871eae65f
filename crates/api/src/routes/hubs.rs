//! Hub registration and route planning.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use common::HubId;
use route_planner::{Hub, HubDirectory, Route};
use serde::Deserialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateHubRequest {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Deserialize)]
pub struct RouteQuery {
    pub source: HubId,
    pub target: HubId,
}

/// POST /hubs registers an active hub. Cached routes are dropped.
#[tracing::instrument(skip(state, req), fields(name = %req.name))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateHubRequest>,
) -> Result<(StatusCode, Json<Hub>), ApiError> {
    if !(-90.0..=90.0).contains(&req.latitude) || !(-180.0..=180.0).contains(&req.longitude) {
        return Err(ApiError::BadRequest(format!(
            "Coordinates out of range: {}, {}",
            req.latitude, req.longitude
        )));
    }
    let hub = Hub::new(req.name, req.latitude, req.longitude);
    state.hubs.insert(hub.clone()).await;
    state.planner.invalidate_cache().await;
    Ok((StatusCode::CREATED, Json(hub)))
}

/// GET /hubs lists active hubs.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<Hub>> {
    let mut hubs = state.hubs.active_hubs().await;
    hubs.sort_by(|a, b| a.name.cmp(&b.name));
    Json(hubs)
}

/// GET /routes?source=..&target=..
#[tracing::instrument(skip(state, query))]
pub async fn plan(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RouteQuery>,
) -> Result<Json<Route>, ApiError> {
    Ok(Json(state.planner.plan(query.source, query.target).await?))
}
