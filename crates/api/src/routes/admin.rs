//! Operator endpoints: failed outbox rows, saga status, breakers, dead letters.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use messaging::DeadLetter;
use outbox::{OutboxEvent, OutboxStatus, OutboxStore};
use projections::SagaState;
use resilience::BreakerSnapshot;
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::routes::orders::parse_order_id;

/// An outbox row without its payload bytes.
#[derive(Serialize)]
pub struct OutboxRowResponse {
    pub id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<OutboxEvent> for OutboxRowResponse {
    fn from(row: OutboxEvent) -> Self {
        Self {
            id: row.id,
            aggregate_type: row.aggregate_type,
            aggregate_id: row.aggregate_id,
            event_type: row.event_type,
            status: row.status,
            retry_count: row.retry_count,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

fn outbox<'a>(state: &'a AppState, service: &str) -> Result<&'a Arc<dyn OutboxStore>, ApiError> {
    state
        .outboxes
        .get(service)
        .ok_or_else(|| ApiError::NotFound(format!("Unknown service {service}")))
}

/// GET /admin/outbox/{service}/failed
#[tracing::instrument(skip(state))]
pub async fn failed_outbox(
    State(state): State<Arc<AppState>>,
    Path(service): Path<String>,
) -> Result<Json<Vec<OutboxRowResponse>>, ApiError> {
    let rows = outbox(&state, &service)?.list_failed().await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

/// POST /admin/outbox/{service}/{id}/requeue puts a FAILED row back to READY.
#[tracing::instrument(skip(state))]
pub async fn requeue_outbox(
    State(state): State<Arc<AppState>>,
    Path((service, id)): Path<(String, String)>,
) -> Result<Json<OutboxRowResponse>, ApiError> {
    let id = Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid ID format: {e}")))?;
    let row = outbox(&state, &service)?.requeue(id).await?;
    metrics::counter!("outbox_requeued_total", "service" => service.clone()).increment(1);
    tracing::info!(%service, outbox_id = %id, "Outbox row requeued by operator");
    Ok(Json(row.into()))
}

/// GET /admin/sagas/{order_id}
#[tracing::instrument(skip(state))]
pub async fn saga(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaState>, ApiError> {
    let order_id = parse_order_id(&id)?;
    let saga = state
        .tracker
        .get(order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("No saga tracked for order {id}")))?;
    Ok(Json(saga))
}

/// GET /admin/sagas/stuck
pub async fn stuck_sagas(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SagaState>>, ApiError> {
    let stuck = state
        .tracker
        .find_stuck(state.stuck_threshold, Utc::now())
        .await?;
    Ok(Json(stuck))
}

/// GET /admin/circuit-breakers
pub async fn breakers(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.snapshot())
}

/// POST /admin/circuit-breakers/{name}/reset
pub async fn reset_breaker(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.breakers.reset(&name) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound(format!("Unknown circuit breaker {name}")))
    }
}

/// GET /admin/dead-letters
pub async fn dead_letters(State(state): State<Arc<AppState>>) -> Json<Vec<DeadLetter>> {
    Json(state.dead_letters.list().await)
}
