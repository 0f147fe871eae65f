//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Dependencies whose breaker is currently open.
    pub open_breakers: Vec<String>,
}

/// GET /health reports `degraded` while any dependency breaker is open.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let open_breakers: Vec<String> = state
        .breakers
        .snapshot()
        .into_iter()
        .filter(|b| b.state == resilience::CircuitState::Open)
        .map(|b| b.name)
        .collect();
    let status = if open_breakers.is_empty() {
        "ok"
    } else {
        "degraded"
    };
    Json(HealthResponse {
        status,
        open_breakers,
    })
}
