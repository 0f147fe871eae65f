//! HTTP surface and in-process wiring for the order fulfillment saga.
//!
//! Provides order placement, stock and hub management, and the operator
//! endpoints (failed outbox rows, saga status, circuit breakers, dead
//! letters), with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
mod system;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use system::{AppState, System, Tracker};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route(
            "/stock/{product_id}",
            get(routes::stock::get).post(routes::stock::restock),
        )
        .route(
            "/hubs",
            get(routes::hubs::list).post(routes::hubs::create),
        )
        .route("/routes", get(routes::hubs::plan))
        .route(
            "/admin/outbox/{service}/failed",
            get(routes::admin::failed_outbox),
        )
        .route(
            "/admin/outbox/{service}/{id}/requeue",
            post(routes::admin::requeue_outbox),
        )
        .route("/admin/sagas/stuck", get(routes::admin::stuck_sagas))
        .route("/admin/sagas/{order_id}", get(routes::admin::saga))
        .route("/admin/circuit-breakers", get(routes::admin::breakers))
        .route(
            "/admin/circuit-breakers/{name}/reset",
            post(routes::admin::reset_breaker),
        )
        .route("/admin/dead-letters", get(routes::admin::dead_letters))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
