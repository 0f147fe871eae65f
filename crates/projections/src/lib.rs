//! Saga state read model.
//!
//! The tracker consumes every saga topic and keeps one row per order with
//! each participant's latest step and a derived overall status:
//! - [`SagaState`] folds events monotonically, so order of arrival across
//!   topics and redelivery do not matter
//! - [`SagaStateStore`] persists rows, in memory or in PostgreSQL
//! - [`SagaStateTracker`] is the consumer group and answers stuck-saga queries

pub mod error;
mod postgres;
pub mod state;
mod store;
mod tracker;

pub use error::{ProjectionError, Result};
pub use postgres::PostgresSagaStateStore;
pub use state::{DeliveryStep, OrderStep, OverallStatus, PaymentStep, SagaState, StockStep};
pub use store::{InMemorySagaStateStore, SagaStateStore};
pub use tracker::{SAGA_TRACKER, SagaStateTracker};
