//! Transactional outbox and idempotency ledger.
//!
//! A service mutates its state, records the consumed event in its ledger and
//! inserts the events it produces into its outbox, all in one
//! [`Transaction`]. The [`OutboxPublisher`] later forwards READY rows to the
//! broker through the `message-broker` circuit breaker.
//!
//! [`Database`] is the in-process implementation; [`postgres`] holds the
//! PostgreSQL equivalents.

mod datastore;
mod error;
mod lock;
mod model;
pub mod postgres;
mod publisher;
mod store;

pub use datastore::{Database, LEDGER_CONSTRAINT, Transaction};
pub use error::{Result, StoreError};
pub use lock::{InMemoryRowLock, RowLock};
pub use model::{OutboxEvent, OutboxStatus, ProcessedEvent};
pub use postgres::{PostgresLedger, PostgresOutboxStore, PostgresRowLock};
pub use publisher::{BROKER_DEPENDENCY, OutboxPublisher, PublisherConfig, TickReport};
pub use store::OutboxStore;
