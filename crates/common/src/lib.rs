//! Identifiers shared by every participant of the order-fulfillment saga.

mod types;

pub use types::{EventId, HubId, OrderId, ProductId};
