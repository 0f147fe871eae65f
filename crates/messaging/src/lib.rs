//! Messaging substrate for the order-fulfillment saga.
//!
//! This crate provides:
//! - [`SagaEvent`]: one typed variant per event kind
//! - [`EventEnvelope`]: the versioned wire format, decoded explicitly
//! - [`Topic`]: the exhaustive event-kind to topic mapping
//! - [`MessageBroker`] / [`MessageSource`]: broker ports, with [`InMemoryBroker`]
//! - [`MessageHandler`] and [`Delivery`]: the consumer contract
//! - [`Dispatcher`]: redelivery, deferral and dead-letter routing

pub mod broker;
pub mod dead_letter;
pub mod dispatcher;
pub mod envelope;
mod error;
pub mod event;
pub mod handler;
mod topic;

pub use broker::{
    DEFAULT_HISTORY_LIMIT, InMemoryBroker, Message, MessageBroker, MessageSource, Received,
};
pub use dead_letter::{DeadLetter, DeadLetterLog};
pub use dispatcher::{DEAD_LETTER_GROUP, Dispatcher, DispatcherConfig};
pub use envelope::{EventEnvelope, SCHEMA_VERSION};
pub use error::{MessagingError, Result};
pub use event::{
    DeliveryAssignedData, DeliveryCreatedData, EventKind, FailureData, OrderCancelData,
    OrderCreatedData, OrderLine, OrderRef, PaymentData, SagaEvent, StockData,
};
pub use handler::{Delivery, MessageHandler};
pub use topic::{Channel, Topic};
