//! Choreographed order-fulfillment saga.
//!
//! There is no coordinator. Each participant reacts to events and emits its
//! own next event through its outbox:
//!
//! 1. order: `OrderCreated`
//! 2. stock reserves, payment authorizes (in parallel)
//! 3. order approves once both succeed
//! 4. stock confirms; delivery plans a route and assigns a courier
//!
//! Any failure event makes the order service cancel the order and publish
//! `OrderCancelRequested`; participants that already acted undo their work.
//! A cancellation that arrives first is kept as a [`CancelRequest`] so a late
//! creation event creates nothing.

pub mod cancel;
mod consumer;
pub mod error;
pub mod gateway;
pub mod services;

pub use cancel::{CancelRequest, CancelRequestStatus, CancelRequests};
pub use error::{Result, SagaError};
pub use gateway::{GatewayError, InMemoryPaymentGateway, PAYMENT_GATEWAY, PaymentGateway};
pub use services::{
    DELIVERY_SERVICE, DeliveryRecord, DeliveryService, DeliveryStatus, ORDER_SERVICE, Order,
    OrderService, OrderStatus, PAYMENT_SERVICE, Payment, PaymentService, PaymentStatus,
    PlaceOrder, Reservation, ReservationStatus, STOCK_SERVICE, StockLevel, StockService,
};
