//! The four saga participants. Each owns a [`outbox::Database`] and consumes
//! its topics as a [`messaging::MessageHandler`].

pub mod delivery;
pub mod order;
pub mod payment;
pub mod stock;

pub use delivery::{DELIVERY_SERVICE, DeliveryRecord, DeliveryService, DeliveryStatus};
pub use order::{ORDER_SERVICE, Order, OrderService, OrderStatus, PlaceOrder};
pub use payment::{PAYMENT_SERVICE, Payment, PaymentService, PaymentStatus};
pub use stock::{Reservation, ReservationStatus, STOCK_SERVICE, StockLevel, StockService};
