pub mod admin;
pub mod health;
pub mod hubs;
pub mod metrics;
pub mod orders;
pub mod stock;
