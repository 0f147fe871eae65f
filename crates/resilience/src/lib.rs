//! Resilience primitives for calls that leave the process.
//!
//! - [`CircuitBreaker`]: CLOSED / OPEN / HALF_OPEN state machine per dependency
//! - [`CircuitBreakerRegistry`]: explicitly owned map from dependency name to breaker
//! - [`RetryPolicy`]: bounded exponential backoff

pub mod backoff;
pub mod circuit_breaker;
pub mod registry;

pub use backoff::RetryPolicy;
pub use circuit_breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState,
};
pub use registry::CircuitBreakerRegistry;
