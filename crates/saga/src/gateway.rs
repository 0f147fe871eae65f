//! Payment gateway port and an in-memory gateway for tests.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::OrderId;
use thiserror::Error;
use uuid::Uuid;

/// Dependency name of the gateway in the circuit-breaker registry.
pub const PAYMENT_GATEWAY: &str = "payment-gateway";

/// Errors returned by a payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The gateway refused the request. Retrying will not help.
    #[error("declined: {0}")]
    Declined(String),

    /// The gateway could not be reached or timed out.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl GatewayError {
    /// Returns true if the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_))
    }
}

/// Synchronous calls to the external payment provider.
///
/// `approve` must be idempotent per order: a redelivered `OrderCreated`
/// calls it again and must get the same payment back.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Authorizes `amount_cents` for the order. Returns the payment id.
    async fn approve(&self, order_id: OrderId, amount_cents: i64) -> Result<Uuid, GatewayError>;

    /// Voids a previous authorization.
    async fn cancel(&self, payment_id: Uuid) -> Result<(), GatewayError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    authorizations: HashMap<OrderId, (Uuid, i64)>,
    voided: Vec<Uuid>,
    approve_calls: u32,
    fail_on_approve: Option<GatewayError>,
    fail_on_cancel: Option<GatewayError>,
    decline_above_cents: Option<i64>,
}

/// In-memory gateway with failure injection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<RwLock<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a gateway that approves everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every approve call fail with `error` until cleared with `None`.
    pub fn set_fail_on_approve(&self, error: Option<GatewayError>) {
        self.write().fail_on_approve = error;
    }

    /// Makes every cancel call fail with `error` until cleared with `None`.
    pub fn set_fail_on_cancel(&self, error: Option<GatewayError>) {
        self.write().fail_on_cancel = error;
    }

    /// Declines orders whose amount is above `limit`.
    pub fn set_decline_above(&self, limit: Option<i64>) {
        self.write().decline_above_cents = limit;
    }

    /// Number of approve calls that reached the gateway.
    pub fn approve_calls(&self) -> u32 {
        self.read().approve_calls
    }

    /// Number of live (authorized and not voided) payments.
    pub fn active_count(&self) -> usize {
        let state = self.read();
        state
            .authorizations
            .values()
            .filter(|(id, _)| !state.voided.contains(id))
            .count()
    }

    /// Returns true if the payment was voided.
    pub fn is_voided(&self, payment_id: Uuid) -> bool {
        self.read().voided.contains(&payment_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryGatewayState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryGatewayState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn approve(&self, order_id: OrderId, amount_cents: i64) -> Result<Uuid, GatewayError> {
        let mut state = self.write();
        state.approve_calls += 1;

        if let Some(error) = &state.fail_on_approve {
            return Err(error.clone());
        }
        if state.decline_above_cents.is_some_and(|limit| amount_cents > limit) {
            return Err(GatewayError::Declined("amount over limit".to_string()));
        }

        let (payment_id, _) = *state
            .authorizations
            .entry(order_id)
            .or_insert_with(|| (Uuid::new_v4(), amount_cents));
        Ok(payment_id)
    }

    async fn cancel(&self, payment_id: Uuid) -> Result<(), GatewayError> {
        let mut state = self.write();
        if let Some(error) = &state.fail_on_cancel {
            return Err(error.clone());
        }
        if !state.voided.contains(&payment_id) {
            state.voided.push(payment_id);
        }
        Ok(())
    }
}
