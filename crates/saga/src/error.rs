//! Saga error types.

use common::OrderId;
use messaging::Delivery;
use outbox::StoreError;
use thiserror::Error;

use crate::gateway::GatewayError;

/// Errors raised by saga participants.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The order command was malformed.
    #[error("Invalid order: {0}")]
    InvalidOrder(String),

    /// A stock quantity that cannot be applied.
    #[error("Invalid quantity: {0}")]
    InvalidQuantity(String),

    /// Order not found.
    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    /// Something this event depends on has not been seen yet.
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Datastore error.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Payment gateway error.
    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),
}

impl SagaError {
    /// How a consumer should settle the message that raised this error.
    ///
    /// A ledger unique violation means a concurrent consumer won: duplicate.
    /// Missing prerequisites and transient store errors are redelivered.
    /// Anything else will fail the same way again and is rejected.
    pub fn into_delivery(self) -> Delivery {
        match &self {
            SagaError::Store(e) if e.is_duplicate() => Delivery::Duplicate,
            SagaError::Store(e) if e.is_transient() => Delivery::retry(self.to_string()),
            SagaError::NotReady(_) => Delivery::retry(self.to_string()),
            SagaError::Gateway(e) if e.is_transient() => Delivery::retry(self.to_string()),
            _ => Delivery::reject(self.to_string()),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_conflict_is_duplicate() {
        let err = SagaError::from(StoreError::UniqueViolation {
            constraint: outbox::LEDGER_CONSTRAINT.to_string(),
        });
        assert_eq!(err.into_delivery(), Delivery::Duplicate);
    }

    #[test]
    fn other_unique_violation_is_rejected() {
        let err = SagaError::from(StoreError::UniqueViolation {
            constraint: "cancel_requests_order_id_key".to_string(),
        });
        assert!(matches!(err.into_delivery(), Delivery::Reject { .. }));
    }

    #[test]
    fn transient_errors_are_retried() {
        assert!(matches!(
            SagaError::from(StoreError::SerializationFailure).into_delivery(),
            Delivery::Retry { .. }
        ));
        assert!(matches!(
            SagaError::NotReady("order details".into()).into_delivery(),
            Delivery::Retry { .. }
        ));
    }
}
