//! The idempotent-consumer skeleton every participant handler runs through.

use messaging::{Delivery, EventEnvelope};
use outbox::{Database, Transaction};

use crate::error::{Result, SagaError};

/// Applies `effect` and records the envelope in the ledger in one transaction.
///
/// An event already in the ledger is acknowledged as a duplicate without
/// running `effect`. If a concurrent consumer records it first, the commit
/// fails on the ledger key and that is a duplicate too.
pub(crate) async fn consume<S, F>(db: &Database<S>, envelope: &EventEnvelope, effect: F) -> Delivery
where
    S: Clone + Send + 'static,
    F: FnOnce(&mut Transaction<S>) -> Result<()>,
{
    if db.has_processed(envelope.event_id).await {
        return Delivery::Duplicate;
    }

    let mut tx = db.begin().await;
    if let Err(e) = effect(&mut tx) {
        return settle_error(db.name(), envelope, e);
    }
    tx.mark_processed(envelope.event_id, envelope.event_type.clone());

    match tx.commit().await {
        Ok(()) => Delivery::Ack,
        Err(e) => settle_error(db.name(), envelope, SagaError::from(e)),
    }
}

pub(crate) fn settle_error(service: &str, envelope: &EventEnvelope, error: SagaError) -> Delivery {
    let delivery = error.into_delivery();
    match &delivery {
        Delivery::Duplicate => {
            tracing::debug!(service, event_id = %envelope.event_id, "Concurrent duplicate lost the ledger race");
        }
        Delivery::Retry { reason } => {
            tracing::warn!(service, event_id = %envelope.event_id, %reason, "Consumer will be retried");
        }
        Delivery::Reject { reason } => {
            tracing::error!(service, event_id = %envelope.event_id, %reason, "Consumer rejected message");
        }
        Delivery::Ack | Delivery::Defer(_) => {}
    }
    delivery
}
