//! The saga tracker consumer group.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::{Delivery, EventEnvelope, MessageHandler, Topic};

use crate::error::Result;
use crate::state::{OverallStatus, SagaState};
use crate::store::SagaStateStore;

/// Consumer group name of the tracker.
pub const SAGA_TRACKER: &str = "saga-tracker";

/// Folds every saga event into a [`SagaStateStore`].
///
/// The tracker subscribes to every topic. It keeps no ledger of its own:
/// folding is monotonic, so redelivered events leave rows unchanged.
pub struct SagaStateTracker<S> {
    store: S,
}

impl<S: SagaStateStore> SagaStateTracker<S> {
    /// Creates a tracker over `store`.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Applies one event. Returns true if its order's row changed.
    pub async fn apply(&self, envelope: &EventEnvelope) -> Result<bool> {
        let changed = self.store.apply(envelope).await?;
        if changed {
            metrics::counter!("saga_state_updates_total", "event_type" => envelope.event_type.clone())
                .increment(1);
        }
        Ok(changed)
    }

    /// Current state of one order's saga.
    pub async fn get(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        self.store.get(order_id).await
    }

    /// Sagas that need attention and have not moved for longer than `threshold`.
    pub async fn find_stuck(
        &self,
        threshold: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<SagaState>> {
        let stuck: Vec<SagaState> = self
            .store
            .list_by_overall(&OverallStatus::NEEDS_ATTENTION)
            .await?
            .into_iter()
            .filter(|state| state.is_stuck(threshold, now))
            .collect();
        metrics::gauge!("saga_stuck_total").set(stuck.len() as f64);
        if !stuck.is_empty() {
            tracing::warn!(count = stuck.len(), "Stuck sagas found");
        }
        Ok(stuck)
    }

    /// Drops every row and replays `events` in order.
    #[tracing::instrument(skip_all)]
    pub async fn rebuild<I>(&self, events: I) -> Result<usize>
    where
        I: IntoIterator<Item = EventEnvelope>,
    {
        self.store.clear().await?;
        let mut applied = 0;
        for envelope in events {
            self.store.apply(&envelope).await?;
            applied += 1;
        }
        tracing::info!(applied, "Saga state rebuilt");
        Ok(applied)
    }
}

#[async_trait]
impl<S: SagaStateStore> MessageHandler for SagaStateTracker<S> {
    fn name(&self) -> &str {
        SAGA_TRACKER
    }

    fn topics(&self) -> Vec<Topic> {
        Topic::ALL.to_vec()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> Delivery {
        match self.apply(envelope).await {
            Ok(true) => Delivery::Ack,
            Ok(false) => Delivery::Duplicate,
            Err(e) => {
                tracing::warn!(
                    event_id = %envelope.event_id,
                    error = %e,
                    "Saga state update failed"
                );
                Delivery::retry(e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemorySagaStateStore;
    use messaging::SagaEvent;

    #[tokio::test]
    async fn handle_acks_changes_and_reports_no_op_as_duplicate() {
        let tracker = SagaStateTracker::new(InMemorySagaStateStore::new());
        let envelope = EventEnvelope::new(SagaEvent::order_approved(OrderId::new()));

        assert_eq!(tracker.handle(&envelope).await, Delivery::Ack);
        assert_eq!(tracker.handle(&envelope).await, Delivery::Duplicate);
    }

    #[tokio::test]
    async fn find_stuck_ignores_recent_and_healthy_sagas() {
        let tracker = SagaStateTracker::new(InMemorySagaStateStore::new());
        let now = Utc::now();
        let old = OrderId::new();
        let recent = OrderId::new();
        let healthy = OrderId::new();

        let mut failed = EventEnvelope::new(SagaEvent::payment_approval_failed(old, "declined"));
        failed.occurred_at = now - chrono::Duration::hours(1);
        tracker.apply(&failed).await.unwrap();
        tracker
            .apply(&EventEnvelope::new(SagaEvent::payment_approval_failed(
                recent, "declined",
            )))
            .await
            .unwrap();
        let mut approved = EventEnvelope::new(SagaEvent::order_approved(healthy));
        approved.occurred_at = now - chrono::Duration::hours(1);
        tracker.apply(&approved).await.unwrap();

        let stuck = tracker
            .find_stuck(chrono::Duration::minutes(10), now)
            .await
            .unwrap();

        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].order_id, old);
    }

    #[tokio::test]
    async fn rebuild_replays_from_scratch() {
        let tracker = SagaStateTracker::new(InMemorySagaStateStore::new());
        let stale = OrderId::new();
        tracker
            .apply(&EventEnvelope::new(SagaEvent::order_approved(stale)))
            .await
            .unwrap();

        let order_id = OrderId::new();
        let applied = tracker
            .rebuild(vec![
                EventEnvelope::new(SagaEvent::order_approved(order_id)),
                EventEnvelope::new(SagaEvent::order_cancelled(order_id, "customer")),
            ])
            .await
            .unwrap();

        assert_eq!(applied, 2);
        assert!(tracker.get(stale).await.unwrap().is_none());
        let state = tracker.get(order_id).await.unwrap().unwrap();
        assert_eq!(state.overall_status, OverallStatus::Failed);
        assert_eq!(state.last_reason.as_deref(), Some("customer"));
    }
}
