//! Storage for saga state rows.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::OrderId;
use messaging::EventEnvelope;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::state::{OverallStatus, SagaState};

/// Where saga state rows live.
///
/// `apply` must read, fold and write one row atomically so two events for the
/// same order cannot overwrite each other's step.
#[async_trait]
pub trait SagaStateStore: Send + Sync {
    /// Folds `envelope` into its order's row, creating the row if needed.
    /// Returns true if the row changed.
    async fn apply(&self, envelope: &EventEnvelope) -> Result<bool>;

    /// Loads one order's row.
    async fn get(&self, order_id: OrderId) -> Result<Option<SagaState>>;

    /// Rows whose overall status is one of `statuses`, oldest update first.
    async fn list_by_overall(&self, statuses: &[OverallStatus]) -> Result<Vec<SagaState>>;

    /// Removes every row.
    async fn clear(&self) -> Result<()>;
}

#[async_trait]
impl<T: SagaStateStore + ?Sized> SagaStateStore for Arc<T> {
    async fn apply(&self, envelope: &EventEnvelope) -> Result<bool> {
        (**self).apply(envelope).await
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        (**self).get(order_id).await
    }

    async fn list_by_overall(&self, statuses: &[OverallStatus]) -> Result<Vec<SagaState>> {
        (**self).list_by_overall(statuses).await
    }

    async fn clear(&self) -> Result<()> {
        (**self).clear().await
    }
}

/// In-memory saga state store.
#[derive(Clone, Default)]
pub struct InMemorySagaStateStore {
    states: Arc<RwLock<HashMap<OrderId, SagaState>>>,
}

impl InMemorySagaStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tracked orders.
    pub async fn len(&self) -> usize {
        self.states.read().await.len()
    }

    /// Whether no order is tracked.
    pub async fn is_empty(&self) -> bool {
        self.states.read().await.is_empty()
    }
}

#[async_trait]
impl SagaStateStore for InMemorySagaStateStore {
    async fn apply(&self, envelope: &EventEnvelope) -> Result<bool> {
        let order_id = envelope.order_id();
        let mut states = self.states.write().await;
        let state = states
            .entry(order_id)
            .or_insert_with(|| SagaState::new(order_id, envelope.occurred_at));
        Ok(state.apply(envelope))
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        Ok(self.states.read().await.get(&order_id).cloned())
    }

    async fn list_by_overall(&self, statuses: &[OverallStatus]) -> Result<Vec<SagaState>> {
        let mut matching: Vec<SagaState> = self
            .states
            .read()
            .await
            .values()
            .filter(|state| statuses.contains(&state.overall_status))
            .cloned()
            .collect();
        matching.sort_by_key(|state| state.updated_at);
        Ok(matching)
    }

    async fn clear(&self) -> Result<()> {
        self.states.write().await.clear();
        Ok(())
    }
}
