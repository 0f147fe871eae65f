use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::datastore::Database;
use crate::error::{Result, StoreError};
use crate::{OutboxEvent, OutboxStatus};

/// Publisher-facing view of a service's outbox table.
///
/// Producers never use this trait: they insert rows through a
/// [`Transaction`](crate::Transaction) together with their state change.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` READY rows, oldest first.
    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Loads one row.
    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>>;

    /// READY → SENT. Fails with `InvalidTransition` if the row is not READY.
    async fn mark_sent(&self, id: Uuid, retries: u32) -> Result<()>;

    /// READY → FAILED, recording the last error.
    async fn mark_failed(&self, id: Uuid, retries: u32, error: &str) -> Result<()>;

    /// Every FAILED row, oldest first.
    async fn list_failed(&self) -> Result<Vec<OutboxEvent>>;

    /// FAILED → READY for manual replay. `retry_count` and `last_error` are kept.
    async fn requeue(&self, id: Uuid) -> Result<OutboxEvent>;

    /// Deletes SENT rows published before `cutoff`. Returns the number deleted.
    async fn prune_sent(&self, cutoff: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
impl<S> OutboxStore for Database<S>
where
    S: Clone + Send + 'static,
{
    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let tables = self.tables.lock().await;
        Ok(tables.outbox.ready().take(limit).cloned().collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let tables = self.tables.lock().await;
        Ok(tables.outbox.get(id).cloned())
    }

    async fn mark_sent(&self, id: Uuid, retries: u32) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .outbox
            .transition(id, OutboxStatus::Ready, OutboxStatus::Sent)?;
        row.retry_count += retries as i32;
        row.published_at = Some(row.updated_at);
        Ok(())
    }

    async fn mark_failed(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .outbox
            .transition(id, OutboxStatus::Ready, OutboxStatus::Failed)?;
        row.retry_count += retries as i32;
        row.last_error = Some(error.to_string());
        Ok(())
    }

    async fn list_failed(&self) -> Result<Vec<OutboxEvent>> {
        let tables = self.tables.lock().await;
        Ok(tables.outbox.failed().cloned().collect())
    }

    async fn requeue(&self, id: Uuid) -> Result<OutboxEvent> {
        let mut tables = self.tables.lock().await;
        let row = tables
            .outbox
            .transition(id, OutboxStatus::Failed, OutboxStatus::Ready)?;
        Ok(row.clone())
    }

    async fn prune_sent(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.prune_sent(cutoff) as u64)
    }
}
