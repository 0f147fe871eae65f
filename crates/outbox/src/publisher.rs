//! Drains READY outbox rows to the broker.

use std::sync::Arc;
use std::time::Duration;

use messaging::{EventEnvelope, Message, MessageBroker};
use resilience::{BreakerError, CircuitBreakerRegistry, RetryPolicy};
use tokio::sync::watch;

use crate::error::Result;
use crate::{OutboxEvent, OutboxStatus, OutboxStore, RowLock};

/// Breaker name used for broker calls.
pub const BROKER_DEPENDENCY: &str = "message-broker";

/// Configuration for an outbox publisher.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Rows fetched per tick.
    pub batch_size: usize,
    /// Time between ticks.
    pub poll_interval: Duration,
    /// Retry within a single publish attempt.
    pub retry: RetryPolicy,
    /// How long SENT rows are kept before a tick deletes them.
    pub sent_retention: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            sent_retention: Duration::from_secs(3600),
        }
    }
}

/// What one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub published: usize,
    pub failed: usize,
    /// Rows held by another publisher instance, or no longer READY.
    pub skipped: usize,
    /// Rows left READY because the broker breaker is open.
    pub deferred: usize,
    /// SENT rows deleted by the retention sweep.
    pub pruned: u64,
}

enum RowOutcome {
    Published,
    Failed,
    Skipped,
    BrokerOpen,
}

/// Periodic publisher for one service's outbox.
///
/// Several instances may run against the same store; the [`RowLock`] makes
/// sure a row is handled by one of them at a time, and the store refuses a
/// second READY → SENT transition.
pub struct OutboxPublisher<O, L, B> {
    service: String,
    store: O,
    lock: L,
    broker: B,
    breakers: CircuitBreakerRegistry,
    config: PublisherConfig,
}

impl<O, L, B> OutboxPublisher<O, L, B>
where
    O: OutboxStore,
    L: RowLock,
    B: MessageBroker,
{
    /// Creates a publisher.
    pub fn new(
        service: impl Into<String>,
        store: O,
        lock: L,
        broker: B,
        breakers: CircuitBreakerRegistry,
        config: PublisherConfig,
    ) -> Self {
        Self {
            service: service.into(),
            store,
            lock,
            broker,
            breakers,
            config,
        }
    }

    /// Publishes one batch of READY rows.
    #[tracing::instrument(skip(self), fields(service = %self.service))]
    pub async fn tick(&self) -> Result<TickReport> {
        let rows = self.store.fetch_ready(self.config.batch_size).await?;
        let mut report = TickReport::default();

        for (index, row) in rows.iter().enumerate() {
            match self.publish_row(row).await? {
                RowOutcome::Published => report.published += 1,
                RowOutcome::Failed => report.failed += 1,
                RowOutcome::Skipped => report.skipped += 1,
                RowOutcome::BrokerOpen => {
                    report.deferred = rows.len() - index;
                    tracing::info!(
                        deferred = report.deferred,
                        "Broker circuit open; leaving rows READY until next tick"
                    );
                    break;
                }
            }
        }

        report.pruned = self.prune_sent().await?;

        if report != TickReport::default() {
            tracing::debug!(?report, "Outbox tick finished");
        }
        Ok(report)
    }

    async fn prune_sent(&self) -> Result<u64> {
        let retention = chrono::Duration::from_std(self.config.sent_retention)
            .unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = chrono::Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };
        let pruned = self.store.prune_sent(cutoff).await?;
        if pruned > 0 {
            metrics::counter!("outbox_events_pruned_total").increment(pruned);
        }
        Ok(pruned)
    }

    async fn publish_row(&self, row: &OutboxEvent) -> Result<RowOutcome> {
        if !self.lock.try_acquire(row.id).await? {
            metrics::counter!("outbox_lock_skipped_total").increment(1);
            tracing::debug!(outbox_id = %row.id, "Row locked by another publisher; skipping");
            return Ok(RowOutcome::Skipped);
        }

        let outcome = self.publish_locked(row).await;
        self.lock.release(row.id).await?;
        outcome
    }

    async fn publish_locked(&self, row: &OutboxEvent) -> Result<RowOutcome> {
        // Another instance may have finished the row between fetch and lock.
        match self.store.get(row.id).await? {
            Some(current) if current.status == OutboxStatus::Ready => {}
            _ => return Ok(RowOutcome::Skipped),
        }

        let message = match EventEnvelope::decode(&row.payload)
            .and_then(|envelope| Message::from_envelope(&envelope))
        {
            Ok(message) => message,
            Err(e) => {
                tracing::error!(outbox_id = %row.id, error = %e, "Undecodable outbox payload");
                self.store.mark_failed(row.id, 0, &e.to_string()).await?;
                metrics::counter!("outbox_events_failed_total").increment(1);
                return Ok(RowOutcome::Failed);
            }
        };

        let breaker = self.breakers.get(BROKER_DEPENDENCY);
        let mut attempts = 0;
        let result = self
            .config
            .retry
            .retry(
                |attempt| {
                    attempts = attempt;
                    let breaker = breaker.clone();
                    let message = message.clone();
                    async move {
                        breaker
                            .execute(|| self.broker.publish(message))
                            .await
                    }
                },
                |e: &BreakerError<_>| !e.is_open(),
            )
            .await;
        let retries = attempts.saturating_sub(1);

        match result {
            Ok(()) => {
                self.store.mark_sent(row.id, retries).await?;
                metrics::counter!("outbox_events_published_total").increment(1);
                tracing::debug!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    topic = %message.channel,
                    "Outbox event published"
                );
                Ok(RowOutcome::Published)
            }
            Err(BreakerError::Open { .. }) => Ok(RowOutcome::BrokerOpen),
            Err(e) => {
                self.store.mark_failed(row.id, retries, &e.to_string()).await?;
                metrics::counter!("outbox_events_failed_total").increment(1);
                tracing::warn!(
                    outbox_id = %row.id,
                    event_type = %row.event_type,
                    attempts,
                    error = %e,
                    "Outbox event failed; awaiting manual requeue"
                );
                Ok(RowOutcome::Failed)
            }
        }
    }

    /// Ticks every `poll_interval` until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(service = %self.service, "Outbox publisher started");
        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        tracing::error!(service = %self.service, error = %e, "Outbox tick failed");
                    }
                }
            }
        }
        tracing::info!(service = %self.service, "Outbox publisher stopped");
    }
}
