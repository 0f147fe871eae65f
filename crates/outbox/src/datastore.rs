//! In-process transactional datastore for one service.
//!
//! A [`Database`] owns three things: the service's domain state `S`, its
//! idempotency ledger and its outbox table. A [`Transaction`] stages changes
//! to all three and applies them together on [`Transaction::commit`], or not
//! at all. Dropping a transaction without committing discards it.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::EventId;
use messaging::{EventEnvelope, SagaEvent};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::{OutboxEvent, OutboxStatus, ProcessedEvent};

/// Name of the ledger's unique key, reported in [`StoreError::UniqueViolation`].
pub const LEDGER_CONSTRAINT: &str = "processed_events_event_id_key";

pub(crate) struct Tables<S> {
    pub(crate) state: S,
    pub(crate) version: u64,
    pub(crate) ledger: HashMap<EventId, ProcessedEvent>,
    pub(crate) outbox: OutboxTable,
}

/// Outbox rows in commit order, indexed by id and by status.
///
/// SENT rows are kept in the order they were published so the retention
/// sweep only looks at the rows it deletes.
#[derive(Default)]
pub(crate) struct OutboxTable {
    next_seq: u64,
    rows: BTreeMap<u64, OutboxEvent>,
    by_id: HashMap<Uuid, u64>,
    ready: BTreeSet<u64>,
    failed: BTreeSet<u64>,
    sent: VecDeque<u64>,
}

impl OutboxTable {
    fn insert(&mut self, row: OutboxEvent) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_id.insert(row.id, seq);
        match row.status {
            OutboxStatus::Ready => {
                self.ready.insert(seq);
            }
            OutboxStatus::Failed => {
                self.failed.insert(seq);
            }
            OutboxStatus::Sent => self.sent.push_back(seq),
        }
        self.rows.insert(seq, row);
    }

    pub(crate) fn get(&self, id: Uuid) -> Option<&OutboxEvent> {
        self.by_id.get(&id).and_then(|seq| self.rows.get(seq))
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    /// READY rows, oldest first.
    pub(crate) fn ready(&self) -> impl Iterator<Item = &OutboxEvent> {
        self.ready.iter().filter_map(|seq| self.rows.get(seq))
    }

    /// FAILED rows, oldest first.
    pub(crate) fn failed(&self) -> impl Iterator<Item = &OutboxEvent> {
        self.failed.iter().filter_map(|seq| self.rows.get(seq))
    }

    /// Moves a row from `expected` to `to` and returns it for further updates.
    pub(crate) fn transition(
        &mut self,
        id: Uuid,
        expected: OutboxStatus,
        to: OutboxStatus,
    ) -> Result<&mut OutboxEvent> {
        let seq = *self.by_id.get(&id).ok_or(StoreError::NotFound(id))?;
        let row = self.rows.get_mut(&seq).ok_or(StoreError::NotFound(id))?;
        if row.status != expected {
            return Err(StoreError::InvalidTransition {
                id,
                expected,
                actual: row.status,
            });
        }
        match expected {
            OutboxStatus::Ready => self.ready.remove(&seq),
            OutboxStatus::Failed => self.failed.remove(&seq),
            OutboxStatus::Sent => false,
        };
        match to {
            OutboxStatus::Ready => {
                self.ready.insert(seq);
            }
            OutboxStatus::Failed => {
                self.failed.insert(seq);
            }
            OutboxStatus::Sent => self.sent.push_back(seq),
        }
        row.status = to;
        row.updated_at = Utc::now();
        Ok(row)
    }

    /// Deletes SENT rows published before `cutoff`. Returns how many went.
    pub(crate) fn prune_sent(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut pruned = 0;
        while let Some(&seq) = self.sent.front() {
            let expired = self
                .rows
                .get(&seq)
                .is_none_or(|row| row.published_at.unwrap_or(row.updated_at) < cutoff);
            if !expired {
                break;
            }
            self.sent.pop_front();
            if let Some(row) = self.rows.remove(&seq) {
                self.by_id.remove(&row.id);
                pruned += 1;
            }
        }
        pruned
    }
}

/// A service's datastore. Clones share the same tables.
pub struct Database<S> {
    name: Arc<str>,
    pub(crate) tables: Arc<Mutex<Tables<S>>>,
}

impl<S> Clone for Database<S> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            tables: self.tables.clone(),
        }
    }
}

impl<S> Database<S>
where
    S: Clone + Send + 'static,
{
    /// Creates a datastore for the named service with initial state.
    pub fn new(name: impl Into<String>, state: S) -> Self {
        let name: String = name.into();
        Self {
            name: name.into(),
            tables: Arc::new(Mutex::new(Tables {
                state,
                version: 0,
                ledger: HashMap::new(),
                outbox: OutboxTable::default(),
            })),
        }
    }

    /// Owning service name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a transaction over a snapshot of the current state.
    pub async fn begin(&self) -> Transaction<S> {
        let tables = self.tables.lock().await;
        Transaction {
            db: self.clone(),
            base_version: tables.version,
            state: tables.state.clone(),
            dirty: false,
            processed: Vec::new(),
            outbox: Vec::new(),
        }
    }

    /// Returns true if `event_id` is recorded in the ledger.
    pub async fn has_processed(&self, event_id: EventId) -> bool {
        self.tables.lock().await.ledger.contains_key(&event_id)
    }

    /// Reads committed state.
    pub async fn read<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.tables.lock().await.state)
    }

    /// Number of ledger rows.
    pub async fn processed_count(&self) -> usize {
        self.tables.lock().await.ledger.len()
    }

    /// Every outbox row still in the table, in commit order.
    pub async fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.rows.values().cloned().collect()
    }

    /// Number of outbox rows still in the table.
    pub async fn outbox_len(&self) -> usize {
        self.tables.lock().await.outbox.len()
    }
}

/// Staged changes against one [`Database`].
pub struct Transaction<S> {
    db: Database<S>,
    base_version: u64,
    state: S,
    dirty: bool,
    processed: Vec<ProcessedEvent>,
    outbox: Vec<OutboxEvent>,
}

impl<S> Transaction<S>
where
    S: Clone + Send + 'static,
{
    /// The state as seen by this transaction.
    pub fn state(&self) -> &S {
        &self.state
    }

    /// Mutable access to the state. Marks the transaction as a writer, so a
    /// concurrent commit will make this one fail with a serialization error.
    pub fn state_mut(&mut self) -> &mut S {
        self.dirty = true;
        &mut self.state
    }

    /// Records `event_id` in the ledger as part of this transaction.
    pub fn mark_processed(&mut self, event_id: EventId, event_type: impl Into<String>) {
        self.processed.push(ProcessedEvent {
            event_id,
            event_type: event_type.into(),
            processed_at: Utc::now(),
        });
    }

    /// Stages an outbox row for `event`. Returns the id of the new envelope.
    pub fn enqueue(
        &mut self,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event: SagaEvent,
    ) -> Result<EventId> {
        let envelope = EventEnvelope::new(event);
        let now = Utc::now();
        self.outbox.push(OutboxEvent {
            id: envelope.event_id.as_uuid(),
            aggregate_type: aggregate_type.to_string(),
            aggregate_id,
            event_type: envelope.event_type.clone(),
            payload: envelope.encode()?,
            status: OutboxStatus::Ready,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            published_at: None,
        });
        Ok(envelope.event_id)
    }

    /// Applies every staged change atomically.
    pub async fn commit(self) -> Result<()> {
        let mut tables = self.db.tables.lock().await;

        let mut seen = std::collections::HashSet::new();
        for row in &self.processed {
            if tables.ledger.contains_key(&row.event_id) || !seen.insert(row.event_id) {
                return Err(StoreError::UniqueViolation {
                    constraint: LEDGER_CONSTRAINT.to_string(),
                });
            }
        }
        if self.dirty && tables.version != self.base_version {
            return Err(StoreError::SerializationFailure);
        }

        for row in self.processed {
            tables.ledger.insert(row.event_id, row);
        }
        for row in self.outbox {
            tables.outbox.insert(row);
        }
        if self.dirty {
            tables.state = self.state;
            tables.version += 1;
        }
        Ok(())
    }
}
