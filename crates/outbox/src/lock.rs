//! Non-blocking per-row locks for publisher instances.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;

/// A lock keyed by outbox row id, shared by every publisher instance.
///
/// Acquisition never waits: a row locked by another instance is skipped.
#[async_trait]
pub trait RowLock: Send + Sync {
    /// Tries to take the lock. Returns false if another holder has it.
    async fn try_acquire(&self, key: Uuid) -> Result<bool>;

    /// Releases a lock taken with [`try_acquire`](Self::try_acquire).
    async fn release(&self, key: Uuid) -> Result<()>;
}

/// Process-local lock table. Clones share the table.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRowLock {
    held: Arc<Mutex<HashSet<Uuid>>>,
}

impl InMemoryRowLock {
    /// Creates an empty lock table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `key` is currently held.
    pub fn is_held(&self, key: Uuid) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&key)
    }
}

#[async_trait]
impl RowLock for InMemoryRowLock {
    async fn try_acquire(&self, key: Uuid) -> Result<bool> {
        Ok(self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key))
    }

    async fn release(&self, key: Uuid) -> Result<()> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&key);
        Ok(())
    }
}
