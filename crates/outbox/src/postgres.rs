//! PostgreSQL implementations of the ledger, outbox store and row lock.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EventId;
use messaging::{EventEnvelope, SagaEvent};
use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::{OutboxEvent, OutboxStatus, OutboxStore, RowLock};

/// Maps unique violations and serialization failures to their [`StoreError`] variants.
fn map_db_error(e: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.is_unique_violation()
    {
        return StoreError::UniqueViolation {
            constraint: db_err.constraint().unwrap_or_default().to_string(),
        };
    }
    if let sqlx::Error::Database(ref db_err) = e
        && db_err.code().as_deref() == Some("40001")
    {
        return StoreError::SerializationFailure;
    }
    StoreError::Database(e)
}

/// Ledger operations. Writes take the caller's connection so they join the
/// caller's transaction.
pub struct PostgresLedger;

impl PostgresLedger {
    /// Returns true if `event_id` is already recorded.
    pub async fn has_processed(conn: &mut PgConnection, event_id: EventId) -> Result<bool> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM processed_events WHERE event_id = $1)")
                .bind(event_id.as_uuid())
                .fetch_one(conn)
                .await?;
        Ok(exists)
    }

    /// Records `event_id`. A concurrent duplicate surfaces as a unique violation
    /// on `processed_events_event_id_key`.
    pub async fn mark_processed(
        conn: &mut PgConnection,
        event_id: EventId,
        event_type: &str,
    ) -> Result<()> {
        sqlx::query("INSERT INTO processed_events (event_id, event_type) VALUES ($1, $2)")
            .bind(event_id.as_uuid())
            .bind(event_type)
            .execute(conn)
            .await
            .map_err(map_db_error)?;
        Ok(())
    }

    /// Inserts a READY outbox row for `event` on the caller's connection.
    pub async fn enqueue(
        conn: &mut PgConnection,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event: SagaEvent,
    ) -> Result<EventId> {
        let envelope = EventEnvelope::new(event);
        sqlx::query(
            r#"
            INSERT INTO outbox_events (id, aggregate_type, aggregate_id, event_type, payload, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 'READY', $6, $6)
            "#,
        )
        .bind(envelope.event_id.as_uuid())
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(&envelope.event_type)
        .bind(envelope.encode()?)
        .bind(envelope.occurred_at)
        .execute(conn)
        .await
        .map_err(map_db_error)?;
        Ok(envelope.event_id)
    }
}

#[derive(sqlx::FromRow)]
struct OutboxRow {
    id: Uuid,
    aggregate_type: String,
    aggregate_id: Uuid,
    event_type: String,
    payload: Vec<u8>,
    status: String,
    retry_count: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
}

impl OutboxRow {
    fn into_event(self) -> Result<OutboxEvent> {
        let status = OutboxStatus::parse(&self.status).ok_or_else(|| {
            StoreError::Database(sqlx::Error::Decode(
                format!("unknown outbox status {}", self.status).into(),
            ))
        })?;
        Ok(OutboxEvent {
            id: self.id,
            aggregate_type: self.aggregate_type,
            aggregate_id: self.aggregate_id,
            event_type: self.event_type,
            payload: self.payload,
            status,
            retry_count: self.retry_count,
            last_error: self.last_error,
            created_at: self.created_at,
            updated_at: self.updated_at,
            published_at: self.published_at,
        })
    }
}

const SELECT_OUTBOX: &str = r#"
    SELECT id, aggregate_type, aggregate_id, event_type, payload, status,
           retry_count, last_error, created_at, updated_at, published_at
    FROM outbox_events
"#;

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn transition(
        &self,
        id: Uuid,
        expected: OutboxStatus,
        sql: &str,
        retries: u32,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(sql)
            .bind(id)
            .bind(retries as i32)
            .bind(error)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 1 {
            return Ok(());
        }
        match self.get(id).await? {
            None => Err(StoreError::NotFound(id)),
            Some(row) => Err(StoreError::InvalidTransition {
                id,
                expected,
                actual: row.status,
            }),
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn fetch_ready(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{SELECT_OUTBOX} WHERE status = 'READY' ORDER BY created_at ASC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxRow::into_event).collect()
    }

    async fn get(&self, id: Uuid) -> Result<Option<OutboxEvent>> {
        let row: Option<OutboxRow> = sqlx::query_as(&format!("{SELECT_OUTBOX} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OutboxRow::into_event).transpose()
    }

    async fn mark_sent(&self, id: Uuid, retries: u32) -> Result<()> {
        self.transition(
            id,
            OutboxStatus::Ready,
            r#"
            UPDATE outbox_events
            SET status = 'SENT', retry_count = retry_count + $2,
                published_at = NOW(), updated_at = NOW(),
                last_error = COALESCE($3, last_error)
            WHERE id = $1 AND status = 'READY'
            "#,
            retries,
            None,
        )
        .await
    }

    async fn mark_failed(&self, id: Uuid, retries: u32, error: &str) -> Result<()> {
        self.transition(
            id,
            OutboxStatus::Ready,
            r#"
            UPDATE outbox_events
            SET status = 'FAILED', retry_count = retry_count + $2,
                last_error = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'READY'
            "#,
            retries,
            Some(error),
        )
        .await
    }

    async fn list_failed(&self) -> Result<Vec<OutboxEvent>> {
        let rows: Vec<OutboxRow> = sqlx::query_as(&format!(
            "{SELECT_OUTBOX} WHERE status = 'FAILED' ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OutboxRow::into_event).collect()
    }

    async fn requeue(&self, id: Uuid) -> Result<OutboxEvent> {
        self.transition(
            id,
            OutboxStatus::Failed,
            r#"
            UPDATE outbox_events
            SET status = 'READY', updated_at = NOW(),
                retry_count = retry_count + $2, last_error = COALESCE($3, last_error)
            WHERE id = $1 AND status = 'FAILED'
            "#,
            0,
            None,
        )
        .await?;
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    async fn prune_sent(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM outbox_events WHERE status = 'SENT' AND published_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// Row lock backed by session-level advisory locks.
///
/// A lock is tied to the connection that took it, so each held key keeps its
/// pooled connection until released.
pub struct PostgresRowLock {
    pool: PgPool,
    held: Mutex<HashMap<Uuid, PoolConnection<Postgres>>>,
}

impl PostgresRowLock {
    /// Creates a lock manager over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            held: Mutex::new(HashMap::new()),
        }
    }

    fn lock_key(key: Uuid) -> i64 {
        let value = key.as_u128();
        ((value >> 64) as u64 ^ value as u64) as i64
    }
}

#[async_trait]
impl RowLock for PostgresRowLock {
    async fn try_acquire(&self, key: Uuid) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(Self::lock_key(key))
            .fetch_one(&mut *conn)
            .await?;
        if acquired {
            self.held.lock().await.insert(key, conn);
        }
        Ok(acquired)
    }

    async fn release(&self, key: Uuid) -> Result<()> {
        let Some(mut conn) = self.held.lock().await.remove(&key) else {
            return Ok(());
        };
        sqlx::query("SELECT pg_advisory_unlock($1)")
            .bind(Self::lock_key(key))
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}
