//! PostgreSQL-backed saga state store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::OrderId;
use messaging::EventEnvelope;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{ProjectionError, Result};
use crate::state::{DeliveryStep, OrderStep, OverallStatus, PaymentStep, SagaState, StockStep};
use crate::store::SagaStateStore;

#[derive(sqlx::FromRow)]
struct SagaStateRow {
    order_id: Uuid,
    order_status: Option<String>,
    payment_status: Option<String>,
    stock_status: Option<String>,
    delivery_status: Option<String>,
    overall_status: String,
    last_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

fn parse_step<T>(value: Option<String>, parse: fn(&str) -> Option<T>) -> Result<Option<T>> {
    match value {
        None => Ok(None),
        Some(s) => parse(&s)
            .map(Some)
            .ok_or_else(|| ProjectionError::Corrupt(format!("unknown step {s}"))),
    }
}

impl SagaStateRow {
    fn into_state(self) -> Result<SagaState> {
        let overall_status = OverallStatus::parse(&self.overall_status).ok_or_else(|| {
            ProjectionError::Corrupt(format!("unknown overall status {}", self.overall_status))
        })?;
        Ok(SagaState {
            order_id: OrderId::from_uuid(self.order_id),
            order_status: parse_step(self.order_status, OrderStep::parse)?,
            payment_status: parse_step(self.payment_status, PaymentStep::parse)?,
            stock_status: parse_step(self.stock_status, StockStep::parse)?,
            delivery_status: parse_step(self.delivery_status, DeliveryStep::parse)?,
            overall_status,
            last_reason: self.last_reason,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

const SELECT_STATE: &str = r#"
    SELECT order_id, order_status, payment_status, stock_status, delivery_status,
           overall_status, last_reason, created_at, updated_at
    FROM saga_states
"#;

/// Saga state rows in the `saga_states` table.
#[derive(Clone)]
pub struct PostgresSagaStateStore {
    pool: PgPool,
}

impl PostgresSagaStateStore {
    /// Creates a new store with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SagaStateStore for PostgresSagaStateStore {
    async fn apply(&self, envelope: &EventEnvelope) -> Result<bool> {
        let order_id = envelope.order_id();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO saga_states (order_id, overall_status, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(OverallStatus::InProgress.as_str())
        .bind(envelope.occurred_at)
        .execute(&mut *tx)
        .await?;

        let row: SagaStateRow =
            sqlx::query_as(&format!("{SELECT_STATE} WHERE order_id = $1 FOR UPDATE"))
                .bind(order_id.as_uuid())
                .fetch_one(&mut *tx)
                .await?;
        let mut state = row.into_state()?;
        if !state.apply(envelope) {
            tx.commit().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE saga_states
            SET order_status = $2, payment_status = $3, stock_status = $4,
                delivery_status = $5, overall_status = $6, last_reason = $7,
                created_at = $8, updated_at = $9
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(state.order_status.map(|s| s.as_str()))
        .bind(state.payment_status.map(|s| s.as_str()))
        .bind(state.stock_status.map(|s| s.as_str()))
        .bind(state.delivery_status.map(|s| s.as_str()))
        .bind(state.overall_status.as_str())
        .bind(&state.last_reason)
        .bind(state.created_at)
        .bind(state.updated_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get(&self, order_id: OrderId) -> Result<Option<SagaState>> {
        let row: Option<SagaStateRow> =
            sqlx::query_as(&format!("{SELECT_STATE} WHERE order_id = $1"))
                .bind(order_id.as_uuid())
                .fetch_optional(&self.pool)
                .await?;
        row.map(SagaStateRow::into_state).transpose()
    }

    async fn list_by_overall(&self, statuses: &[OverallStatus]) -> Result<Vec<SagaState>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows: Vec<SagaStateRow> = sqlx::query_as(&format!(
            "{SELECT_STATE} WHERE overall_status = ANY($1) ORDER BY updated_at ASC"
        ))
        .bind(statuses)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(SagaStateRow::into_state).collect()
    }

    async fn clear(&self) -> Result<()> {
        sqlx::query("TRUNCATE TABLE saga_states")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
