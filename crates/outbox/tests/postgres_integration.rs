//! PostgreSQL integration tests
//!
//! These tests need Docker and share one PostgreSQL container. Run with:
//!
//! ```bash
//! cargo test -p outbox --test postgres_integration -- --ignored --test-threads=1
//! ```

use std::sync::Arc;

use common::{EventId, OrderId};
use messaging::SagaEvent;
use outbox::{
    OutboxStatus, OutboxStore, PostgresLedger, PostgresOutboxStore, PostgresRowLock, RowLock,
    StoreError,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();
            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_saga_substrate.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn get_test_pool() -> PgPool {
    let info = get_container_info().await;
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();
    sqlx::query("TRUNCATE TABLE processed_events, outbox_events")
        .execute(&pool)
        .await
        .unwrap();
    pool
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn ledger_and_outbox_commit_together() {
    let pool = get_test_pool().await;
    let store = PostgresOutboxStore::new(pool.clone());
    let event_id = EventId::new();
    let order_id = OrderId::new();

    let mut tx = pool.begin().await.unwrap();
    PostgresLedger::mark_processed(&mut tx, event_id, "OrderCreated")
        .await
        .unwrap();
    PostgresLedger::enqueue(
        &mut tx,
        "Payment",
        order_id.as_uuid(),
        SagaEvent::payment_approval_failed(order_id, "declined"),
    )
    .await
    .unwrap();
    tx.commit().await.unwrap();

    let mut conn = pool.acquire().await.unwrap();
    assert!(PostgresLedger::has_processed(&mut conn, event_id).await.unwrap());
    let ready = store.fetch_ready(10).await.unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].aggregate_id, order_id.as_uuid());
    assert_eq!(ready[0].status, OutboxStatus::Ready);
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn rolled_back_transaction_leaves_no_outbox_row() {
    let pool = get_test_pool().await;
    let store = PostgresOutboxStore::new(pool.clone());
    let order_id = OrderId::new();

    let mut tx = pool.begin().await.unwrap();
    PostgresLedger::enqueue(
        &mut tx,
        "Order",
        order_id.as_uuid(),
        SagaEvent::order_approved(order_id),
    )
    .await
    .unwrap();
    tx.rollback().await.unwrap();

    assert!(store.fetch_ready(10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn duplicate_ledger_insert_is_unique_violation() {
    let pool = get_test_pool().await;
    let event_id = EventId::new();
    let mut conn = pool.acquire().await.unwrap();

    PostgresLedger::mark_processed(&mut conn, event_id, "OrderCreated")
        .await
        .unwrap();
    let err = PostgresLedger::mark_processed(&mut conn, event_id, "OrderCreated")
        .await
        .unwrap_err();

    assert!(err.is_duplicate());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn status_transitions_and_requeue() {
    let pool = get_test_pool().await;
    let store = PostgresOutboxStore::new(pool.clone());
    let order_id = OrderId::new();
    let mut conn = pool.acquire().await.unwrap();
    let sent = PostgresLedger::enqueue(
        &mut conn,
        "Order",
        order_id.as_uuid(),
        SagaEvent::order_approved(order_id),
    )
    .await
    .unwrap()
    .as_uuid();
    let failed = PostgresLedger::enqueue(
        &mut conn,
        "Order",
        order_id.as_uuid(),
        SagaEvent::order_cancelled(order_id, "test"),
    )
    .await
    .unwrap()
    .as_uuid();

    store.mark_sent(sent, 0).await.unwrap();
    assert!(matches!(
        store.mark_sent(sent, 0).await,
        Err(StoreError::InvalidTransition { .. })
    ));

    store.mark_failed(failed, 2, "broker down").await.unwrap();
    let listed = store.list_failed().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].retry_count, 2);
    assert_eq!(listed[0].last_error.as_deref(), Some("broker down"));

    let requeued = store.requeue(failed).await.unwrap();
    assert_eq!(requeued.status, OutboxStatus::Ready);
    assert!(matches!(
        store.requeue(Uuid::new_v4()).await,
        Err(StoreError::NotFound(_))
    ));

    let cutoff = chrono::Utc::now() + chrono::Duration::seconds(5);
    assert!(store.prune_sent(cutoff).await.unwrap() >= 1);
    assert!(store.get(sent).await.unwrap().is_none());
    assert!(store.get(failed).await.unwrap().is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
#[serial]
async fn advisory_lock_is_exclusive_across_instances() {
    let pool = get_test_pool().await;
    let a = PostgresRowLock::new(pool.clone());
    let b = PostgresRowLock::new(pool.clone());
    let key = Uuid::new_v4();

    assert!(a.try_acquire(key).await.unwrap());
    assert!(!b.try_acquire(key).await.unwrap());

    a.release(key).await.unwrap();
    assert!(b.try_acquire(key).await.unwrap());
    b.release(key).await.unwrap();
}
