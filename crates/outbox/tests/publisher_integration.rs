//! Outbox publisher against the in-memory datastore and broker.

use std::sync::Arc;
use std::time::Duration;

use common::OrderId;
use messaging::{Channel, EventEnvelope, InMemoryBroker, SagaEvent, Topic};
use outbox::{
    BROKER_DEPENDENCY, Database, InMemoryRowLock, OutboxPublisher, OutboxStatus, OutboxStore,
    PublisherConfig, RowLock, TickReport,
};
use resilience::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryPolicy};
use uuid::Uuid;

type Publisher = OutboxPublisher<Database<()>, InMemoryRowLock, InMemoryBroker>;

struct TestHarness {
    db: Database<()>,
    lock: InMemoryRowLock,
    broker: InMemoryBroker,
    breakers: CircuitBreakerRegistry,
}

impl TestHarness {
    fn new() -> Self {
        Self {
            db: Database::new("order-service", ()),
            lock: InMemoryRowLock::new(),
            broker: InMemoryBroker::new(),
            breakers: CircuitBreakerRegistry::new(CircuitBreakerConfig {
                failure_threshold: 5,
                success_threshold: 1,
                timeout: Duration::from_secs(30),
            }),
        }
    }

    fn publisher(&self) -> Publisher {
        OutboxPublisher::new(
            "order-service",
            self.db.clone(),
            self.lock.clone(),
            self.broker.clone(),
            self.breakers.clone(),
            PublisherConfig {
                batch_size: 10,
                poll_interval: Duration::from_millis(100),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay: Duration::from_millis(10),
                    max_delay: Duration::from_millis(40),
                },
                sent_retention: Duration::from_secs(3600),
            },
        )
    }

    async fn enqueue(&self, event: SagaEvent) -> Uuid {
        let mut tx = self.db.begin().await;
        let id = tx.enqueue("Order", event.order_id().as_uuid(), event).unwrap();
        tx.commit().await.unwrap();
        id.as_uuid()
    }

    async fn status(&self, id: Uuid) -> OutboxStatus {
        self.db.get(id).await.unwrap().unwrap().status
    }
}

#[tokio::test(start_paused = true)]
async fn publishes_ready_rows_and_marks_them_sent() {
    let harness = TestHarness::new();
    let order_id = OrderId::new();
    let id = harness.enqueue(SagaEvent::order_approved(order_id)).await;

    let report = harness.publisher().tick().await.unwrap();

    assert_eq!(report.published, 1);
    assert_eq!(harness.status(id).await, OutboxStatus::Sent);

    let sent = harness
        .broker
        .published_on(Channel::live(Topic::OrderApprove))
        .await;
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].key, order_id.to_string());
    let envelope = EventEnvelope::decode(&sent[0].payload).unwrap();
    assert_eq!(envelope.event_id.as_uuid(), id);
}

#[tokio::test(start_paused = true)]
async fn transient_broker_failure_is_retried_within_one_attempt() {
    let harness = TestHarness::new();
    let id = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    harness.broker.fail_next_publishes(1).await;

    let report = harness.publisher().tick().await.unwrap();

    assert_eq!(report.published, 1);
    let row = harness.db.get(id).await.unwrap().unwrap();
    assert_eq!(row.status, OutboxStatus::Sent);
    assert_eq!(row.retry_count, 1);
}

#[tokio::test(start_paused = true)]
async fn exhausted_retries_mark_failed_until_requeued() {
    let harness = TestHarness::new();
    let id = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    harness.broker.set_fail_on_publish(true).await;
    let publisher = harness.publisher();

    let report = publisher.tick().await.unwrap();
    assert_eq!(report.failed, 1);

    let failed = harness.db.list_failed().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, id);
    assert_eq!(failed[0].retry_count, 2);
    assert!(failed[0].last_error.as_deref().unwrap().contains("publish rejected"));

    // FAILED rows are not picked up again on their own.
    harness.broker.set_fail_on_publish(false).await;
    assert_eq!(publisher.tick().await.unwrap(), TickReport::default());
    assert_eq!(harness.status(id).await, OutboxStatus::Failed);

    harness.db.requeue(id).await.unwrap();
    assert_eq!(publisher.tick().await.unwrap().published, 1);
    assert_eq!(harness.status(id).await, OutboxStatus::Sent);
}

#[tokio::test(start_paused = true)]
async fn open_breaker_leaves_rows_ready() {
    let harness = TestHarness::new();
    let first = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    let second = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    let breaker = harness.breakers.get(BROKER_DEPENDENCY);
    for _ in 0..5 {
        breaker.record_failure();
    }

    let report = harness.publisher().tick().await.unwrap();

    assert_eq!(report.deferred, 2);
    assert_eq!(harness.status(first).await, OutboxStatus::Ready);
    assert_eq!(harness.status(second).await, OutboxStatus::Ready);
    assert!(harness.broker.published().await.is_empty());

    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(harness.publisher().tick().await.unwrap().published, 2);
}

#[tokio::test(start_paused = true)]
async fn locked_row_is_skipped() {
    let harness = TestHarness::new();
    let id = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    assert!(harness.lock.try_acquire(id).await.unwrap());

    let report = harness.publisher().tick().await.unwrap();

    assert_eq!(report.skipped, 1);
    assert_eq!(harness.status(id).await, OutboxStatus::Ready);
    assert!(harness.broker.published().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_publishers_send_each_row_once() {
    let harness = TestHarness::new();
    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(
            harness
                .enqueue(SagaEvent::order_approved(OrderId::new()))
                .await,
        );
    }

    let a = Arc::new(harness.publisher());
    let b = Arc::new(harness.publisher());
    let (ra, rb) = tokio::join!(
        tokio::spawn({
            let a = a.clone();
            async move { a.tick().await.unwrap() }
        }),
        tokio::spawn({
            let b = b.clone();
            async move { b.tick().await.unwrap() }
        }),
    );
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    assert_eq!(ra.published + rb.published, 20);
    assert_eq!(harness.broker.published().await.len(), 20);
    for id in ids {
        assert_eq!(harness.status(id).await, OutboxStatus::Sent);
    }
}

#[tokio::test(start_paused = true)]
async fn sent_rows_are_pruned_after_retention() {
    let harness = TestHarness::new();
    let kept = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    let publisher = OutboxPublisher::new(
        "order-service",
        harness.db.clone(),
        harness.lock.clone(),
        harness.broker.clone(),
        harness.breakers.clone(),
        PublisherConfig {
            sent_retention: Duration::ZERO,
            ..PublisherConfig::default()
        },
    );
    harness.broker.set_fail_on_publish(true).await;
    let report = publisher.tick().await.unwrap();
    assert_eq!(report.failed, 1);
    harness.broker.set_fail_on_publish(false).await;

    let sent = harness
        .enqueue(SagaEvent::order_approved(OrderId::new()))
        .await;
    assert_eq!(publisher.tick().await.unwrap().published, 1);
    std::thread::sleep(Duration::from_millis(5));
    let report = publisher.tick().await.unwrap();

    assert_eq!(report.pruned, 1);
    assert!(harness.db.get(sent).await.unwrap().is_none());
    assert_eq!(harness.status(kept).await, OutboxStatus::Failed);
    assert_eq!(harness.db.outbox_len().await, 1);
    assert_eq!(harness.broker.published().await.len(), 1);
}
