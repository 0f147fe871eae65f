//! In-process wiring of the four participants, the tracker and the broker.

use std::collections::BTreeMap;
use std::sync::Arc;

use messaging::{DeadLetterLog, Dispatcher, InMemoryBroker};
use outbox::{Database, InMemoryRowLock, OutboxPublisher, OutboxStore, PublisherConfig};
use projections::{SagaStateStore, SagaStateTracker};
use resilience::CircuitBreakerRegistry;
use route_planner::{InMemoryHubDirectory, RoutePlanner};
use saga::{DeliveryService, InMemoryPaymentGateway, OrderService, PaymentService, StockService};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;

/// Tracker over whichever saga state store the binary picked.
pub type Tracker = SagaStateTracker<Arc<dyn SagaStateStore>>;

type Publisher<S> = OutboxPublisher<Database<S>, InMemoryRowLock, InMemoryBroker>;

/// Shared state handed to every route.
pub struct AppState {
    pub orders: OrderService,
    pub stock: StockService,
    pub hubs: InMemoryHubDirectory,
    pub planner: Arc<RoutePlanner<InMemoryHubDirectory>>,
    /// Outbox of each service, by service name.
    pub outboxes: BTreeMap<String, Arc<dyn OutboxStore>>,
    pub tracker: Arc<Tracker>,
    pub breakers: CircuitBreakerRegistry,
    pub dead_letters: DeadLetterLog,
    pub stuck_threshold: chrono::Duration,
}

/// Every component of the saga, wired to one in-memory broker.
pub struct System {
    pub broker: InMemoryBroker,
    pub breakers: CircuitBreakerRegistry,
    pub hubs: InMemoryHubDirectory,
    pub planner: Arc<RoutePlanner<InMemoryHubDirectory>>,
    pub gateway: InMemoryPaymentGateway,
    pub order: OrderService,
    pub stock: StockService,
    pub payment: Arc<PaymentService<InMemoryPaymentGateway>>,
    pub delivery: Arc<DeliveryService<InMemoryHubDirectory>>,
    pub tracker: Arc<Tracker>,
    pub dispatcher: Arc<Dispatcher<InMemoryBroker>>,
    lock: InMemoryRowLock,
    publisher_config: PublisherConfig,
    stuck_threshold: chrono::Duration,
}

impl System {
    /// Builds the participants and registers their consumers.
    pub async fn new(config: &Config, saga_states: Arc<dyn SagaStateStore>) -> Self {
        let broker = InMemoryBroker::with_history_limit(config.broker_history_limit);
        let breakers = CircuitBreakerRegistry::new(config.breaker());
        let hubs = InMemoryHubDirectory::new();
        let planner = Arc::new(RoutePlanner::new(hubs.clone(), config.planner()));

        let gateway = InMemoryPaymentGateway::new();
        let order = OrderService::new();
        let stock = StockService::new();
        let payment = Arc::new(PaymentService::new(gateway.clone(), &breakers));
        let delivery = Arc::new(DeliveryService::new(
            planner.clone(),
            config.couriers.clone(),
        ));
        let tracker = Arc::new(SagaStateTracker::new(saga_states));

        let mut dispatcher =
            Dispatcher::new(broker.clone(), DeadLetterLog::new(), config.dispatcher()).await;
        dispatcher.register(Arc::new(order.clone())).await;
        dispatcher.register(Arc::new(stock.clone())).await;
        dispatcher.register(payment.clone()).await;
        dispatcher.register(delivery.clone()).await;
        dispatcher.register(tracker.clone()).await;

        Self {
            broker,
            breakers,
            hubs,
            planner,
            gateway,
            order,
            stock,
            payment,
            delivery,
            tracker,
            dispatcher: Arc::new(dispatcher),
            lock: InMemoryRowLock::new(),
            publisher_config: config.publisher(),
            stuck_threshold: config.stuck_threshold(),
        }
    }

    /// State for the HTTP routes.
    pub fn app_state(&self) -> Arc<AppState> {
        let outboxes: BTreeMap<String, Arc<dyn OutboxStore>> = BTreeMap::from([
            outbox_entry(self.order.database()),
            outbox_entry(self.stock.database()),
            outbox_entry(self.payment.database()),
            outbox_entry(self.delivery.database()),
        ]);
        Arc::new(AppState {
            orders: self.order.clone(),
            stock: self.stock.clone(),
            hubs: self.hubs.clone(),
            planner: self.planner.clone(),
            outboxes,
            tracker: self.tracker.clone(),
            breakers: self.breakers.clone(),
            dead_letters: self.dispatcher.dead_letters().clone(),
            stuck_threshold: self.stuck_threshold,
        })
    }

    fn publisher<S>(&self, db: &Database<S>) -> Publisher<S>
    where
        S: Clone + Send + 'static,
    {
        OutboxPublisher::new(
            db.name(),
            db.clone(),
            self.lock.clone(),
            self.broker.clone(),
            self.breakers.clone(),
            self.publisher_config.clone(),
        )
    }

    /// One publish-then-deliver round across every service.
    /// Returns how many rows and messages moved.
    pub async fn pump(&self) -> usize {
        let mut moved = 0;
        for report in [
            self.publisher(self.order.database()).tick().await,
            self.publisher(self.stock.database()).tick().await,
            self.publisher(self.payment.database()).tick().await,
            self.publisher(self.delivery.database()).tick().await,
        ] {
            match report {
                Ok(report) => moved += report.published,
                Err(e) => tracing::error!(error = %e, "Outbox tick failed"),
            }
        }
        moved + self.dispatcher.drain().await
    }

    /// Starts the publishers and the dispatcher until `shutdown` flips to true.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            tokio::spawn(Arc::new(self.publisher(self.order.database())).run(shutdown.clone())),
            tokio::spawn(Arc::new(self.publisher(self.stock.database())).run(shutdown.clone())),
            tokio::spawn(Arc::new(self.publisher(self.payment.database())).run(shutdown.clone())),
            tokio::spawn(Arc::new(self.publisher(self.delivery.database())).run(shutdown.clone())),
            tokio::spawn(self.dispatcher.clone().run(shutdown)),
        ]
    }
}

fn outbox_entry<S>(db: &Database<S>) -> (String, Arc<dyn OutboxStore>)
where
    S: Clone + Send + 'static,
{
    (db.name().to_string(), Arc::new(db.clone()))
}
