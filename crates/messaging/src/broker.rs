//! Broker ports and the in-process broker.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{MessagingError, Result};
use crate::{Channel, EventEnvelope};

/// A message as it travels through the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub channel: Channel,
    /// Partition key; the order id for saga events.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

impl Message {
    /// Creates a message with no headers.
    pub fn new(channel: Channel, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            channel,
            key: key.into(),
            payload,
            headers: BTreeMap::new(),
        }
    }

    /// Encodes an envelope onto its live topic, keyed by order id.
    pub fn from_envelope(envelope: &EventEnvelope) -> Result<Self> {
        Ok(Self::new(
            Channel::live(envelope.topic()),
            envelope.order_id().to_string(),
            envelope.encode()?,
        ))
    }

    /// Adds a header.
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

/// A message handed to one consumer group.
#[derive(Debug, Clone)]
pub struct Received {
    /// The consumer group the copy belongs to.
    pub group: String,
    pub message: Message,
    /// Delivery attempt, starting at 1.
    pub attempt: u32,
}

/// Producer side of the broker.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publishes a message to every group subscribed to its channel.
    async fn publish(&self, message: Message) -> Result<()>;
}

/// Consumer side of the broker.
///
/// Each subscribed group gets its own copy of every message; a message taken
/// with [`MessageSource::poll`] is acknowledged unless it is handed back with
/// [`MessageSource::redeliver`].
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Subscribes a consumer group to a channel.
    async fn subscribe(&self, group: &str, channel: Channel);

    /// Takes the next message that is ready for delivery.
    async fn poll(&self) -> Option<Received>;

    /// Puts a message back, not to be delivered again before `delay` passes.
    async fn redeliver(&self, received: Received, delay: Duration);
}

/// Published messages the in-memory broker keeps for inspection.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

struct BrokerState {
    subscriptions: HashMap<Channel, Vec<String>>,
    pending: VecDeque<(Instant, Received)>,
    /// Most recent publishes, oldest first, at most `history_limit` long.
    published: VecDeque<Message>,
    history_limit: usize,
    fail_on_publish: bool,
    failures_remaining: u32,
}

impl Default for BrokerState {
    fn default() -> Self {
        Self {
            subscriptions: HashMap::new(),
            pending: VecDeque::new(),
            published: VecDeque::new(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            fail_on_publish: false,
            failures_remaining: 0,
        }
    }
}

/// In-process broker with per-group queues and failure injection.
///
/// Delivery is at-least-once: nothing here deduplicates, so consumers must.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl InMemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a broker that remembers at most `limit` published messages.
    /// Queued deliveries are never dropped.
    pub fn with_history_limit(limit: usize) -> Self {
        let state = BrokerState {
            history_limit: limit,
            ..BrokerState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// Makes every publish fail until reset.
    pub async fn set_fail_on_publish(&self, fail: bool) {
        self.state.lock().await.fail_on_publish = fail;
    }

    /// Makes the next `count` publishes fail.
    pub async fn fail_next_publishes(&self, count: u32) {
        self.state.lock().await.failures_remaining = count;
    }

    /// The most recent accepted messages, in publish order.
    pub async fn published(&self) -> Vec<Message> {
        self.state.lock().await.published.iter().cloned().collect()
    }

    /// Messages accepted on one channel.
    pub async fn published_on(&self, channel: Channel) -> Vec<Message> {
        self.state
            .lock()
            .await
            .published
            .iter()
            .filter(|m| m.channel == channel)
            .cloned()
            .collect()
    }

    /// Number of deliveries still queued, including parked ones.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;

        if state.fail_on_publish {
            return Err(MessagingError::BrokerUnavailable(
                "publish rejected".to_string(),
            ));
        }
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(MessagingError::BrokerUnavailable(
                "transient publish failure".to_string(),
            ));
        }

        let now = Instant::now();
        let groups = state
            .subscriptions
            .get(&message.channel)
            .cloned()
            .unwrap_or_default();
        for group in groups {
            state.pending.push_back((
                now,
                Received {
                    group,
                    message: message.clone(),
                    attempt: 1,
                },
            ));
        }
        if state.history_limit > 0 {
            if state.published.len() == state.history_limit {
                state.published.pop_front();
            }
            state.published.push_back(message);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageSource for InMemoryBroker {
    async fn subscribe(&self, group: &str, channel: Channel) {
        let mut state = self.state.lock().await;
        let groups = state.subscriptions.entry(channel).or_default();
        if !groups.iter().any(|g| g == group) {
            groups.push(group.to_string());
        }
    }

    async fn poll(&self) -> Option<Received> {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let index = state
            .pending
            .iter()
            .position(|(not_before, _)| *not_before <= now)?;
        state.pending.remove(index).map(|(_, received)| received)
    }

    async fn redeliver(&self, received: Received, delay: Duration) {
        let mut state = self.state.lock().await;
        state.pending.push_back((Instant::now() + delay, received));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Topic;

    fn message(topic: Topic) -> Message {
        Message::new(Channel::live(topic), "key", b"{}".to_vec())
    }

    #[tokio::test]
    async fn publish_fans_out_to_each_group() {
        let broker = InMemoryBroker::new();
        broker.subscribe("payment", Channel::live(Topic::OrderCreated)).await;
        broker.subscribe("stock", Channel::live(Topic::OrderCreated)).await;

        broker.publish(message(Topic::OrderCreated)).await.unwrap();

        let mut groups = vec![
            broker.poll().await.unwrap().group,
            broker.poll().await.unwrap().group,
        ];
        groups.sort();
        assert_eq!(groups, vec!["payment", "stock"]);
        assert!(broker.poll().await.is_none());
    }

    #[tokio::test]
    async fn unsubscribed_channel_is_recorded_but_not_queued() {
        let broker = InMemoryBroker::new();
        broker.publish(message(Topic::StockConfirmed)).await.unwrap();

        assert_eq!(broker.published().await.len(), 1);
        assert_eq!(broker.pending_count().await, 0);
    }

    #[tokio::test]
    async fn history_keeps_only_the_latest_messages() {
        let broker = InMemoryBroker::with_history_limit(2);
        broker.subscribe("g", Channel::live(Topic::OrderCreated)).await;
        for key in ["a", "b", "c"] {
            broker
                .publish(Message::new(Channel::live(Topic::OrderCreated), key, b"{}".to_vec()))
                .await
                .unwrap();
        }

        let keys: Vec<_> = broker.published().await.into_iter().map(|m| m.key).collect();
        assert_eq!(keys, vec!["b", "c"]);
        assert_eq!(broker.pending_count().await, 3);

        let silent = InMemoryBroker::with_history_limit(0);
        silent.publish(message(Topic::OrderCreated)).await.unwrap();
        assert!(silent.published().await.is_empty());
    }

    #[tokio::test]
    async fn injected_failures_reject_publish() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(1).await;

        assert!(broker.publish(message(Topic::OrderCreated)).await.is_err());
        assert!(broker.publish(message(Topic::OrderCreated)).await.is_ok());

        broker.set_fail_on_publish(true).await;
        assert!(broker.publish(message(Topic::OrderCreated)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_message_waits_for_delay() {
        let broker = InMemoryBroker::new();
        broker.subscribe("g", Channel::live(Topic::OrderCreated)).await;
        broker.publish(message(Topic::OrderCreated)).await.unwrap();

        let received = broker.poll().await.unwrap();
        broker.redeliver(received, Duration::from_secs(5)).await;
        assert!(broker.poll().await.is_none());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(broker.poll().await.is_some());
    }
}
