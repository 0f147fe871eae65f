//! Routes broker deliveries to handlers and acts on their [`Delivery`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::broker::{Message, MessageBroker, MessageSource, Received};
use crate::dead_letter::{DeadLetter, DeadLetterLog, HEADER_ATTEMPTS, HEADER_GROUP, HEADER_REASON};
use crate::{Channel, Delivery, EventEnvelope, MessageHandler};

/// Consumer group that reads every dead-letter channel.
pub const DEAD_LETTER_GROUP: &str = "dead-letter-log";

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Deliveries allowed before a retried message is dead-lettered.
    pub max_attempts: u32,
    /// Delay before a retried message becomes visible again.
    pub retry_delay: Duration,
    /// Idle wait between drains when running as a worker.
    pub poll_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_delay: Duration::from_millis(200),
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Delivers messages to consumer groups.
pub struct Dispatcher<B> {
    broker: B,
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    dead_letters: DeadLetterLog,
    config: DispatcherConfig,
}

impl<B> Dispatcher<B>
where
    B: MessageBroker + MessageSource,
{
    /// Creates a dispatcher and subscribes the dead-letter log to every `.DLT` channel.
    pub async fn new(broker: B, dead_letters: DeadLetterLog, config: DispatcherConfig) -> Self {
        for channel in Channel::all_dead_letters() {
            broker.subscribe(DEAD_LETTER_GROUP, channel).await;
        }
        Self {
            broker,
            handlers: HashMap::new(),
            dead_letters,
            config,
        }
    }

    /// Registers a handler under its group name and subscribes it to its topics.
    pub async fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        for topic in handler.topics() {
            self.broker.subscribe(handler.name(), Channel::live(topic)).await;
        }
        tracing::debug!(handler = handler.name(), "Registered message handler");
        self.handlers.insert(handler.name().to_string(), handler);
    }

    /// The dead-letter log this dispatcher writes to.
    pub fn dead_letters(&self) -> &DeadLetterLog {
        &self.dead_letters
    }

    /// Delivers the next ready message. Returns false if none was ready.
    pub async fn dispatch_one(&self) -> bool {
        let Some(received) = self.broker.poll().await else {
            return false;
        };

        if received.message.channel.dead_letter {
            self.dead_letters
                .record(DeadLetter::from_message(&received.message))
                .await;
            return true;
        }

        let Some(handler) = self.handlers.get(&received.group).cloned() else {
            let reason = format!("no handler registered for group {}", received.group);
            self.dead_letter(received, reason).await;
            return true;
        };

        let envelope = match EventEnvelope::decode(&received.message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.dead_letter(received, e.to_string()).await;
                return true;
            }
        };

        let outcome = handler.handle(&envelope).await;
        metrics::counter!(
            "consumer_messages_total",
            "handler" => handler.name().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        match outcome {
            Delivery::Ack => {}
            Delivery::Duplicate => {
                metrics::counter!("consumer_duplicates_total").increment(1);
                tracing::debug!(
                    handler = handler.name(),
                    event_id = %envelope.event_id,
                    "Duplicate delivery acknowledged"
                );
            }
            Delivery::Retry { reason } => {
                if received.attempt >= self.config.max_attempts {
                    self.dead_letter(received, reason).await;
                } else {
                    tracing::warn!(
                        handler = handler.name(),
                        event_id = %envelope.event_id,
                        attempt = received.attempt,
                        %reason,
                        "Handler asked for redelivery"
                    );
                    let mut next = received;
                    next.attempt += 1;
                    self.broker.redeliver(next, self.config.retry_delay).await;
                }
            }
            Delivery::Defer(delay) => {
                tracing::info!(
                    handler = handler.name(),
                    event_id = %envelope.event_id,
                    delay_ms = delay.as_millis() as u64,
                    "Delivery deferred"
                );
                self.broker.redeliver(received, delay).await;
            }
            Delivery::Reject { reason } => {
                self.dead_letter(received, reason).await;
            }
        }
        true
    }

    /// Delivers messages until none is ready. Returns how many were delivered.
    pub async fn drain(&self) -> usize {
        let mut delivered = 0;
        while self.dispatch_one().await {
            delivered += 1;
        }
        delivered
    }

    /// Runs the dispatcher until `shutdown` flips to true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(handlers = self.handlers.len(), "Dispatcher started");
        loop {
            self.drain().await;
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {}
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    async fn dead_letter(&self, received: Received, reason: String) {
        let message = Message::new(
            received.message.channel.topic.dead_letter(),
            received.message.key.clone(),
            received.message.payload.clone(),
        )
        .with_header(HEADER_GROUP, received.group.clone())
        .with_header(HEADER_REASON, reason.clone())
        .with_header(HEADER_ATTEMPTS, received.attempt.to_string());

        if let Err(e) = self.broker.publish(message).await {
            tracing::error!(
                group = %received.group,
                error = %e,
                "Could not publish to dead-letter topic; keeping message"
            );
            self.broker.redeliver(received, self.config.retry_delay).await;
            return;
        }
        tracing::warn!(
            group = %received.group,
            channel = %received.message.channel,
            attempts = received.attempt,
            %reason,
            "Message routed to dead-letter topic"
        );
    }
}
