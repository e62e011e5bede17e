//! An in-process broker with RabbitMQ routing and settlement rules.
//!
//! Connections made through [`InMemoryBroker`] break when the broker is
//! stopped: their channels report disconnected, every operation fails with a
//! channel error and unacked deliveries go back to their queues flagged as
//! redelivered.

use crate::{
    broker::{BrokerChannel, Connector, Delivery, DeliveryStream, Envelope},
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::Notify;
use traces::Headers;

const PREDECLARED_EXCHANGES: [(&str, ExchangeKind); 3] = [
    ("amq.direct", ExchangeKind::Direct),
    ("amq.fanout", ExchangeKind::Fanout),
    ("amq.topic", ExchangeKind::Topic),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    Ack,
    Nack { requeue: bool },
}

/// Declared exchanges, queues and bindings, sorted for comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub exchanges: BTreeSet<String>,
    pub queues: BTreeSet<String>,
    pub bindings: BTreeSet<(String, String, String)>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    headers: Headers,
    content_type: String,
    msg_type: String,
    message_id: String,
    body: Vec<u8>,
    redelivered: bool,
}

impl StoredMessage {
    fn from_envelope(envelope: &Envelope) -> StoredMessage {
        StoredMessage {
            exchange: envelope.exchange.clone(),
            routing_key: envelope.routing_key.clone(),
            headers: envelope.headers.clone(),
            content_type: envelope.content_type.clone(),
            msg_type: envelope.msg_type.clone(),
            message_id: envelope.message_id.clone(),
            body: envelope.body.clone(),
            redelivered: false,
        }
    }

    fn into_delivery(self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            headers: self.headers,
            content_type: self.content_type,
            msg_type: self.msg_type,
            message_id: self.message_id,
            body: self.body,
        }
    }
}

struct MemoryQueue {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
}

struct Unacked {
    queue: String,
    consumer_tag: String,
    message: StoredMessage,
}

struct ConsumerState {
    id: u64,
    prefetch: u16,
    in_flight: u16,
}

#[derive(Default)]
struct BrokerState {
    running: bool,
    generation: u64,
    connect_attempts: usize,
    next_delivery_tag: u64,
    next_consumer_id: u64,
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, MemoryQueue>,
    bindings: HashSet<(String, String, String)>,
    consumers: HashMap<String, ConsumerState>,
    unacked: HashMap<u64, Unacked>,
    published: Vec<Envelope>,
    settlements: Vec<(u64, Settled)>,
}

struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        InMemoryBroker::new()
    }
}

impl InMemoryBroker {
    /// A running broker with the `amq.*` exchanges already declared.
    pub fn new() -> InMemoryBroker {
        let mut state = BrokerState {
            running: true,
            ..Default::default()
        };

        for (name, kind) in PREDECLARED_EXCHANGES {
            state.exchanges.insert(
                name.to_owned(),
                ExchangeDefinition::new(name).kind(kind).durable(),
            );
        }

        InMemoryBroker {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                notify: Notify::new(),
            }),
        }
    }

    /// A channel on the current connection generation, bypassing
    /// [`Connector::connect`].
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        let generation = self.lock().generation;

        Arc::new(MemoryChannel {
            broker: self.clone(),
            generation,
        })
    }

    /// Drops every connection. Unacked deliveries are requeued as redelivered.
    pub fn stop(&self) {
        {
            let mut state = self.lock();
            state.running = false;
            state.generation += 1;
            state.consumers.clear();

            let mut tags: Vec<u64> = state.unacked.keys().copied().collect();
            tags.sort_unstable_by(|a, b| b.cmp(a));

            for tag in tags {
                if let Some(unacked) = state.unacked.remove(&tag) {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                        queue.ready.push_front(message);
                    }
                }
            }
        }

        self.inner.notify.notify_waiters();
    }

    pub fn start(&self) {
        self.lock().running = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn connect_attempts(&self) -> usize {
        self.lock().connect_attempts
    }

    /// Messages waiting in `queue`, not counting unacked ones.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    pub fn queue_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }

    pub fn unacked_len(&self) -> usize {
        self.lock().unacked.len()
    }

    pub fn has_binding(&self, queue: &str, exchange: &str, routing_key: &str) -> bool {
        self.lock().bindings.contains(&(
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ))
    }

    pub fn published(&self) -> Vec<Envelope> {
        self.lock().published.clone()
    }

    pub fn settlements(&self) -> Vec<(u64, Settled)> {
        self.lock().settlements.clone()
    }

    pub fn topology_snapshot(&self) -> TopologySnapshot {
        let state = self.lock();

        TopologySnapshot {
            exchanges: state.exchanges.keys().cloned().collect(),
            queues: state.queues.keys().cloned().collect(),
            bindings: state.bindings.iter().cloned().collect(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.inner.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        let generation = {
            let mut state = self.lock();
            state.connect_attempts += 1;

            if !state.running {
                return Err(AmqpError::ConnectionError(
                    "connection refused".to_owned(),
                ));
            }

            state.generation
        };

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            generation,
        }))
    }
}

struct MemoryChannel {
    broker: InMemoryBroker,
    generation: u64,
}

impl MemoryChannel {
    /// Locks the broker, failing when this channel's connection is gone.
    fn open(&self) -> Result<MutexGuard<'_, BrokerState>, AmqpError> {
        let state = self.broker.lock();

        if !state.running || state.generation != self.generation {
            return Err(AmqpError::ChannelError("channel closed".to_owned()));
        }

        Ok(state)
    }

    fn settle(&self, delivery_tag: u64, settled: Settled) -> Result<(), AmqpError> {
        let failure = match settled {
            Settled::Ack => AmqpError::AckMessageError,
            Settled::Nack { .. } => AmqpError::NackMessageError,
        };

        {
            let mut state = self.open()?;
            let Some(unacked) = state.unacked.remove(&delivery_tag) else {
                return Err(failure);
            };

            if let Some(consumer) = state.consumers.get_mut(&unacked.consumer_tag) {
                consumer.in_flight = consumer.in_flight.saturating_sub(1);
            }

            match settled {
                Settled::Ack => {}
                Settled::Nack { requeue: true } => {
                    let mut message = unacked.message;
                    message.redelivered = true;
                    if let Some(queue) = state.queues.get_mut(&unacked.queue) {
                        queue.ready.push_front(message);
                    }
                }
                Settled::Nack { requeue: false } => {
                    let dlq = state
                        .queues
                        .get(&unacked.queue)
                        .and_then(|q| q.def.dlq_name().map(str::to_owned));

                    if let Some(dlq) = dlq.and_then(|name| state.queues.get_mut(&name)) {
                        let mut message = unacked.message;
                        message.redelivered = false;
                        dlq.ready.push_back(message);
                    }
                }
            }

            state.settlements.push((delivery_tag, settled));
        }

        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    fn next_delivery(&self, queue: &str, consumer_tag: &str) -> NextDelivery {
        let mut state = match self.open() {
            Ok(state) => state,
            Err(err) => return NextDelivery::Closed(err),
        };

        let state = &mut *state;
        let Some(consumer) = state.consumers.get_mut(consumer_tag) else {
            return NextDelivery::Closed(AmqpError::ChannelError("consumer cancelled".to_owned()));
        };

        if consumer.in_flight >= consumer.prefetch {
            return NextDelivery::Pending;
        }

        let Some(message) = state
            .queues
            .get_mut(queue)
            .and_then(|q| q.ready.pop_front())
        else {
            return NextDelivery::Pending;
        };

        consumer.in_flight += 1;
        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;

        state.unacked.insert(
            delivery_tag,
            Unacked {
                queue: queue.to_owned(),
                consumer_tag: consumer_tag.to_owned(),
                message: message.clone(),
            },
        );

        NextDelivery::Ready(message.into_delivery(delivery_tag))
    }
}

/// Cancels its consumer registration when the delivery stream is dropped.
struct Subscription {
    channel: MemoryChannel,
    queue: String,
    consumer_tag: String,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut state = self.channel.broker.lock();

        if state
            .consumers
            .get(&self.consumer_tag)
            .is_some_and(|consumer| consumer.id == self.id)
        {
            state.consumers.remove(&self.consumer_tag);
        }
    }
}

enum NextDelivery {
    Ready(Delivery),
    Pending,
    Closed(AmqpError),
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn is_connected(&self) -> bool {
        self.open().is_ok()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        let mut state = self.open()?;

        if def.is_default() {
            return Ok(());
        }

        match state.exchanges.get(def.name()).cloned() {
            Some(existing) if def.is_reserved() => {
                if existing.exchange_kind() != def.exchange_kind() {
                    return Err(AmqpError::TopologyConflict(def.name().to_owned()));
                }
                Ok(())
            }
            Some(existing) if &existing == def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflict(def.name().to_owned())),
            None if def.is_reserved() => Err(AmqpError::DeclareExchangeError(format!(
                "no exchange '{}'",
                def.name()
            ))),
            None => {
                state.exchanges.insert(def.name().to_owned(), def.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        let mut state = self.open()?;

        match state.queues.get(def.name()).map(|q| q.def.clone()) {
            Some(existing) if &existing == def => Ok(()),
            Some(_) => Err(AmqpError::TopologyConflict(def.name().to_owned())),
            None => {
                state.queues.insert(
                    def.name().to_owned(),
                    MemoryQueue {
                        def: def.clone(),
                        ready: VecDeque::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        let mut state = self.open()?;

        if !state.queues.contains_key(queue) || !state.exchanges.contains_key(exchange) {
            return Err(AmqpError::BindingExchangeToQueueError(
                exchange.to_owned(),
                queue.to_owned(),
            ));
        }

        state.bindings.insert((
            queue.to_owned(),
            exchange.to_owned(),
            routing_key.to_owned(),
        ));
        Ok(())
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        {
            let mut state = self.open()?;

            let targets: Vec<String> = if envelope.exchange.is_empty() {
                state
                    .queues
                    .contains_key(&envelope.routing_key)
                    .then(|| envelope.routing_key.clone())
                    .into_iter()
                    .collect()
            } else {
                let Some(exchange) = state.exchanges.get(&envelope.exchange) else {
                    return Err(AmqpError::PublishingError(format!(
                        "no exchange '{}'",
                        envelope.exchange
                    )));
                };
                let kind = exchange.exchange_kind();

                let mut targets: Vec<String> = state
                    .bindings
                    .iter()
                    .filter(|(_, ex, key)| {
                        ex == &envelope.exchange && routes(kind, key, &envelope.routing_key)
                    })
                    .map(|(queue, _, _)| queue.clone())
                    .collect();
                targets.sort();
                targets.dedup();
                targets
            };

            for target in targets {
                if let Some(queue) = state.queues.get_mut(&target) {
                    queue.ready.push_back(StoredMessage::from_envelope(envelope));
                }
            }

            state.published.push(envelope.clone());
        }

        self.broker.inner.notify.notify_waiters();
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let id = {
            let mut state = self.open()?;

            if !state.queues.contains_key(queue) {
                return Err(AmqpError::ConsumerCreationError(format!(
                    "no queue '{}'",
                    queue
                )));
            }

            if state.consumers.contains_key(consumer_tag) {
                return Err(AmqpError::ConsumerCreationError(format!(
                    "consumer tag '{}' already in use",
                    consumer_tag
                )));
            }

            state.next_consumer_id += 1;
            let id = state.next_consumer_id;
            state.consumers.insert(
                consumer_tag.to_owned(),
                ConsumerState {
                    id,
                    prefetch: prefetch.max(1),
                    in_flight: 0,
                },
            );
            id
        };

        let subscription = Subscription {
            channel: MemoryChannel {
                broker: self.broker.clone(),
                generation: self.generation,
            },
            queue: queue.to_owned(),
            consumer_tag: consumer_tag.to_owned(),
            id,
        };

        let deliveries = stream::unfold(
            (subscription, false),
            |(subscription, closed)| async move {
                if closed {
                    return None;
                }

                loop {
                    let inner = subscription.channel.broker.inner.clone();
                    let notified = inner.notify.notified();

                    match subscription
                        .channel
                        .next_delivery(&subscription.queue, &subscription.consumer_tag)
                    {
                        NextDelivery::Ready(delivery) => {
                            return Some((Ok(delivery), (subscription, false)))
                        }
                        NextDelivery::Closed(err) => {
                            return Some((Err(err), (subscription, true)))
                        }
                        NextDelivery::Pending => notified.await,
                    }
                }
            },
        );

        Ok(deliveries.boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.settle(delivery_tag, Settled::Ack)
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.settle(delivery_tag, Settled::Nack { requeue })
    }
}

fn routes(kind: ExchangeKind, binding_key: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => binding_key == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => {
            let pattern: Vec<&str> = binding_key.split('.').collect();
            let words: Vec<&str> = routing_key.split('.').collect();
            topic_matches(&pattern, &words)
        }
    }
}

fn topic_matches(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| topic_matches(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && topic_matches(rest, &words[1..]),
        Some((word, rest)) => words.first() == Some(word) && topic_matches(rest, &words[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(exchange: &str, routing_key: &str, body: &[u8]) -> Envelope {
        Envelope {
            exchange: exchange.to_owned(),
            routing_key: routing_key.to_owned(),
            body: body.to_vec(),
            ..Default::default()
        }
    }

    async fn queue_bound(channel: &dyn BrokerChannel, queue: &str, exchange: &str, key: &str) {
        channel
            .declare_queue(&QueueDefinition::new(queue))
            .await
            .unwrap();
        channel.bind(queue, exchange, key).await.unwrap();
    }

    #[test]
    fn should_match_topic_patterns() {
        assert!(routes(ExchangeKind::Topic, "orders.*", "orders.checkout"));
        assert!(!routes(ExchangeKind::Topic, "orders.*", "orders.checkout.eu"));
        assert!(routes(ExchangeKind::Topic, "orders.#", "orders.checkout.eu"));
        assert!(routes(ExchangeKind::Topic, "#", "anything.at.all"));
        assert!(routes(ExchangeKind::Topic, "*.checkout", "orders.checkout"));
        assert!(!routes(ExchangeKind::Topic, "user.mailing", "user.billing"));
        assert!(routes(ExchangeKind::Fanout, "ignored", "anything"));
    }

    #[tokio::test]
    async fn should_route_direct_and_default_exchange() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        queue_bound(channel.as_ref(), "notify_user", "amq.direct", "user.mailing").await;

        channel
            .publish(&envelope("amq.direct", "user.mailing", b"a"))
            .await
            .unwrap();
        channel
            .publish(&envelope("amq.direct", "orders.checkout", b"unroutable"))
            .await
            .unwrap();
        channel
            .publish(&envelope("", "notify_user", b"b"))
            .await
            .unwrap();

        assert_eq!(
            broker.queue_bodies("notify_user"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(broker.published().len(), 3);
    }

    #[tokio::test]
    async fn should_refuse_unknown_exchange() {
        let broker = InMemoryBroker::new();

        let result = broker
            .channel()
            .publish(&envelope("missing", "key", b"a"))
            .await;

        assert!(matches!(result, Err(AmqpError::PublishingError(_))));
    }

    #[tokio::test]
    async fn should_respect_prefetch() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        queue_bound(channel.as_ref(), "q", "amq.direct", "k").await;
        for body in [b"1", b"2"] {
            channel.publish(&envelope("amq.direct", "k", body)).await.unwrap();
        }

        let mut deliveries = channel.consume("q", "c1", 1).await.unwrap();
        let first = deliveries.next().await.unwrap().unwrap();

        let second = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            deliveries.next(),
        )
        .await;
        assert!(second.is_err(), "prefetch of one allows a single in-flight delivery");

        channel.ack(first.delivery_tag).await.unwrap();
        let second = deliveries.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"2");
    }

    #[tokio::test]
    async fn should_refuse_consumer_tag_in_use() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        queue_bound(channel.as_ref(), "q", "amq.direct", "k").await;

        let deliveries = channel.consume("q", "c1", 1).await.unwrap();

        assert!(matches!(
            channel.consume("q", "c1", 1).await,
            Err(AmqpError::ConsumerCreationError(_))
        ));
        assert_eq!(broker.consumer_count(), 1);

        drop(deliveries);
        assert_eq!(broker.consumer_count(), 0);
        assert!(channel.consume("q", "c1", 1).await.is_ok());
    }

    #[tokio::test]
    async fn should_reject_double_settlement() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        queue_bound(channel.as_ref(), "q", "amq.direct", "k").await;
        channel.publish(&envelope("amq.direct", "k", b"1")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1", 1).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();

        channel.ack(delivery.delivery_tag).await.unwrap();
        assert_eq!(
            channel.nack(delivery.delivery_tag, true).await,
            Err(AmqpError::NackMessageError)
        );
        assert_eq!(
            broker.settlements(),
            vec![(delivery.delivery_tag, Settled::Ack)]
        );
    }

    #[tokio::test]
    async fn should_requeue_unacked_on_stop() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        queue_bound(channel.as_ref(), "q", "amq.direct", "k").await;
        channel.publish(&envelope("amq.direct", "k", b"1")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1", 1).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        assert!(!delivery.redelivered);

        broker.stop();

        assert!(!channel.is_connected());
        assert!(matches!(
            deliveries.next().await,
            Some(Err(AmqpError::ChannelError(_)))
        ));
        assert!(deliveries.next().await.is_none());
        assert!(channel.ack(delivery.delivery_tag).await.is_err());
        assert_eq!(broker.queue_len("q"), 1);

        broker.start();
        assert!(!channel.is_connected());

        let channel = broker.connect().await.unwrap();
        let mut deliveries = channel.consume("q", "c1", 1).await.unwrap();
        let redelivered = deliveries.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.body, b"1");
    }

    #[tokio::test]
    async fn should_dead_letter_rejected_messages() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        let def = QueueDefinition::new("q").with_dlq();
        channel
            .declare_queue(&def.dead_letter_queue().unwrap())
            .await
            .unwrap();
        channel.declare_queue(&def).await.unwrap();
        channel.publish(&envelope("", "q", b"poison")).await.unwrap();

        let mut deliveries = channel.consume("q", "c1", 1).await.unwrap();
        let delivery = deliveries.next().await.unwrap().unwrap();
        channel.nack(delivery.delivery_tag, false).await.unwrap();

        assert_eq!(broker.queue_len("q"), 0);
        assert_eq!(broker.queue_bodies("q-dlq"), vec![b"poison".to_vec()]);
    }

    #[tokio::test]
    async fn should_refuse_connections_while_stopped() {
        let broker = InMemoryBroker::new();
        broker.stop();

        assert!(broker.connect().await.is_err());
        broker.start();
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_attempts(), 2);
    }
}
