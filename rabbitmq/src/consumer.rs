use crate::{
    broker::{
        BrokerChannel, Delivery, MESSAGING_DESTINATION_ATTRIBUTE, MESSAGING_MESSAGE_ID_ATTRIBUTE,
        MESSAGING_OPERATION_ATTRIBUTE, MESSAGING_ROUTING_KEY_ATTRIBUTE, MESSAGING_SYSTEM,
        MESSAGING_SYSTEM_ATTRIBUTE,
    },
    errors::AmqpError,
    supervisor::{ConnectionSupervisor, Session},
    topology::{self, Topology},
};
use futures_util::StreamExt;
use messaging::{
    errors::MessagingError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use std::sync::Arc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use traces::{propagation, KeyValue, SpanKind, Status, Tracer};
use uuid::Uuid;

pub const DEFAULT_PREFETCH: u16 = 1;
pub const MESSAGING_REDELIVERED_ATTRIBUTE: &str = "messaging.rabbitmq.redelivered";

/// What happens to a delivery whose handler failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Back to the queue for another attempt.
    #[default]
    Requeue,
    /// Rejected without requeue, into the dead-letter queue when there is one.
    DeadLetter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Requeue,
    Reject,
}

impl Settlement {
    /// A failed delivery is never acked. Undecodable payloads are rejected
    /// whatever the policy, they would fail again on every redelivery.
    pub fn of(result: &Result<(), MessagingError>, policy: FailurePolicy) -> Settlement {
        match (result, policy) {
            (Ok(()), _) => Settlement::Ack,
            (Err(MessagingError::InvalidPayload(_)), _) => Settlement::Reject,
            (Err(_), FailurePolicy::Requeue) => Settlement::Requeue,
            (Err(_), FailurePolicy::DeadLetter) => Settlement::Reject,
        }
    }
}

/// A single sequential consume loop over one queue.
pub struct RabbitMQConsumer {
    supervisor: Arc<ConnectionSupervisor>,
    tracer: Tracer,
    topology: Topology,
    handler: Arc<dyn ConsumerHandler>,
    prefetch: u16,
    policy: FailurePolicy,
    consumer_tag: String,
    cancellation: CancellationToken,
}

impl RabbitMQConsumer {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        tracer: Tracer,
        topology: Topology,
        handler: Arc<dyn ConsumerHandler>,
    ) -> RabbitMQConsumer {
        let cancellation = supervisor.cancellation_token().child_token();
        let consumer_tag = format!("{}-{}", topology.queue_name(), Uuid::new_v4());

        RabbitMQConsumer {
            supervisor,
            tracer,
            topology,
            handler,
            prefetch: DEFAULT_PREFETCH,
            policy: FailurePolicy::default(),
            consumer_tag,
            cancellation,
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn consumer_tag<T: Into<String>>(mut self, consumer_tag: T) -> Self {
        self.consumer_tag = consumer_tag.into();
        self
    }

    /// Replaces the stop signal. The default one is a child of the
    /// supervisor's shutdown token.
    pub fn cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    /// Consumes until cancelled or shut down, resubscribing after every
    /// reconnect. Only fatal errors end the loop with `Err`.
    pub async fn run(&self) -> Result<(), MessagingError> {
        let queue = self.topology.queue_name();
        info!(queue, consumer_tag = self.consumer_tag, "starting consumer");

        loop {
            let session = tokio::select! {
                _ = self.cancellation.cancelled() => break,
                session = self.supervisor.acquire_session() => match session {
                    Ok(session) => session,
                    Err(AmqpError::ConnectionTerminated) => break,
                    Err(err) => return Err(err.into()),
                },
            };

            let err = match self.consume_session(&session).await {
                Ok(()) => break,
                Err(err) => err,
            };

            if err.is_fatal() {
                error!(queue, error = err.to_string(), "consumer stopped on fatal error");
                return Err(err.into());
            }

            warn!(
                queue,
                error = err.to_string(),
                session = session.id(),
                "consumer interrupted, resubscribing"
            );
            self.supervisor.report_failure(&session);

            if !err.is_connection_error() {
                let delay = self.supervisor.backoff().delay(0);
                tokio::select! {
                    _ = self.cancellation.cancelled() => break,
                    _ = time::sleep(delay) => {}
                }
            }
        }

        info!(queue, consumer_tag = self.consumer_tag, "consumer stopped");
        Ok(())
    }

    /// Subscribes on `session` and processes deliveries one by one.
    /// Returns `Ok` only on cancellation.
    async fn consume_session(&self, session: &Session) -> Result<(), AmqpError> {
        let channel = session.channel();
        topology::ensure(&self.topology, channel.as_ref()).await?;

        let mut deliveries = channel
            .consume(self.topology.queue_name(), &self.consumer_tag, self.prefetch)
            .await?;

        debug!(
            queue = self.topology.queue_name(),
            session = session.id(),
            prefetch = self.prefetch,
            "subscribed"
        );

        loop {
            let delivery = tokio::select! {
                biased;

                _ = self.cancellation.cancelled() => return Ok(()),
                _ = session.lost().cancelled() => {
                    return Err(AmqpError::ChannelError("session lost".to_owned()));
                }
                next = deliveries.next() => match next {
                    Some(Ok(delivery)) => delivery,
                    Some(Err(err)) => return Err(err),
                    None => {
                        return Err(AmqpError::ChannelError("delivery stream closed".to_owned()));
                    }
                },
            };

            self.process(channel.as_ref(), delivery).await?;
        }
    }

    /// Runs the handler under a consumer span and settles the delivery once.
    async fn process(
        &self,
        channel: &dyn BrokerChannel,
        delivery: Delivery,
    ) -> Result<(), AmqpError> {
        let queue = self.topology.queue_name();
        let parent = propagation::decode(&delivery.headers);

        let mut span =
            self.tracer
                .start_with_parent(queue.to_owned(), SpanKind::Consumer, parent.as_ref());
        span.set_attributes([
            KeyValue::new(MESSAGING_SYSTEM_ATTRIBUTE, MESSAGING_SYSTEM),
            KeyValue::new(MESSAGING_DESTINATION_ATTRIBUTE, queue.to_owned()),
            KeyValue::new(MESSAGING_ROUTING_KEY_ATTRIBUTE, delivery.routing_key.clone()),
            KeyValue::new(MESSAGING_OPERATION_ATTRIBUTE, "process"),
            KeyValue::new(MESSAGING_MESSAGE_ID_ATTRIBUTE, delivery.message_id.clone()),
            KeyValue::new(MESSAGING_REDELIVERED_ATTRIBUTE, delivery.redelivered),
        ]);

        debug!(
            trace.id = span.trace_id(),
            span.id = span.span_id(),
            linked = parent.is_some(),
            redelivered = delivery.redelivered,
            "received: {} - exchange: {}",
            delivery.msg_type,
            delivery.exchange,
        );

        let msg = ConsumerMessage::new(
            queue,
            delivery.msg_type.as_str(),
            &delivery.body,
            delivery.headers,
        )
        .routing_key(delivery.routing_key)
        .redelivered(delivery.redelivered);

        let result = self.handler.exec(&mut span, &msg).await;
        let settlement = Settlement::of(&result, self.policy);

        if let Err(err) = &result {
            warn!(
                trace.id = span.trace_id(),
                span.id = span.span_id(),
                error = err.to_string(),
                ?settlement,
                "error handling message"
            );
            span.record_error(err);
        }

        let settled = match settlement {
            Settlement::Ack => channel.ack(delivery.delivery_tag).await,
            Settlement::Requeue => channel.nack(delivery.delivery_tag, true).await,
            Settlement::Reject => channel.nack(delivery.delivery_tag, false).await,
        };

        match &settled {
            Ok(()) => {
                if result.is_ok() {
                    span.set_status(Status::Ok);
                }
                debug!(
                    trace.id = span.trace_id(),
                    span.id = span.span_id(),
                    ?settlement,
                    "message settled"
                );
            }
            Err(err) => {
                error!(
                    trace.id = span.trace_id(),
                    span.id = span.span_id(),
                    error = err.to_string(),
                    ?settlement,
                    "failure to settle message"
                );
                span.record_error(err);
            }
        }

        span.end();
        settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Envelope, JSON_CONTENT_TYPE},
        exchange::ExchangeDefinition,
        memory::{InMemoryBroker, Settled},
        publisher::RabbitMQPublisher,
        queue::QueueDefinition,
        supervisor::BackoffPolicy,
    };
    use async_trait::async_trait;
    use messaging::{
        publisher::{PublishMessage, Publisher},
        MockConsumerHandler,
    };
    use opentelemetry::trace::SpanId;
    use serde::{Deserialize, Serialize};
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };
    use tokio::{sync::mpsc, task::JoinHandle};
    use traces::{exporters::InMemoryExporter, CausalContext, Headers, Span};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Event {
        id: u64,
        user_id: u64,
    }

    struct Received {
        msg: ConsumerMessage,
        ctx: CausalContext,
        parent: Option<SpanId>,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Received>,
    }

    #[async_trait]
    impl ConsumerHandler for Recorder {
        async fn exec(&self, span: &mut Span, msg: &ConsumerMessage) -> Result<(), MessagingError> {
            msg.decode::<Event>()?;
            let _ = self.tx.send(Received {
                msg: msg.clone(),
                ctx: span.context(),
                parent: span.parent_span_id(),
            });
            Ok(())
        }
    }

    /// Drops the broker connection while handling the first delivery.
    struct Flaky {
        broker: InMemoryBroker,
        calls: AtomicUsize,
        tx: mpsc::UnboundedSender<bool>,
    }

    #[async_trait]
    impl ConsumerHandler for Flaky {
        async fn exec(&self, _span: &mut Span, msg: &ConsumerMessage) -> Result<(), MessagingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.broker.stop();
                self.broker.start();
            }
            let _ = self.tx.send(msg.redelivered);
            Ok(())
        }
    }

    struct Fixture {
        broker: InMemoryBroker,
        supervisor: Arc<ConnectionSupervisor>,
        tracer: Tracer,
        exporter: InMemoryExporter,
    }

    impl Fixture {
        fn new() -> Fixture {
            let broker = InMemoryBroker::new();
            let exporter = InMemoryExporter::default();
            let supervisor = ConnectionSupervisor::new(
                Arc::new(broker.clone()),
                BackoffPolicy::default(),
                Duration::from_millis(50),
            );
            supervisor.spawn();

            Fixture {
                broker,
                supervisor,
                tracer: Tracer::new("relay", Arc::new(exporter.clone())),
                exporter,
            }
        }

        fn consumer(&self, topology: Topology, handler: Arc<dyn ConsumerHandler>) -> RabbitMQConsumer {
            RabbitMQConsumer::new(self.supervisor.clone(), self.tracer.clone(), topology, handler)
        }

        /// Waits for the consumer to subscribe, then publishes straight to
        /// `queue` through the default exchange.
        async fn publish_raw(&self, queue: &str, body: &[u8], headers: Headers) {
            self.eventually(|b| b.consumer_count() == 1).await;
            self.supervisor
                .acquire_channel()
                .await
                .unwrap()
                .publish(&Envelope {
                    routing_key: queue.to_owned(),
                    headers,
                    content_type: JSON_CONTENT_TYPE.to_owned(),
                    body: body.to_vec(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        async fn eventually<F: Fn(&InMemoryBroker) -> bool>(&self, condition: F) {
            time::timeout(Duration::from_secs(5), async {
                while !condition(&self.broker) {
                    time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("condition not reached in time");
        }
    }

    fn spawn(consumer: RabbitMQConsumer) -> JoinHandle<Result<(), MessagingError>> {
        tokio::spawn(async move { consumer.run().await })
    }

    fn notify_user() -> Topology {
        Topology::new(
            ExchangeDefinition::new("amq.direct").direct().durable(),
            QueueDefinition::new("notify_user").durable().with_dlq(),
            "user.mailing",
        )
    }

    fn orders() -> Topology {
        Topology::queue_only(QueueDefinition::new("changebalance_orders").durable().with_dlq())
    }

    #[test]
    fn should_never_ack_a_failure() {
        let failure = Err(MessagingError::HandlerFailure("boom".to_owned()));
        let poison = Err(MessagingError::InvalidPayload("eof".to_owned()));

        assert_eq!(Settlement::of(&Ok(()), FailurePolicy::Requeue), Settlement::Ack);
        assert_eq!(Settlement::of(&failure, FailurePolicy::Requeue), Settlement::Requeue);
        assert_eq!(Settlement::of(&failure, FailurePolicy::DeadLetter), Settlement::Reject);
        assert_eq!(Settlement::of(&poison, FailurePolicy::Requeue), Settlement::Reject);
    }

    #[tokio::test]
    async fn should_link_consumer_span_to_publisher_span() {
        let fixture = Fixture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = spawn(fixture.consumer(notify_user(), Arc::new(Recorder { tx })));

        let publisher = RabbitMQPublisher::new(fixture.supervisor.clone(), fixture.tracer.clone())
            .topology(notify_user());
        let msg = PublishMessage::json("amq.direct", "user.mailing", &Event { id: 1, user_id: 2 })
            .unwrap();
        publisher.publish(None, &msg).await.unwrap();

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received.msg.decode::<Event>(),
            Ok(Event { id: 1, user_id: 2 })
        );
        assert_eq!(received.msg.from, "notify_user");
        assert_eq!(received.msg.routing_key, "user.mailing");

        let producer = fixture
            .exporter
            .finished()
            .into_iter()
            .find(|s| s.kind == SpanKind::Producer)
            .unwrap();
        assert_eq!(received.ctx.trace_id(), producer.trace_id);
        assert_eq!(received.parent, Some(producer.span_id));

        fixture.eventually(|b| b.settlements().len() == 1).await;
        assert!(matches!(fixture.broker.settlements()[0], (_, Settled::Ack)));

        fixture.supervisor.shutdown();
        assert_eq!(consumer.await.unwrap(), Ok(()));

        let consumer_span = fixture
            .exporter
            .finished()
            .into_iter()
            .find(|s| s.kind == SpanKind::Consumer)
            .unwrap();
        assert_eq!(consumer_span.status, Status::Ok);
        assert_eq!(consumer_span.parent_span_id, Some(producer.span_id));
    }

    #[tokio::test]
    async fn should_open_root_span_without_trace_headers() {
        let fixture = Fixture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = spawn(fixture.consumer(orders(), Arc::new(Recorder { tx })));

        fixture
            .publish_raw("changebalance_orders", br#"{"id":1,"user_id":2}"#, Headers::new())
            .await;

        let received = rx.recv().await.unwrap();
        assert_eq!(received.parent, None);
        assert!(received.ctx.is_valid());

        fixture.eventually(|b| b.settlements().len() == 1).await;
        assert!(matches!(fixture.broker.settlements()[0], (_, Settled::Ack)));

        fixture.supervisor.shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn should_requeue_failed_message_for_redelivery() {
        let fixture = Fixture::new();
        let mut handler = MockConsumerHandler::new();
        let mut seq = mockall::Sequence::new();
        handler
            .expect_exec()
            .withf(|_, msg| !msg.redelivered)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Err(MessagingError::HandlerFailure("db down".to_owned())));
        handler
            .expect_exec()
            .withf(|_, msg| msg.redelivered)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        let consumer = spawn(fixture.consumer(orders(), Arc::new(handler)));

        fixture
            .publish_raw("changebalance_orders", br#"{"id":1,"user_id":2}"#, Headers::new())
            .await;

        fixture.eventually(|b| b.settlements().len() == 2).await;
        let settlements: Vec<Settled> =
            fixture.broker.settlements().into_iter().map(|(_, s)| s).collect();
        assert_eq!(
            settlements,
            vec![Settled::Nack { requeue: true }, Settled::Ack]
        );

        fixture.supervisor.shutdown();
        consumer.await.unwrap().unwrap();

        let spans = fixture.exporter.finished();
        assert_eq!(spans.len(), 2);
        assert!(matches!(spans[0].status, Status::Error { .. }));
        assert_eq!(spans[1].status, Status::Ok);
    }

    #[tokio::test]
    async fn should_run_competing_consumers_on_one_queue() {
        let fixture = Fixture::new();
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().times(2).returning(|_, _| Ok(()));
        let handler: Arc<dyn ConsumerHandler> = Arc::new(handler);

        let first = spawn(fixture.consumer(orders(), handler.clone()));
        let second = spawn(fixture.consumer(orders(), handler));

        fixture.eventually(|b| b.consumer_count() == 2).await;

        let channel = fixture.supervisor.acquire_channel().await.unwrap();
        for _ in 0..2 {
            channel
                .publish(&Envelope {
                    routing_key: "changebalance_orders".to_owned(),
                    content_type: JSON_CONTENT_TYPE.to_owned(),
                    body: br#"{"id":1,"user_id":2}"#.to_vec(),
                    ..Default::default()
                })
                .await
                .unwrap();
        }

        fixture.eventually(|b| b.settlements().len() == 2).await;
        assert!(fixture
            .broker
            .settlements()
            .iter()
            .all(|(_, settled)| *settled == Settled::Ack));

        fixture.supervisor.shutdown();
        assert_eq!(first.await.unwrap(), Ok(()));
        assert_eq!(second.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn should_dead_letter_poison_messages() {
        let fixture = Fixture::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let consumer = spawn(fixture.consumer(orders(), Arc::new(Recorder { tx })));

        fixture
            .publish_raw("changebalance_orders", b"not json", Headers::new())
            .await;

        fixture
            .eventually(|b| b.queue_len("changebalance_orders-dlq") == 1)
            .await;
        assert_eq!(
            fixture.broker.settlements()[0].1,
            Settled::Nack { requeue: false }
        );
        assert_eq!(fixture.broker.queue_len("changebalance_orders"), 0);

        fixture.supervisor.shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn should_dead_letter_failures_when_configured() {
        let fixture = Fixture::new();
        let mut handler = MockConsumerHandler::new();
        handler
            .expect_exec()
            .times(1)
            .returning(|_, _| Err(MessagingError::HandlerFailure("boom".to_owned())));
        let consumer = spawn(
            fixture
                .consumer(orders(), Arc::new(handler))
                .failure_policy(FailurePolicy::DeadLetter),
        );

        fixture
            .publish_raw("changebalance_orders", br#"{"id":1,"user_id":2}"#, Headers::new())
            .await;

        fixture
            .eventually(|b| b.queue_len("changebalance_orders-dlq") == 1)
            .await;

        fixture.supervisor.shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn should_redeliver_after_connection_loss_and_settle_once() {
        let fixture = Fixture::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Flaky {
            broker: fixture.broker.clone(),
            calls: AtomicUsize::new(0),
            tx,
        };
        let consumer = spawn(fixture.consumer(orders(), Arc::new(handler)));

        fixture
            .publish_raw("changebalance_orders", br#"{"id":1,"user_id":2}"#, Headers::new())
            .await;

        assert_eq!(rx.recv().await, Some(false));
        assert_eq!(rx.recv().await, Some(true));

        fixture.eventually(|b| b.settlements().len() == 1).await;
        assert!(matches!(fixture.broker.settlements()[0], (_, Settled::Ack)));
        assert_eq!(fixture.broker.unacked_len(), 0);
        assert!(fixture.broker.connect_attempts() >= 2);

        fixture.supervisor.shutdown();
        consumer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn should_stop_on_cancellation_without_settling() {
        let fixture = Fixture::new();
        let token = CancellationToken::new();
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().never();
        let consumer = spawn(
            fixture
                .consumer(orders(), Arc::new(handler))
                .cancellation(token.clone()),
        );

        fixture.eventually(|b| b.consumer_count() == 1).await;
        token.cancel();

        assert_eq!(consumer.await.unwrap(), Ok(()));
        assert!(fixture.broker.settlements().is_empty());
        fixture.supervisor.shutdown();
    }

    #[tokio::test]
    async fn should_fail_on_topology_conflict() {
        let fixture = Fixture::new();
        fixture
            .supervisor
            .acquire_channel()
            .await
            .unwrap()
            .declare_queue(&QueueDefinition::new("changebalance_orders"))
            .await
            .unwrap();
        let mut handler = MockConsumerHandler::new();
        handler.expect_exec().never();

        let result = fixture
            .consumer(orders(), Arc::new(handler))
            .run()
            .await;

        assert_eq!(
            result,
            Err(MessagingError::TopologyConflict(
                "changebalance_orders".to_owned()
            ))
        );
        fixture.supervisor.shutdown();
    }
}
