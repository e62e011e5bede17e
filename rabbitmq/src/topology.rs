use crate::{
    broker::BrokerChannel, errors::AmqpError, exchange::ExchangeDefinition,
    queue::QueueDefinition,
};
use tracing::debug;

/// An exchange, a queue and the binding between them.
///
/// ```rust,no_run
/// use rabbitmq::{exchange::ExchangeDefinition, queue::QueueDefinition, topology::Topology};
///
/// let topology = Topology::new(
///     ExchangeDefinition::new("amq.direct").direct().durable(),
///     QueueDefinition::new("notify_user").durable().with_dlq(),
///     "user.mailing",
/// );
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topology {
    exchange: ExchangeDefinition,
    queue: QueueDefinition,
    binding_key: String,
}

impl Topology {
    pub fn new<T: Into<String>>(
        exchange: ExchangeDefinition,
        queue: QueueDefinition,
        binding_key: T,
    ) -> Topology {
        Topology {
            exchange,
            queue,
            binding_key: binding_key.into(),
        }
    }

    /// A queue reached through the default exchange by its own name.
    pub fn queue_only(queue: QueueDefinition) -> Topology {
        let binding_key = queue.name.clone();

        Topology {
            exchange: ExchangeDefinition::default_exchange(),
            queue,
            binding_key,
        }
    }

    pub fn exchange(&self) -> &ExchangeDefinition {
        &self.exchange
    }

    pub fn queue(&self) -> &QueueDefinition {
        &self.queue
    }

    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }

    pub fn binding_key(&self) -> &str {
        &self.binding_key
    }

    /// What a publisher addresses: the exchange, or the queue itself when
    /// going through the default exchange.
    pub fn destination(&self) -> &str {
        if self.exchange.is_default() {
            return self.queue.name();
        }

        self.exchange.name()
    }
}

/// Declares exchange, dead-letter queue, queue and binding, in that order.
///
/// Every step is idempotent on the broker, so this is called again after
/// each reconnect. The default exchange is neither declared nor bound.
pub async fn ensure(topology: &Topology, channel: &dyn BrokerChannel) -> Result<(), AmqpError> {
    let exchange = &topology.exchange;

    if !exchange.is_default() {
        channel.declare_exchange(exchange).await?;
    }

    if let Some(dlq) = topology.queue.dead_letter_queue() {
        channel.declare_queue(&dlq).await?;
    }

    channel.declare_queue(&topology.queue).await?;

    if !exchange.is_default() {
        channel
            .bind(
                topology.queue.name(),
                exchange.name(),
                &topology.binding_key,
            )
            .await?;
    }

    debug!(
        exchange = exchange.name(),
        queue = topology.queue.name(),
        binding_key = topology.binding_key,
        "topology ensured"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        broker::{Envelope, MockBrokerChannel},
        memory::InMemoryBroker,
    };
    use mockall::Sequence;

    fn notify_user() -> Topology {
        Topology::new(
            ExchangeDefinition::new("amq.direct").direct().durable(),
            QueueDefinition::new("notify_user").durable().with_dlq(),
            "user.mailing",
        )
    }

    #[tokio::test]
    async fn should_declare_in_order() {
        let mut channel = MockBrokerChannel::new();
        let mut seq = Sequence::new();

        channel
            .expect_declare_exchange()
            .withf(|def| def.name() == "amq.direct")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "notify_user-dlq")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_declare_queue()
            .withf(|def| def.name() == "notify_user")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        channel
            .expect_bind()
            .withf(|queue, exchange, key| {
                queue.to_string() == "notify_user"
                    && exchange.to_string() == "amq.direct"
                    && key.to_string() == "user.mailing"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        assert!(ensure(&notify_user(), &channel).await.is_ok());
    }

    #[tokio::test]
    async fn should_skip_default_exchange() {
        let mut channel = MockBrokerChannel::new();

        channel.expect_declare_exchange().never();
        channel.expect_bind().never();
        channel
            .expect_declare_queue()
            .times(1)
            .returning(|_| Ok(()));

        let topology = Topology::queue_only(QueueDefinition::new("changebalance_orders"));

        assert_eq!(topology.destination(), "changebalance_orders");
        assert!(ensure(&topology, &channel).await.is_ok());
    }

    #[tokio::test]
    async fn should_stop_at_first_failure() {
        let mut channel = MockBrokerChannel::new();

        channel
            .expect_declare_exchange()
            .returning(|def| Err(AmqpError::TopologyConflict(def.name().to_owned())));
        channel.expect_declare_queue().never();
        channel.expect_bind().never();

        assert_eq!(
            ensure(&notify_user(), &channel).await,
            Err(AmqpError::TopologyConflict("amq.direct".to_owned()))
        );
    }

    #[tokio::test]
    async fn should_be_idempotent_and_keep_queued_messages() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();
        let topology = notify_user();

        ensure(&topology, channel.as_ref()).await.unwrap();
        channel
            .publish(&Envelope {
                exchange: "amq.direct".to_owned(),
                routing_key: "user.mailing".to_owned(),
                body: b"{}".to_vec(),
                ..Default::default()
            })
            .await
            .unwrap();

        let snapshot = broker.topology_snapshot();
        for _ in 0..5 {
            ensure(&topology, channel.as_ref()).await.unwrap();
        }

        assert_eq!(broker.topology_snapshot(), snapshot);
        assert_eq!(broker.queue_len("notify_user"), 1);
        assert!(broker.has_binding("notify_user", "amq.direct", "user.mailing"));
    }

    #[tokio::test]
    async fn should_be_commutative() {
        let first = InMemoryBroker::new();
        let second = InMemoryBroker::new();
        let orders = Topology::new(
            ExchangeDefinition::new("orders").topic().durable(),
            QueueDefinition::new("changebalance_orders").durable(),
            "orders.*",
        );

        ensure(&notify_user(), first.channel().as_ref()).await.unwrap();
        ensure(&orders, first.channel().as_ref()).await.unwrap();

        ensure(&orders, second.channel().as_ref()).await.unwrap();
        ensure(&notify_user(), second.channel().as_ref()).await.unwrap();

        assert_eq!(first.topology_snapshot(), second.topology_snapshot());
    }

    #[tokio::test]
    async fn should_surface_conflicting_definitions() {
        let broker = InMemoryBroker::new();
        let channel = broker.channel();

        ensure(&notify_user(), channel.as_ref()).await.unwrap();

        let conflicting = Topology::new(
            ExchangeDefinition::new("amq.direct").direct().durable(),
            QueueDefinition::new("notify_user").durable().with_dlq().ttl(1000),
            "user.mailing",
        );

        assert_eq!(
            ensure(&conflicting, channel.as_ref()).await,
            Err(AmqpError::TopologyConflict("notify_user".to_owned()))
        );
    }
}
