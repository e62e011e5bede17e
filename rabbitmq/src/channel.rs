use crate::{
    broker::{BrokerChannel, Connector, Delivery, DeliveryStream, Envelope},
    errors::AmqpError,
    exchange::ExchangeDefinition,
    headers::{from_field_table, to_field_table},
    queue::QueueDefinition,
};
use async_trait::async_trait;
use configs::{Configs, DynamicConfigs};
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, error};

const PERSISTENT_DELIVERY_MODE: u8 = 2;

pub struct LapinConnector {
    uri: String,
    connection_name: String,
}

impl LapinConnector {
    pub fn new<T>(cfg: &Configs<T>) -> LapinConnector
    where
        T: DynamicConfigs,
    {
        LapinConnector {
            uri: cfg.rabbitmq_uri(),
            connection_name: cfg.app.name.clone(),
        }
    }
}

#[async_trait]
impl Connector for LapinConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        debug!("creating amqp connection...");
        let options = ConnectionProperties::default()
            .with_connection_name(LongString::from(self.connection_name.clone()));

        let conn = match Connection::connect(&self.uri, options).await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                Err(AmqpError::ConnectionError(err.to_string()))
            }
        }?;
        debug!("amqp connected");

        let healthy = Arc::new(AtomicBool::new(true));
        let flag = healthy.clone();
        conn.on_error(move |err| {
            error!(error = err.to_string(), "amqp connection error");
            flag.store(false, Ordering::SeqCst);
        });

        debug!("creating amqp channel...");
        let channel = match conn.create_channel().await {
            Ok(c) => Ok(c),
            Err(err) => {
                error!(error = err.to_string(), "error to create the channel");
                Err(AmqpError::ChannelError(err.to_string()))
            }
        }?;

        if let Err(err) = channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
        {
            error!(error = err.to_string(), "failure to enable publisher confirms");
            return Err(AmqpError::ChannelError(err.to_string()));
        }
        debug!("channel created");

        Ok(Arc::new(LapinChannel {
            conn,
            channel,
            healthy,
        }))
    }
}

pub struct LapinChannel {
    conn: Connection,
    channel: Channel,
    healthy: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn is_connected(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
            && self.conn.status().connected()
            && self.channel.status().connected()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        debug!(exchange = def.name(), "declaring exchange");

        self.channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().into(),
                ExchangeDeclareOptions {
                    passive: def.is_reserved(),
                    durable: def.durable,
                    auto_delete: def.delete,
                    internal: def.internal,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the exchange"
                );
                classify(&err, def.name(), AmqpError::DeclareExchangeError)
            })
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        debug!(queue = def.name(), "declaring queue");

        self.channel
            .queue_declare(
                def.name(),
                QueueDeclareOptions {
                    passive: false,
                    durable: def.durable,
                    exclusive: def.exclusive,
                    auto_delete: def.delete,
                    nowait: false,
                },
                def.arguments(),
            )
            .await
            .map(|_| ())
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    name = def.name(),
                    "error to declare the queue"
                );
                classify(&err, def.name(), AmqpError::DeclareQueueError)
            })
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), AmqpError> {
        debug!(queue, exchange, routing_key, "binding queue");

        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue");
                classify(&err, queue, |_| {
                    AmqpError::BindingExchangeToQueueError(exchange.to_owned(), queue.to_owned())
                })
            })
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        let properties = BasicProperties::default()
            .with_content_type(ShortString::from(envelope.content_type.as_str()))
            .with_kind(ShortString::from(envelope.msg_type.as_str()))
            .with_message_id(ShortString::from(envelope.message_id.as_str()))
            .with_delivery_mode(PERSISTENT_DELIVERY_MODE)
            .with_headers(to_field_table(&envelope.headers));

        let publishing_error = |reason: String| AmqpError::PublishingError(reason);

        let confirm = self
            .channel
            .basic_publish(
                &envelope.exchange,
                &envelope.routing_key,
                BasicPublishOptions::default(),
                &envelope.body,
                properties,
            )
            .await
            .map_err(|err| classify(&err, &envelope.exchange, publishing_error))?;

        let confirmation = confirm
            .await
            .map_err(|err| classify(&err, &envelope.exchange, publishing_error))?;

        if confirmation.is_nack() {
            return Err(AmqpError::PublishingError(
                "message was nacked by the broker".to_owned(),
            ));
        }

        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError> {
        let consumer_error = AmqpError::ConsumerCreationError;

        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| classify(&err, queue, consumer_error))?;

        let consumer = self
            .channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to create the consumer");
                classify(&err, queue, consumer_error)
            })?;

        Ok(consumer
            .map(|result| match result {
                Ok(delivery) => Ok(into_delivery(delivery)),
                Err(err) => Err(AmqpError::ChannelError(err.to_string())),
            })
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|err| classify(&err, "", |_| AmqpError::AckMessageError))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|err| classify(&err, "", |_| AmqpError::NackMessageError))
    }
}

fn into_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let as_string = |value: &Option<ShortString>| {
        value
            .as_ref()
            .map(|value| value.to_string())
            .unwrap_or_default()
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        headers: from_field_table(properties.headers().as_ref()),
        content_type: as_string(properties.content_type()),
        msg_type: as_string(properties.kind()),
        message_id: as_string(properties.message_id()),
        body: delivery.data,
    }
}

/// Sorts a lapin failure into connection loss, topology conflict or an
/// operation specific error built by `otherwise`.
fn classify<F>(err: &lapin::Error, name: &str, otherwise: F) -> AmqpError
where
    F: FnOnce(String) -> AmqpError,
{
    match err {
        lapin::Error::ProtocolError(amqp_err) => match amqp_err.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                AmqpError::TopologyConflict(name.to_owned())
            }
            AMQPErrorKind::Hard(_) => AmqpError::ConnectionError(err.to_string()),
            AMQPErrorKind::Soft(_) => otherwise(err.to_string()),
        },
        lapin::Error::IOError(_) | lapin::Error::InvalidConnectionState(_) => {
            AmqpError::ConnectionError(err.to_string())
        }
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
            AmqpError::ChannelError(err.to_string())
        }
        _ => otherwise(err.to_string()),
    }
}
