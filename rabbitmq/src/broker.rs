//! The broker operations the relay is written against.
//!
//! [`crate::channel`] implements them over lapin; [`crate::memory`] provides
//! an in-process broker for tests.

use crate::{errors::AmqpError, exchange::ExchangeDefinition, queue::QueueDefinition};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use traces::Headers;

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

pub const JSON_CONTENT_TYPE: &str = "application/json";

pub const MESSAGING_SYSTEM: &str = "rabbitmq";
pub const MESSAGING_SYSTEM_ATTRIBUTE: &str = "messaging.system";
pub const MESSAGING_DESTINATION_ATTRIBUTE: &str = "messaging.destination.name";
pub const MESSAGING_ROUTING_KEY_ATTRIBUTE: &str = "messaging.rabbitmq.destination.routing_key";
pub const MESSAGING_OPERATION_ATTRIBUTE: &str = "messaging.operation";
pub const MESSAGING_MESSAGE_ID_ATTRIBUTE: &str = "messaging.message.id";

/// A message on its way to the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub headers: Headers,
    pub content_type: String,
    pub msg_type: String,
    pub message_id: String,
    pub body: Vec<u8>,
}

/// A message handed out by the broker, waiting to be settled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: Headers,
    pub content_type: String,
    pub msg_type: String,
    pub message_id: String,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// One live channel to the broker.
///
/// Delivery tags are only meaningful on the channel that produced them.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn is_connected(&self) -> bool;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), AmqpError>;

    /// Resolves once the broker has confirmed the message.
    async fn publish(&self, envelope: &Envelope) -> Result<(), AmqpError>;

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), AmqpError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), AmqpError>;
}

/// Opens a fresh connection and channel.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError>;
}
