use crate::errors::MessagingError;
use async_trait::async_trait;
use serde::Serialize;
use traces::{CausalContext, Headers};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// What to publish and where.
///
/// `to` names an exchange and `key` the routing key. With an empty `to` the
/// message goes through the default exchange straight to the queue named by
/// `key`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishMessage {
    pub to: String,
    pub key: String,
    pub msg_type: String,
    pub data: Box<[u8]>,
    pub headers: Headers,
}

impl PublishMessage {
    pub fn to_exchange<T>(exchange: T, routing_key: T, data: &[u8]) -> Self
    where
        T: Into<String>,
    {
        PublishMessage {
            to: exchange.into(),
            key: routing_key.into(),
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn to_queue<T>(queue: T, data: &[u8]) -> Self
    where
        T: Into<String>,
    {
        PublishMessage {
            key: queue.into(),
            data: data.into(),
            ..Default::default()
        }
    }

    pub fn json<T, P>(exchange: T, routing_key: T, payload: &P) -> Result<Self, MessagingError>
    where
        T: Into<String>,
        P: Serialize,
    {
        let data = serde_json::to_vec(payload)
            .map_err(|err| MessagingError::InvalidPayload(err.to_string()))?;

        Ok(PublishMessage::to_exchange(exchange, routing_key, &data))
    }

    pub fn msg_type<T: Into<String>>(mut self, msg_type: T) -> Self {
        self.msg_type = msg_type.into();
        self
    }

    pub fn header<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Exchange name, or the queue name for default exchange messages.
    pub fn destination(&self) -> &str {
        if self.to.is_empty() {
            return &self.key;
        }

        &self.to
    }
}

#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `msg` under a new producer span, child of `parent` when given.
    async fn publish(
        &self,
        parent: Option<CausalContext>,
        msg: &PublishMessage,
    ) -> Result<(), MessagingError>;
}
