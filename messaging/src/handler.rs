use crate::errors::MessagingError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use traces::{Headers, Span};

#[cfg(any(test, feature = "mocks"))]
use mockall::automock;

/// A delivery handed to a [`ConsumerHandler`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerMessage {
    /// Queue the message was consumed from.
    pub from: String,
    pub msg_type: String,
    pub routing_key: String,
    pub data: Box<[u8]>,
    pub headers: Headers,
    pub redelivered: bool,
}

impl ConsumerMessage {
    pub fn new<T>(from: T, msg_type: T, data: &[u8], headers: Headers) -> Self
    where
        T: Into<String>,
    {
        ConsumerMessage {
            from: from.into(),
            msg_type: msg_type.into(),
            routing_key: String::new(),
            data: data.into(),
            headers,
            redelivered: false,
        }
    }

    pub fn routing_key<T: Into<String>>(mut self, routing_key: T) -> Self {
        self.routing_key = routing_key.into();
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    /// Parses the JSON body. A body that does not parse is a poison message.
    pub fn decode<T>(&self) -> Result<T, MessagingError>
    where
        T: DeserializeOwned,
    {
        serde_json::from_slice(&self.data)
            .map_err(|err| MessagingError::InvalidPayload(err.to_string()))
    }
}

/// Business logic run for each delivery.
///
/// The span is open for the whole call; returning `Err` nacks the delivery.
#[cfg_attr(any(test, feature = "mocks"), automock)]
#[async_trait]
pub trait ConsumerHandler: Send + Sync {
    async fn exec(&self, span: &mut Span, msg: &ConsumerMessage) -> Result<(), MessagingError>;
}
