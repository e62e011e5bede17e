use messaging::errors::MessagingError;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    #[error("internal error")]
    InternalError,

    #[error("failure to connect `{0}`")]
    ConnectionError(String),

    #[error("failure to create a channel `{0}`")]
    ChannelError(String),

    #[error("connection terminated")]
    ConnectionTerminated,

    #[error("failure to declare an exchange `{0}`")]
    DeclareExchangeError(String),

    #[error("failure to declare a queue `{0}`")]
    DeclareQueueError(String),

    #[error("failure to binding exchange `{0}` to queue `{1}`")]
    BindingExchangeToQueueError(String, String),

    #[error("topology conflict `{0}`")]
    TopologyConflict(String),

    #[error("failure to create the consumer `{0}`")]
    ConsumerCreationError(String),

    #[error("failure to publish `{0}`")]
    PublishingError(String),

    #[error("failure to ack message")]
    AckMessageError,

    #[error("failure to nack message")]
    NackMessageError,
}

impl AmqpError {
    /// The session is gone: reconnect and retry the operation.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionError(_) | AmqpError::ChannelError(_)
        )
    }

    /// Retrying will never help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AmqpError::ConnectionTerminated | AmqpError::TopologyConflict(_)
        )
    }
}

impl From<AmqpError> for MessagingError {
    fn from(err: AmqpError) -> Self {
        match err {
            AmqpError::ConnectionTerminated => MessagingError::ConnectionTerminated,
            AmqpError::TopologyConflict(name) => MessagingError::TopologyConflict(name),
            AmqpError::PublishingError(reason) => MessagingError::PublishFailed(reason),
            AmqpError::ConsumerCreationError(reason) => MessagingError::ConsumerError(reason),
            other => MessagingError::ConsumerError(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_classify_errors() {
        assert!(AmqpError::ConnectionError("refused".to_owned()).is_connection_error());
        assert!(AmqpError::ChannelError("closed".to_owned()).is_connection_error());
        assert!(!AmqpError::PublishingError("nack".to_owned()).is_connection_error());

        assert!(AmqpError::TopologyConflict("orders".to_owned()).is_fatal());
        assert!(AmqpError::ConnectionTerminated.is_fatal());
        assert!(!AmqpError::ConnectionError("refused".to_owned()).is_fatal());
    }

    #[test]
    fn should_convert_into_messaging_error() {
        assert_eq!(
            MessagingError::from(AmqpError::TopologyConflict("q".to_owned())),
            MessagingError::TopologyConflict("q".to_owned())
        );
        assert_eq!(
            MessagingError::from(AmqpError::PublishingError("nack".to_owned())),
            MessagingError::PublishFailed("nack".to_owned())
        );
        assert_eq!(
            MessagingError::from(AmqpError::ConnectionTerminated),
            MessagingError::ConnectionTerminated
        );
    }
}
