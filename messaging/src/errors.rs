use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("internal error")]
    InternalError,

    #[error("failure to publish `{0}`")]
    PublishFailed(String),

    #[error("connection terminated")]
    ConnectionTerminated,

    #[error("topology conflict `{0}`")]
    TopologyConflict(String),

    #[error("invalid payload `{0}`")]
    InvalidPayload(String),

    #[error("handler failure `{0}`")]
    HandlerFailure(String),

    #[error("queue `{0}` has no topology registered")]
    UnregisteredQueue(String),

    #[error("failure to consume message `{0}`")]
    ConsumerError(String),
}

impl MessagingError {
    /// Errors that will not go away by retrying.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MessagingError::ConnectionTerminated
                | MessagingError::TopologyConflict(_)
                | MessagingError::UnregisteredQueue(_)
        )
    }
}
