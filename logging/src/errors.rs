use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum LoggingError {
    #[error("failure to install the global subscriber: `{0}`")]
    SubscriberError(String),
}
