pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod publisher;

#[cfg(any(test, feature = "mocks"))]
pub use publisher::MockPublisher;

#[cfg(any(test, feature = "mocks"))]
pub use handler::MockConsumerHandler;
