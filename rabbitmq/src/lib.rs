pub mod broker;
pub mod channel;
pub mod consumer;
pub mod dispatcher;
pub mod errors;
pub mod exchange;
pub mod headers;
pub mod publisher;
pub mod queue;
pub mod supervisor;
pub mod topology;

#[cfg(any(test, feature = "mocks"))]
pub mod memory;
