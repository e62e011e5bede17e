use crate::{errors::MessagingError, handler::ConsumerHandler};
use async_trait::async_trait;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct DispatcherDefinition {
    /// Queue to consume.
    pub name: String,
    /// Concurrent consumer loops on the queue.
    pub workers: usize,
}

impl DispatcherDefinition {
    pub fn new<T: Into<String>>(name: T) -> Self {
        DispatcherDefinition {
            name: name.into(),
            workers: 1,
        }
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }
}

#[async_trait]
pub trait Dispatcher: Send + Sync {
    fn register(self, definition: &DispatcherDefinition, handler: Arc<dyn ConsumerHandler>)
        -> Self;

    async fn consume_blocking(&self) -> Result<(), MessagingError>;
}
