use async_trait::async_trait;
use messaging::{
    errors::MessagingError,
    handler::{ConsumerHandler, ConsumerMessage},
};
use serde::{Deserialize, Serialize};
use tracing::info;
use traces::{KeyValue, Span};

pub const USER_ID_ATTRIBUTE: &str = "user.id";
pub const EVENT_ID_ATTRIBUTE: &str = "event.id";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Event {
    pub id: u64,
    pub user_id: u64,
    #[serde(default)]
    pub description: String,
}

impl Event {
    pub fn new<T: Into<String>>(id: u64, user_id: u64, description: T) -> Event {
        Event {
            id,
            user_id,
            description: description.into(),
        }
    }
}

fn decode(span: &mut Span, msg: &ConsumerMessage) -> Result<Event, MessagingError> {
    let event: Event = msg.decode()?;

    span.set_attributes([
        KeyValue::new(EVENT_ID_ATTRIBUTE, event.id as i64),
        KeyValue::new(USER_ID_ATTRIBUTE, event.user_id as i64),
    ]);

    Ok(event)
}

pub struct NotifyUserHandler;

#[async_trait]
impl ConsumerHandler for NotifyUserHandler {
    async fn exec(&self, span: &mut Span, msg: &ConsumerMessage) -> Result<(), MessagingError> {
        let event = decode(span, msg)?;

        info!(
            trace.id = span.trace_id(),
            span.id = span.span_id(),
            event_id = event.id,
            user_id = event.user_id,
            "notifying user: {}",
            event.description
        );

        Ok(())
    }
}

pub struct ChangeBalanceHandler;

#[async_trait]
impl ConsumerHandler for ChangeBalanceHandler {
    async fn exec(&self, span: &mut Span, msg: &ConsumerMessage) -> Result<(), MessagingError> {
        let event = decode(span, msg)?;

        info!(
            trace.id = span.trace_id(),
            span.id = span.span_id(),
            event_id = event.id,
            user_id = event.user_id,
            "changing balance: {}",
            event.description
        );

        Ok(())
    }
}
