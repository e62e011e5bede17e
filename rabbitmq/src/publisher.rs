use crate::{
    broker::{
        Envelope, JSON_CONTENT_TYPE, MESSAGING_DESTINATION_ATTRIBUTE,
        MESSAGING_MESSAGE_ID_ATTRIBUTE, MESSAGING_OPERATION_ATTRIBUTE,
        MESSAGING_ROUTING_KEY_ATTRIBUTE, MESSAGING_SYSTEM, MESSAGING_SYSTEM_ATTRIBUTE,
    },
    errors::AmqpError,
    supervisor::{ConnectionSupervisor, Session},
    topology::{self, Topology},
};
use async_trait::async_trait;
use messaging::{
    errors::MessagingError,
    publisher::{PublishMessage, Publisher},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{debug, error, warn};
use traces::{propagation, CausalContext, KeyValue, SpanKind, Status, Tracer};
use uuid::Uuid;

pub struct RabbitMQPublisher {
    supervisor: Arc<ConnectionSupervisor>,
    tracer: Tracer,
    topologies: Vec<Topology>,
    /// Topologies declared on the session with the given id.
    ensured: Mutex<(u64, HashSet<Topology>)>,
}

impl RabbitMQPublisher {
    pub fn new(supervisor: Arc<ConnectionSupervisor>, tracer: Tracer) -> RabbitMQPublisher {
        RabbitMQPublisher {
            supervisor,
            tracer,
            topologies: vec![],
            ensured: Mutex::new((0, HashSet::new())),
        }
    }

    /// Declared before the first publish that can reach it, and again after
    /// every reconnect.
    pub fn topology(mut self, topology: Topology) -> Self {
        self.topologies.push(topology);
        self
    }

    pub fn topologies(mut self, topologies: Vec<Topology>) -> Self {
        self.topologies.extend(topologies);
        self
    }

    /// Publishes through whatever session is current, retrying on a fresh
    /// one when the connection is lost underneath.
    async fn submit(&self, envelope: &Envelope) -> Result<(), AmqpError> {
        loop {
            let session = self.supervisor.acquire_session().await?;

            let result = match self.ensure_topologies(&session, envelope).await {
                Ok(()) => session.channel().publish(envelope).await,
                Err(err) => Err(err),
            };

            match result {
                Err(err) if err.is_connection_error() => {
                    warn!(
                        error = err.to_string(),
                        session = session.id(),
                        "publish interrupted by connection loss, retrying"
                    );
                    self.supervisor.report_failure(&session);
                }
                other => return other,
            }
        }
    }

    async fn ensure_topologies(
        &self,
        session: &Session,
        envelope: &Envelope,
    ) -> Result<(), AmqpError> {
        let channel = session.channel();

        for topology in self.topologies.iter().filter(|t| reaches(t, envelope)) {
            if self.is_ensured(session.id(), topology) {
                continue;
            }

            topology::ensure(topology, channel.as_ref()).await?;
            self.mark_ensured(session.id(), topology);
        }

        Ok(())
    }

    fn is_ensured(&self, session: u64, topology: &Topology) -> bool {
        let ensured = self.lock();
        ensured.0 == session && ensured.1.contains(topology)
    }

    fn mark_ensured(&self, session: u64, topology: &Topology) {
        let mut ensured = self.lock();
        if ensured.0 != session {
            *ensured = (session, HashSet::new());
        }
        ensured.1.insert(topology.clone());
    }

    fn lock(&self) -> MutexGuard<'_, (u64, HashSet<Topology>)> {
        match self.ensured.lock() {
            Ok(ensured) => ensured,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Whether a message sent as `envelope` can land in the topology's queue.
fn reaches(topology: &Topology, envelope: &Envelope) -> bool {
    if envelope.exchange.is_empty() {
        return topology.exchange().is_default() && topology.queue_name() == envelope.routing_key;
    }

    topology.exchange().name() == envelope.exchange
}

fn publish_error(err: AmqpError) -> MessagingError {
    match err {
        AmqpError::PublishingError(_)
        | AmqpError::ConnectionTerminated
        | AmqpError::TopologyConflict(_) => err.into(),
        other => MessagingError::PublishFailed(other.to_string()),
    }
}

#[async_trait]
impl Publisher for RabbitMQPublisher {
    async fn publish(
        &self,
        parent: Option<CausalContext>,
        msg: &PublishMessage,
    ) -> Result<(), MessagingError> {
        let destination = msg.destination().to_owned();
        let message_id = Uuid::new_v4().to_string();

        let mut span = self.tracer.start_with_parent(
            destination.clone(),
            SpanKind::Producer,
            parent.as_ref(),
        );
        span.set_attributes([
            KeyValue::new(MESSAGING_SYSTEM_ATTRIBUTE, MESSAGING_SYSTEM),
            KeyValue::new(MESSAGING_DESTINATION_ATTRIBUTE, destination.clone()),
            KeyValue::new(MESSAGING_ROUTING_KEY_ATTRIBUTE, msg.key.clone()),
            KeyValue::new(MESSAGING_OPERATION_ATTRIBUTE, "publish"),
            KeyValue::new(MESSAGING_MESSAGE_ID_ATTRIBUTE, message_id.clone()),
        ]);

        let mut headers = msg.headers.clone();
        propagation::inject(&span.context(), &mut headers);

        let envelope = Envelope {
            exchange: msg.to.clone(),
            routing_key: msg.key.clone(),
            headers,
            content_type: JSON_CONTENT_TYPE.to_owned(),
            msg_type: msg.msg_type.clone(),
            message_id,
            body: msg.data.to_vec(),
        };

        match self.submit(&envelope).await {
            Ok(()) => {
                debug!(
                    trace.id = span.trace_id(),
                    span.id = span.span_id(),
                    destination,
                    routing_key = envelope.routing_key,
                    "message published"
                );
                span.set_status(Status::Ok);
                span.end();
                Ok(())
            }
            Err(err) => {
                error!(
                    trace.id = span.trace_id(),
                    span.id = span.span_id(),
                    error = err.to_string(),
                    destination,
                    "error publishing message"
                );
                span.record_error(&err);
                span.end();
                Err(publish_error(err))
            }
        }
    }
}
