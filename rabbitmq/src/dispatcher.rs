use crate::{
    consumer::{FailurePolicy, RabbitMQConsumer, DEFAULT_PREFETCH},
    supervisor::ConnectionSupervisor,
    topology::Topology,
};
use async_trait::async_trait;
use futures_util::future::join_all;
use messaging::{
    dispatcher::{Dispatcher, DispatcherDefinition},
    errors::MessagingError,
    handler::ConsumerHandler,
};
use std::sync::Arc;
use tracing::{error, info};
use traces::Tracer;

pub struct RabbitMQDispatcher {
    supervisor: Arc<ConnectionSupervisor>,
    tracer: Tracer,
    topologies: Vec<Topology>,
    prefetch: u16,
    policy: FailurePolicy,
    registrations: Vec<(DispatcherDefinition, Arc<dyn ConsumerHandler>)>,
}

impl RabbitMQDispatcher {
    pub fn new(
        supervisor: Arc<ConnectionSupervisor>,
        tracer: Tracer,
        topologies: Vec<Topology>,
    ) -> Self {
        RabbitMQDispatcher {
            supervisor,
            tracer,
            topologies,
            prefetch: DEFAULT_PREFETCH,
            policy: FailurePolicy::default(),
            registrations: vec![],
        }
    }

    pub fn prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    fn topology_of(&self, queue: &str) -> Result<&Topology, MessagingError> {
        self.topologies
            .iter()
            .find(|t| t.queue_name() == queue)
            .ok_or_else(|| {
                error!(queue, "no topology registered for queue");
                MessagingError::UnregisteredQueue(queue.to_owned())
            })
    }
}

#[async_trait]
impl Dispatcher for RabbitMQDispatcher {
    fn register(mut self, def: &DispatcherDefinition, handler: Arc<dyn ConsumerHandler>) -> Self {
        self.registrations.push((def.clone(), handler));
        self
    }

    /// Runs every registered worker until all stop. The first fatal error
    /// stops the others and is returned.
    async fn consume_blocking(&self) -> Result<(), MessagingError> {
        let stop = self.supervisor.cancellation_token().child_token();
        let mut consumers = vec![];

        for (def, handler) in &self.registrations {
            let topology = self.topology_of(&def.name)?;

            for worker in 0..def.workers {
                consumers.push(
                    RabbitMQConsumer::new(
                        self.supervisor.clone(),
                        self.tracer.clone(),
                        topology.clone(),
                        handler.clone(),
                    )
                    .prefetch(self.prefetch)
                    .failure_policy(self.policy)
                    .consumer_tag(format!("{}-{}", def.name, worker))
                    .cancellation(stop.child_token()),
                );
            }
        }

        info!(workers = consumers.len(), "starting dispatcher");

        let mut spawns = vec![];
        for consumer in consumers {
            spawns.push(tokio::spawn({
                let stop = stop.clone();
                async move {
                    let result = consumer.run().await;
                    if result.is_err() {
                        stop.cancel();
                    }
                    result
                }
            }));
        }

        let mut outcome = Ok(());
        for spawned in join_all(spawns).await {
            let result = match spawned {
                Ok(result) => result,
                Err(err) => {
                    error!(error = err.to_string(), "consumer task failed");
                    Err(MessagingError::InternalError)
                }
            };

            if outcome.is_ok() {
                outcome = result;
            }
        }

        info!("dispatcher stopped");
        outcome
    }
}
