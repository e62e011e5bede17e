mod handlers;

use configs::{Configs, Empty};
use configs_builder::ConfigBuilder;
use handlers::{ChangeBalanceHandler, Event, NotifyUserHandler};
use messaging::{
    dispatcher::{Dispatcher, DispatcherDefinition},
    errors::MessagingError,
    publisher::{PublishMessage, Publisher},
};
use rabbitmq::{
    channel::LapinConnector, dispatcher::RabbitMQDispatcher, exchange::ExchangeDefinition,
    publisher::RabbitMQPublisher, queue::QueueDefinition, supervisor::ConnectionSupervisor,
    topology::Topology,
};
use std::{env, error::Error, sync::Arc};
use tracing::{error, info};
use traces::Tracer;

const SEND_TEST_EVENTS_COMMAND: &str = "send-test-events";

const EXCHANGE: &str = "amq.direct";
const NOTIFY_USER_QUEUE: &str = "notify_user";
const NOTIFY_USER_ROUTING_KEY: &str = "user.mailing";
const CHANGE_BALANCE_QUEUE: &str = "changebalance_orders";
const CHANGE_BALANCE_ROUTING_KEY: &str = "orders.checkout";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cfg = ConfigBuilder::new().amqp().otlp().build::<Empty>()?;
    let export = traces::provider::init(&cfg)?;

    let supervisor = ConnectionSupervisor::from_configs(
        Arc::new(LapinConnector::new(&cfg)),
        &cfg.rabbitmq,
    );
    let supervisor_task = supervisor.spawn();

    let result = match env::args().nth(1).as_deref() {
        Some(SEND_TEST_EVENTS_COMMAND) => send_test_events(&supervisor, export.tracer()).await,
        Some(command) => {
            error!(command, "unknown command");
            Err(MessagingError::InternalError)
        }
        None => consume(&cfg, &supervisor, export.tracer()).await,
    };

    supervisor.shutdown();
    supervisor_task.await?;
    export.shutdown().await;

    if let Err(err) = &result {
        error!(error = err.to_string(), "relay-worker stopped with error");
    }

    result.map_err(Into::into)
}

fn topologies() -> Vec<Topology> {
    let exchange = ExchangeDefinition::new(EXCHANGE).direct().durable();

    vec![
        Topology::new(
            exchange.clone(),
            QueueDefinition::new(NOTIFY_USER_QUEUE).durable().with_dlq(),
            NOTIFY_USER_ROUTING_KEY,
        ),
        Topology::new(
            exchange,
            QueueDefinition::new(CHANGE_BALANCE_QUEUE).durable().with_dlq(),
            CHANGE_BALANCE_ROUTING_KEY,
        ),
    ]
}

async fn consume(
    cfg: &Configs<Empty>,
    supervisor: &Arc<ConnectionSupervisor>,
    tracer: Tracer,
) -> Result<(), MessagingError> {
    let dispatcher = RabbitMQDispatcher::new(supervisor.clone(), tracer, topologies())
        .prefetch(cfg.rabbitmq.prefetch_count)
        .register(
            &DispatcherDefinition::new(NOTIFY_USER_QUEUE),
            Arc::new(NotifyUserHandler),
        )
        .register(
            &DispatcherDefinition::new(CHANGE_BALANCE_QUEUE),
            Arc::new(ChangeBalanceHandler),
        );

    tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, shutting down");
                supervisor.shutdown();
            }
        }
    });

    dispatcher.consume_blocking().await
}

async fn send_test_events(
    supervisor: &Arc<ConnectionSupervisor>,
    tracer: Tracer,
) -> Result<(), MessagingError> {
    let publisher = RabbitMQPublisher::new(supervisor.clone(), tracer).topologies(topologies());

    let events = [
        (
            NOTIFY_USER_ROUTING_KEY,
            NOTIFY_USER_QUEUE,
            Event::new(1, 2, "welcome aboard"),
        ),
        (
            CHANGE_BALANCE_ROUTING_KEY,
            CHANGE_BALANCE_QUEUE,
            Event::new(2, 2, "checkout of order 42"),
        ),
    ];

    for (routing_key, msg_type, event) in events {
        let msg = PublishMessage::json(EXCHANGE, routing_key, &event)?.msg_type(msg_type);
        publisher.publish(None, &msg).await?;
        info!(routing_key, event_id = event.id, "test event published");
    }

    Ok(())
}
