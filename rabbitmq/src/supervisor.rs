use crate::{
    broker::{BrokerChannel, Connector},
    errors::AmqpError,
};
use configs::RabbitMQConfigs;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Floor for every reconnect delay.
pub const MIN_RECONNECT_DELAY: Duration = Duration::from_secs(1);

const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Terminal, reached only through an explicit shutdown.
    Failed,
}

impl ConnectionState {
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connected, Disconnected)
                | (Disconnected | Connecting | Connected, Failed)
        )
    }
}

/// Capped exponential delay between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> BackoffPolicy {
        let base = base.max(MIN_RECONNECT_DELAY);

        BackoffPolicy {
            base,
            max: max.max(base),
        }
    }

    pub fn fixed(delay: Duration) -> BackoffPolicy {
        BackoffPolicy::new(delay, delay)
    }

    /// Delay before retry number `attempt`, counting from zero.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base.saturating_mul(factor).min(self.max)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::from(&RabbitMQConfigs::default())
    }
}

impl From<&RabbitMQConfigs> for BackoffPolicy {
    fn from(cfg: &RabbitMQConfigs) -> Self {
        BackoffPolicy::new(
            Duration::from_millis(cfg.reconnect_delay_ms),
            Duration::from_millis(cfg.max_reconnect_delay_ms),
        )
    }
}

/// A connected channel lent out by the supervisor.
///
/// `lost` is cancelled once the session is known to be dead, by the
/// health check or by a user through [`ConnectionSupervisor::report_failure`].
#[derive(Clone)]
pub struct Session {
    channel: Arc<dyn BrokerChannel>,
    id: u64,
    lost: CancellationToken,
}

impl Session {
    pub fn channel(&self) -> Arc<dyn BrokerChannel> {
        self.channel.clone()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lost(&self) -> &CancellationToken {
        &self.lost
    }

    pub fn is_lost(&self) -> bool {
        self.lost.is_cancelled()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("lost", &self.is_lost())
            .finish()
    }
}

/// Owns the broker connection and keeps it alive.
///
/// ```text
/// DISCONNECTED --connect--> CONNECTING --ok--> CONNECTED
///      ^                        |                  |
///      +-------- failure -------+------ lost ------+
///
/// any --shutdown--> FAILED
/// ```
///
/// Connection attempts never give up; only [`ConnectionSupervisor::shutdown`]
/// stops them. Publishers and consumers borrow the current session per
/// operation through [`ConnectionSupervisor::acquire_session`].
pub struct ConnectionSupervisor {
    connector: Arc<dyn Connector>,
    backoff: BackoffPolicy,
    health_check_interval: Duration,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    shutdown: CancellationToken,
    sessions: AtomicU64,
}

impl ConnectionSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        backoff: BackoffPolicy,
        health_check_interval: Duration,
    ) -> Arc<ConnectionSupervisor> {
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Arc::new(ConnectionSupervisor {
            connector,
            backoff,
            health_check_interval: health_check_interval.max(Duration::from_millis(1)),
            state,
            session: Mutex::new(None),
            shutdown: CancellationToken::new(),
            sessions: AtomicU64::new(0),
        })
    }

    pub fn from_configs(
        connector: Arc<dyn Connector>,
        cfg: &RabbitMQConfigs,
    ) -> Arc<ConnectionSupervisor> {
        ConnectionSupervisor::new(
            connector,
            BackoffPolicy::from(cfg),
            Duration::from_millis(cfg.health_check_interval_ms),
        )
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run())
    }

    /// Connect, watch and reconnect until shutdown.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;

        while !self.shutdown.is_cancelled() {
            self.transition(ConnectionState::Connecting);

            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                connected = self.connector.connect() => connected,
            };

            match connected {
                Ok(channel) => {
                    attempt = 0;

                    let session = Session {
                        channel,
                        id: self.sessions.fetch_add(1, Ordering::SeqCst) + 1,
                        lost: CancellationToken::new(),
                    };

                    self.store(Some(session.clone()));
                    self.transition(ConnectionState::Connected);
                    info!(session = session.id, "amqp session established");

                    self.watch(&session).await;

                    self.store(None);
                    session.lost.cancel();
                    self.transition(ConnectionState::Disconnected);

                    if !self.shutdown.is_cancelled() {
                        warn!(session = session.id, "amqp session lost, reconnecting");
                    }
                }
                Err(err) => {
                    let delay = self.backoff.delay(attempt);
                    attempt = attempt.saturating_add(1);

                    self.transition(ConnectionState::Disconnected);
                    warn!(
                        error = err.to_string(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "failure to connect, retrying"
                    );

                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = time::sleep(delay) => {}
                    }
                }
            }
        }

        self.store(None);
        self.transition(ConnectionState::Failed);
        info!("connection supervisor stopped");
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Stops reconnecting and fails every pending and future acquire.
    pub fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }

        info!("shutting down connection supervisor");
        self.shutdown.cancel();
        self.transition(ConnectionState::Failed);
    }

    /// Cancelled on shutdown. Consumers derive their child tokens from it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Waits until a live session exists and returns it.
    pub async fn acquire_session(&self) -> Result<Session, AmqpError> {
        let mut state = self.state.subscribe();

        loop {
            let current = *state.borrow_and_update();
            if self.shutdown.is_cancelled() || current == ConnectionState::Failed {
                return Err(AmqpError::ConnectionTerminated);
            }

            if let Some(session) = self.current().filter(|s| !s.is_lost()) {
                return Ok(session);
            }

            debug!(state = ?current, "waiting for an amqp session");

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(AmqpError::ConnectionTerminated),
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(AmqpError::ConnectionTerminated);
                    }
                }
            }
        }
    }

    pub async fn acquire_channel(&self) -> Result<Arc<dyn BrokerChannel>, AmqpError> {
        self.acquire_session().await.map(|session| session.channel)
    }

    /// Marks `session` as dead so the supervisor reconnects without waiting
    /// for the next health check.
    pub fn report_failure(&self, session: &Session) {
        if session.is_lost() {
            return;
        }

        warn!(session = session.id, "amqp session reported as failed");
        session.lost.cancel();
    }

    async fn watch(&self, session: &Session) {
        let mut ticker = time::interval(self.health_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = session.lost.cancelled() => return,
                _ = ticker.tick() => {
                    if !session.channel.is_connected() {
                        error!(session = session.id, "amqp health check failed");
                        return;
                    }
                }
            }
        }
    }

    fn transition(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if !current.can_transition_to(next) {
                return false;
            }

            debug!(from = ?*current, to = ?next, "connection state changed");
            *current = next;
            true
        });
    }

    fn current(&self) -> Option<Session> {
        self.lock().clone()
    }

    fn store(&self, session: Option<Session>) {
        *self.lock() = session;
    }

    fn lock(&self) -> MutexGuard<'_, Option<Session>> {
        match self.session.lock() {
            Ok(session) => session,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
