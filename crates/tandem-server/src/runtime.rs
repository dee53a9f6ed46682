//! The process-scoped services every socket handler and route shares.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tandem_core::constants::{
    AUTH_TIMEOUT, DEFAULT_SEND_QUEUE, MAX_MESSAGE_BYTES, PING_INTERVAL, RATE_LIMIT_PER_MINUTE,
    RATE_LIMIT_WINDOW, TASK_IDLE_TIMEOUT,
};
use tandem_core::ids::{AgentId, InstanceId, UserId};
use tandem_engine::SessionEngine;
use tandem_settings::TandemSettings;
use tandem_store::agents::AgentRepo;
use tandem_store::messages::MessageRepo;
use tandem_store::session_logs::SessionLogRepo;
use tandem_store::Database;

use crate::auth::{Authenticator, StoreAuthenticator};
use crate::broker::RelayBroker;
use crate::dispatcher::AgentDispatcher;
use crate::fanout::SessionFanout;
use crate::health::{self, HealthResponse};
use crate::rate_limit::RateLimiter;
use crate::registry::{ConnectionRegistry, SeatKey};
use crate::relay::UserRelay;

/// Timeouts and limits for one runtime.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub auth_timeout: Duration,
    pub task_idle_timeout: Duration,
    pub rate_limit_per_minute: u32,
    pub max_send_queue: usize,
    pub max_message_bytes: usize,
    pub ping_interval: Duration,
    pub resubscribe_delay: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            auth_timeout: AUTH_TIMEOUT,
            task_idle_timeout: TASK_IDLE_TIMEOUT,
            rate_limit_per_minute: RATE_LIMIT_PER_MINUTE,
            max_send_queue: DEFAULT_SEND_QUEUE,
            max_message_bytes: MAX_MESSAGE_BYTES,
            ping_interval: PING_INTERVAL,
            resubscribe_delay: Duration::from_secs(2),
        }
    }
}

impl RuntimeConfig {
    pub fn from_settings(settings: &TandemSettings) -> Self {
        Self {
            auth_timeout: Duration::from_secs(settings.runtime.auth_timeout_secs),
            task_idle_timeout: Duration::from_secs(settings.runtime.task_idle_timeout_secs),
            rate_limit_per_minute: settings.runtime.rate_limit_per_minute,
            max_send_queue: settings.server.max_send_queue,
            max_message_bytes: settings.server.max_message_bytes,
            ping_interval: Duration::from_secs(settings.server.ping_interval_secs.max(1)),
            resubscribe_delay: Duration::from_secs(settings.broker.resubscribe_delay_secs.max(1)),
        }
    }
}

pub struct Runtime {
    pub config: RuntimeConfig,
    pub instance: InstanceId,
    pub engine: Arc<SessionEngine>,
    pub users: Arc<ConnectionRegistry<UserId>>,
    pub agents: Arc<ConnectionRegistry<AgentId>>,
    pub seats: Arc<ConnectionRegistry<SeatKey>>,
    pub dispatcher: Arc<AgentDispatcher>,
    pub relay: UserRelay,
    pub fanout: Arc<SessionFanout>,
    pub auth: Arc<dyn Authenticator>,
    pub agent_repo: AgentRepo,
    pub messages: MessageRepo,
    pub logs: SessionLogRepo,
    started_at: Instant,
}

impl Runtime {
    pub fn new(db: Database, broker: Arc<dyn RelayBroker>, config: RuntimeConfig) -> Arc<Self> {
        let auth = Arc::new(StoreAuthenticator::new(db.clone()));
        Self::with_authenticator(db, broker, config, auth)
    }

    /// Same as [`Runtime::new`] with a caller-supplied credential check.
    pub fn with_authenticator(
        db: Database,
        broker: Arc<dyn RelayBroker>,
        config: RuntimeConfig,
        auth: Arc<dyn Authenticator>,
    ) -> Arc<Self> {
        let instance = InstanceId::new();
        let engine = Arc::new(SessionEngine::new(db.clone()));
        let users = Arc::new(ConnectionRegistry::new("users"));
        let agents = Arc::new(ConnectionRegistry::new("agents"));
        let seats = Arc::new(ConnectionRegistry::new("seats"));
        let dispatcher = Arc::new(AgentDispatcher::new(agents.clone(), config.task_idle_timeout));
        let relay = UserRelay::new(
            db.clone(),
            dispatcher.clone(),
            users.clone(),
            RateLimiter::new(config.rate_limit_per_minute, RATE_LIMIT_WINDOW),
        );
        let fanout = Arc::new(SessionFanout::new(
            instance.clone(),
            engine.clone(),
            seats.clone(),
            broker,
        ));

        Arc::new(Self {
            config,
            instance,
            engine,
            users,
            agents,
            seats,
            dispatcher,
            relay,
            fanout,
            auth,
            agent_repo: AgentRepo::new(db.clone()),
            messages: MessageRepo::new(db.clone()),
            logs: SessionLogRepo::new(db),
            started_at: Instant::now(),
        })
    }

    /// Start delivering other instances' session events to local sockets.
    pub fn spawn_relay_listener(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.fanout
            .spawn_relay_listener(self.config.resubscribe_delay, cancel)
    }

    pub fn health(&self) -> HealthResponse {
        health::health_check(self.started_at, self)
    }
}
