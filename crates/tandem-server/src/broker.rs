//! Cross-process relay of session events.
//!
//! Every instance publishes what it broadcast locally and listens for what
//! the others broadcast. Messages carry their origin so an instance can skip
//! its own.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};

use tandem_core::ids::{InstanceId, SessionId, UserId};
use tandem_core::protocol::SessionServerMessage;

const LOCAL_CAPACITY: usize = 1024;

/// Upper bound on one publish, connecting included.
pub const PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayMessage {
    pub origin: InstanceId,
    pub session_id: SessionId,
    pub event: RelayEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude: Option<UserId>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RelayEvent {
    /// Re-read the session and push fresh role-filtered views.
    StateChanged,
    /// Deliver as-is to local participants.
    Event { message: SessionServerMessage },
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

pub type RelayStream = BoxStream<'static, RelayMessage>;

#[async_trait]
pub trait RelayBroker: Send + Sync {
    fn name(&self) -> &'static str;

    async fn publish(&self, message: &RelayMessage) -> Result<(), BrokerError>;

    /// A stream of everything published from now on, own messages included.
    async fn subscribe(&self) -> Result<RelayStream, BrokerError>;
}

/// In-process broker. Runtimes sharing one instance behave like separate
/// processes sharing a pub/sub server.
#[derive(Clone)]
pub struct LocalBroker {
    sender: broadcast::Sender<RelayMessage>,
}

impl LocalBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(LOCAL_CAPACITY);
        Self { sender }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RelayBroker for LocalBroker {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn publish(&self, message: &RelayMessage) -> Result<(), BrokerError> {
        // No subscribers is not an error.
        let _ = self.sender.send(message.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<RelayStream, BrokerError> {
        let stream = BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move {
            match item {
                Ok(message) => Some(message),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    warn!(skipped, "relay subscriber lagged");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Redis PUBLISH/SUBSCRIBE on a single channel.
pub struct RedisBroker {
    client: redis::Client,
    channel: String,
    publisher: Mutex<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisBroker {
    pub fn new(url: &str, channel: impl Into<String>) -> Result<Self, BrokerError> {
        Ok(Self {
            client: redis::Client::open(url)?,
            channel: channel.into(),
            publisher: Mutex::new(None),
            timeout: PUBLISH_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn publisher(&self) -> Result<MultiplexedConnection, BrokerError> {
        if let Some(conn) = self.publisher.lock().clone() {
            return Ok(conn);
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.publisher.lock() = Some(conn.clone());
        Ok(conn)
    }
}

#[async_trait]
impl RelayBroker for RedisBroker {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn publish(&self, message: &RelayMessage) -> Result<(), BrokerError> {
        let payload = serde_json::to_string(message)?;
        let attempt = async {
            let mut conn = self.publisher().await?;
            let _: i64 = conn.publish(&self.channel, payload).await?;
            Ok::<_, BrokerError>(())
        };
        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(BrokerError::Timeout(self.timeout)),
        };
        if result.is_err() {
            // Reconnect on the next publish.
            self.publisher.lock().take();
        }
        result
    }

    async fn subscribe(&self) -> Result<RelayStream, BrokerError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;
        debug!(channel = %self.channel, "subscribed to relay channel");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "unreadable relay payload");
                    return None;
                }
            };
            match serde_json::from_str::<RelayMessage>(&payload) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!(error = %e, "malformed relay message");
                    None
                }
            }
        });
        Ok(stream.boxed())
    }
}

/// Pick the broker named by the settings. A Redis broker that cannot even be
/// configured falls back to local delivery.
pub fn from_settings(settings: &tandem_settings::BrokerSettings) -> Arc<dyn RelayBroker> {
    match (settings.kind, settings.redis_url.as_deref()) {
        (tandem_settings::BrokerKind::Redis, Some(url)) => match RedisBroker::new(url, &settings.channel) {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                warn!(error = %e, "redis broker unavailable, relaying within this process only");
                Arc::new(LocalBroker::new())
            }
        },
        (tandem_settings::BrokerKind::Redis, None) => {
            warn!("broker kind is redis but no redisUrl is set, relaying within this process only");
            Arc::new(LocalBroker::new())
        }
        (tandem_settings::BrokerKind::Local, _) => Arc::new(LocalBroker::new()),
    }
}
