// Redis implementation of Broadcaster
//
// PUBLISH goes through a shared ConnectionManager (reconnects on its own).
// Each subscription opens its own pub/sub connection; when that connection
// drops the subscription ends with TransportFailure and the session closes.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use storyline_core::{BroadcastError, Broadcaster, MessageHandler};

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct RedisBroadcaster {
    client: redis::Client,
    publisher: ConnectionManager,
    ping_timeout: Duration,
}

impl RedisBroadcaster {
    /// Connect to Redis; fails if the server is not reachable
    pub async fn connect(url: &str) -> anyhow::Result<Self> {
        let client = redis::Client::open(url)?;
        let publisher = client.get_connection_manager().await?;
        Ok(Self {
            client,
            publisher,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        })
    }

    pub fn with_ping_timeout(mut self, timeout: Duration) -> Self {
        self.ping_timeout = timeout;
        self
    }
}

fn unavailable(e: redis::RedisError) -> BroadcastError {
    warn!("Redis unavailable: {}", e);
    BroadcastError::Unavailable
}

#[async_trait]
impl Broadcaster for RedisBroadcaster {
    async fn is_available(&self) -> bool {
        let mut conn = self.publisher.clone();
        let ping = async move {
            let pong: redis::RedisResult<String> = redis::cmd("PING").query_async(&mut conn).await;
            pong
        };
        match tokio::time::timeout(self.ping_timeout, ping).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!("Redis ping failed: {}", e);
                false
            }
            Err(_) => {
                debug!("Redis ping timed out");
                false
            }
        }
    }

    #[instrument(skip(self, message))]
    async fn publish(&self, channel: &str, message: &str) -> Result<usize, BroadcastError> {
        let mut conn = self.publisher.clone();
        let receivers: usize = conn.publish(channel, message).await.map_err(unavailable)?;
        Ok(receivers)
    }

    #[instrument(skip(self, handler, cancel))]
    async fn subscribe(
        &self,
        channels: &[String],
        handler: &mut dyn MessageHandler,
        cancel: CancellationToken,
    ) -> Result<(), BroadcastError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(unavailable)?;
        for channel in channels {
            pubsub
                .subscribe(channel.as_str())
                .await
                .map_err(|e| BroadcastError::transport(e.to_string()))?;
        }
        debug!(?channels, "Subscribed");

        let mut messages = pubsub.on_message();
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                msg = messages.next() => msg,
            };

            let Some(msg) = msg else {
                return Err(BroadcastError::transport("pub/sub connection closed"));
            };

            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping undecodable pub/sub payload: {}", e);
                    continue;
                }
            };

            if handler
                .on_message(msg.get_channel_name(), &payload)
                .await
                .is_break()
            {
                return Ok(());
            }
        }
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

