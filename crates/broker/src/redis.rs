//! Redis-backed broker.
//!
//! Connection layout:
//! - one [`ConnectionManager`] (auto-reconnecting, multiplexed) for every
//!   non-blocking command,
//! - one dedicated multiplexed connection for `BLPOP`, so a worker parked in
//!   a blocking pop never delays publishes or submissions sharing this broker,
//! - one fresh pub/sub connection per [`Subscription`], closed when the
//!   subscription is dropped.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use courier_core::config::RedisConfig;
use courier_core::CourierError;
use futures::StreamExt;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{AsyncCommands, Client, ConnectionAddr, ConnectionInfo, RedisConnectionInfo, RedisError};
use tracing::{debug, info, instrument, warn};

use crate::subscription::Subscription;
use crate::traits::{Broker, CappedList, KeyValueStore, PubSub, WorkQueue};

/// Inclusive list index of the `count`-th element, saturating at `isize::MAX`.
fn last_index(count: usize) -> isize {
    isize::try_from(count).unwrap_or(isize::MAX) - 1
}

fn transport(e: RedisError) -> CourierError {
    CourierError::Transport(e.to_string())
}

pub struct RedisBroker {
    client: Client,
    commands: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

impl RedisBroker {
    /// Connect using the workspace Redis settings.
    #[instrument(skip_all, fields(endpoint = %config.redacted_url()))]
    pub async fn connect(config: &RedisConfig) -> Result<Self, CourierError> {
        let client = match &config.url {
            Some(url) => Client::open(url.as_str()).map_err(transport)?,
            None => Client::open(ConnectionInfo {
                addr: ConnectionAddr::Tcp(config.host.clone(), config.port),
                redis: RedisConnectionInfo {
                    db: config.db,
                    password: config.password.clone(),
                    ..Default::default()
                },
            })
            .map_err(transport)?,
        };
        Self::from_client(client).await
    }

    /// Connect to a `redis://` URL.
    pub async fn open(url: &str) -> Result<Self, CourierError> {
        let client = Client::open(url).map_err(transport)?;
        Self::from_client(client).await
    }

    async fn from_client(client: Client) -> Result<Self, CourierError> {
        let commands = client.get_connection_manager().await.map_err(transport)?;
        info!("connected to redis");
        Ok(Self {
            client,
            commands,
            blocking: Mutex::new(None),
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.commands.clone()
    }

    /// Run `BLPOP` on the dedicated blocking connection, reopening it after
    /// a failure.
    async fn blocking_pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, CourierError> {
        let cached = self.blocking.lock().ok().and_then(|slot| slot.clone());
        let mut conn = match cached {
            Some(conn) => conn,
            None => self
                .client
                .get_multiplexed_async_connection()
                .await
                .map_err(transport)?,
        };

        // BLPOP treats 0 as "block forever"; never send it.
        let secs = wait.as_secs_f64().max(0.001);
        let reply: Result<Option<(String, Vec<u8>)>, RedisError> = redis::cmd("BLPOP")
            .arg(queue)
            .arg(secs)
            .query_async(&mut conn)
            .await;

        match reply {
            Ok(item) => {
                if let Ok(mut slot) = self.blocking.lock() {
                    *slot = Some(conn);
                }
                Ok(item.map(|(_, value)| value))
            }
            Err(e) => {
                warn!(error = %e, "blocking connection failed, will reconnect");
                if let Ok(mut slot) = self.blocking.lock() {
                    *slot = None;
                }
                Err(transport(e))
            }
        }
    }
}

#[async_trait]
impl WorkQueue for RedisBroker {
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<u64, CourierError> {
        self.conn().rpush(queue, item).await.map_err(transport)
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, CourierError> {
        self.blocking_pop(queue, wait).await
    }

    async fn len(&self, queue: &str) -> Result<u64, CourierError> {
        self.conn().llen(queue).await.map_err(transport)
    }
}

#[async_trait]
impl KeyValueStore for RedisBroker {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CourierError> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
        }
        let mut conn = self.conn();
        let _: () = cmd.query_async(&mut conn).await.map_err(transport)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError> {
        self.conn().get(key).await.map_err(transport)
    }

    async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        let removed: u64 = self.conn().del(key).await.map_err(transport)?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl PubSub for RedisBroker {
    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<u64, CourierError> {
        self.conn().publish(channel, message).await.map_err(transport)
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CourierError> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(transport)?;
        // Resolves once Redis has acknowledged the SUBSCRIBE.
        pubsub.subscribe(channel).await.map_err(transport)?;
        debug!(channel = %channel, "subscribed");

        let messages = pubsub
            .into_on_message()
            .map(|msg| msg.get_payload_bytes().to_vec());
        Ok(Subscription::new(channel, messages.boxed()))
    }
}

#[async_trait]
impl CappedList for RedisBroker {
    async fn prepend_capped(&self, list: &str, entry: Vec<u8>, max_len: usize) -> Result<(), CourierError> {
        let stop = last_index(max_len.max(1));
        let mut conn = self.conn();
        let _: () = redis::pipe()
            .atomic()
            .lpush(list, entry)
            .ignore()
            .ltrim(list, 0, stop)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(transport)?;
        Ok(())
    }

    async fn head(&self, list: &str, count: usize) -> Result<Vec<Vec<u8>>, CourierError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let stop = last_index(count);
        self.conn()
            .lrange(list, 0, stop)
            .await
            .map_err(transport)
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn ping(&self) -> Result<(), CourierError> {
        let mut conn = self.conn();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.map_err(transport)?;
        debug!(reply = %pong, "ping");
        Ok(())
    }

    fn name(&self) -> &str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_index_never_wraps_negative() {
        assert_eq!(last_index(1), 0);
        assert_eq!(last_index(20), 19);
        assert_eq!(last_index(isize::MAX as usize), isize::MAX - 1);
        assert_eq!(last_index(usize::MAX), isize::MAX - 1);
    }
}
