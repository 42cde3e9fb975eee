//! Redis backend for tier 2.
//!
//! Commands go through a [`ConnectionManager`] (reconnects transparently);
//! subscriptions open a dedicated pub/sub connection whose messages are
//! forwarded onto a bounded queue by a spawned task.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::mpsc;
use tracing::debug;

use super::backend::{ChannelMessage, DistributedBackend};
use crate::error::{Error, Result};

/// Keys fetched per SCAN round trip
const SCAN_BATCH: usize = 100;

fn backend_err(e: redis::RedisError) -> Error {
    if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
        Error::TierUnavailable(e.to_string())
    } else {
        Error::Backend(e.to_string())
    }
}

/// Tier 2 over Redis
pub struct RedisBackend {
    client: Client,
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Connect to `redis://host:port/db`
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).map_err(|e| Error::Config(e.to_string()))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .map_err(backend_err)?;
        debug!(url = %url, "Connected to Redis");
        Ok(Self { client, connection })
    }
}

#[async_trait]
impl DistributedBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let mut conn = self.connection.clone();
        let value: Option<Vec<u8>> = conn.get(key).await.map_err(backend_err)?;
        Ok(value.map(Bytes::from))
    }

    async fn set_ex(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        let mut conn = self.connection.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value.as_ref(), secs)
            .await
            .map_err(backend_err)
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.connection.clone();
        conn.del(keys).await.map_err(backend_err)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut conn = self.connection.clone();
        let pattern = format!("{}*", prefix);
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        // SCAN instead of KEYS so large keyspaces do not block the server
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await
                .map_err(backend_err)?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, payload)
            .await
            .map_err(backend_err)
    }

    async fn subscribe(
        &self,
        patterns: &[String],
        capacity: usize,
    ) -> Result<mpsc::Receiver<ChannelMessage>> {
        let mut pubsub = self.client.get_async_pubsub().await.map_err(backend_err)?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await.map_err(backend_err)?;
        }

        let (tx, rx) = mpsc::channel(capacity.max(1));
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let message =
                    ChannelMessage::from_bytes(msg.get_channel_name(), msg.get_payload_bytes());
                if tx.send(message).await.is_err() {
                    // Receiver gone: coordinator shut down
                    break;
                }
            }
            debug!("Redis subscription closed");
        });
        Ok(rx)
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager closes when the last clone drops
        Ok(())
    }
}
