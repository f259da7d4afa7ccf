/*!
 * Redis-backed store client.
 *
 * Commands run on a multiplexed connection shared by clones of the store;
 * subscriptions get a dedicated pub/sub connection per subscriber. The
 * subscriber re-establishes its connection with exponential backoff and
 * reports each recovery as [`SubscriberEvent::Reconnected`] so the
 * subscribe loop can replay its channel set.
 */
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{debug, warn};

use modlink_core::config::StoreConfig;

use crate::error::{Error, Result};
use crate::store::{Store, StoreSubscriber, SubscriberEvent, NULL_VALUE};

const RECONNECT_BASE: Duration = Duration::from_secs(1);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

/// Redis implementation of the [`Store`] contract
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: MultiplexedConnection,
    request_timeout: Duration,
}

impl RedisStore {
    /// Connect to the store described by `config`
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        let conn = client.get_multiplexed_tokio_connection().await?;
        debug!("Connected to store at {}", config.url);
        Ok(Self {
            client,
            conn,
            request_timeout: config.request_timeout(),
        })
    }

    async fn bounded<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(Error::unavailable("store request timed out")),
        }
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hset(key, field, value).await })
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hget(key, field).await }).await
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hdel(key, field).await }).await
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hkeys(key).await }).await
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hvals(key).await }).await
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hlen(key).await }).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.hgetall(key).await }).await
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.get(key).await }).await
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move { conn.publish(channel, message).await })
            .await
    }

    async fn hset_publish(
        &self,
        key: &str,
        field: &str,
        value: &str,
        channel: &str,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::pipe()
                .hset(key, field, value)
                .ignore()
                .publish(channel, value)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn hdel_publish(&self, key: &str, field: &str, channel: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        self.bounded(async move {
            redis::pipe()
                .hdel(key, field)
                .ignore()
                .publish(channel, NULL_VALUE)
                .ignore()
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn subscriber(&self) -> Result<Box<dyn StoreSubscriber>> {
        let pubsub = self.client.get_async_pubsub().await?;
        Ok(Box::new(RedisSubscriber {
            client: self.client.clone(),
            pubsub: Some(pubsub),
            channels: HashSet::new(),
            backoff: RECONNECT_BASE,
            closed: false,
            closed_emitted: false,
        }))
    }
}

/// Dedicated pub/sub connection with automatic reconnection
pub struct RedisSubscriber {
    client: redis::Client,
    pubsub: Option<redis::aio::PubSub>,
    channels: HashSet<String>,
    backoff: Duration,
    closed: bool,
    closed_emitted: bool,
}

impl RedisSubscriber {
    async fn reconnect(&mut self) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in &self.channels {
            pubsub.subscribe(channel.as_str()).await?;
        }
        self.pubsub = Some(pubsub);
        self.backoff = RECONNECT_BASE;
        Ok(())
    }
}

#[async_trait]
impl StoreSubscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.channels.insert(channel.to_string());
        if let Some(pubsub) = self.pubsub.as_mut() {
            pubsub.subscribe(channel).await?;
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.channels.remove(channel);
        if let Some(pubsub) = self.pubsub.as_mut() {
            pubsub.unsubscribe(channel).await?;
        }
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<()> {
        self.channels.clear();
        if let Some(mut pubsub) = self.pubsub.take() {
            // UNSUBSCRIBE with no arguments drops every channel at once
            pubsub.unsubscribe(Vec::<String>::new()).await?;
        }
        self.closed = true;
        Ok(())
    }

    async fn next_event(&mut self) -> Option<SubscriberEvent> {
        loop {
            if self.closed {
                if self.closed_emitted {
                    return None;
                }
                self.closed_emitted = true;
                return Some(SubscriberEvent::Closed);
            }

            if self.pubsub.is_none() {
                match self.reconnect().await {
                    Ok(()) => return Some(SubscriberEvent::Reconnected),
                    Err(e) => {
                        warn!("Store subscriber reconnect failed: {}", e);
                        tokio::time::sleep(self.backoff).await;
                        self.backoff = (self.backoff * 2).min(RECONNECT_MAX);
                        continue;
                    }
                }
            }

            let Some(pubsub) = self.pubsub.as_mut() else {
                continue;
            };

            let msg = {
                let mut stream = pubsub.on_message();
                stream.next().await
            };

            match msg {
                Some(msg) => {
                    let channel = msg.get_channel_name().to_string();
                    let payload: String = msg.get_payload().unwrap_or_default();
                    return Some(SubscriberEvent::Message { channel, payload });
                }
                None => {
                    // Stream ended: the subscribing connection is gone
                    debug!("Store subscriber connection lost");
                    self.pubsub = None;
                }
            }
        }
    }
}
