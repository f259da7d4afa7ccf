/*!
 * In-memory store.
 *
 * A process-local implementation of the [`Store`] contract used by tests
 * and local development. Publishes go through a broadcast channel so
 * subscribers observe the same mutation/publish pairing as with the real
 * store. `simulate_reconnect` drives the subscribe loop's resubscribe
 * path without a network.
 */
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::Result;
use crate::store::{Store, StoreSubscriber, SubscriberEvent, NULL_VALUE};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
struct MemoryInner {
    hashes: Mutex<HashMap<String, HashMap<String, String>>>,
    keys: Mutex<HashMap<String, String>>,
    messages: broadcast::Sender<(String, String)>,
    control: broadcast::Sender<()>,
}

/// In-memory implementation of the [`Store`] contract
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (control, _) = broadcast::channel(8);
        Self {
            inner: Arc::new(MemoryInner {
                hashes: Mutex::new(HashMap::new()),
                keys: Mutex::new(HashMap::new()),
                messages,
                control,
            }),
        }
    }

    /// Set a plain string key (role lookups in tests)
    pub fn put(&self, key: &str, value: &str) {
        self.inner
            .keys
            .lock()
            .expect("memory store lock poisoned")
            .insert(key.to_string(), value.to_string());
    }

    /// Force every subscriber to observe a reconnect
    pub fn simulate_reconnect(&self) {
        let _ = self.inner.control.send(());
    }

    fn broadcast(&self, channel: &str, message: &str) {
        // No receivers is fine; subscribers may come and go
        let _ = self
            .inner
            .messages
            .send((channel.to_string(), message.to_string()));
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        Ok(hashes.get(key).and_then(|h| h.get(field).cloned()))
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        let mut hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        if let Some(hash) = hashes.get_mut(key) {
            hash.remove(field);
            if hash.is_empty() {
                hashes.remove(key);
            }
        }
        Ok(())
    }

    async fn hkeys(&self, key: &str) -> Result<Vec<String>> {
        let hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        Ok(hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hvals(&self, key: &str) -> Result<Vec<String>> {
        let hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        Ok(hashes
            .get(key)
            .map(|h| h.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn hlen(&self, key: &str) -> Result<usize> {
        let hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        Ok(hashes.get(key).map(|h| h.len()).unwrap_or(0))
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        let hashes = self.inner.hashes.lock().expect("memory store lock poisoned");
        Ok(hashes.get(key).cloned().unwrap_or_default())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let keys = self.inner.keys.lock().expect("memory store lock poisoned");
        Ok(keys.get(key).cloned())
    }

    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        self.broadcast(channel, message);
        Ok(())
    }

    async fn hset_publish(
        &self,
        key: &str,
        field: &str,
        value: &str,
        channel: &str,
    ) -> Result<()> {
        self.hset(key, field, value).await?;
        self.broadcast(channel, value);
        Ok(())
    }

    async fn hdel_publish(&self, key: &str, field: &str, channel: &str) -> Result<()> {
        self.hdel(key, field).await?;
        self.broadcast(channel, NULL_VALUE);
        Ok(())
    }

    async fn subscriber(&self) -> Result<Box<dyn StoreSubscriber>> {
        Ok(Box::new(MemorySubscriber {
            messages: self.inner.messages.subscribe(),
            control: self.inner.control.subscribe(),
            channels: HashSet::new(),
            closed: false,
            closed_emitted: false,
        }))
    }
}

/// Subscriber half of [`MemoryStore`]
pub struct MemorySubscriber {
    messages: broadcast::Receiver<(String, String)>,
    control: broadcast::Receiver<()>,
    channels: HashSet<String>,
    closed: bool,
    closed_emitted: bool,
}

#[async_trait]
impl StoreSubscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> Result<()> {
        self.channels.insert(channel.to_string());
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> Result<()> {
        self.channels.remove(channel);
        Ok(())
    }

    async fn unsubscribe_all(&mut self) -> Result<()> {
        self.channels.clear();
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

            tokio::select! {
                msg = self.messages.recv() => match msg {
                    Ok((channel, payload)) => {
                        if self.channels.contains(&channel) {
                            return Some(SubscriberEvent::Message { channel, payload });
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Memory subscriber lagged by {} messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                ctl = self.control.recv() => match ctl {
                    Ok(()) => return Some(SubscriberEvent::Reconnected),
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}
