/*!
 * The store contract.
 *
 * The status store is a key/value + pub/sub collaborator (Redis in
 * production). It is injected wherever it is needed; nothing in the crate
 * holds a process-global client, so tests run against [`MemoryStore`]
 * without touching the network.
 *
 * [`MemoryStore`]: crate::memory::MemoryStore
 */
use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;

/// Value published on a channel when a key is removed
pub const NULL_VALUE: &str = "null";

/// Key/value + pub/sub store operations used by the driver runtime.
///
/// Mutating hash operations have pipelined `*_publish` variants that issue
/// the mutation and the matching publish as one batch, so a subscriber on
/// the channel observes every mutation exactly once.
#[async_trait]
pub trait Store: Send + Sync {
    /// Set a hash field
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;

    /// Get a hash field
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;

    /// Delete a hash field
    async fn hdel(&self, key: &str, field: &str) -> Result<()>;

    /// List the fields of a hash
    async fn hkeys(&self, key: &str) -> Result<Vec<String>>;

    /// List the values of a hash
    async fn hvals(&self, key: &str) -> Result<Vec<String>>;

    /// Number of fields in a hash
    async fn hlen(&self, key: &str) -> Result<usize>;

    /// All field/value pairs of a hash
    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>>;

    /// Get a plain string key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Publish a message on a channel
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;

    /// Set a hash field and publish the new value on `channel`, pipelined
    async fn hset_publish(&self, key: &str, field: &str, value: &str, channel: &str)
        -> Result<()>;

    /// Delete a hash field and publish [`NULL_VALUE`] on `channel`, pipelined
    async fn hdel_publish(&self, key: &str, field: &str, channel: &str) -> Result<()>;

    /// Open a dedicated subscribing connection to the store
    async fn subscriber(&self) -> Result<Box<dyn StoreSubscriber>>;
}

/// An event observed by a subscribing connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriberEvent {
    /// A message arrived on a subscribed channel
    Message {
        /// The channel the message was published on
        channel: String,
        /// The message payload
        payload: String,
    },
    /// The subscribing connection was lost and re-established; every
    /// channel must be re-subscribed by the caller
    Reconnected,
    /// The subscribing connection was closed on request
    Closed,
}

/// A dedicated subscribing connection to the store.
///
/// Owned by the subscribe loop; all methods take `&mut self` so the loop
/// is the single writer on the connection.
#[async_trait]
pub trait StoreSubscriber: Send {
    /// Subscribe to a channel
    async fn subscribe(&mut self, channel: &str) -> Result<()>;

    /// Unsubscribe from a channel
    async fn unsubscribe(&mut self, channel: &str) -> Result<()>;

    /// Unsubscribe from every channel and close the connection; the event
    /// stream ends after a final [`SubscriberEvent::Closed`]
    async fn unsubscribe_all(&mut self) -> Result<()>;

    /// Wait for the next event; `None` once the stream has ended
    async fn next_event(&mut self) -> Option<SubscriberEvent>;
}
