/*!
 * Per-module status storage.
 *
 * Every driver module owns a hash of status keys under
 * `"<prefix>/<module_id>"`. Each mutation is paired with exactly one
 * publish on `"<hash_key>/<status>"` carrying the new value, or the
 * literal `"null"` on delete, so subscribers anywhere in the cluster
 * observe the hash converge.
 */
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use modlink_core::types::{Id, Value};

use crate::error::Result;
use crate::store::{Store, NULL_VALUE};

/// Status hash of a single driver module
#[derive(Clone)]
pub struct Storage {
    module_id: Id,
    hash_key: String,
    store: Arc<dyn Store>,
}

impl Storage {
    /// Create the status hash for `module_id` under `prefix`
    pub fn new(prefix: &str, module_id: Id, store: Arc<dyn Store>) -> Self {
        let hash_key = format!("{}/{}", prefix, module_id);
        Self {
            module_id,
            hash_key,
            store,
        }
    }

    /// The module this hash belongs to
    pub fn module_id(&self) -> &Id {
        &self.module_id
    }

    /// The store key the hash lives under
    pub fn hash_key(&self) -> &str {
        &self.hash_key
    }

    /// The publish channel for a status key
    pub fn channel(&self, status: &str) -> String {
        format!("{}/{}", self.hash_key, status)
    }

    /// Write a status value as a JSON string.
    ///
    /// A blank value is a delete. The mutation and its publish go to the
    /// store as one pipelined batch.
    pub async fn set(&self, status: &str, json: &str) -> Result<()> {
        if json.trim().is_empty() {
            return self.delete(status).await;
        }
        debug!(module = %self.module_id, status = %status, "status write");
        self.store
            .hset_publish(&self.hash_key, status, json, &self.channel(status))
            .await
    }

    /// Write a status value, serializing it to JSON
    pub async fn set_value(&self, status: &str, value: &Value) -> Result<()> {
        let json = value.to_json().map_err(crate::error::Error::Core)?;
        self.set(status, &json).await
    }

    /// Read a status value as its stored JSON string
    pub async fn get(&self, status: &str) -> Result<Option<String>> {
        self.store.hget(&self.hash_key, status).await
    }

    /// Remove a status key, publishing `"null"` to its channel
    pub async fn delete(&self, status: &str) -> Result<()> {
        debug!(module = %self.module_id, status = %status, "status delete");
        self.store
            .hdel_publish(&self.hash_key, status, &self.channel(status))
            .await
    }

    /// Republish the current value (or `"null"`) without mutating
    pub async fn signal_status(&self, status: &str) -> Result<()> {
        let value = self.get(status).await?;
        let payload = value.as_deref().unwrap_or(NULL_VALUE);
        self.store.publish(&self.channel(status), payload).await
    }

    /// The status keys currently set
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.store.hkeys(&self.hash_key).await
    }

    /// The status values currently set
    pub async fn values(&self) -> Result<Vec<String>> {
        self.store.hvals(&self.hash_key).await
    }

    /// The whole hash as a map
    pub async fn to_map(&self) -> Result<HashMap<String, String>> {
        self.store.hgetall(&self.hash_key).await
    }

    /// Number of status keys
    pub async fn len(&self) -> Result<usize> {
        self.store.hlen(&self.hash_key).await
    }

    /// Whether the hash is empty
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Remove every status key, publishing `"null"` for each
    pub async fn clear(&self) -> Result<()> {
        for status in self.keys().await? {
            self.delete(&status).await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("hash_key", &self.hash_key)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::store::SubscriberEvent;

    fn storage(store: &MemoryStore) -> Storage {
        Storage::new("drv", Id::from_string("m1"), Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_set_and_get_round_trip() {
        let store = MemoryStore::new();
        let storage = storage(&store);

        storage.set("power", "true").await.unwrap();
        assert_eq!(storage.get("power").await.unwrap(), Some("true".to_string()));
    }

    #[tokio::test]
    async fn test_set_publishes_on_status_channel() {
        let store = MemoryStore::new();
        let storage = storage(&store);

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("drv/m1/power").await.unwrap();

        storage.set("power", "true").await.unwrap();

        assert_eq!(
            sub.next_event().await,
            Some(SubscriberEvent::Message {
                channel: "drv/m1/power".to_string(),
                payload: "true".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_blank_value_deletes() {
        let store = MemoryStore::new();
        let storage = storage(&store);

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("drv/m1/power").await.unwrap();

        storage.set("power", "true").await.unwrap();
        storage.set("power", "").await.unwrap();

        assert_eq!(storage.get("power").await.unwrap(), None);

        // First the write, then the delete's "null"
        sub.next_event().await;
        assert_eq!(
            sub.next_event().await,
            Some(SubscriberEvent::Message {
                channel: "drv/m1/power".to_string(),
                payload: "null".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_signal_status_republishes_without_mutating() {
        let store = MemoryStore::new();
        let storage = storage(&store);
        storage.set("power", "true").await.unwrap();

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("drv/m1/power").await.unwrap();

        storage.signal_status("power").await.unwrap();
        assert_eq!(
            sub.next_event().await,
            Some(SubscriberEvent::Message {
                channel: "drv/m1/power".to_string(),
                payload: "true".to_string(),
            })
        );

        // Unset key republishes "null"
        storage.signal_status("missing").await.unwrap();
        sub.subscribe("drv/m1/missing").await.unwrap();
        storage.signal_status("missing").await.unwrap();
        assert_eq!(
            sub.next_event().await,
            Some(SubscriberEvent::Message {
                channel: "drv/m1/missing".to_string(),
                payload: "null".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_hash_inspection() {
        let store = MemoryStore::new();
        let storage = storage(&store);

        assert!(storage.is_empty().await.unwrap());

        storage.set("power", "true").await.unwrap();
        storage.set_value("volume", &Value::Integer(35)).await.unwrap();

        assert_eq!(storage.len().await.unwrap(), 2);
        let map = storage.to_map().await.unwrap();
        assert_eq!(map.get("volume"), Some(&"35".to_string()));
    }

    #[tokio::test]
    async fn test_clear_publishes_null_per_key() {
        let store = MemoryStore::new();
        let storage = storage(&store);
        storage.set("power", "true").await.unwrap();
        storage.set("input", "\"hdmi\"").await.unwrap();

        let mut sub = store.subscriber().await.unwrap();
        sub.subscribe("drv/m1/power").await.unwrap();
        sub.subscribe("drv/m1/input").await.unwrap();

        storage.clear().await.unwrap();
        assert!(storage.is_empty().await.unwrap());

        let mut nulls = 0;
        for _ in 0..2 {
            if let Some(SubscriberEvent::Message { payload, .. }) = sub.next_event().await {
                assert_eq!(payload, "null");
                nulls += 1;
            }
        }
        assert_eq!(nulls, 2);
    }
}
