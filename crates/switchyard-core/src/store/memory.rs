//! In-process `SharedStore` backed by an expiring map and broadcast channels.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;

use super::{Message, SharedStore, Subscription};
use crate::error::StoreError;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

struct MemoryStoreInner {
    entries: HashMap<String, Entry>,
    channels: HashMap<String, broadcast::Sender<Message>>,
    publish_counts: HashMap<String, u64>,
}

/// Thread-safe in-memory store. Cloning shares the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<RwLock<MemoryStoreInner>>,
    offline: Arc<AtomicBool>,
    channel_capacity: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_channel_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_channel_capacity(channel_capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MemoryStoreInner {
                entries: HashMap::new(),
                channels: HashMap::new(),
                publish_counts: HashMap::new(),
            })),
            offline: Arc::new(AtomicBool::new(false)),
            channel_capacity: channel_capacity.max(1),
        }
    }

    /// Simulate losing the connection: every operation fails until restored.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of publish calls that reached `channel`, delivered or not.
    pub async fn publish_count(&self, channel: &str) -> u64 {
        let inner = self.inner.read().await;
        inner.publish_counts.get(channel).copied().unwrap_or(0)
    }

    /// Drop expired entries. Reads already ignore them.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.is_live(now));
        before - inner.entries.len()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        inner.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let mut inner = self.inner.write().await;
        Ok(inner
            .entries
            .remove(key)
            .map(|entry| entry.is_live(now))
            .unwrap_or(false))
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        self.check_online()?;
        let now = Instant::now();
        let inner = self.inner.read().await;
        let mut keys: Vec<String> = inner
            .entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        *inner.publish_counts.entry(channel.to_string()).or_insert(0) += 1;
        let Some(sender) = inner.channels.get(channel) else {
            return Ok(0);
        };
        let message = Message {
            channel: channel.to_string(),
            payload,
        };
        // A send error only means there are no live receivers.
        Ok(sender.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError> {
        self.check_online()?;
        let mut inner = self.inner.write().await;
        let capacity = self.channel_capacity;
        let sender = inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(capacity).0);
        Ok(Subscription::new(channel, sender.subscribe()))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_get_delete() {
        let store = MemoryStore::new();
        store
            .set_ex("workflow:1", "{}".into(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("workflow:1").await.unwrap().as_deref(), Some("{}"));
        assert!(store.delete("workflow:1").await.unwrap());
        assert!(!store.delete("workflow:1").await.unwrap());
        assert!(store.get("workflow:1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_entries_expire() {
        let store = MemoryStore::new();
        store
            .set_ex("short", "v".into(), Duration::from_millis(30))
            .await
            .unwrap();
        store
            .set_ex("long", "v".into(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(store.get("short").await.unwrap().is_none());
        assert_eq!(store.keys("").await.unwrap(), vec!["long".to_string()]);
        assert_eq!(store.purge_expired().await, 1);
    }

    #[tokio::test]
    async fn test_keys_by_prefix() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60);
        store.set_ex("cache:query:a", "1".into(), ttl).await.unwrap();
        store.set_ex("cache:query:b", "2".into(), ttl).await.unwrap();
        store.set_ex("workflow:x", "3".into(), ttl).await.unwrap();
        assert_eq!(
            store.keys("cache:query:").await.unwrap(),
            vec!["cache:query:a".to_string(), "cache:query:b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let store = MemoryStore::new();
        let delivered = store.publish("domain:nlp:requests", "{}".into()).await.unwrap();
        assert_eq!(delivered, 0);
        assert_eq!(store.publish_count("domain:nlp:requests").await, 1);
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber() {
        let store = MemoryStore::new();
        let mut a = store.subscribe("global:completions").await.unwrap();
        let mut b = store.subscribe("global:completions").await.unwrap();

        let delivered = store
            .publish("global:completions", "done".into())
            .await
            .unwrap();
        assert_eq!(delivered, 2);
        assert_eq!(a.recv().await.unwrap().payload, "done");
        let msg = b.recv().await.unwrap();
        assert_eq!(msg.channel, "global:completions");
        assert_eq!(msg.payload, "done");
    }

    #[tokio::test]
    async fn test_dropped_subscription_stops_counting() {
        let store = MemoryStore::new();
        let sub = store.subscribe("c").await.unwrap();
        drop(sub);
        assert_eq!(store.publish("c", "x".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_offline_store_fails() {
        let store = MemoryStore::new();
        store.set_offline(true);
        assert!(store.ping().await.is_err());
        assert!(matches!(
            store.get("k").await,
            Err(StoreError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(store.ping().await.is_ok());
    }
}
