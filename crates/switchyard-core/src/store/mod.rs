//! Shared state and messaging substrate.
//!
//! Every component talks to the others only through a [`SharedStore`]:
//! key/value documents with expiry plus fire-and-forget pub/sub channels.
//! Delivery is at-most-once per subscriber; publishing to a channel nobody
//! listens on succeeds and reports zero receivers.

pub mod memory;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{OrchestratorError, StoreError};

pub use memory::MemoryStore;

/// A message delivered on a pub/sub channel.
#[derive(Debug, Clone)]
pub struct Message {
    pub channel: String,
    pub payload: String,
}

/// A live channel subscription. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: broadcast::Receiver<Message>,
}

impl Subscription {
    pub fn new(channel: impl Into<String>, rx: broadcast::Receiver<Message>) -> Self {
        Self {
            channel: channel.into(),
            rx,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next message. Returns `None` once the channel is closed.
    /// Messages dropped because this subscriber lagged are logged and skipped.
    pub async fn recv(&mut self) -> Option<Message> {
        loop {
            match self.rx.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(
                        "[Store] Subscriber on '{}' lagged, {} message(s) dropped",
                        self.channel,
                        skipped
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[async_trait]
pub trait SharedStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError>;

    /// Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Live keys starting with `prefix`.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Publish and return the number of subscribers that received it.
    async fn publish(&self, channel: &str, payload: String) -> Result<usize, StoreError>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

pub type DynStore = Arc<dyn SharedStore>;

// ─── Typed helpers ─────────────────────────────────────────────────────────

pub async fn load_json<T: DeserializeOwned>(
    store: &dyn SharedStore,
    key: &str,
) -> Result<Option<T>, OrchestratorError> {
    match store.get(key).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn save_json<T: Serialize>(
    store: &dyn SharedStore,
    key: &str,
    value: &T,
    ttl: Duration,
) -> Result<(), OrchestratorError> {
    let raw = serde_json::to_string(value)?;
    store.set_ex(key, raw, ttl).await?;
    Ok(())
}

pub async fn publish_json<T: Serialize>(
    store: &dyn SharedStore,
    channel: &str,
    value: &T,
) -> Result<usize, OrchestratorError> {
    let raw = serde_json::to_string(value)?;
    Ok(store.publish(channel, raw).await?)
}

// ─── Key and channel names ─────────────────────────────────────────────────

pub mod keys {
    pub const WORKFLOW_PREFIX: &str = "workflow:";
    pub const QUERY_CACHE_PREFIX: &str = "cache:query:";

    pub fn workflow(request_id: &str) -> String {
        format!("{}{}", WORKFLOW_PREFIX, request_id)
    }

    pub fn query_cache(digest: &str) -> String {
        format!("{}{}", QUERY_CACHE_PREFIX, digest)
    }
}

pub mod channels {
    use crate::models::{Domain, SlaveType};

    pub const GLOBAL_COMPLETIONS: &str = "global:completions";

    pub fn domain_requests(domain: Domain) -> String {
        format!("domain:{}:requests", domain.as_str())
    }

    pub fn domain_results(domain: Domain) -> String {
        format!("domain:{}:results", domain.as_str())
    }

    pub fn slave_tasks(domain: Domain, slave_type: SlaveType) -> String {
        format!("slave_pool:{}:{}:tasks", domain.as_str(), slave_type.as_str())
    }
}
