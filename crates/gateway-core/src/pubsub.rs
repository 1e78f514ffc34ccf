use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::error::{GatewayError, Result};

/// A stream of raw payloads delivered on a subscribed topic.
pub type Subscription = std::pin::Pin<Box<dyn futures_util::Stream<Item = Vec<u8>> + Send>>;

/// Fanout backend for `gateway-events` (Hub's single subscriber) and
/// `cache-invalidate` (one subscriber per node, many publishers).
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<Subscription>;
}

/// Redis-backed implementation. Each subscribe opens its own dedicated
/// pub/sub connection, since Redis multiplexes subscriptions on a
/// connection that can no longer issue regular commands.
pub struct RedisPubSub {
    client: redis::Client,
}

impl RedisPubSub {
    pub fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Fatal(format!("invalid redis url: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PubSub for RedisPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| GatewayError::Transient(format!("redis connect for publish: {e}")))?;
        conn.publish::<_, _, ()>(topic, payload)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis PUBLISH {topic}: {e}")))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|e| GatewayError::Transient(format!("redis pubsub connect: {e}")))?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis SUBSCRIBE {topic}: {e}")))?;
        let stream = pubsub
            .into_on_message()
            .filter_map(|msg| async move { msg.get_payload::<Vec<u8>>().ok() });
        Ok(Box::pin(stream))
    }
}

/// In-memory fake for tests: one `broadcast` channel per topic, created
/// lazily on first publish or subscribe.
#[derive(Clone)]
pub struct InMemoryPubSub {
    topics: std::sync::Arc<tokio::sync::Mutex<std::collections::HashMap<String, broadcast::Sender<Vec<u8>>>>>,
}

impl InMemoryPubSub {
    pub fn new() -> Self {
        Self { topics: Default::default() }
    }

    async fn sender_for(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        let mut topics = self.topics.lock().await;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(1024).0)
            .clone()
    }
}

impl Default for InMemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for InMemoryPubSub {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let sender = self.sender_for(topic).await;
        // No receivers yet is not an error: matches Redis PUBLISH semantics
        // where a message with no subscribers is simply dropped.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        let sender = self.sender_for(topic).await;
        let stream = BroadcastStream::new(sender.subscribe()).filter_map(|item| async move { item.ok() });
        Ok(Box::pin(stream))
    }
}
