use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;
use crate::permissions::cache::PermissionCache;
use crate::pubsub::PubSub;

const TOPIC: &str = "cache-invalidate";

/// Wire shape for the `cache-invalidate` topic (§6.2): a flat object with
/// optional fields rather than a tagged enum, so any external mutator
/// (role edits, member changes, override changes) can publish it without
/// depending on this crate's serde representation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InvalidationMessage {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub all: Option<bool>,
}

/// Publishes cache invalidation events so every node drops its local
/// permission cache entries in step, and (per-node) subscribes to apply
/// them against its own `PermissionCache`.
pub struct PermissionInvalidator {
    bus: Arc<dyn PubSub>,
}

impl PermissionInvalidator {
    pub fn new(bus: Arc<dyn PubSub>) -> Self {
        Self { bus }
    }

    async fn publish(&self, msg: InvalidationMessage) -> Result<()> {
        let bytes = serde_json::to_vec(&msg).expect("InvalidationMessage serializes");
        self.bus.publish(TOPIC, bytes).await
    }

    pub async fn invalidate_user(&self, user_id: &str) -> Result<()> {
        self.publish(InvalidationMessage { user_id: Some(user_id.to_string()), ..Default::default() }).await
    }

    pub async fn invalidate_channel(&self, channel_id: &str) -> Result<()> {
        self.publish(InvalidationMessage { channel_id: Some(channel_id.to_string()), ..Default::default() }).await
    }

    pub async fn invalidate_user_channel(&self, user_id: &str, channel_id: &str) -> Result<()> {
        self.publish(InvalidationMessage {
            user_id: Some(user_id.to_string()),
            channel_id: Some(channel_id.to_string()),
            ..Default::default()
        })
        .await
    }

    pub async fn invalidate_all(&self) -> Result<()> {
        self.publish(InvalidationMessage { all: Some(true), ..Default::default() }).await
    }

    /// Runs forever, applying invalidation messages against `cache` as they
    /// arrive. A message this node can't deserialize is logged and skipped
    /// rather than tearing down the loop — a malformed payload from one
    /// node shouldn't take every other node's cache out of sync.
    pub async fn run(&self, cache: Arc<PermissionCache>) -> Result<()> {
        let mut stream = self.bus.subscribe(TOPIC).await?;
        while let Some(payload) = stream.next().await {
            let msg: InvalidationMessage = match serde_json::from_slice(&payload) {
                Ok(msg) => msg,
                Err(err) => {
                    warn!(error = %err, "discarding malformed cache-invalidate payload");
                    continue;
                }
            };
            if let Err(err) = apply(&cache, msg).await {
                warn!(error = %err, "failed to apply cache invalidation");
            }
        }
        Ok(())
    }
}

/// Maps a message to exactly one cache operation per §4.C: `all` takes
/// priority over any other fields present; otherwise (user,chan)=exact,
/// (user only)=DeleteByUser, (chan only)=DeleteByChannel, neither=no-op.
async fn apply(cache: &PermissionCache, msg: InvalidationMessage) -> Result<()> {
    if msg.all.unwrap_or(false) {
        return cache.delete_all().await;
    }
    match (msg.user_id, msg.channel_id) {
        (Some(user_id), Some(channel_id)) => cache.delete_exact(&user_id, Some(&channel_id)).await,
        (Some(user_id), None) => cache.delete_by_user(&user_id).await,
        (None, Some(channel_id)) => cache.delete_by_channel(&channel_id).await,
        (None, None) => Ok(()),
    }
}
