use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::kv::KvStore;

const PERMISSION_CACHE_TTL: Duration = Duration::from_secs(300);

/// Permission masks are stored as the decimal string form of a 64-bit
/// integer (§6.3), not raw bytes, so cached values stay human-readable
/// under `redis-cli GET`.
fn encode(mask: u64) -> Vec<u8> {
    mask.to_string().into_bytes()
}

fn decode(bytes: &[u8]) -> Option<u64> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

/// Caches resolved permission bitmasks keyed by `(user, channel)`. A
/// `channel_id` of `None` is the server-wide (no channel context) entry.
pub struct PermissionCache {
    kv: Arc<dyn KvStore>,
}

impl PermissionCache {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn key(user_id: &str, channel_id: Option<&str>) -> String {
        match channel_id {
            Some(cid) => format!("perms:{user_id}:{cid}"),
            None => format!("perms:{user_id}:_server"),
        }
    }

    pub async fn get(&self, user_id: &str, channel_id: Option<&str>) -> Result<Option<u64>> {
        let Some(bytes) = self.kv.get(&Self::key(user_id, channel_id)).await? else {
            return Ok(None);
        };
        Ok(decode(&bytes))
    }

    pub async fn set(&self, user_id: &str, channel_id: Option<&str>, mask: u64) -> Result<()> {
        self.kv
            .set(&Self::key(user_id, channel_id), encode(mask), PERMISSION_CACHE_TTL)
            .await
    }

    pub async fn get_many(
        &self,
        user_id: &str,
        channel_ids: &[String],
    ) -> Result<Vec<Option<u64>>> {
        let keys: Vec<String> = channel_ids.iter().map(|c| Self::key(user_id, Some(c))).collect();
        let raw = self.kv.mget(&keys).await?;
        Ok(raw.into_iter().map(|b| b.and_then(|bytes| decode(&bytes))).collect())
    }

    pub async fn set_many(
        &self,
        user_id: &str,
        entries: &[(String, u64)],
    ) -> Result<()> {
        let encoded: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(cid, mask)| (Self::key(user_id, Some(cid)), encode(*mask)))
            .collect();
        self.kv.mset(&encoded, PERMISSION_CACHE_TTL).await
    }

    /// Bulk read across users for a single channel, one round trip.
    pub async fn get_many_users(
        &self,
        channel_id: &str,
        user_ids: &[String],
    ) -> Result<Vec<Option<u64>>> {
        let keys: Vec<String> = user_ids.iter().map(|u| Self::key(u, Some(channel_id))).collect();
        let raw = self.kv.mget(&keys).await?;
        Ok(raw.into_iter().map(|b| b.and_then(|bytes| decode(&bytes))).collect())
    }

    /// Bulk write across users for a single channel, one round trip.
    pub async fn set_many_users(
        &self,
        channel_id: &str,
        entries: &[(String, u64)],
    ) -> Result<()> {
        let encoded: Vec<(String, Vec<u8>)> = entries
            .iter()
            .map(|(uid, mask)| (Self::key(uid, Some(channel_id)), encode(*mask)))
            .collect();
        self.kv.mset(&encoded, PERMISSION_CACHE_TTL).await
    }

    /// Drops every cached entry (server-wide and per-channel) for one user.
    pub async fn delete_by_user(&self, user_id: &str) -> Result<()> {
        self.kv.del_prefix(&format!("perms:{user_id}:")).await
    }

    /// Drops the cached entry for one user in one channel only.
    pub async fn delete_exact(&self, user_id: &str, channel_id: Option<&str>) -> Result<()> {
        self.kv.del(&Self::key(user_id, channel_id)).await
    }

    /// Drops every user's cached entry for a channel, via a suffix scan.
    /// Cursor-based (batch 100) on the Redis backend; callers invoke it
    /// sparingly (role/overwrite changes, not per-message).
    pub async fn delete_by_channel(&self, channel_id: &str) -> Result<()> {
        self.kv.del_suffix(&format!(":{channel_id}")).await
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.kv.del_prefix("perms:").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn cache() -> PermissionCache {
        PermissionCache::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrips_mask() {
        let cache = cache();
        cache.set("u1", Some("c1"), 0b1011).await.unwrap();
        assert_eq!(cache.get("u1", Some("c1")).await.unwrap(), Some(0b1011));
    }

    #[tokio::test(start_paused = true)]
    async fn server_wide_and_channel_entries_are_distinct() {
        let cache = cache();
        cache.set("u1", None, 0xFF).await.unwrap();
        cache.set("u1", Some("c1"), 0x0F).await.unwrap();
        assert_eq!(cache.get("u1", None).await.unwrap(), Some(0xFF));
        assert_eq!(cache.get("u1", Some("c1")).await.unwrap(), Some(0x0F));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_by_user_clears_all_channels() {
        let cache = cache();
        cache.set("u1", Some("c1"), 1).await.unwrap();
        cache.set("u1", Some("c2"), 2).await.unwrap();
        cache.set("u2", Some("c1"), 3).await.unwrap();
        cache.delete_by_user("u1").await.unwrap();
        assert_eq!(cache.get("u1", Some("c1")).await.unwrap(), None);
        assert_eq!(cache.get("u1", Some("c2")).await.unwrap(), None);
        assert_eq!(cache.get("u2", Some("c1")).await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_by_channel_clears_every_user_for_that_channel_only() {
        let cache = cache();
        cache.set("u1", Some("c1"), 1).await.unwrap();
        cache.set("u2", Some("c1"), 2).await.unwrap();
        cache.set("u1", Some("c2"), 3).await.unwrap();
        cache.delete_by_channel("c1").await.unwrap();
        assert_eq!(cache.get("u1", Some("c1")).await.unwrap(), None);
        assert_eq!(cache.get("u2", Some("c1")).await.unwrap(), None);
        assert_eq!(cache.get("u1", Some("c2")).await.unwrap(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn get_many_users_and_set_many_users_round_trip() {
        let cache = cache();
        cache.set_many_users("c1", &[("u1".to_string(), 5), ("u2".to_string(), 6)]).await.unwrap();
        let result = cache.get_many_users("c1", &["u1".to_string(), "u2".to_string(), "u3".to_string()]).await.unwrap();
        assert_eq!(result, vec![Some(5), Some(6), None]);
    }
}
