use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::{GatewayError, Result};

/// Key/value backend shared by the session store, presence substore and
/// permission cache. Everything here is a thin TTL-aware map; the callers
/// own key layout and serialization.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;
    async fn del(&self, key: &str) -> Result<()>;

    /// Sets `key` only if it doesn't already exist (or has expired).
    /// Returns `true` iff this call created it.
    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool>;

    /// Deletes `key` and reports whether it existed beforehand.
    async fn del_if_present(&self, key: &str) -> Result<bool>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>>;
    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()>;

    /// Deletes every key matching a `prefix*` glob. Used for bulk
    /// invalidation (e.g. all permission cache entries for a user).
    async fn del_prefix(&self, prefix: &str) -> Result<()>;

    /// Deletes every key matching a `*suffix` glob. Used where the
    /// invalidation scope is the tail of the key rather than the head
    /// (e.g. every user's cached entry for one channel).
    async fn del_suffix(&self, suffix: &str) -> Result<()>;
}

/// Redis-backed implementation. Grounded on the `ConnectionManager` idiom:
/// clone the manager per call, let it handle reconnects transparently.
pub struct RedisKvStore {
    conn: ConnectionManager,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| GatewayError::Fatal(format!("invalid redis url: {e}")))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| GatewayError::Transient(format!("redis connect failed: {e}")))?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get(key)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis GET {key}: {e}")))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        conn.set_ex::<_, _, ()>(key, value, secs)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis SET {key}: {e}")))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis DEL {key}: {e}")))
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let opts = redis::SetOptions::default()
            .with_expiration(redis::SetExpiry::EX(secs as usize))
            .conditional_set(redis::ExistenceCheck::NX);
        let reply: Option<String> = conn
            .set_options(key, value, opts)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis SET NX {key}: {e}")))?;
        Ok(reply.is_some())
    }

    async fn del_if_present(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: u64 = conn
            .del(key)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis DEL {key}: {e}")))?;
        Ok(deleted > 0)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        conn.mget(keys)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis MGET: {e}")))
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let secs = ttl.as_secs().max(1);
        let mut pipe = redis::pipe();
        for (k, v) in entries {
            pipe.set_ex(k, v, secs).ignore();
        }
        pipe.query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| GatewayError::Transient(format!("redis pipelined SET: {e}")))
    }

    async fn del_prefix(&self, prefix: &str) -> Result<()> {
        self.del_pattern(&format!("{prefix}*")).await
    }

    async fn del_suffix(&self, suffix: &str) -> Result<()> {
        self.del_pattern(&format!("*{suffix}")).await
    }
}

impl RedisKvStore {
    /// Cursor-based `SCAN` over a glob pattern, batched in chunks of 100
    /// per §4.B, rather than a blocking `KEYS *` scan.
    async fn del_pattern(&self, pattern: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await
                .map_err(|e| GatewayError::Transient(format!("redis SCAN {pattern}: {e}")))?;
            if !keys.is_empty() {
                conn.del::<_, ()>(keys)
                    .await
                    .map_err(|e| GatewayError::Transient(format!("redis DEL (pattern {pattern}): {e}")))?;
            }
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(())
    }
}

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// In-memory fake used by unit and integration tests. TTLs are simulated
/// against `tokio::time::Instant`, so tests can drive time with
/// `tokio::test(start_paused = true)` and `tokio::time::advance`.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<Mutex<HashMap<String, Entry>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut map = self.inner.lock().await;
        if let Some(entry) = map.get(key) {
            if entry.expires_at <= Instant::now() {
                map.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            Entry { value, expires_at: Instant::now() + ttl },
        );
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.inner.lock().await.remove(key);
        Ok(())
    }

    async fn set_if_absent(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<bool> {
        let mut map = self.inner.lock().await;
        let present = map.get(key).is_some_and(|entry| entry.expires_at > Instant::now());
        if present {
            return Ok(false);
        }
        map.insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
        Ok(true)
    }

    async fn del_if_present(&self, key: &str) -> Result<bool> {
        let mut map = self.inner.lock().await;
        let Some(entry) = map.remove(key) else {
            return Ok(false);
        };
        Ok(entry.expires_at > Instant::now())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.get(key).await?);
        }
        Ok(out)
    }

    async fn mset(&self, entries: &[(String, Vec<u8>)], ttl: Duration) -> Result<()> {
        for (k, v) in entries {
            self.set(k, v.clone(), ttl).await?;
        }
        Ok(())
    }

    async fn del_prefix(&self, prefix: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }

    async fn del_suffix(&self, suffix: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.retain(|k, _| !k.ends_with(suffix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrips() {
        let store = InMemoryKvStore::new();
        store.set("a", b"hello".to_vec(), Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let store = InMemoryKvStore::new();
        store.set("a", b"hello".to_vec(), Duration::from_secs(1)).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn del_prefix_removes_matching_keys_only() {
        let store = InMemoryKvStore::new();
        store.set("perms:1:a", b"x".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("perms:1:b", b"y".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("perms:2:a", b"z".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.del_prefix("perms:1:").await.unwrap();
        assert_eq!(store.get("perms:1:a").await.unwrap(), None);
        assert_eq!(store.get("perms:1:b").await.unwrap(), None);
        assert_eq!(store.get("perms:2:a").await.unwrap(), Some(b"z".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn del_suffix_removes_matching_keys_only() {
        let store = InMemoryKvStore::new();
        store.set("perms:1:c1", b"x".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("perms:2:c1", b"y".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.set("perms:1:c2", b"z".to_vec(), Duration::from_secs(60)).await.unwrap();
        store.del_suffix(":c1").await.unwrap();
        assert_eq!(store.get("perms:1:c1").await.unwrap(), None);
        assert_eq!(store.get("perms:2:c1").await.unwrap(), None);
        assert_eq!(store.get("perms:1:c2").await.unwrap(), Some(b"z".to_vec()));
    }
}
