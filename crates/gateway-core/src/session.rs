use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::KvStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMeta {
    pub user_id: String,
    pub last_seq: u64,
    pub disconnected_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayEntry {
    pub seq: u64,
    pub frame: String,
}

/// Persists session metadata and a bounded replay buffer across
/// reconnects. Both rows share the configured session TTL; a load past
/// expiry is indistinguishable from one that never existed.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    ttl: Duration,
    replay_buffer_size: usize,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, ttl: Duration, replay_buffer_size: usize) -> Self {
        Self { kv, ttl, replay_buffer_size }
    }

    fn session_key(id: &str) -> String {
        format!("session:{id}")
    }

    fn replay_key(id: &str) -> String {
        format!("replay:{id}")
    }

    /// Mints a new session id: a monotone millisecond timestamp in hex
    /// followed by random hex bytes, all printable ASCII and globally
    /// unique in practice.
    pub fn new_session_id() -> String {
        let millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis();
        let mut random = [0u8; 10];
        rand::thread_rng().fill_bytes(&mut random);
        format!("{:x}{}", millis, hex::encode(random))
    }

    pub async fn save(&self, id: &str, user_id: &str, last_seq: u64) -> Result<()> {
        let meta = SessionMeta {
            user_id: user_id.to_string(),
            last_seq,
            disconnected_at: Some(SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()),
        };
        let bytes = serde_json::to_vec(&meta).expect("SessionMeta serializes");
        self.kv.set(&Self::session_key(id), bytes, self.ttl).await?;

        // Refresh the replay list's TTL even if it's currently empty, so
        // both keys expire together.
        let replay = self.load_replay(id).await?;
        let replay_bytes = serde_json::to_vec(&replay).expect("replay list serializes");
        self.kv.set(&Self::replay_key(id), replay_bytes, self.ttl).await
    }

    pub async fn load(&self, id: &str) -> Result<Option<SessionMeta>> {
        let Some(bytes) = self.kv.get(&Self::session_key(id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.kv.del(&Self::session_key(id)).await?;
        self.kv.del(&Self::replay_key(id)).await
    }

    async fn load_replay(&self, id: &str) -> Result<Vec<ReplayEntry>> {
        let Some(bytes) = self.kv.get(&Self::replay_key(id)).await? else {
            return Ok(Vec::new());
        };
        Ok(serde_json::from_slice(&bytes).unwrap_or_default())
    }

    /// Appends one frame, trims to the last N entries, and refreshes TTL.
    /// Conceptually one pipelined round trip against Redis; the in-memory
    /// fake does the same sequence against its single lock.
    pub async fn append_replay(&self, id: &str, seq: u64, frame: String) -> Result<()> {
        let mut entries = self.load_replay(id).await?;
        entries.push(ReplayEntry { seq, frame });
        if entries.len() > self.replay_buffer_size {
            let excess = entries.len() - self.replay_buffer_size;
            entries.drain(0..excess);
        }
        let bytes = serde_json::to_vec(&entries).expect("replay list serializes");
        self.kv.set(&Self::replay_key(id), bytes, self.ttl).await
    }

    /// Frames whose seq is strictly greater than `after_seq`, in original
    /// order. A replay list entry that fails to parse (shouldn't happen,
    /// since we only ever write what we read) is skipped rather than
    /// aborting the whole replay.
    pub async fn replay(&self, id: &str, after_seq: u64) -> Result<Vec<ReplayEntry>> {
        let entries = self.load_replay(id).await?;
        Ok(entries.into_iter().filter(|e| e.seq > after_seq).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn store() -> SessionStore {
        SessionStore::new(Arc::new(InMemoryKvStore::new()), Duration::from_secs(300), 3)
    }

    #[tokio::test(start_paused = true)]
    async fn save_then_load_roundtrips_metadata() {
        let store = store();
        store.save("s1", "u1", 5).await.unwrap();
        let meta = store.load("s1").await.unwrap().unwrap();
        assert_eq!(meta.user_id, "u1");
        assert_eq!(meta.last_seq, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn load_after_ttl_expiry_returns_none() {
        let store = store();
        store.save("s1", "u1", 1).await.unwrap();
        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(store.load("s1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn replay_trims_to_buffer_size_and_filters_by_seq() {
        let store = store();
        for seq in 1..=5u64 {
            store.append_replay("s1", seq, format!("frame-{seq}")).await.unwrap();
        }
        // Buffer size 3: only seqs 3, 4, 5 survive.
        let all = store.replay("s1", 0).await.unwrap();
        assert_eq!(all.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![3, 4, 5]);

        let after_three = store.replay("s1", 3).await.unwrap();
        assert_eq!(after_three.iter().map(|e| e.seq).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[tokio::test]
    async fn session_ids_are_unique_and_printable_ascii() {
        let a = SessionStore::new_session_id();
        let b = SessionStore::new_session_id();
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_graphic()));
    }

    #[tokio::test(start_paused = true)]
    async fn delete_removes_both_metadata_and_replay() {
        let store = store();
        store.save("s1", "u1", 1).await.unwrap();
        store.append_replay("s1", 1, "frame-1".to_string()).await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.load("s1").await.unwrap().is_none());
        assert!(store.replay("s1", 0).await.unwrap().is_empty());
    }
}
