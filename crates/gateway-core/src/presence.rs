use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::kv::KvStore;

const PRESENCE_TTL: Duration = Duration::from_secs(120);
const TYPING_TTL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Idle,
    Dnd,
    Invisible,
    Offline,
}

impl PresenceStatus {
    /// Accepts `{online, idle, dnd, invisible}`; rejects `offline` (server-
    /// derived only, clients never announce it) and anything else.
    pub fn parse_client_status(s: &str) -> Option<Self> {
        match s {
            "online" => Some(Self::Online),
            "idle" => Some(Self::Idle),
            "dnd" => Some(Self::Dnd),
            "invisible" => Some(Self::Invisible),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub status: PresenceStatus,
    pub custom_text: Option<String>,
}

/// Tracks online status and per-channel typing indicators, both
/// short-lived TTL rows over the shared `KvStore`.
pub struct PresenceSubstore {
    kv: Arc<dyn KvStore>,
}

impl PresenceSubstore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn presence_key(user_id: &str) -> String {
        format!("presence:{user_id}")
    }

    fn typing_key(channel_id: &str, user_id: &str) -> String {
        format!("typing:{channel_id}:{user_id}")
    }

    pub async fn set(&self, user_id: &str, record: PresenceRecord) -> Result<()> {
        let bytes = serde_json::to_vec(&record).expect("PresenceRecord serializes");
        self.kv.set(&Self::presence_key(user_id), bytes, PRESENCE_TTL).await
    }

    pub async fn get(&self, user_id: &str) -> Result<Option<PresenceRecord>> {
        let Some(bytes) = self.kv.get(&Self::presence_key(user_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice(&bytes).ok())
    }

    /// Absent entries are skipped; `invisible` entries are skipped too, so
    /// observers can never distinguish invisible from offline. Order of the
    /// returned list is not tied to `user_ids`.
    pub async fn get_many(&self, user_ids: &[String]) -> Result<Vec<(String, PresenceRecord)>> {
        let keys: Vec<String> = user_ids.iter().map(|id| Self::presence_key(id)).collect();
        let raw = self.kv.mget(&keys).await?;
        Ok(user_ids
            .iter()
            .zip(raw.into_iter())
            .filter_map(|(uid, bytes)| {
                let record: PresenceRecord = serde_json::from_slice(&bytes?).ok()?;
                if record.status == PresenceStatus::Invisible {
                    return None;
                }
                Some((uid.clone(), record))
            })
            .collect())
    }

    /// Re-stamps the TTL without changing the stored status. Heartbeats and
    /// any activity on a connection call this to keep presence alive.
    pub async fn refresh(&self, user_id: &str) -> Result<()> {
        if let Some(record) = self.get(user_id).await? {
            self.set(user_id, record).await?;
        }
        Ok(())
    }

    pub async fn delete(&self, user_id: &str) -> Result<()> {
        self.kv.del(&Self::presence_key(user_id)).await
    }

    /// Creates the typing marker if it isn't already live. Returns `true`
    /// iff this call created it, so repeated client pings within the TTL
    /// can be deduped before they trigger a TYPING_START dispatch.
    pub async fn set_typing(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        self.kv.set_if_absent(&Self::typing_key(channel_id, user_id), Vec::new(), TYPING_TTL).await
    }

    /// Returns `true` iff a live typing marker existed to clear.
    pub async fn clear_typing(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        self.kv.del_if_present(&Self::typing_key(channel_id, user_id)).await
    }

    /// True if this user already has a live typing entry for the channel —
    /// used to dedup repeated client-side typing pings within the TTL.
    pub async fn is_typing(&self, channel_id: &str, user_id: &str) -> Result<bool> {
        Ok(self.kv.get(&Self::typing_key(channel_id, user_id)).await?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn store() -> PresenceSubstore {
        PresenceSubstore::new(Arc::new(InMemoryKvStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn set_then_get_roundtrips_status() {
        let presence = store();
        presence
            .set("u1", PresenceRecord { status: PresenceStatus::Online, custom_text: None })
            .await
            .unwrap();
        let record = presence.get("u1").await.unwrap().unwrap();
        assert_eq!(record.status, PresenceStatus::Online);
    }

    #[tokio::test(start_paused = true)]
    async fn presence_expires_after_ttl() {
        let presence = store();
        presence
            .set("u1", PresenceRecord { status: PresenceStatus::Online, custom_text: None })
            .await
            .unwrap();
        tokio::time::advance(PRESENCE_TTL + Duration::from_secs(1)).await;
        assert!(presence.get("u1").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn typing_dedup_within_ttl() {
        let presence = store();
        assert!(presence.set_typing("c1", "u1").await.unwrap());
        assert!(!presence.set_typing("c1", "u1").await.unwrap(), "repeat ping within TTL must not re-create");
        assert!(presence.is_typing("c1", "u1").await.unwrap());
        tokio::time::advance(TYPING_TTL + Duration::from_secs(1)).await;
        assert!(!presence.is_typing("c1", "u1").await.unwrap());
        assert!(presence.set_typing("c1", "u1").await.unwrap(), "expired marker must be creatable again");
    }

    #[tokio::test(start_paused = true)]
    async fn clear_typing_reports_whether_it_existed() {
        let presence = store();
        assert!(!presence.clear_typing("c1", "u1").await.unwrap());
        presence.set_typing("c1", "u1").await.unwrap();
        assert!(presence.clear_typing("c1", "u1").await.unwrap());
        assert!(!presence.clear_typing("c1", "u1").await.unwrap());
    }

    #[test]
    fn offline_is_not_a_valid_client_announced_status() {
        assert_eq!(PresenceStatus::parse_client_status("offline"), None);
        assert_eq!(PresenceStatus::parse_client_status("bogus"), None);
        assert_eq!(PresenceStatus::parse_client_status("online"), Some(PresenceStatus::Online));
        assert_eq!(PresenceStatus::parse_client_status("invisible"), Some(PresenceStatus::Invisible));
    }

    #[tokio::test(start_paused = true)]
    async fn get_many_skips_absent_and_invisible_entries() {
        let presence = store();
        presence.set("u1", PresenceRecord { status: PresenceStatus::Online, custom_text: None }).await.unwrap();
        presence.set("u2", PresenceRecord { status: PresenceStatus::Invisible, custom_text: None }).await.unwrap();
        let visible = presence
            .get_many(&["u1".to_string(), "u2".to_string(), "u3".to_string()])
            .await
            .unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].0, "u1");
    }
}
