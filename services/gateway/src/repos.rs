use std::sync::Arc;

use async_trait::async_trait;
use gateway_core::collab::{
    ChannelInfo, ChannelLister, MemberLister, OnboardingRepo, Override, PermissionStore, RoleLister,
    RolePermission, ServerConfigRepo, UserRepo,
};
use gateway_core::error::{GatewayError, Result};
use gateway_core::kv::KvStore;
use gateway_protocol::ready::{
    ChannelSummary, MemberSummary, OnboardingSnapshot, RoleSummary, ServerSummary, UserSummary,
};
use serde::de::DeserializeOwned;

/// Read-only views over data the REST/repo tier owns, reached through the
/// same shared KV store the session/presence/permission substores use
/// rather than a direct Postgres dependency (out of scope here, §2). The
/// REST tier is expected to keep these keys in sync as it writes its own
/// tables; the gateway only ever reads them.
///
/// Key layout: JSON blobs under a small fixed set of keys. Read-mostly
/// values (server config, channel/role/member lists) never expire; the
/// REST tier overwrites them on change.
async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<T>> {
    let Some(bytes) = kv.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_slice(&bytes)
        .map_err(|e| GatewayError::Transient(format!("malformed value at {key}: {e}")))?;
    Ok(Some(value))
}

pub struct KvUserRepo {
    kv: Arc<dyn KvStore>,
}

impl KvUserRepo {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl UserRepo for KvUserRepo {
    async fn get(&self, user_id: &str) -> Result<Option<UserSummary>> {
        get_json(self.kv.as_ref(), &format!("user:{user_id}")).await
    }
}

pub struct KvServerConfigRepo {
    kv: Arc<dyn KvStore>,
}

impl KvServerConfigRepo {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl ServerConfigRepo for KvServerConfigRepo {
    async fn get(&self) -> Result<ServerSummary> {
        get_json(self.kv.as_ref(), "server:config")
            .await?
            .ok_or_else(|| GatewayError::Fatal("server:config missing from kv store".to_string()))
    }
}

pub struct KvChannelLister {
    kv: Arc<dyn KvStore>,
}

impl KvChannelLister {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl ChannelLister for KvChannelLister {
    async fn list(&self) -> Result<Vec<ChannelSummary>> {
        Ok(get_json(self.kv.as_ref(), "channels:list").await?.unwrap_or_default())
    }
}

pub struct KvRoleLister {
    kv: Arc<dyn KvStore>,
}

impl KvRoleLister {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl RoleLister for KvRoleLister {
    async fn list(&self) -> Result<Vec<RoleSummary>> {
        Ok(get_json(self.kv.as_ref(), "roles:list").await?.unwrap_or_default())
    }
}

pub struct KvMemberLister {
    kv: Arc<dyn KvStore>,
}

impl KvMemberLister {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl MemberLister for KvMemberLister {
    async fn list_first_page(&self) -> Result<Vec<MemberSummary>> {
        let members: Vec<MemberSummary> = get_json(self.kv.as_ref(), "members:first_page").await?.unwrap_or_default();
        Ok(members.into_iter().take(1000).collect())
    }
}

pub struct KvOnboardingRepo {
    kv: Arc<dyn KvStore>,
}

impl KvOnboardingRepo {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl OnboardingRepo for KvOnboardingRepo {
    async fn snapshot(&self) -> Result<Option<OnboardingSnapshot>> {
        get_json(self.kv.as_ref(), "onboarding:snapshot").await
    }
}

/// Permission inputs: owners, per-user role grants and per-category/channel
/// overrides, all written by the REST tier as it mutates roles/overrides.
pub struct KvPermissionStore {
    kv: Arc<dyn KvStore>,
}

impl KvPermissionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl PermissionStore for KvPermissionStore {
    async fn is_owner(&self, user_id: &str) -> Result<bool> {
        Ok(get_json::<bool>(self.kv.as_ref(), &format!("owner:{user_id}")).await?.unwrap_or(false))
    }

    async fn role_permissions(&self, user_id: &str) -> Result<Vec<RolePermission>> {
        Ok(get_json(self.kv.as_ref(), &format!("user_roles:{user_id}")).await?.unwrap_or_default())
    }

    async fn channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
        get_json(self.kv.as_ref(), &format!("channel_info:{channel_id}")).await
    }

    async fn overrides(&self, target_id: &str) -> Result<Vec<(String, Override)>> {
        Ok(get_json(self.kv.as_ref(), &format!("overrides:{target_id}")).await?.unwrap_or_default())
    }
}
