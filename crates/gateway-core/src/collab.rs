//! Collaborator boundary: everything the REST/SQL tier owns and the
//! gateway only reads. Real implementations live outside this crate
//! (HTTP service, repo layer); `fakes` below backs unit and integration
//! tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Override {
    pub allow: u64,
    pub deny: u64,
    pub target_is_role: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub id: String,
    pub category_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePermission {
    pub role_id: u64,
    pub allow_bits: u64,
}

/// Read-only view over roles, channels and overrides that the Permission
/// Resolver consults on a cache miss. Grounded on the same repo-trait
/// shape the teacher uses to keep the Postgres-backed implementation
/// entirely outside this crate.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn is_owner(&self, user_id: &str) -> Result<bool>;
    async fn role_permissions(&self, user_id: &str) -> Result<Vec<RolePermission>>;
    async fn channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>>;
    /// Overrides attached to a category or channel, keyed by held role id
    /// for role-targeted entries and by user id for the single
    /// user-targeted entry (callers distinguish via `target_is_role`).
    async fn overrides(&self, target_id: &str) -> Result<Vec<(String, Override)>>;
}

/// Validates bearer tokens minted by the auth tier. The gateway never
/// mints or stores tokens itself (§2 Non-goals); it only verifies them
/// during Identify.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, token: &str) -> Result<Option<String>>;
}

/// Read-only contracts consumed while assembling the READY payload
/// (§4.I, §6.4). Real implementations sit in the REST/repo tier; the
/// gateway only ever reads through them.
#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<gateway_protocol::ready::UserSummary>>;
}

#[async_trait]
pub trait ServerConfigRepo: Send + Sync {
    async fn get(&self) -> Result<gateway_protocol::ready::ServerSummary>;
}

#[async_trait]
pub trait ChannelLister: Send + Sync {
    async fn list(&self) -> Result<Vec<gateway_protocol::ready::ChannelSummary>>;
}

#[async_trait]
pub trait RoleLister: Send + Sync {
    async fn list(&self) -> Result<Vec<gateway_protocol::ready::RoleSummary>>;
}

#[async_trait]
pub trait MemberLister: Send + Sync {
    /// First page only, bounded to 1000 entries (§6.4).
    async fn list_first_page(&self) -> Result<Vec<gateway_protocol::ready::MemberSummary>>;
}

#[async_trait]
pub trait OnboardingRepo: Send + Sync {
    async fn snapshot(&self) -> Result<Option<gateway_protocol::ready::OnboardingSnapshot>>;
}

pub mod fakes {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePermissionStore {
        pub owners: Mutex<std::collections::HashSet<String>>,
        pub roles: Mutex<HashMap<String, Vec<RolePermission>>>,
        pub channels: Mutex<HashMap<String, ChannelInfo>>,
        pub overrides: Mutex<HashMap<String, Vec<(String, Override)>>>,
    }

    impl FakePermissionStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_owner(&self, user_id: &str) {
            self.owners.lock().unwrap().insert(user_id.to_string());
        }

        pub fn set_roles(&self, user_id: &str, roles: Vec<RolePermission>) {
            self.roles.lock().unwrap().insert(user_id.to_string(), roles);
        }

        pub fn set_channel(&self, channel_id: &str, category_id: Option<&str>) {
            self.channels.lock().unwrap().insert(
                channel_id.to_string(),
                ChannelInfo { id: channel_id.to_string(), category_id: category_id.map(String::from) },
            );
        }

        pub fn set_overrides(&self, target_id: &str, overrides: Vec<(String, Override)>) {
            self.overrides.lock().unwrap().insert(target_id.to_string(), overrides);
        }
    }

    #[async_trait]
    impl PermissionStore for FakePermissionStore {
        async fn is_owner(&self, user_id: &str) -> Result<bool> {
            Ok(self.owners.lock().unwrap().contains(user_id))
        }

        async fn role_permissions(&self, user_id: &str) -> Result<Vec<RolePermission>> {
            Ok(self.roles.lock().unwrap().get(user_id).cloned().unwrap_or_default())
        }

        async fn channel_info(&self, channel_id: &str) -> Result<Option<ChannelInfo>> {
            Ok(self.channels.lock().unwrap().get(channel_id).cloned())
        }

        async fn overrides(&self, target_id: &str) -> Result<Vec<(String, Override)>> {
            Ok(self.overrides.lock().unwrap().get(target_id).cloned().unwrap_or_default())
        }
    }

    #[derive(Default)]
    pub struct FakeTokenValidator {
        pub tokens: Mutex<HashMap<String, String>>,
    }

    impl FakeTokenValidator {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn issue(&self, token: &str, user_id: &str) {
            self.tokens.lock().unwrap().insert(token.to_string(), user_id.to_string());
        }
    }

    #[async_trait]
    impl TokenValidator for FakeTokenValidator {
        async fn validate(&self, token: &str) -> Result<Option<String>> {
            Ok(self.tokens.lock().unwrap().get(token).cloned())
        }
    }

    use gateway_protocol::ready::{
        ChannelSummary, MemberSummary, OnboardingSnapshot, RoleSummary, ServerSummary, UserSummary,
    };

    #[derive(Default)]
    pub struct FakeUserRepo {
        pub users: Mutex<HashMap<String, UserSummary>>,
    }

    impl FakeUserRepo {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert(&self, user: UserSummary) {
            self.users.lock().unwrap().insert(user.id.clone(), user);
        }
    }

    #[async_trait]
    impl UserRepo for FakeUserRepo {
        async fn get(&self, user_id: &str) -> Result<Option<UserSummary>> {
            Ok(self.users.lock().unwrap().get(user_id).cloned())
        }
    }

    pub struct FakeServerConfigRepo {
        pub server: ServerSummary,
    }

    #[async_trait]
    impl ServerConfigRepo for FakeServerConfigRepo {
        async fn get(&self) -> Result<ServerSummary> {
            Ok(self.server.clone())
        }
    }

    #[derive(Default)]
    pub struct FakeChannelLister {
        pub channels: Mutex<Vec<ChannelSummary>>,
    }

    impl FakeChannelLister {
        pub fn new(channels: Vec<ChannelSummary>) -> Self {
            Self { channels: Mutex::new(channels) }
        }
    }

    #[async_trait]
    impl ChannelLister for FakeChannelLister {
        async fn list(&self) -> Result<Vec<ChannelSummary>> {
            Ok(self.channels.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    pub struct FakeRoleLister {
        pub roles: Mutex<Vec<RoleSummary>>,
    }

    impl FakeRoleLister {
        pub fn new(roles: Vec<RoleSummary>) -> Self {
            Self { roles: Mutex::new(roles) }
        }
    }

    #[async_trait]
    impl RoleLister for FakeRoleLister {
        async fn list(&self) -> Result<Vec<RoleSummary>> {
            Ok(self.roles.lock().unwrap().clone())
        }
    }

    #[derive(Default)]
    pub struct FakeMemberLister {
        pub members: Mutex<Vec<MemberSummary>>,
    }

    impl FakeMemberLister {
        pub fn new(members: Vec<MemberSummary>) -> Self {
            Self { members: Mutex::new(members) }
        }
    }

    #[async_trait]
    impl MemberLister for FakeMemberLister {
        async fn list_first_page(&self) -> Result<Vec<MemberSummary>> {
            Ok(self.members.lock().unwrap().iter().take(1000).cloned().collect())
        }
    }

    #[derive(Default)]
    pub struct FakeOnboardingRepo {
        pub snapshot: Mutex<Option<OnboardingSnapshot>>,
    }

    #[async_trait]
    impl OnboardingRepo for FakeOnboardingRepo {
        async fn snapshot(&self) -> Result<Option<OnboardingSnapshot>> {
            Ok(self.snapshot.lock().unwrap().clone())
        }
    }
}
