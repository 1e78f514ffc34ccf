use std::sync::Arc;

use tracing::warn;

use crate::collab::PermissionStore;
use crate::error::Result;
use crate::permissions::bits::{ALL, MANAGE_SERVER};
use crate::permissions::cache::PermissionCache;

/// Computes effective permissions by layering category and channel
/// overrides atop the role union, consulting the cache first and the
/// collaborator `PermissionStore` on a miss.
pub struct PermissionResolver {
    store: Arc<dyn PermissionStore>,
    cache: Arc<PermissionCache>,
}

impl PermissionResolver {
    pub fn new(store: Arc<dyn PermissionStore>, cache: Arc<PermissionCache>) -> Self {
        Self { store, cache }
    }

    /// Steps 1-2: owner shortcut, then role union with the ManageServer
    /// admin shortcut. No channel context.
    async fn resolve_base(&self, user_id: &str) -> Result<u64> {
        if self.store.is_owner(user_id).await? {
            return Ok(ALL);
        }
        let mut mask = 0u64;
        for role in self.store.role_permissions(user_id).await? {
            mask |= role.allow_bits;
        }
        if mask & MANAGE_SERVER != 0 {
            return Ok(ALL);
        }
        Ok(mask)
    }

    pub async fn resolve_server(&self, user_id: &str) -> Result<u64> {
        if let Some(mask) = self.cache_get(user_id, None).await {
            return Ok(mask);
        }
        let mask = self.resolve_base(user_id).await?;
        self.cache_set(user_id, None, mask).await;
        Ok(mask)
    }

    pub async fn resolve(&self, user_id: &str, channel_id: &str) -> Result<u64> {
        if let Some(mask) = self.cache_get(user_id, Some(channel_id)).await {
            return Ok(mask);
        }

        let mut mask = self.resolve_base(user_id).await?;
        if mask == ALL {
            self.cache_set(user_id, Some(channel_id), mask).await;
            return Ok(mask);
        }

        let role_ids: Vec<String> = self
            .store
            .role_permissions(user_id)
            .await?
            .into_iter()
            .map(|r| r.role_id.to_string())
            .collect();

        if let Some(info) = self.store.channel_info(channel_id).await? {
            if let Some(category_id) = &info.category_id {
                mask = apply_overrides(mask, &self.store.overrides(category_id).await?, user_id, &role_ids);
            }
            mask = apply_overrides(mask, &self.store.overrides(channel_id).await?, user_id, &role_ids);
        }

        self.cache_set(user_id, Some(channel_id), mask).await;
        Ok(mask)
    }

    pub async fn has_permission(&self, user_id: &str, channel_id: &str, bit: u64) -> Result<bool> {
        Ok(self.resolve(user_id, channel_id).await? & bit != 0)
    }

    /// Same-length boolean vector over `channel_ids`. Runs the role-union
    /// step once; admins short-circuit to all-true. Otherwise bulk-loads
    /// the cache, computes misses against the store, and writes misses
    /// back in one batched round trip.
    pub async fn filter_permitted(
        &self,
        user_id: &str,
        channel_ids: &[String],
        bit: u64,
    ) -> Result<Vec<bool>> {
        let base = self.resolve_base(user_id).await?;
        if base == ALL {
            return Ok(vec![true; channel_ids.len()]);
        }

        let cached = self.cache.get_many(user_id, channel_ids).await.unwrap_or_else(|err| {
            warn!(error = %err, "permission cache get_many failed, treating as all-miss");
            vec![None; channel_ids.len()]
        });

        let mut results = Vec::with_capacity(channel_ids.len());
        let mut misses = Vec::new();
        let role_ids: Vec<String> = self
            .store
            .role_permissions(user_id)
            .await?
            .into_iter()
            .map(|r| r.role_id.to_string())
            .collect();

        for (channel_id, cached_mask) in channel_ids.iter().zip(cached.iter()) {
            let mask = match cached_mask {
                Some(mask) => *mask,
                None => {
                    let mut mask = base;
                    if let Some(info) = self.store.channel_info(channel_id).await? {
                        if let Some(category_id) = &info.category_id {
                            mask = apply_overrides(mask, &self.store.overrides(category_id).await?, user_id, &role_ids);
                        }
                        mask = apply_overrides(mask, &self.store.overrides(channel_id).await?, user_id, &role_ids);
                    }
                    misses.push((channel_id.clone(), mask));
                    mask
                }
            };
            results.push(mask & bit != 0);
        }

        if !misses.is_empty() {
            if let Err(err) = self.cache.set_many(user_id, &misses).await {
                warn!(error = %err, "best-effort permission cache set_many failed");
            }
        }

        Ok(results)
    }

    /// Same-length boolean vector over `user_ids` for one channel — the
    /// shape the Hub's fanout needs (§4.I step 4: "build a single call
    /// FilterPermitted(channel, users[], ViewChannels)"). Each user's role
    /// union is still computed individually (there is no cross-user
    /// shortcut), but the cache reads/writes for the batch go in one round
    /// trip each.
    pub async fn filter_permitted_users(
        &self,
        channel_id: &str,
        user_ids: &[String],
        bit: u64,
    ) -> Result<Vec<bool>> {
        let cached = self.cache.get_many_users(channel_id, user_ids).await.unwrap_or_else(|err| {
            warn!(error = %err, "permission cache get_many_users failed, treating as all-miss");
            vec![None; user_ids.len()]
        });

        let mut results = Vec::with_capacity(user_ids.len());
        let mut misses = Vec::new();

        for (user_id, cached_mask) in user_ids.iter().zip(cached.iter()) {
            let mask = match cached_mask {
                Some(mask) => *mask,
                None => {
                    let mut mask = self.resolve_base(user_id).await?;
                    if mask != ALL {
                        let role_ids: Vec<String> = self
                            .store
                            .role_permissions(user_id)
                            .await?
                            .into_iter()
                            .map(|r| r.role_id.to_string())
                            .collect();
                        if let Some(info) = self.store.channel_info(channel_id).await? {
                            if let Some(category_id) = &info.category_id {
                                mask = apply_overrides(mask, &self.store.overrides(category_id).await?, user_id, &role_ids);
                            }
                            mask = apply_overrides(mask, &self.store.overrides(channel_id).await?, user_id, &role_ids);
                        }
                    }
                    misses.push((user_id.clone(), mask));
                    mask
                }
            };
            results.push(mask & bit != 0);
        }

        if !misses.is_empty() {
            if let Err(err) = self.cache.set_many_users(channel_id, &misses).await {
                warn!(error = %err, "best-effort permission cache set_many_users failed");
            }
        }

        Ok(results)
    }

    async fn cache_get(&self, user_id: &str, channel_id: Option<&str>) -> Option<u64> {
        match self.cache.get(user_id, channel_id).await {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "permission cache get failed, treating as miss");
                None
            }
        }
    }

    async fn cache_set(&self, user_id: &str, channel_id: Option<&str>, mask: u64) {
        if let Err(err) = self.cache.set(user_id, channel_id, mask).await {
            warn!(error = %err, "best-effort permission cache set failed");
        }
    }
}

/// Applies one override level: every held-role override first (add allow,
/// remove deny, in listed order — so deny wins within the level), then the
/// single user-targeted override.
fn apply_overrides(
    mut mask: u64,
    overrides: &[(String, crate::collab::Override)],
    user_id: &str,
    role_ids: &[String],
) -> u64 {
    for (target_id, ov) in overrides {
        if ov.target_is_role && role_ids.iter().any(|r| r == target_id) {
            mask |= ov.allow;
            mask &= !ov.deny;
        }
    }
    for (target_id, ov) in overrides {
        if !ov.target_is_role && target_id == user_id {
            mask |= ov.allow;
            mask &= !ov.deny;
        }
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::{fakes::FakePermissionStore, Override, RolePermission};
    use crate::kv::InMemoryKvStore;
    use crate::permissions::bits::{self, SEND_MESSAGES, VIEW_CHANNELS};

    fn resolver(store: Arc<FakePermissionStore>) -> PermissionResolver {
        let cache = Arc::new(PermissionCache::new(Arc::new(InMemoryKvStore::new())));
        PermissionResolver::new(store, cache)
    }

    #[tokio::test(start_paused = true)]
    async fn owner_gets_all_permissions() {
        let store = Arc::new(FakePermissionStore::new());
        store.set_owner("u1");
        let resolver = resolver(store);
        assert_eq!(resolver.resolve_server("u1").await.unwrap(), ALL);
    }

    #[tokio::test(start_paused = true)]
    async fn manage_server_role_shortcuts_to_all() {
        let store = Arc::new(FakePermissionStore::new());
        store.set_roles("u1", vec![RolePermission { role_id: 1, allow_bits: bits::MANAGE_SERVER }]);
        let resolver = resolver(store);
        assert_eq!(resolver.resolve_server("u1").await.unwrap(), ALL);
    }

    #[tokio::test(start_paused = true)]
    async fn channel_override_adds_then_category_deny_does_not_leak_across_levels() {
        let store = Arc::new(FakePermissionStore::new());
        store.set_roles("u1", vec![RolePermission { role_id: 1, allow_bits: VIEW_CHANNELS }]);
        store.set_channel("c1", Some("cat1"));
        store.set_overrides(
            "cat1",
            vec![("1".to_string(), Override { allow: 0, deny: VIEW_CHANNELS, target_is_role: true })],
        );
        store.set_overrides(
            "c1",
            vec![("1".to_string(), Override { allow: SEND_MESSAGES, deny: 0, target_is_role: true })],
        );
        let resolver = resolver(store);
        let mask = resolver.resolve("u1", "c1").await.unwrap();
        // Category denies VIEW_CHANNELS, channel then re-adds SEND_MESSAGES
        // but never re-grants VIEW_CHANNELS, so it stays denied.
        assert_eq!(mask & VIEW_CHANNELS, 0);
        assert_eq!(mask & SEND_MESSAGES, SEND_MESSAGES);
    }

    #[tokio::test(start_paused = true)]
    async fn user_override_applied_after_role_overrides_within_a_level() {
        let store = Arc::new(FakePermissionStore::new());
        store.set_roles("u1", vec![RolePermission { role_id: 1, allow_bits: 0 }]);
        store.set_channel("c1", None);
        store.set_overrides(
            "c1",
            vec![
                ("1".to_string(), Override { allow: VIEW_CHANNELS, deny: 0, target_is_role: true }),
                ("u1".to_string(), Override { allow: 0, deny: VIEW_CHANNELS, target_is_role: false }),
            ],
        );
        let resolver = resolver(store);
        let mask = resolver.resolve("u1", "c1").await.unwrap();
        assert_eq!(mask & VIEW_CHANNELS, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn filter_permitted_short_circuits_for_admins() {
        let store = Arc::new(FakePermissionStore::new());
        store.set_owner("u1");
        let resolver = resolver(store);
        let result = resolver
            .filter_permitted("u1", &["a".to_string(), "b".to_string()], VIEW_CHANNELS)
            .await
            .unwrap();
        assert_eq!(result, vec![true, true]);
    }
}
