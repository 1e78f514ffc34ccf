use std::net::SocketAddr;
use std::sync::Arc;

use gateway::repos::{KvChannelLister, KvMemberLister, KvOnboardingRepo, KvRoleLister, KvServerConfigRepo, KvUserRepo};
use gateway_core::collab::fakes::{FakePermissionStore, FakeTokenValidator};
use gateway_core::kv::{InMemoryKvStore, KvStore};
use gateway_core::permissions::{PermissionCache, PermissionInvalidator, PermissionResolver};
use gateway_core::presence::PresenceSubstore;
use gateway_core::publisher::EventPublisher;
use gateway_core::pubsub::{InMemoryPubSub, PubSub};
use gateway_core::session::SessionStore;
use gateway_core::{GatewayConfig, Hub, HubDeps};

/// Everything a test needs to drive the real gateway Hub/router over a
/// real TCP socket without a Redis or REST/SQL tier: an in-memory KV store
/// and in-memory pub/sub stand in for the Redis-backed ones, and the
/// token/permission fakes from `gateway-core::collab::fakes` stand in for
/// the REST tier's repos. Channel/role/member/onboarding/server-config
/// reads still flow through the KV-backed repos so tests can seed READY
/// payload contents the same way the real deployment's REST tier would.
pub struct MockGatewayServer {
    addr: SocketAddr,
    pub kv: Arc<dyn KvStore>,
    pub bus: Arc<dyn PubSub>,
    pub tokens: Arc<FakeTokenValidator>,
    pub permissions: Arc<FakePermissionStore>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockGatewayServer {
    pub async fn start() -> Self {
        Self::start_with_config(GatewayConfig::default()).await
    }

    pub async fn start_with_config(config: GatewayConfig) -> Self {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let bus: Arc<dyn PubSub> = Arc::new(InMemoryPubSub::new());
        let tokens = Arc::new(FakeTokenValidator::new());
        let permissions = Arc::new(FakePermissionStore::new());

        let permission_cache = Arc::new(PermissionCache::new(kv.clone()));
        let permission_resolver = Arc::new(PermissionResolver::new(permissions.clone(), permission_cache.clone()));
        let invalidator_cache = permission_cache.clone();

        let deps = HubDeps {
            token_validator: tokens.clone(),
            user_repo: Arc::new(KvUserRepo::new(kv.clone())),
            server_config_repo: Arc::new(KvServerConfigRepo::new(kv.clone())),
            channel_lister: Arc::new(KvChannelLister::new(kv.clone())),
            role_lister: Arc::new(KvRoleLister::new(kv.clone())),
            member_lister: Arc::new(KvMemberLister::new(kv.clone())),
            onboarding_repo: Arc::new(KvOnboardingRepo::new(kv.clone())),
            permission_store: permissions.clone(),
            bus: bus.clone(),
            session_store: Arc::new(SessionStore::new(kv.clone(), config.session_ttl, config.replay_buffer_size)),
            presence: Arc::new(PresenceSubstore::new(kv.clone())),
            permission_cache,
            permission_resolver,
            publisher: Arc::new(EventPublisher::new(bus.clone())),
        };

        let hub = Hub::new(config, deps);
        let run_hub = hub.clone();
        tokio::spawn(async move {
            let _ = run_hub.run().await;
        });

        let invalidator = PermissionInvalidator::new(bus.clone());
        tokio::spawn(async move {
            let _ = invalidator.run(invalidator_cache).await;
        });

        let router = gateway::build_router(hub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("failed to bind");
        let addr = listener.local_addr().expect("listener has no local addr");

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Self { addr, kv, bus, tokens, permissions, _task: task }
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/v1/gateway", self.addr)
    }

    pub fn bus(&self) -> Arc<dyn PubSub> {
        self.bus.clone()
    }
}
