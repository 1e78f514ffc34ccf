use std::env;
use std::sync::Arc;

use gateway::auth::KvTokenValidator;
use gateway::repos::{
    KvChannelLister, KvMemberLister, KvOnboardingRepo, KvPermissionStore, KvRoleLister,
    KvServerConfigRepo, KvUserRepo,
};
use gateway_core::kv::{KvStore, RedisKvStore};
use gateway_core::permissions::{PermissionCache, PermissionInvalidator, PermissionResolver};
use gateway_core::presence::PresenceSubstore;
use gateway_core::publisher::EventPublisher;
use gateway_core::pubsub::{PubSub, RedisPubSub};
use gateway_core::session::SessionStore;
use gateway_core::{GatewayConfig, Hub, HubDeps};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_owned());
    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(log_level)).init();

    let redis_url = env::var("REDIS_URL").expect("REDIS_URL must be set");
    let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_owned());
    let config = GatewayConfig::from_env();

    info!("connecting to redis...");
    let kv: Arc<dyn KvStore> = Arc::new(
        RedisKvStore::connect(&redis_url)
            .await
            .expect("failed to connect to redis for kv store"),
    );
    let bus: Arc<dyn PubSub> =
        Arc::new(RedisPubSub::new(&redis_url).expect("failed to build redis pub/sub client"));

    let permission_cache = Arc::new(PermissionCache::new(kv.clone()));
    let permission_store = Arc::new(KvPermissionStore::new(kv.clone()));
    let permission_resolver = Arc::new(PermissionResolver::new(permission_store.clone(), permission_cache.clone()));
    let invalidator_cache = permission_cache.clone();

    let deps = HubDeps {
        token_validator: Arc::new(KvTokenValidator::new(kv.clone())),
        user_repo: Arc::new(KvUserRepo::new(kv.clone())),
        server_config_repo: Arc::new(KvServerConfigRepo::new(kv.clone())),
        channel_lister: Arc::new(KvChannelLister::new(kv.clone())),
        role_lister: Arc::new(KvRoleLister::new(kv.clone())),
        member_lister: Arc::new(KvMemberLister::new(kv.clone())),
        onboarding_repo: Arc::new(KvOnboardingRepo::new(kv.clone())),
        permission_store,
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
        if let Err(err) = run_hub.run().await {
            tracing::error!(%err, "hub event loop exited");
        }
    });

    let invalidator = PermissionInvalidator::new(bus.clone());
    tokio::spawn(async move {
        if let Err(err) = invalidator.run(invalidator_cache).await {
            tracing::error!(%err, "permission invalidator exited");
        }
    });

    let router = gateway::build_router(hub.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await.expect("failed to bind");
    info!(addr = %bind_addr, "gateway listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(hub))
        .await
        .expect("server error");
    info!("gateway shut down gracefully");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT), drains connections, then returns to
/// trigger graceful shutdown.
async fn shutdown_signal(hub: Hub) {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }

    hub.shutdown().await;
}
