use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;
use gateway_protocol::{event_type, ready::ReadyPayload, CloseCode, Frame};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::collab::{ChannelLister, MemberLister, OnboardingRepo, PermissionStore, RoleLister, ServerConfigRepo, TokenValidator, UserRepo};
use crate::config::GatewayConfig;
use crate::connection::{reader_loop, writer_loop, ConnState, ConnectionState, ReaderCallbacks, ReaderConfig, SocketReader, SocketWriter};
use crate::error::{GatewayError, Result};
use crate::permissions::{PermissionCache, PermissionResolver};
use crate::presence::{PresenceRecord, PresenceStatus, PresenceSubstore};
use crate::publisher::EventPublisher;
use crate::pubsub::PubSub;
use crate::session::SessionStore;

const VIEW_CHANNELS: u64 = crate::permissions::bits::VIEW_CHANNELS;
const READY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
const SAVE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);
const PRESENCE_SIDE_EFFECT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// Everything the Hub needs from outside this crate: the collaborator
/// traits (§6.4) plus the concrete Kv/PubSub-backed substores.
pub struct HubDeps {
    pub token_validator: Arc<dyn TokenValidator>,
    pub user_repo: Arc<dyn UserRepo>,
    pub server_config_repo: Arc<dyn ServerConfigRepo>,
    pub channel_lister: Arc<dyn ChannelLister>,
    pub role_lister: Arc<dyn RoleLister>,
    pub member_lister: Arc<dyn MemberLister>,
    pub onboarding_repo: Arc<dyn OnboardingRepo>,
    pub permission_store: Arc<dyn PermissionStore>,
    pub bus: Arc<dyn PubSub>,
    pub session_store: Arc<SessionStore>,
    pub presence: Arc<PresenceSubstore>,
    pub permission_cache: Arc<PermissionCache>,
    pub permission_resolver: Arc<PermissionResolver>,
    pub publisher: Arc<EventPublisher>,
}

/// Owns the connection registry: user-id to `ConnectionState`, behind a
/// reader/writer lock (§4.I, §5). Cloned cheaply — internals are `Arc`.
#[derive(Clone)]
pub struct Hub {
    registry: Arc<RwLock<HashMap<String, Arc<ConnectionState>>>>,
    config: Arc<GatewayConfig>,
    deps: Arc<HubDeps>,
}

impl Hub {
    pub fn new(config: GatewayConfig, deps: HubDeps) -> Self {
        Self { registry: Arc::new(RwLock::new(HashMap::new())), config: Arc::new(config), deps: Arc::new(deps) }
    }

    /// Accepts one socket split into its read and write halves: builds a
    /// fresh `ConnectionState`, spawns the writer task, and drives the
    /// reader on the calling task until it exits (§4.I ServeWebSocket).
    pub async fn serve_websocket(
        &self,
        reader_socket: impl SocketReader + 'static,
        writer_socket: impl SocketWriter + Send + 'static,
    ) {
        let (conn, rx) = ConnectionState::new();
        let reader_config = ReaderConfig {
            heartbeat_interval: self.config.heartbeat_interval,
            rate_limit_count: self.config.ws_rate_limit_count,
            rate_limit_window: self.config.ws_rate_limit_window,
        };

        tokio::spawn(writer_loop(conn.clone(), rx, writer_socket));

        let callbacks: Arc<dyn ReaderCallbacks> = Arc::new(HubCallbacks { hub: self.clone() });
        reader_loop(conn, reader_socket, callbacks, reader_config).await;
    }

    async fn register(&self, conn: Arc<ConnectionState>, user_id: String) -> Result<()> {
        let mut registry = self.registry.write().await;
        if registry.len() >= self.config.max_connections {
            return Err(GatewayError::Overload("max connections reached".to_string()));
        }
        if let Some(existing) = registry.get(&user_id) {
            // Displacement: the old connection gets InvalidSession(false)
            // and is torn down; its reader exits on close, its writer
            // drains and terminates.
            existing.enqueue(Frame::invalid_session(false));
            *existing.state.lock().await = ConnState::Displaced;
            existing.close_send();
        }
        *conn.state.lock().await = ConnState::Identified;
        registry.insert(user_id, conn);
        Ok(())
    }

    async fn unregister(&self, conn: &Arc<ConnectionState>) {
        let user_id = conn.current_user_id().await;
        let Some(user_id) = user_id else {
            conn.close_send();
            return;
        };

        let was_current = {
            let mut registry = self.registry.write().await;
            match registry.get(&user_id) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    registry.remove(&user_id);
                    true
                }
                _ => false,
            }
        };
        conn.close_send();
        if !was_current {
            // Lost the race to displacement; the displacing connection
            // already owns the registry slot and will run its own
            // lifecycle, so there's nothing further to persist here.
            return;
        }

        let session_id = conn.session_id.lock().await.clone();
        if let Some(session_id) = session_id {
            let seq = conn.next_seq().saturating_sub(1);
            if let Err(err) = timeout(SAVE_TIMEOUT, self.deps.session_store.save(&session_id, &user_id, seq)).await {
                warn!(error = %err, "session save on disconnect timed out");
            }
        }

        let hub = self.clone();
        let offline_user = user_id.clone();
        tokio::spawn(async move { hub.delayed_offline(offline_user).await });
    }

    async fn delayed_offline(&self, user_id: String) {
        tokio::time::sleep(self.config.offline_grace_period).await;
        if self.registry.read().await.contains_key(&user_id) {
            return;
        }
        if let Err(err) = self.deps.presence.delete(&user_id).await {
            warn!(error = %err, "presence delete on delayed-offline failed");
        }
        let payload = serde_json::json!({"user_id": user_id, "status": "offline"});
        if let Err(err) = self.deps.publisher.publish(event_type::PRESENCE_UPDATE, payload).await {
            warn!(error = %err, "presence offline publish failed");
        }
    }

    async fn handle_identify(&self, conn: &Arc<ConnectionState>, token: String) -> Result<()> {
        let user_id = timeout(READY_TIMEOUT, self.deps.token_validator.validate(&token))
            .await
            .map_err(|_| GatewayError::Auth("token validation timed out".to_string()))??
            .ok_or_else(|| GatewayError::Auth("invalid token".to_string()))?;

        let ready = timeout(READY_TIMEOUT, self.assemble_ready(&user_id))
            .await
            .map_err(|_| GatewayError::Transient("ready assembly timed out".to_string()))??;

        *conn.user_id.lock().await = Some(user_id.clone());
        *conn.session_id.lock().await = Some(ready.session_id.clone());

        self.register(conn.clone(), user_id.clone()).await?;

        let seq = conn.next_seq() as i64;
        conn.enqueue(Frame::dispatch(seq, event_type::READY, serde_json::to_value(&ready).expect("ReadyPayload serializes")));

        if let Err(err) = self.deps.presence.set(&user_id, PresenceRecord { status: PresenceStatus::Online, custom_text: None }).await {
            warn!(error = %err, "presence set on identify failed");
        }
        let payload = serde_json::json!({"user_id": user_id, "status": "online"});
        if let Err(err) = timeout(PRESENCE_SIDE_EFFECT_TIMEOUT, self.deps.publisher.publish(event_type::PRESENCE_UPDATE, payload)).await {
            warn!(error = %err, "presence online publish timed out");
        }

        Ok(())
    }

    async fn assemble_ready(&self, user_id: &str) -> Result<ReadyPayload> {
        let user = self
            .deps
            .user_repo
            .get(user_id)
            .await?
            .ok_or_else(|| GatewayError::Auth("identified user not found".to_string()))?;
        let server = self.deps.server_config_repo.get().await?;
        let channels = self.deps.channel_lister.list().await?;
        let roles = self.deps.role_lister.list().await?;
        let members = self.deps.member_lister.list_first_page().await?;
        let onboarding = self.deps.onboarding_repo.snapshot().await?;

        let member_ids: Vec<String> = members.iter().map(|m| m.user_id.clone()).collect();
        let presences = self
            .deps
            .presence
            .get_many(&member_ids)
            .await
            .unwrap_or_default()
            .into_iter()
            .map(|(uid, record)| gateway_protocol::ready::PresenceSummary {
                user_id: uid,
                status: format!("{:?}", record.status).to_lowercase(),
            })
            .collect();

        Ok(ReadyPayload {
            user,
            server,
            channels,
            roles,
            members,
            presences,
            onboarding,
            session_id: SessionStore::new_session_id(),
        })
    }

    async fn handle_resume(
        &self,
        conn: &Arc<ConnectionState>,
        token: String,
        session_id: String,
        client_seq: u64,
    ) -> Result<()> {
        let user_id = self
            .deps
            .token_validator
            .validate(&token)
            .await?
            .ok_or_else(|| GatewayError::Auth("invalid token".to_string()))?;

        let meta = self
            .deps
            .session_store
            .load(&session_id)
            .await?
            .ok_or_else(|| GatewayError::ResumeImpossible("session missing or expired".to_string()))?;

        if meta.user_id != user_id {
            return Err(GatewayError::ResumeImpossible("user mismatch".to_string()));
        }
        if client_seq > meta.last_seq {
            return Err(GatewayError::ResumeImpossible("client ahead of server".to_string()));
        }

        let replay = self.deps.session_store.replay(&session_id, client_seq).await?;

        *conn.user_id.lock().await = Some(user_id.clone());
        *conn.session_id.lock().await = Some(session_id.clone());
        conn.set_seq(meta.last_seq);

        self.register(conn.clone(), user_id.clone()).await?;
        self.deps.session_store.delete(&session_id).await?;

        for entry in replay {
            if let Ok(frame) = serde_json::from_str::<Frame>(&entry.frame) {
                conn.enqueue(frame);
            }
        }
        let seq = conn.next_seq() as i64;
        conn.enqueue(Frame::dispatch(seq, event_type::RESUMED, serde_json::json!({})));

        let stored_status = self.deps.presence.get(&user_id).await.unwrap_or(None).map(|r| r.status);
        if stored_status == Some(PresenceStatus::Offline) || stored_status.is_none() {
            let _ = self
                .deps
                .presence
                .set(&user_id, PresenceRecord { status: PresenceStatus::Online, custom_text: None })
                .await;
            let payload = serde_json::json!({"user_id": user_id, "status": "online"});
            let _ = self.deps.publisher.publish(event_type::PRESENCE_UPDATE, payload).await;
        } else {
            let _ = self.deps.presence.refresh(&user_id).await;
        }

        Ok(())
    }

    async fn handle_presence_update(&self, conn: &Arc<ConnectionState>, status: String) -> Result<()> {
        let user_id = conn
            .current_user_id()
            .await
            .ok_or_else(|| GatewayError::Protocol("presence update before identify".to_string()))?;
        let parsed = PresenceStatus::parse_client_status(&status)
            .ok_or_else(|| GatewayError::Protocol(format!("invalid presence status: {status}")))?;
        self.deps.presence.set(&user_id, PresenceRecord { status: parsed, custom_text: None }).await?;
        let payload = serde_json::json!({"user_id": user_id, "status": status});
        self.deps.publisher.publish(event_type::PRESENCE_UPDATE, payload).await
    }

    async fn refresh_presence(&self, user_id: &str) {
        if let Err(err) = self.deps.presence.refresh(user_id).await {
            warn!(error = %err, "presence TTL refresh failed");
        }
    }

    /// The fanout hot path (§4.I.handlePubSubEvent). Snapshots identified
    /// connections under the read lock, then releases it before any
    /// permission check or send so slow targets never hold up the Hub.
    async fn handle_pubsub_event(&self, raw: Vec<u8>) {
        let envelope: Value = match serde_json::from_slice(&raw) {
            Ok(v) => v,
            Err(err) => {
                warn!(error = %err, "discarding malformed gateway-events payload");
                return;
            }
        };
        let Some(event_type) = envelope.get("t").and_then(|v| v.as_str()).map(String::from) else {
            warn!("gateway-events payload missing event type");
            return;
        };
        let data = envelope.get("d").cloned().unwrap_or(Value::Null);
        let channel_id = data.get("channel_id").and_then(|v| v.as_str()).map(String::from);

        let targets: Vec<(String, Arc<ConnectionState>)> = {
            let registry = self.registry.read().await;
            registry.iter().map(|(uid, conn)| (uid.clone(), conn.clone())).collect()
        };

        let permitted: Vec<bool> = if let Some(channel_id) = &channel_id {
            let user_ids: Vec<String> = targets.iter().map(|(uid, _)| uid.clone()).collect();
            match self.deps.permission_resolver.filter_permitted_users(channel_id, &user_ids, VIEW_CHANNELS).await {
                Ok(results) => results,
                Err(err) => {
                    warn!(error = %err, "bulk permission filter failed during fanout, skipping all targets");
                    vec![false; targets.len()]
                }
            }
        } else {
            vec![true; targets.len()]
        };

        let ephemeral = event_type::is_ephemeral(&event_type);

        for ((user_id, conn), allowed) in targets.into_iter().zip(permitted.into_iter()) {
            if !allowed {
                continue;
            }
            if ephemeral {
                conn.enqueue(Frame::ephemeral_dispatch(&event_type, data.clone()));
                continue;
            }
            let seq = conn.next_seq() as i64;
            let frame = Frame::dispatch(seq, &event_type, data.clone());
            let session_id = conn.session_id.lock().await.clone();
            conn.enqueue(frame.clone());
            if let Some(session_id) = session_id {
                if let Ok(encoded) = frame.encode() {
                    if let Err(err) = self.deps.session_store.append_replay(&session_id, seq as u64, encoded).await {
                        warn!(error = %err, user_id = %user_id, "best-effort replay append failed");
                    }
                }
            }
        }
    }

    /// Subscribes to `gateway-events` and dispatches forever, exiting when
    /// the subscription stream ends (e.g. pub/sub connection lost).
    pub async fn run(&self) -> Result<()> {
        let mut stream = self.deps.bus.subscribe("gateway-events").await?;
        info!("hub dispatch loop started");
        while let Some(payload) = stream.next().await {
            self.handle_pubsub_event(payload).await;
        }
        Err(GatewayError::Fatal("gateway-events subscription ended".to_string()))
    }

    /// Closes every identified connection: publishes offline presence,
    /// enqueues a Reconnect frame, and signals done with a GoingAway close.
    pub async fn shutdown(&self) {
        let mut registry = self.registry.write().await;
        for (user_id, conn) in registry.drain() {
            if let Err(err) = self.deps.presence.delete(&user_id).await {
                warn!(error = %err, "presence delete during shutdown failed");
            }
            let payload = serde_json::json!({"user_id": user_id, "status": "offline"});
            let _ = self.deps.publisher.publish(event_type::PRESENCE_UPDATE, payload).await;
            conn.enqueue(Frame::reconnect());
            conn.enqueue_close_signal(CloseCode::GoingAway);
        }
    }
}

struct HubCallbacks {
    hub: Hub,
}

#[async_trait::async_trait]
impl ReaderCallbacks for HubCallbacks {
    async fn on_identify(&self, conn: &Arc<ConnectionState>, token: String) -> Result<()> {
        self.hub.handle_identify(conn, token).await
    }

    async fn on_resume(&self, conn: &Arc<ConnectionState>, token: String, session_id: String, seq: u64) -> Result<()> {
        self.hub.handle_resume(conn, token, session_id, seq).await
    }

    async fn on_presence_update(&self, conn: &Arc<ConnectionState>, status: String) -> Result<()> {
        self.hub.handle_presence_update(conn, status).await
    }

    async fn refresh_presence(&self, user_id: &str) {
        self.hub.refresh_presence(user_id).await
    }

    async fn on_disconnect(&self, conn: &Arc<ConnectionState>) {
        self.hub.unregister(conn).await
    }
}
