use std::time::Duration;

/// Process-level knobs for the Hub and its connections. Loaded from the
/// environment at startup the same way the teacher's `main.rs` loads
/// `DATABASE_URL`/`BIND_ADDR` — required values `.expect()`, optional ones
/// fall back via `.unwrap_or_else(...)`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_connections: usize,
    pub heartbeat_interval: Duration,
    /// Grace period a disconnected session's metadata + replay buffer
    /// survive before being forgotten (§3 PersistedSession, default 5 min).
    pub session_ttl: Duration,
    /// Bound N on the replay buffer (§3 ReplayBuffer).
    pub replay_buffer_size: usize,
    /// How long after unregister before presence is marked offline (§4.I
    /// delayed-offline). Deployment-specific; not hard-coded (§9).
    pub offline_grace_period: Duration,
    pub ws_rate_limit_count: u32,
    pub ws_rate_limit_window: Duration,
}

impl GatewayConfig {
    /// Loads configuration from the environment. Panics (via `.expect`) on
    /// malformed values for required knobs, mirroring the teacher's
    /// fail-fast startup style.
    pub fn from_env() -> Self {
        Self {
            max_connections: env_parse("MAX_CONNECTIONS", 10_000),
            heartbeat_interval: Duration::from_millis(env_parse("HEARTBEAT_INTERVAL_MS", 45_000)),
            session_ttl: Duration::from_secs(env_parse("SESSION_TTL_SECS", 300)),
            replay_buffer_size: env_parse("REPLAY_BUFFER_SIZE", 100),
            offline_grace_period: Duration::from_secs(env_parse("OFFLINE_GRACE_SECS", 60)),
            ws_rate_limit_count: env_parse("WS_RATE_LIMIT_COUNT", 120),
            ws_rate_limit_window: Duration::from_secs(env_parse("WS_RATE_LIMIT_WINDOW_SECS", 60)),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            heartbeat_interval: Duration::from_millis(45_000),
            session_ttl: Duration::from_secs(300),
            replay_buffer_size: 100,
            offline_grace_period: Duration::from_secs(60),
            ws_rate_limit_count: 120,
            ws_rate_limit_window: Duration::from_secs(60),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_spec_defaults() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.session_ttl, Duration::from_secs(300));
        assert_eq!(cfg.replay_buffer_size, 100);
    }
}
