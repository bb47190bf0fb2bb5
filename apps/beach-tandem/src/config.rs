use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    /// Unset runs a single node against the in-process store and bus.
    pub redis_url: Option<String>,
    pub room_idle_ttl_seconds: u64,
    pub claim_ttl_ms: u64,
    pub node_ttl_seconds: u64,
    pub node_heartbeat_seconds: u64,
    pub sweep_interval_seconds: u64,
    pub order_retry_attempts: u32,
    pub echo_origin: bool,
    pub reorder_window_ms: u64,
    pub access_url: Option<String>,
    pub token_secret: Option<String>,
    pub hook_secret: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parse_var("TANDEM_PORT").unwrap_or(defaults.port),
            redis_url: non_empty_var("REDIS_URL"),
            room_idle_ttl_seconds: parse_var("COLLAB_ROOM_IDLE_TTL_SECS")
                .unwrap_or(defaults.room_idle_ttl_seconds),
            claim_ttl_ms: parse_var("COLLAB_CLAIM_TTL_MS").unwrap_or(defaults.claim_ttl_ms),
            node_ttl_seconds: parse_var("COLLAB_NODE_TTL_SECS")
                .unwrap_or(defaults.node_ttl_seconds),
            node_heartbeat_seconds: parse_var("COLLAB_NODE_HEARTBEAT_SECS")
                .unwrap_or(defaults.node_heartbeat_seconds),
            sweep_interval_seconds: parse_var("COLLAB_SWEEP_INTERVAL_SECS")
                .unwrap_or(defaults.sweep_interval_seconds),
            order_retry_attempts: parse_var("COLLAB_ORDER_RETRY_ATTEMPTS")
                .unwrap_or(defaults.order_retry_attempts),
            echo_origin: env::var("COLLAB_ECHO_ORIGIN")
                .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.echo_origin),
            reorder_window_ms: parse_var("COLLAB_REORDER_WINDOW_MS")
                .unwrap_or(defaults.reorder_window_ms),
            access_url: non_empty_var("COLLAB_ACCESS_URL"),
            token_secret: non_empty_var("COLLAB_TOKEN_SECRET"),
            hook_secret: non_empty_var("COLLAB_HOOK_SECRET"),
        }
    }

    pub fn room_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.room_idle_ttl_seconds)
    }

    pub fn claim_ttl(&self) -> Duration {
        Duration::from_millis(self.claim_ttl_ms)
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node_ttl_seconds)
    }

    pub fn node_heartbeat(&self) -> Duration {
        Duration::from_secs(self.node_heartbeat_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }

    pub fn reorder_window(&self) -> Duration {
        Duration::from_millis(self.reorder_window_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: None,
            room_idle_ttl_seconds: 30,
            claim_ttl_ms: 250,
            node_ttl_seconds: 30,
            node_heartbeat_seconds: 10,
            sweep_interval_seconds: 15,
            order_retry_attempts: 3,
            echo_origin: false,
            reorder_window_ms: 500,
            access_url: None,
            token_secret: None,
            hook_secret: None,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}
