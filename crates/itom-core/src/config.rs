use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

// Wire constants shared with the chat backend
pub const DEFAULT_BASE_URL: &str = "http://localhost:8001";
pub const DEFAULT_REALTIME_URL: &str = "ws://localhost:8001/ws";
pub const CHAT_STREAM_PATH: &str = "/api/chat/stream";
pub const CHAT_CLARIFY_PATH: &str = "/api/chat/clarify";
pub const CONVERSATIONS_PATH: &str = "/api/conversations";
pub const AGENTS_PATH: &str = "/api/agents";
pub const HEALTH_PATH: &str = "/api/health";

pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const BACKOFF_BASE_MS: u64 = 1_000;
pub const BACKOFF_MAX_MS: u64 = 30_000;
pub const CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEDUP_WINDOW_MS: u64 = 5_000;

/// Close code for a deliberate, application-initiated close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Top-level client config (config.toml + ITOM_CHAT_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Chat backend HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Base URL without trailing slash, e.g. `http://localhost:8001`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Realtime (WebSocket) sync channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Set to false to run without cross-tab sync.
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Base URL; the per-client id is appended as the last path segment.
    #[serde(default = "default_realtime_url")]
    pub url: String,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_realtime_url(),
            heartbeat_interval_secs: HEARTBEAT_INTERVAL_SECS,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            backoff_base_ms: BACKOFF_BASE_MS,
            backoff_max_ms: BACKOFF_MAX_MS,
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
        }
    }
}

/// Streaming request settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Fail a stream that delivers no bytes for this many seconds.
    /// Unset means no client-side timeout.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

/// Chat session behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Window within which a realtime echo of a local message is treated as a duplicate.
    #[serde(default = "default_dedup_window_ms")]
    pub dedup_window_ms: u64,
    /// Append sent and completed messages to the conversation store.
    #[serde(default)]
    pub persist_messages: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dedup_window_ms: DEDUP_WINDOW_MS,
            persist_messages: false,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}
fn default_realtime_url() -> String {
    DEFAULT_REALTIME_URL.to_string()
}
fn default_heartbeat_interval() -> u64 {
    HEARTBEAT_INTERVAL_SECS
}
fn default_max_reconnect_attempts() -> u32 {
    MAX_RECONNECT_ATTEMPTS
}
fn default_backoff_base_ms() -> u64 {
    BACKOFF_BASE_MS
}
fn default_backoff_max_ms() -> u64 {
    BACKOFF_MAX_MS
}
fn default_connect_timeout() -> u64 {
    CONNECT_TIMEOUT_SECS
}
fn default_dedup_window_ms() -> u64 {
    DEDUP_WINDOW_MS
}

impl ClientConfig {
    /// Load config from a TOML file with ITOM_CHAT_* env var overrides.
    ///
    /// Path resolution:
    ///   1. Explicit path argument
    ///   2. ITOM_CHAT_CONFIG env var
    ///   3. ~/.itom-chat/config.toml
    ///
    /// Nested keys use a double underscore: `ITOM_CHAT_SERVER__BASE_URL`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("ITOM_CHAT_CONFIG").ok())
            .unwrap_or_else(default_config_path);
        tracing::debug!(path = %path, "loading client config");

        Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ITOM_CHAT_").ignore(&["CONFIG"]).split("__"))
            .extract()
            .map_err(|e| crate::error::CoreError::Config(e.to_string()))
    }

    /// Full URL of an HTTP API path on the configured backend.
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.server.base_url.trim_end_matches('/'), path)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.itom-chat/config.toml", home)
}
