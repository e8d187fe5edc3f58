//! Server configuration: sonet.toml + SONET_* environment overrides.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use sonet_proto::chat::MAX_GROUP_MEMBERS;

pub const DEFAULT_PORT: u16 = 9096;
pub const DEFAULT_BIND: &str = "0.0.0.0";
/// Content size cap, checked before encryption.
pub const DEFAULT_MAX_CONTENT_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ListenConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub hub: HubTunables,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self { bind: default_bind(), port: default_port() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_max_content")]
    pub max_content_bytes: usize,
    /// Advertised practical group limit; clamped to the 500 hard cap.
    #[serde(default = "default_practical_members")]
    pub practical_group_members: usize,
    /// Messages per minute per user on the RPC path.
    #[serde(default = "default_rate")]
    pub message_rate_limit: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_content_bytes: default_max_content(),
            practical_group_members: default_practical_members(),
            message_rate_limit: default_rate(),
        }
    }
}

impl LimitsConfig {
    pub fn practical_members(&self) -> usize {
        self.practical_group_members.min(MAX_GROUP_MEMBERS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubTunables {
    #[serde(default = "default_connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_typing_timeout_secs")]
    pub typing_timeout_secs: u64,
    #[serde(default = "default_typing_emit_millis")]
    pub typing_emit_millis: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_ban_after")]
    pub ban_after_violations: u32,
}

impl Default for HubTunables {
    fn default() -> Self {
        Self {
            connection_timeout_secs: default_connection_timeout_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            typing_timeout_secs: default_typing_timeout_secs(),
            typing_emit_millis: default_typing_emit_millis(),
            queue_capacity: default_queue_capacity(),
            ban_after_violations: default_ban_after(),
        }
    }
}

impl HubTunables {
    pub fn to_hub_config(&self, message_rate_limit: usize) -> sonet_hub::HubConfig {
        sonet_hub::HubConfig {
            connection_timeout: std::time::Duration::from_secs(self.connection_timeout_secs),
            ping_interval: std::time::Duration::from_secs(self.ping_interval_secs),
            typing_timeout: std::time::Duration::from_secs(self.typing_timeout_secs),
            typing_emit_interval: std::time::Duration::from_millis(self.typing_emit_millis),
            queue_capacity: self.queue_capacity,
            message_rate_limit,
            ban_after_violations: self.ban_after_violations,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    /// Sqlite path; in-memory only when absent.
    pub path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// user_id → session token. Empty table accepts every token; wire a
    /// real identity service through `AuthPredicate` in production.
    #[serde(default)]
    pub tokens: std::collections::HashMap<String, String>,
}

impl ServerConfig {
    /// Load order: defaults < sonet.toml (or explicit path) < SONET_* env.
    pub fn load(path: Option<&str>) -> Result<Self, figment::Error> {
        let toml_path = path.unwrap_or("sonet.toml");
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file(toml_path))
            .merge(Env::prefixed("SONET_").split("__"))
            .extract()
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_max_content() -> usize {
    DEFAULT_MAX_CONTENT_BYTES
}
fn default_practical_members() -> usize {
    MAX_GROUP_MEMBERS
}
fn default_rate() -> usize {
    60
}
fn default_connection_timeout_secs() -> u64 {
    30
}
fn default_ping_interval_secs() -> u64 {
    25
}
fn default_typing_timeout_secs() -> u64 {
    6
}
fn default_typing_emit_millis() -> u64 {
    500
}
fn default_queue_capacity() -> usize {
    256
}
fn default_ban_after() -> u32 {
    5
}
