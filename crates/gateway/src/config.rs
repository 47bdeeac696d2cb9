//! Declarative gateway settings, read once at startup.

use std::collections::HashMap;
use std::time::Duration;

use proto::INTERNAL_MARKER;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const DEFAULT_PORT: u16 = 3000;
const DEFAULT_GRACE_PERIOD_MS: u64 = 3000;
const DEFAULT_MAX_FRAME_BYTES: usize = 1_048_576;

/// Complete gateway configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Listener settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Handshake and clustering settings.
    #[serde(default)]
    pub realtime: RealtimeConfig,

    /// Named datasource connection settings.
    #[serde(default)]
    pub datasources: HashMap<String, DatasourceSettings>,

    /// Static credential records seeded into the in-memory token store.
    #[serde(default)]
    pub tokens: Vec<Map<String, Value>>,
}

/// Transport-level listener options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port; `0` picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// WebSocket upgrade route.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,
    /// Largest accepted inbound message.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            ws_path: default_ws_path(),
            max_frame_bytes: default_max_frame_bytes(),
        }
    }
}

/// Handshake, loopback and clustering settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Require the authentication handshake.
    #[serde(default = "default_true")]
    pub auth: bool,
    /// Use `wss://` for the internal loopback sessions.
    #[serde(default)]
    pub secure: bool,
    /// How long an unauthenticated connection is tolerated.
    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,
    /// Trusted-peer marker expected in the `is` field of internal tokens.
    #[serde(default = "default_internal_secret")]
    pub internal_secret: String,
    /// Datasource holding credential records; unset uses the static `tokens` list.
    #[serde(default)]
    pub credentials_datasource: Option<String>,
    /// Cluster fan-out adapter.
    #[serde(default)]
    pub adapter: Option<AdapterSettings>,
    /// Integration overrides.
    #[serde(default)]
    pub custom: CustomConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            auth: true,
            secure: false,
            grace_period_ms: default_grace_period_ms(),
            internal_secret: default_internal_secret(),
            credentials_datasource: None,
            adapter: None,
            custom: CustomConfig::default(),
        }
    }
}

impl RealtimeConfig {
    /// Grace period as a [`Duration`].
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// `realtime.adapter` block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterSettings {
    /// Registered adapter name (`memory`, `postgres`).
    #[serde(default)]
    pub name: Option<String>,
    /// Key into `datasources`.
    #[serde(default)]
    pub datasource: Option<String>,
}

/// `realtime.custom` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomConfig {
    /// Model (table) that holds credential records. Defaults to `AccessToken`.
    #[serde(default, rename = "AccessToken", alias = "access_token")]
    pub access_token: Option<String>,
}

/// Connection settings of a named datasource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasourceSettings {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub db: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_frame_bytes() -> usize {
    DEFAULT_MAX_FRAME_BYTES
}

fn default_true() -> bool {
    true
}

fn default_grace_period_ms() -> u64 {
    DEFAULT_GRACE_PERIOD_MS
}

fn default_internal_secret() -> String {
    INTERNAL_MARKER.to_string()
}
