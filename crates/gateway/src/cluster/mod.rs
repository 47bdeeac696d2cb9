//! Cluster fan-out: adapter trait, static adapter registry and the startup
//! selection that decides between standalone and clustered mode.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use proto::{ClusterPacket, ConfigError, GatewayError};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{AdapterSettings, DatasourceSettings};

pub use memory::MemoryAdapter;
pub use postgres::PostgresAdapter;

/// Backend that carries broadcasts between gateway instances.
#[async_trait]
pub trait ClusterAdapter: Send + Sync {
    /// Registered adapter name.
    fn name(&self) -> &'static str;

    /// Publishes a packet to every other instance.
    async fn publish(&self, packet: &ClusterPacket) -> Result<(), GatewayError>;

    /// Starts receiving packets published by any instance (including this one).
    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterPacket>, GatewayError>;
}

/// Explicit connection options for adapters configured by host/port/db.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterOptions {
    pub host: String,
    pub port: u16,
    pub db: String,
    pub user: Option<String>,
    pub password: Option<String>,
}

/// Constructor input resolved from a datasource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterTarget {
    Url(String),
    Options(AdapterOptions),
}

/// Adapter constructor stored in [`ADAPTERS`].
pub type AdapterCtor = fn(&AdapterTarget) -> Result<Arc<dyn ClusterAdapter>, ConfigError>;

/// Compile-time registry of adapter constructors.
pub const ADAPTERS: &[(&str, AdapterCtor)] = &[
    ("memory", memory::construct),
    ("postgres", postgres::construct),
];

/// Looks up a constructor by adapter name.
pub fn adapter_ctor(name: &str) -> Option<AdapterCtor> {
    ADAPTERS
        .iter()
        .find(|(registered, _)| *registered == name)
        .map(|(_, ctor)| *ctor)
}

/// Outcome of the startup selection.
pub enum ClusterMode {
    Standalone,
    Clustered(Arc<dyn ClusterAdapter>),
}

impl std::fmt::Debug for ClusterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standalone => write!(f, "Standalone"),
            Self::Clustered(adapter) => write!(f, "Clustered({})", adapter.name()),
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Resolves adapter settings into an adapter name and constructor target.
///
/// Returns `Ok(None)` when neither `name` nor `datasource` is set. A block
/// with only one of them, or naming an undefined datasource, is an error
/// rather than a fallback to standalone mode.
pub fn resolve_target(
    settings: Option<&AdapterSettings>,
    datasources: &HashMap<String, DatasourceSettings>,
) -> Result<Option<(String, AdapterTarget)>, ConfigError> {
    let Some(settings) = settings else {
        return Ok(None);
    };
    let (name, datasource) = match (non_empty(&settings.name), non_empty(&settings.datasource)) {
        (None, None) => return Ok(None),
        (Some(_), None) => {
            return Err(ConfigError::MissingField(
                "realtime.adapter.datasource".to_string(),
            ));
        }
        (None, Some(_)) => {
            return Err(ConfigError::MissingField("realtime.adapter.name".to_string()));
        }
        (Some(name), Some(datasource)) => (name, datasource),
    };

    let ds = datasources.get(datasource).ok_or_else(|| {
        ConfigError::invalid(
            "realtime.adapter.datasource",
            format!("datasource '{datasource}' is not defined"),
        )
    })?;

    if let Some(url) = non_empty(&ds.url) {
        return Ok(Some((name.to_string(), AdapterTarget::Url(url.to_string()))));
    }

    match (non_empty(&ds.host), ds.port, non_empty(&ds.db)) {
        (Some(host), Some(port), Some(db)) => Ok(Some((
            name.to_string(),
            AdapterTarget::Options(AdapterOptions {
                host: host.to_string(),
                port,
                db: db.to_string(),
                user: non_empty(&ds.user).map(str::to_string),
                password: non_empty(&ds.password).map(str::to_string),
            }),
        ))),
        _ => Err(ConfigError::invalid(
            format!("datasources.{datasource}"),
            "unexpected datasource options for clustering mode (need url, or host + port + db)",
        )),
    }
}

/// Chooses standalone or clustered mode from the declarative settings.
pub fn select_adapter(
    settings: Option<&AdapterSettings>,
    datasources: &HashMap<String, DatasourceSettings>,
) -> Result<ClusterMode, ConfigError> {
    let Some((name, target)) = resolve_target(settings, datasources)? else {
        info!("Running in a not clustered environment");
        return Ok(ClusterMode::Standalone);
    };

    let ctor = adapter_ctor(&name).ok_or_else(|| {
        let known: Vec<&str> = ADAPTERS.iter().map(|(n, _)| *n).collect();
        ConfigError::invalid(
            "realtime.adapter.name",
            format!("unknown adapter '{name}' (known: {})", known.join(", ")),
        )
    })?;
    let adapter = ctor(&target)?;
    info!(adapter = %name, "Running in clustering environment");
    Ok(ClusterMode::Clustered(adapter))
}

/// Local end of the fan-out: instance identity plus the installed adapter.
pub struct Fanout {
    instance_id: String,
    adapter: RwLock<Option<Arc<dyn ClusterAdapter>>>,
}

impl Default for Fanout {
    fn default() -> Self {
        Self::new()
    }
}

impl Fanout {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            adapter: RwLock::new(None),
        }
    }

    /// Id stamped as `origin` on every published packet.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn install(&self, adapter: Arc<dyn ClusterAdapter>) {
        debug!(adapter = adapter.name(), "Installing cluster adapter");
        *self.adapter.write() = Some(adapter);
    }

    pub fn adapter(&self) -> Option<Arc<dyn ClusterAdapter>> {
        self.adapter.read().clone()
    }

    pub fn is_clustered(&self) -> bool {
        self.adapter.read().is_some()
    }

    /// Publishes a broadcast to other instances. Failures are logged, not returned.
    pub async fn publish(&self, nsp: &str, room: Option<&str>, event: &str, data: &Value) {
        let Some(adapter) = self.adapter() else {
            return;
        };
        let packet = ClusterPacket {
            origin: self.instance_id.clone(),
            nsp: nsp.to_string(),
            room: room.map(str::to_string),
            event: event.to_string(),
            data: data.clone(),
        };
        if let Err(e) = adapter.publish(&packet).await {
            warn!(adapter = adapter.name(), event, "Cluster publish failed: {e}");
        }
    }

    /// Returns `true` when a received packet was published by this instance.
    pub fn is_own(&self, packet: &ClusterPacket) -> bool {
        packet.origin == self.instance_id
    }
}
