//! Config file discovery, environment overrides and credential store wiring.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use gateway::config::AdapterSettings;
use gateway::credentials::{DEFAULT_TOKEN_MODEL, validate_model_name};
use gateway::{GatewayConfig, MemoryTokenStore, SqliteTokenStore, TokenValidator};
use proto::{ConfigError, GatewayError};
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "flint.toml";

/// Returns `~/.flint`, falling back to `./.flint` without `HOME`.
pub fn flint_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".flint")
}

/// Picks the explicit path, else `./flint.toml`, else `~/.flint/flint.toml`.
fn resolve_config_path(path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = path {
        return Some(path.to_path_buf());
    }
    let cwd = std::env::current_dir().ok()?.join(CONFIG_FILE);
    if cwd.exists() {
        return Some(cwd);
    }
    let home_config = flint_home().join(CONFIG_FILE);
    if home_config.exists() {
        return Some(home_config);
    }
    None
}

/// Loads configuration from a file (or defaults) and applies env overrides.
pub fn load_config(path: Option<&Path>) -> Result<GatewayConfig, ConfigError> {
    let config_path = resolve_config_path(path);
    debug!(path = ?config_path, "Config file resolved");

    let mut config = if let Some(path) = config_path {
        let content = std::fs::read_to_string(&path).map_err(ConfigError::Io)?;
        toml::from_str(&content).map_err(|e| ConfigError::Toml(e.to_string()))?
    } else {
        GatewayConfig::default()
    };
    apply_env_overrides(&mut config);

    debug!(
        host = %config.server.host,
        port = config.server.port,
        auth = config.realtime.auth,
        "Config loaded"
    );
    Ok(config)
}

/// Applies `FLINT_*` environment variables on top of the file settings.
pub fn apply_env_overrides(config: &mut GatewayConfig) {
    if let Ok(host) = std::env::var("FLINT_HOST") {
        config.server.host = host;
    }
    if let Ok(port) = std::env::var("FLINT_PORT") {
        match port.parse::<u16>() {
            Ok(p) => config.server.port = p,
            Err(_) => warn!("Ignoring FLINT_PORT={port}: not a port number"),
        }
    }
    if let Ok(value) = std::env::var("FLINT_AUTH") {
        match parse_flag(&value) {
            Some(flag) => config.realtime.auth = flag,
            None => warn!("Ignoring FLINT_AUTH={value}: expected true or false"),
        }
    }
    if let Ok(value) = std::env::var("FLINT_SECURE") {
        match parse_flag(&value) {
            Some(flag) => config.realtime.secure = flag,
            None => warn!("Ignoring FLINT_SECURE={value}: expected true or false"),
        }
    }
    if let Ok(secret) = std::env::var("FLINT_INTERNAL_SECRET") {
        config.realtime.internal_secret = secret;
    }
    if let Ok(name) = std::env::var("FLINT_ADAPTER") {
        config
            .realtime
            .adapter
            .get_or_insert_with(AdapterSettings::default)
            .name = Some(name).filter(|n| !n.is_empty());
    }
    if let Ok(datasource) = std::env::var("FLINT_ADAPTER_DATASOURCE") {
        config
            .realtime
            .adapter
            .get_or_insert_with(AdapterSettings::default)
            .datasource = Some(datasource).filter(|d| !d.is_empty());
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Name of the table holding credential records.
pub fn credential_model(config: &GatewayConfig) -> &str {
    config
        .realtime
        .custom
        .access_token
        .as_deref()
        .filter(|m| !m.is_empty())
        .unwrap_or(DEFAULT_TOKEN_MODEL)
}

/// Database URL of the configured credentials datasource, if any.
pub fn credentials_url(config: &GatewayConfig) -> Result<Option<&str>, ConfigError> {
    let Some(name) = config.realtime.credentials_datasource.as_deref() else {
        return Ok(None);
    };
    let datasource = config.datasources.get(name).ok_or_else(|| {
        ConfigError::invalid(
            "realtime.credentials_datasource",
            format!("datasource '{name}' is not defined"),
        )
    })?;
    datasource
        .url
        .as_deref()
        .map(Some)
        .ok_or_else(|| ConfigError::MissingField(format!("datasources.{name}.url")))
}

/// Builds the token validator the handshake consults.
///
/// A configured credentials datasource is opened as a SQLite store; otherwise
/// the static `[[tokens]]` records are served from memory.
pub async fn build_validator(
    config: &GatewayConfig,
) -> Result<Arc<dyn TokenValidator>, GatewayError> {
    let model = credential_model(config);
    match credentials_url(config)? {
        Some(url) => {
            let store = SqliteTokenStore::open(url, model).await?;
            Ok(Arc::new(store))
        }
        None => {
            validate_model_name(model)?;
            let store = MemoryTokenStore::from_records(config.tokens.iter().cloned());
            info!(records = store.len(), "Using static token records");
            Ok(Arc::new(store))
        }
    }
}
