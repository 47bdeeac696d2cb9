//! PostgreSQL `LISTEN/NOTIFY` fan-out.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use proto::{ClusterPacket, ConfigError, GatewayError};
use sqlx::postgres::{PgConnectOptions, PgListener, PgPool, PgPoolOptions};
use tokio::sync::{OnceCell, mpsc};
use tracing::{debug, info, warn};

use super::{AdapterTarget, ClusterAdapter};

/// Notification channel shared by every gateway instance.
pub const NOTIFY_CHANNEL: &str = "flint_fanout";

const SUBSCRIBER_BUFFER: usize = 256;
const POOL_SIZE: u32 = 4;

/// Adapter publishing with `pg_notify` and receiving through a [`PgListener`].
pub struct PostgresAdapter {
    options: PgConnectOptions,
    pool: OnceCell<PgPool>,
}

impl PostgresAdapter {
    /// Creates an adapter; no connection is opened until first use.
    pub fn new(options: PgConnectOptions) -> Self {
        Self {
            options,
            pool: OnceCell::new(),
        }
    }

    pub fn connect_options(&self) -> &PgConnectOptions {
        &self.options
    }

    async fn pool(&self) -> Result<&PgPool, GatewayError> {
        self.pool
            .get_or_try_init(|| async {
                let pool = PgPoolOptions::new()
                    .max_connections(POOL_SIZE)
                    .connect_with(self.options.clone())
                    .await
                    .map_err(|e| GatewayError::Adapter(format!("postgres connect failed: {e}")))?;
                info!(
                    host = %self.options.get_host(),
                    port = self.options.get_port(),
                    "Postgres fan-out connected"
                );
                Ok(pool)
            })
            .await
    }
}

/// Builds connection options from a URL or the host/port/db triple.
pub fn connect_options(target: &AdapterTarget) -> Result<PgConnectOptions, ConfigError> {
    match target {
        AdapterTarget::Url(url) => PgConnectOptions::from_str(url)
            .map_err(|e| ConfigError::invalid("datasource.url", e.to_string())),
        AdapterTarget::Options(opts) => {
            let mut options = PgConnectOptions::new()
                .host(&opts.host)
                .port(opts.port)
                .database(&opts.db);
            if let Some(user) = &opts.user {
                options = options.username(user);
            }
            if let Some(password) = &opts.password {
                options = options.password(password);
            }
            Ok(options)
        }
    }
}

pub(super) fn construct(target: &AdapterTarget) -> Result<Arc<dyn ClusterAdapter>, ConfigError> {
    Ok(Arc::new(PostgresAdapter::new(connect_options(target)?)))
}

#[async_trait]
impl ClusterAdapter for PostgresAdapter {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn publish(&self, packet: &ClusterPacket) -> Result<(), GatewayError> {
        let payload = serde_json::to_string(packet)
            .map_err(|e| GatewayError::Adapter(format!("encode packet: {e}")))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(self.pool().await?)
            .await
            .map_err(|e| GatewayError::Adapter(format!("pg_notify failed: {e}")))?;
        Ok(())
    }

    async fn subscribe(&self) -> Result<mpsc::Receiver<ClusterPacket>, GatewayError> {
        let mut listener = PgListener::connect_with(self.pool().await?)
            .await
            .map_err(|e| GatewayError::Adapter(format!("listener connect failed: {e}")))?;
        listener
            .listen(NOTIFY_CHANNEL)
            .await
            .map_err(|e| GatewayError::Adapter(format!("LISTEN failed: {e}")))?;

        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        tokio::spawn(async move {
            loop {
                // recv() reconnects on its own after a dropped connection.
                let notification = match listener.recv().await {
                    Ok(n) => n,
                    Err(e) => {
                        warn!("Postgres listener stopped: {e}");
                        break;
                    }
                };
                match serde_json::from_str::<ClusterPacket>(notification.payload()) {
                    Ok(packet) => {
                        if tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Ignoring malformed fan-out payload: {e}"),
                }
            }
            debug!("Postgres subscription ended");
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::AdapterOptions;

    #[test]
    fn url_target_parses_connection_string() {
        let options = connect_options(&AdapterTarget::Url(
            "postgres://svc:pw@db.internal:6543/fanout".to_string(),
        ))
        .expect("valid url");
        assert_eq!(options.get_host(), "db.internal");
        assert_eq!(options.get_port(), 6543);
        assert_eq!(options.get_database(), Some("fanout"));
        assert_eq!(options.get_username(), "svc");
    }

    #[test]
    fn invalid_url_is_a_config_error() {
        let err = connect_options(&AdapterTarget::Url("not a url".to_string()))
            .expect_err("invalid url");
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn options_target_maps_triple_and_user() {
        let options = connect_options(&AdapterTarget::Options(AdapterOptions {
            host: "10.0.0.5".to_string(),
            port: 5433,
            db: "events".to_string(),
            user: Some("fanout".to_string()),
            password: None,
        }))
        .expect("options");
        assert_eq!(options.get_host(), "10.0.0.5");
        assert_eq!(options.get_port(), 5433);
        assert_eq!(options.get_database(), Some("events"));
        assert_eq!(options.get_username(), "fanout");
    }

    #[test]
    fn construct_does_not_connect() {
        let adapter = construct(&AdapterTarget::Url(
            "postgres://localhost:1/unreachable".to_string(),
        ))
        .expect("lazy construction");
        assert_eq!(adapter.name(), "postgres");
    }
}
