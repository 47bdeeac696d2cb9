//! Internal loopback sessions opened by the gateway against itself.
//!
//! Two clients connect back to the local transport: a service client used
//! for server-originated traffic, and a registration client that joins the
//! reserved `flint` group.

use proto::event::{AUTHENTICATED, AUTHENTICATION, GROUP_REGISTER};
use serde_json::{Value, json};
use tracing::{debug, error, info};

use crate::client::GatewayClient;

/// Builds the loopback URL for the local transport.
pub fn loopback_url(secure: bool, port: u16, path: &str) -> String {
    let scheme = if secure { "wss" } else { "ws" };
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    format!("{scheme}://127.0.0.1:{port}{path}")
}

/// Clients opened by [`InternalChannelBootstrap::start`]. Either may be
/// missing when its connection failed.
#[derive(Debug, Default)]
pub struct InternalClients {
    pub service: Option<GatewayClient>,
    pub registration: Option<GatewayClient>,
}

/// Opens the two internal loopback sessions.
#[derive(Debug, Clone)]
pub struct InternalChannelBootstrap {
    url: String,
    auth_enabled: bool,
    secret: String,
}

impl InternalChannelBootstrap {
    pub fn new(url: impl Into<String>, auth_enabled: bool, secret: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auth_enabled,
            secret: secret.into(),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn trusted_payload(&self) -> Value {
        json!({ "is": self.secret })
    }

    /// Connects both clients. Connection failures are logged and not retried.
    pub async fn start(&self) -> InternalClients {
        InternalClients {
            service: self.open_service().await,
            registration: self.open_registration().await,
        }
    }

    async fn open_service(&self) -> Option<GatewayClient> {
        let client = match GatewayClient::connect(&self.url).await {
            Ok(client) => client,
            Err(e) => {
                error!("Internal service session failed: {e}");
                return None;
            }
        };
        if self.auth_enabled
            && let Err(e) = client.emit(AUTHENTICATION, self.trusted_payload())
        {
            error!("Internal service session could not authenticate: {e}");
        }
        info!(url = %self.url, "Internal service session open");
        Some(client)
    }

    async fn open_registration(&self) -> Option<GatewayClient> {
        let client = match GatewayClient::connect(&self.url).await {
            Ok(client) => client,
            Err(e) => {
                error!("Internal registration session failed: {e}");
                return None;
            }
        };

        if self.auth_enabled {
            let emitter = client.emitter();
            client.once(AUTHENTICATED, move |_| {
                debug!("Registration session authenticated, joining group");
                if let Err(e) = emitter.emit(GROUP_REGISTER, Value::Null) {
                    error!("Group registration failed: {e}");
                }
            });
            if let Err(e) = client.emit(AUTHENTICATION, self.trusted_payload()) {
                error!("Internal registration session could not authenticate: {e}");
            }
        } else if let Err(e) = client.emit(GROUP_REGISTER, Value::Null) {
            error!("Group registration failed: {e}");
        }
        info!(url = %self.url, "Internal registration session open");
        Some(client)
    }
}
