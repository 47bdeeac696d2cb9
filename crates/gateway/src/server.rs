//! WebSocket transport: axum router, listener binding and the serve loop.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
};
use proto::GatewayError;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::namespace::NamespaceRegistry;
use crate::registry::ConnectionRegistry;
use crate::session;
use crate::socket::Socket;

/// Callback run synchronously for every upgraded connection, in registration order.
pub type ConnectionHook = Arc<dyn Fn(&Arc<Socket>) + Send + Sync>;

/// Shared state of the WebSocket server.
pub struct Transport {
    pub(crate) config: ServerConfig,
    pub(crate) namespaces: Arc<NamespaceRegistry>,
    pub(crate) connections: Arc<ConnectionRegistry>,
    pub(crate) auth_required: bool,
    pub(crate) hooks: Vec<ConnectionHook>,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    connections: usize,
    namespaces: usize,
}

impl Transport {
    pub fn new(
        config: ServerConfig,
        namespaces: Arc<NamespaceRegistry>,
        connections: Arc<ConnectionRegistry>,
        auth_required: bool,
        hooks: Vec<ConnectionHook>,
    ) -> Self {
        Self {
            config,
            namespaces,
            connections,
            auth_required,
            hooks,
        }
    }

    /// Builds the `ws_path` upgrade route and `/health`.
    pub fn router(self: Arc<Self>) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        Router::new()
            .route(&self.config.ws_path, get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self)
            .layer(cors)
    }

    /// Binds the configured host and port. Port `0` picks a free port.
    pub async fn bind(&self) -> Result<TcpListener, GatewayError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GatewayError::Bind(format!("{addr}: {e}")))?;
        Ok(listener)
    }

    /// Serves connections on `listener` until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: TcpListener, shutdown: F) -> Result<(), GatewayError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;
        info!(%addr, path = %self.config.ws_path, "Realtime transport listening");

        let app = self.router();
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| GatewayError::Connection(format!("server error: {e}")))?;

        info!("Realtime transport stopped");
        Ok(())
    }
}

async fn health_handler(State(transport): State<Arc<Transport>>) -> impl IntoResponse {
    Json(Health {
        status: "ok",
        connections: transport.connections.len(),
        namespaces: transport.namespaces.len(),
    })
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(transport): State<Arc<Transport>>,
) -> impl IntoResponse {
    debug!(%remote, "WebSocket upgrade");
    ws.max_message_size(transport.config.max_frame_bytes)
        .on_upgrade(move |socket| session::run(socket, Some(remote), transport))
}
