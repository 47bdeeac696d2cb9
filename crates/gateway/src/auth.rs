//! Connection handshake: grace timer, trusted-peer marker, credential lookup
//! and custom resolvers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use proto::event::{AUTHENTICATED, AUTHENTICATION, RESERVED_EVENTS, UNAUTHORIZED};
use proto::{AuthRequest, CredentialQuery, GatewayError, INTERNAL_MARKER, SessionToken};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::credentials::TokenValidator;
use crate::namespace::NamespaceRegistry;
use crate::signal::{HostSignal, SignalBus};
use crate::socket::{CLOSE_UNAUTHORIZED, Socket, event_handler};

/// Handshake parameters taken from the realtime configuration.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub grace_period: Duration,
    pub secret: String,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_millis(3000),
            secret: INTERNAL_MARKER.to_string(),
        }
    }
}

/// Async resolver callback: `Some(object)` accepts the connection. `None` or a
/// non-object token rejects it.
pub type ResolverHandler = Arc<
    dyn Fn(Arc<Socket>, Value) -> Pin<Box<dyn Future<Output = Option<Value>> + Send>>
        + Send
        + Sync,
>;

/// Wraps an async closure as a [`ResolverHandler`].
pub fn resolver_handler<F, Fut>(f: F) -> ResolverHandler
where
    F: Fn(Arc<Socket>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Value>> + Send + 'static,
{
    Arc::new(move |socket, payload| Box::pin(f(socket, payload)))
}

/// Alternate handshake path bound to its own event name.
#[derive(Clone)]
pub struct AuthResolver {
    name: String,
    handler: ResolverHandler,
}

impl std::fmt::Debug for AuthResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthResolver")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AuthResolver {
    /// Validates the event name. Empty and built-in names are rejected.
    pub fn new(name: impl Into<String>, handler: ResolverHandler) -> Result<Self, GatewayError> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(GatewayError::InvalidResolver(
                "resolver name must not be empty".to_string(),
            ));
        }
        if RESERVED_EVENTS.contains(&name.as_str()) {
            return Err(GatewayError::InvalidResolver(format!(
                "'{name}' is a built-in event"
            )));
        }
        Ok(Self { name, handler })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Per-gateway handshake state shared by every connection.
pub struct AuthHandshake {
    settings: AuthSettings,
    validator: Arc<dyn TokenValidator>,
    namespaces: Arc<NamespaceRegistry>,
    signals: SignalBus,
    resolvers: Vec<AuthResolver>,
}

impl AuthHandshake {
    pub fn new(
        settings: AuthSettings,
        validator: Arc<dyn TokenValidator>,
        namespaces: Arc<NamespaceRegistry>,
        signals: SignalBus,
        resolvers: Vec<AuthResolver>,
    ) -> Self {
        Self {
            settings,
            validator,
            namespaces,
            signals,
            resolvers,
        }
    }

    /// Wires the handshake onto a fresh connection and arms its grace timer.
    ///
    /// Custom resolvers are registered before the default `authentication` listener.
    pub fn attach(self: &Arc<Self>, socket: &Arc<Socket>) {
        for resolver in &self.resolvers {
            let handshake = self.clone();
            let resolver = resolver.clone();
            let name = resolver.name.clone();
            socket.on(
                &name,
                event_handler(move |socket, payload| {
                    let handshake = handshake.clone();
                    let resolver = resolver.clone();
                    async move {
                        handshake.resolve_custom(&socket, &resolver, payload).await;
                    }
                }),
            );
        }

        let handshake = self.clone();
        socket.on(
            AUTHENTICATION,
            event_handler(move |socket, payload| {
                let handshake = handshake.clone();
                async move {
                    handshake.authenticate(&socket, payload).await;
                }
            }),
        );

        self.arm_grace_timer(socket);
    }

    fn arm_grace_timer(&self, socket: &Arc<Socket>) {
        let weak = Arc::downgrade(socket);
        let grace = self.settings.grace_period;
        let task = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(socket) = weak.upgrade() else {
                return;
            };
            if socket.is_authenticated() || socket.is_closed() {
                return;
            }
            info!(conn_id = %socket.id(), "Grace period elapsed without authentication");
            socket.emit(UNAUTHORIZED, Value::Null);
            socket.close(CLOSE_UNAUTHORIZED, UNAUTHORIZED);
        });
        socket.set_grace_timer(task.abort_handle());
    }

    /// Handles one `authentication` payload. Returns `true` if it authenticated the socket.
    pub async fn authenticate(&self, socket: &Arc<Socket>, payload: Value) -> bool {
        if socket.is_authenticated() {
            debug!(conn_id = %socket.id(), "Ignoring authentication on authenticated connection");
            return false;
        }

        let request = match AuthRequest::decode(&payload, &self.settings.secret) {
            Ok(request) => request,
            Err(e) => {
                warn!(conn_id = %socket.id(), "Rejecting authentication payload: {e}");
                return false;
            }
        };

        match request {
            AuthRequest::Internal { fields } => {
                debug!(conn_id = %socket.id(), "Trusted peer authenticated");
                self.accept(socket, SessionToken::internal(fields))
            }
            AuthRequest::Credential { id, fields } => {
                let query = CredentialQuery::new(id);
                let record = match self.validator.find_one(&query).await {
                    Ok(record) => record,
                    Err(e) => {
                        warn!(conn_id = %socket.id(), "Token lookup failed: {e}");
                        None
                    }
                };
                let Some(record) = record else {
                    debug!(conn_id = %socket.id(), id = %query.id, "No credential record");
                    return false;
                };

                let token = SessionToken::from_credential(fields, record);
                if !self.accept(socket, token.clone()) {
                    return false;
                }
                self.signals.publish(HostSignal::SocketAuthenticated {
                    id: socket.id().clone(),
                    token,
                });
                true
            }
        }
    }

    async fn resolve_custom(&self, socket: &Arc<Socket>, resolver: &AuthResolver, payload: Value) {
        if socket.is_authenticated() {
            return;
        }
        let resolved = (resolver.handler)(socket.clone(), payload).await;
        match resolved.and_then(SessionToken::from_resolver) {
            Some(token) => {
                debug!(conn_id = %socket.id(), resolver = %resolver.name, "Custom resolver accepted");
                self.accept(socket, token);
            }
            None => {
                debug!(conn_id = %socket.id(), resolver = %resolver.name, "Custom resolver rejected");
            }
        }
    }

    /// Stamps the token, cancels the grace timer, restores namespaces and
    /// notifies the peer. Returns `false` if the socket is closed or already stamped.
    pub fn accept(&self, socket: &Arc<Socket>, token: SessionToken) -> bool {
        if socket.is_closed() {
            debug!(conn_id = %socket.id(), "Not accepting token on closed connection");
            return false;
        }
        if !socket.stamp_token(token) {
            return false;
        }
        socket.cancel_grace_timer();
        let restored = self.namespaces.restore(socket);
        info!(conn_id = %socket.id(), restored, "Connection authenticated");
        socket.emit(AUTHENTICATED, Value::Null);
        true
    }
}
