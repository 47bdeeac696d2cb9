//! The [`Gateway`]: single entry point wiring transport, handshake,
//! namespaces, cluster fan-out and the internal loopback sessions.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use proto::event::{DISCONNECT, GROUP_REGISTER, PING, PONG, RELAY};
use proto::{DEFAULT_NAMESPACE, FLINT_GROUP, GatewayError, RelayEnvelope};
use serde_json::{Value, json};
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::auth::{AuthHandshake, AuthResolver, AuthSettings};
use crate::bootstrap::{InternalChannelBootstrap, InternalClients, loopback_url};
use crate::client::{ClientEmitter, ClientHandler, GatewayClient};
use crate::cluster::{ClusterMode, Fanout, select_adapter};
use crate::config::GatewayConfig;
use crate::credentials::TokenValidator;
use crate::namespace::{Namespace, NamespaceRegistry};
use crate::registry::ConnectionRegistry;
use crate::server::{ConnectionHook, Transport};
use crate::signal::{HostSignal, SignalBus};
use crate::socket::{Socket, event_handler};

/// Close code sent to live connections on shutdown.
const CLOSE_GOING_AWAY: u16 = 1001;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

struct PendingListener {
    id: u64,
    event: String,
    handler: ClientHandler,
    once: bool,
}

/// Registrations accepted until [`Gateway::connect`] seals them.
#[derive(Default)]
struct Setup {
    resolvers: Vec<AuthResolver>,
    hooks: Vec<ConnectionHook>,
    sealed: bool,
}

struct Running {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
    remote: Option<JoinHandle<()>>,
    clients: InternalClients,
}

/// Realtime gateway facade.
pub struct Gateway {
    config: GatewayConfig,
    validator: Arc<dyn TokenValidator>,
    fanout: Arc<Fanout>,
    namespaces: Arc<NamespaceRegistry>,
    connections: Arc<ConnectionRegistry>,
    signals: SignalBus,
    setup: Mutex<Setup>,
    next_listener: AtomicU64,
    pending_listeners: Mutex<Vec<PendingListener>>,
    /// Facade listener id to (event, service client listener id).
    attached_listeners: Mutex<HashMap<u64, (String, u64)>>,
    running: Mutex<Option<Running>>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, validator: Arc<dyn TokenValidator>) -> Self {
        let fanout = Arc::new(Fanout::new());
        Self {
            config,
            validator,
            namespaces: Arc::new(NamespaceRegistry::new(fanout.clone())),
            fanout,
            connections: Arc::new(ConnectionRegistry::new()),
            signals: SignalBus::new(),
            setup: Mutex::new(Setup::default()),
            next_listener: AtomicU64::new(1),
            pending_listeners: Mutex::new(Vec::new()),
            attached_listeners: Mutex::new(HashMap::new()),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Adds a custom handshake path. Rejected once [`Gateway::connect`] has begun.
    pub fn register_auth_resolver(&self, resolver: AuthResolver) -> Result<(), GatewayError> {
        let mut setup = self.setup.lock();
        if setup.sealed {
            return Err(GatewayError::InvalidResolver(format!(
                "'{}' registered after connect",
                resolver.name()
            )));
        }
        if setup.resolvers.iter().any(|r| r.name() == resolver.name()) {
            return Err(GatewayError::InvalidResolver(format!(
                "'{}' is already registered",
                resolver.name()
            )));
        }
        debug!(resolver = resolver.name(), "Auth resolver registered");
        setup.resolvers.push(resolver);
        Ok(())
    }

    /// Runs `hook` for every new connection, after the built-in wiring.
    /// Rejected once [`Gateway::connect`] has begun.
    pub fn on_connection<F>(&self, hook: F) -> Result<(), GatewayError>
    where
        F: Fn(&Arc<Socket>) + Send + Sync + 'static,
    {
        let mut setup = self.setup.lock();
        if setup.sealed {
            return Err(GatewayError::Connection(
                "connection hook registered after connect".to_string(),
            ));
        }
        setup.hooks.push(Arc::new(hook));
        Ok(())
    }

    /// Starts the transport and the internal sessions. Returns the bound address.
    ///
    /// Resolvers and connection hooks are sealed for the duration of the call
    /// and stay sealed while running; a failed start unseals them.
    pub async fn connect(&self) -> Result<SocketAddr, GatewayError> {
        let (resolvers, user_hooks) = {
            let mut setup = self.setup.lock();
            if setup.sealed {
                return Err(GatewayError::Connection(
                    "gateway already connected or connecting".to_string(),
                ));
            }
            setup.sealed = true;
            (setup.resolvers.clone(), setup.hooks.clone())
        };
        let started = self.start(resolvers, user_hooks).await;
        if started.is_err() {
            self.setup.lock().sealed = false;
        }
        started
    }

    async fn start(
        &self,
        resolvers: Vec<AuthResolver>,
        user_hooks: Vec<ConnectionHook>,
    ) -> Result<SocketAddr, GatewayError> {
        let realtime = &self.config.realtime;

        let remote = match select_adapter(realtime.adapter.as_ref(), &self.config.datasources)? {
            ClusterMode::Standalone => None,
            ClusterMode::Clustered(adapter) => {
                self.fanout.install(adapter.clone());
                let mut packets = adapter.subscribe().await?;
                let fanout = self.fanout.clone();
                let namespaces = self.namespaces.clone();
                Some(tokio::spawn(async move {
                    while let Some(packet) = packets.recv().await {
                        if fanout.is_own(&packet) {
                            continue;
                        }
                        let delivered = namespaces.deliver_remote(&packet);
                        debug!(nsp = %packet.nsp, event = %packet.event, delivered, "Remote broadcast");
                    }
                    warn!("Cluster subscription ended");
                }))
            }
        };

        let mut hooks = vec![self.connection_wiring()];
        if realtime.auth {
            let handshake = Arc::new(AuthHandshake::new(
                AuthSettings {
                    grace_period: realtime.grace_period(),
                    secret: realtime.internal_secret.clone(),
                },
                self.validator.clone(),
                self.namespaces.clone(),
                self.signals.clone(),
                resolvers,
            ));
            hooks.push(Arc::new(move |socket: &Arc<Socket>| handshake.attach(socket)));
        }
        hooks.extend(user_hooks);

        let transport = Arc::new(Transport::new(
            self.config.server.clone(),
            self.namespaces.clone(),
            self.connections.clone(),
            realtime.auth,
            hooks,
        ));
        let listener = match transport.bind().await {
            Ok(listener) => listener,
            Err(e) => {
                if let Some(task) = remote {
                    task.abort();
                }
                return Err(e);
            }
        };
        let addr = listener
            .local_addr()
            .map_err(|e| GatewayError::Bind(e.to_string()))?;

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let signal = async move {
                let _ = shutdown_rx.await;
            };
            if let Err(e) = transport.serve(listener, signal).await {
                error!("Realtime transport failed: {e}");
            }
        });

        let bootstrap = InternalChannelBootstrap::new(
            loopback_url(realtime.secure, addr.port(), &self.config.server.ws_path),
            realtime.auth,
            realtime.internal_secret.clone(),
        );
        let clients = bootstrap.start().await;

        {
            let mut running = self.running.lock();
            let pending: Vec<PendingListener> = self.pending_listeners.lock().drain(..).collect();
            match &clients.service {
                Some(service) => {
                    let mut attached = self.attached_listeners.lock();
                    for listener in pending {
                        let (id, entry) = attach_listener(service, listener);
                        attached.insert(id, entry);
                    }
                }
                None if !pending.is_empty() => {
                    warn!(
                        dropped = pending.len(),
                        "No internal service session; dropping queued listeners"
                    );
                }
                None => {}
            }
            *running = Some(Running {
                addr,
                shutdown,
                server,
                remote,
                clients,
            });
        }
        self.signals
            .publish(HostSignal::ConnectionStarted { addr });
        info!(%addr, auth = realtime.auth, clustered = self.fanout.is_clustered(), "Gateway started");
        Ok(addr)
    }

    /// Relay, disconnect, liveness and group-join listeners for every connection.
    fn connection_wiring(&self) -> ConnectionHook {
        let namespaces = self.namespaces.clone();
        let connections = self.connections.clone();
        let signals = self.signals.clone();

        Arc::new(move |socket: &Arc<Socket>| {
            if !connections.add(socket.clone()) {
                warn!(conn_id = %socket.id(), "Connection registered twice");
            }

            let relay_namespaces = namespaces.clone();
            socket.on(
                RELAY,
                event_handler(move |socket, data| {
                    let namespaces = relay_namespaces.clone();
                    async move {
                        match serde_json::from_value::<RelayEnvelope>(data) {
                            Ok(envelope) => {
                                namespaces
                                    .default_namespace()
                                    .emit(&envelope.event, envelope.data)
                                    .await;
                            }
                            Err(e) => {
                                warn!(conn_id = %socket.id(), "Ignoring malformed relay envelope: {e}");
                            }
                        }
                    }
                }),
            );

            let registry = connections.clone();
            let disconnect_signals = signals.clone();
            socket.on(
                DISCONNECT,
                event_handler(move |socket, _data| {
                    let registry = registry.clone();
                    let signals = disconnect_signals.clone();
                    async move {
                        registry.remove(socket.id());
                        signals.publish(HostSignal::SocketDisconnect {
                            id: socket.id().clone(),
                        });
                        socket.remove_all_listeners();
                    }
                }),
            );

            socket.on(
                PING,
                event_handler(|socket, _data| async move {
                    let now = chrono::Utc::now().timestamp_millis() as f64 / 1000.0;
                    socket.emit(PONG, json!(now));
                }),
            );

            let group_namespaces = namespaces.clone();
            socket.on(
                GROUP_REGISTER,
                event_handler(move |socket, _data| {
                    let namespaces = group_namespaces.clone();
                    async move {
                        namespaces.default_namespace().join(FLINT_GROUP, &socket);
                    }
                }),
            );
        })
    }

    pub fn is_connected(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.addr)
    }

    /// Broadcasts to every recognised connection of the default namespace.
    pub async fn emit(&self, event: &str, data: Value) -> usize {
        self.namespaces.default_namespace().emit(event, data).await
    }

    /// Broadcasts to a group of the default namespace (e.g. `flint`).
    pub async fn emit_to_group(&self, group: &str, event: &str, data: Value) -> usize {
        self.namespaces
            .default_namespace()
            .emit_to(group, event, data)
            .await
    }

    /// Subscribes the internal service client to `event`. Returns an id for
    /// [`Gateway::remove_listener`].
    ///
    /// Before [`Gateway::connect`] the listener is queued. While running without
    /// a service session it fails with [`GatewayError::NotConnected`].
    pub fn on<F>(&self, event: &str, handler: F) -> Result<u64, GatewayError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.add_listener(event, Arc::new(handler), false)
    }

    /// Subscribes the internal service client to the next `event`.
    pub fn once<F>(&self, event: &str, handler: F) -> Result<u64, GatewayError>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.add_listener(event, Arc::new(handler), true)
    }

    fn add_listener(
        &self,
        event: &str,
        handler: ClientHandler,
        once: bool,
    ) -> Result<u64, GatewayError> {
        let listener = PendingListener {
            id: self.next_listener.fetch_add(1, Ordering::Relaxed),
            event: event.to_string(),
            handler,
            once,
        };
        let id = listener.id;
        let running = self.running.lock();
        match running.as_ref() {
            None => self.pending_listeners.lock().push(listener),
            Some(running) => {
                let Some(service) = running.clients.service.as_ref() else {
                    warn!(event, "No internal service session; listener not registered");
                    return Err(GatewayError::NotConnected);
                };
                let (id, entry) = attach_listener(service, listener);
                self.attached_listeners.lock().insert(id, entry);
            }
        }
        Ok(id)
    }

    /// Removes a listener added with [`Gateway::on`] or [`Gateway::once`].
    /// Returns `false` if `id` is unknown for `event`.
    pub fn remove_listener(&self, event: &str, id: u64) -> bool {
        let running = self.running.lock();
        {
            let mut pending = self.pending_listeners.lock();
            if let Some(pos) = pending.iter().position(|l| l.id == id && l.event == event) {
                pending.remove(pos);
                return true;
            }
        }
        let mut attached = self.attached_listeners.lock();
        let client_id = match attached.get(&id) {
            Some((registered, client_id)) if registered == event => *client_id,
            _ => return false,
        };
        attached.remove(&id);
        if let Some(service) = running.as_ref().and_then(|r| r.clients.service.as_ref()) {
            service.off(DEFAULT_NAMESPACE, event, client_id);
        }
        true
    }

    /// Namespace handle, created on first reference.
    pub fn of(&self, nsp: &str) -> Arc<Namespace> {
        self.namespaces.of(nsp)
    }

    /// Calls `f` for every live connection.
    pub fn for_each_connection<F>(&self, f: F)
    where
        F: FnMut(&Arc<Socket>),
    {
        self.connections.for_each(f);
    }

    /// First connection whose token carries `user_id`; `None` for an empty or absent id.
    pub fn get_connection_by_user(&self, user_id: Option<&str>) -> Option<Arc<Socket>> {
        self.connections.find_by_user(user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn signals(&self) -> broadcast::Receiver<HostSignal> {
        self.signals.subscribe()
    }

    /// Sending half of the internal service session, once connected.
    pub fn service_client(&self) -> Option<ClientEmitter> {
        self.running
            .lock()
            .as_ref()
            .and_then(|r| r.clients.service.as_ref())
            .map(GatewayClient::emitter)
    }

    /// Closes every connection and stops the transport.
    pub async fn shutdown(&self) -> Result<(), GatewayError> {
        let running = self.running.lock().take().ok_or(GatewayError::NotConnected)?;
        self.attached_listeners.lock().clear();

        for client in [&running.clients.service, &running.clients.registration]
            .into_iter()
            .flatten()
        {
            client.close();
        }
        self.connections
            .for_each(|socket| socket.close(CLOSE_GOING_AWAY, "server shutdown"));

        let _ = running.shutdown.send(());
        match tokio::time::timeout(SHUTDOWN_GRACE, running.server).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Transport task ended abnormally: {e}"),
            Err(_) => warn!("Transport did not stop within {SHUTDOWN_GRACE:?}"),
        }
        if let Some(remote) = running.remote {
            remote.abort();
        }
        self.setup.lock().sealed = false;
        info!(addr = %running.addr, "Gateway stopped");
        Ok(())
    }
}

/// Registers `listener` on the service client; returns its facade id and the
/// bookkeeping entry for removal.
fn attach_listener(service: &GatewayClient, listener: PendingListener) -> (u64, (String, u64)) {
    let handler = listener.handler;
    let client_id = if listener.once {
        service.once(&listener.event, move |data| handler(data))
    } else {
        service.on(&listener.event, move |data| handler(data))
    };
    (listener.id, (listener.event, client_id))
}
