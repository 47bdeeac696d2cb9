//! Minimal WebSocket client speaking the gateway frame protocol.
//!
//! Used by the internal loopback bootstrap and handy in tests. Listeners are
//! synchronous callbacks keyed by namespace and event name.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use proto::event::DISCONNECT;
use proto::{DEFAULT_NAMESPACE, Frame, GatewayError, normalize_namespace};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, warn};

/// Callback for an event received by a [`GatewayClient`].
pub type ClientHandler = Arc<dyn Fn(Value) + Send + Sync>;

type ListenerKey = (String, String);

struct ClientListener {
    id: u64,
    once: bool,
    handler: ClientHandler,
}

#[derive(Default)]
struct ListenerTable {
    entries: Mutex<HashMap<ListenerKey, Vec<ClientListener>>>,
}

impl ListenerTable {
    fn remove(&self, key: &ListenerKey, id: u64) {
        let mut entries = self.entries.lock();
        if let Some(list) = entries.get_mut(key) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                entries.remove(key);
            }
        }
    }

    fn dispatch(&self, nsp: &str, event: &str, data: Value) {
        let key = (normalize_namespace(nsp), event.to_string());
        let handlers: Vec<ClientHandler> = {
            let mut entries = self.entries.lock();
            let Some(list) = entries.get_mut(&key) else {
                return;
            };
            let handlers = list.iter().map(|l| l.handler.clone()).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                entries.remove(&key);
            }
            handlers
        };
        for handler in handlers {
            handler(data.clone());
        }
    }
}

/// Cloneable sending half of a [`GatewayClient`], usable from inside listeners.
#[derive(Clone)]
pub struct ClientEmitter {
    outbound: mpsc::UnboundedSender<Message>,
    connected: Arc<AtomicBool>,
}

impl ClientEmitter {
    /// Sends an event on the default namespace.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), GatewayError> {
        self.send_frame(&Frame::event(event, data))
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(GatewayError::NotConnected);
        }
        let text = frame
            .encode()
            .map_err(|e| GatewayError::Connection(e.to_string()))?;
        self.outbound
            .send(Message::Text(text.into()))
            .map_err(|_| GatewayError::NotConnected)
    }
}

/// Client connection to a gateway.
pub struct GatewayClient {
    url: String,
    emitter: ClientEmitter,
    listeners: Arc<ListenerTable>,
    next_listener: AtomicU64,
    tasks: Vec<AbortHandle>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.url)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl GatewayClient {
    /// Opens a connection to `url` (e.g. `ws://127.0.0.1:3000/ws`).
    pub async fn connect(url: &str) -> Result<Self, GatewayError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| GatewayError::Connection(format!("{url}: {e}")))?;
        let (mut ws_tx, mut ws_rx) = stream.split();
        debug!(url, "Client connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let listeners = Arc::new(ListenerTable::default());
        let connected = Arc::new(AtomicBool::new(true));

        let write_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let read_listeners = listeners.clone();
        let read_connected = connected.clone();
        let read_url = url.to_string();
        let read_task = tokio::spawn(async move {
            while let Some(msg) = ws_rx.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(frame)) => {
                        debug!(url = %read_url, ?frame, "Server closed connection");
                        break;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(url = %read_url, "Client read error: {e}");
                        break;
                    }
                };
                match Frame::decode(text.as_str()) {
                    Ok(Frame::Event { nsp, event, data }) => {
                        read_listeners.dispatch(&nsp, &event, data);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(url = %read_url, "Ignoring server frame: {e}"),
                }
            }
            read_connected.store(false, Ordering::Release);
            read_listeners.dispatch(DEFAULT_NAMESPACE, DISCONNECT, Value::Null);
        });

        Ok(Self {
            url: url.to_string(),
            emitter: ClientEmitter {
                outbound,
                connected,
            },
            listeners,
            next_listener: AtomicU64::new(1),
            tasks: vec![write_task.abort_handle(), read_task.abort_handle()],
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.emitter.connected.load(Ordering::Acquire)
    }

    pub fn emitter(&self) -> ClientEmitter {
        self.emitter.clone()
    }

    /// Listens for `event` on the default namespace.
    pub fn on<F>(&self, event: &str, handler: F) -> u64
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.add_listener(DEFAULT_NAMESPACE, event, Arc::new(handler), false)
    }

    /// Listens for the next `event` on the default namespace only.
    pub fn once<F>(&self, event: &str, handler: F) -> u64
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.add_listener(DEFAULT_NAMESPACE, event, Arc::new(handler), true)
    }

    /// Listens for `event` on namespace `nsp`.
    pub fn on_in<F>(&self, nsp: &str, event: &str, handler: F) -> u64
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.add_listener(nsp, event, Arc::new(handler), false)
    }

    fn add_listener(&self, nsp: &str, event: &str, handler: ClientHandler, once: bool) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .entries
            .lock()
            .entry((normalize_namespace(nsp), event.to_string()))
            .or_default()
            .push(ClientListener { id, once, handler });
        id
    }

    pub fn off(&self, nsp: &str, event: &str, id: u64) {
        self.listeners
            .remove(&(normalize_namespace(nsp), event.to_string()), id);
    }

    /// Resolves with the next `event` on namespace `nsp`, or `None` after `wait`.
    ///
    /// The listener is registered before this returns, so events that arrive
    /// before the future is first polled are not missed.
    pub fn next_event(
        &self,
        nsp: &str,
        event: &str,
        wait: Duration,
    ) -> impl Future<Output = Option<Value>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        let id = self.add_listener(
            nsp,
            event,
            Arc::new(move |data: Value| {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(data);
                }
            }),
            true,
        );
        let listeners = self.listeners.clone();
        let key = (normalize_namespace(nsp), event.to_string());
        async move {
            match tokio::time::timeout(wait, rx).await {
                Ok(Ok(data)) => Some(data),
                _ => {
                    listeners.remove(&key, id);
                    None
                }
            }
        }
    }

    /// Sends an event on the default namespace.
    pub fn emit(&self, event: &str, data: Value) -> Result<(), GatewayError> {
        self.send_frame(&Frame::event(event, data))
    }

    /// Sends an event on namespace `nsp`.
    pub fn emit_in(&self, nsp: &str, event: &str, data: Value) -> Result<(), GatewayError> {
        self.send_frame(&Frame::namespaced(normalize_namespace(nsp), event, data))
    }

    /// Attaches this connection to namespace `nsp`.
    pub fn join_namespace(&self, nsp: &str) -> Result<(), GatewayError> {
        self.send_frame(&Frame::Connect {
            nsp: normalize_namespace(nsp),
        })
    }

    pub fn leave_namespace(&self, nsp: &str) -> Result<(), GatewayError> {
        self.send_frame(&Frame::Disconnect {
            nsp: normalize_namespace(nsp),
        })
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), GatewayError> {
        self.emitter.send_frame(frame)
    }

    /// Sends a close frame and stops delivering events.
    pub fn close(&self) {
        if self.emitter.connected.swap(false, Ordering::AcqRel) {
            let _ = self.emitter.outbound.send(Message::Close(None));
        }
    }
}

impl Drop for GatewayClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}
