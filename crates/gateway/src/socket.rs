//! Server-side handle of one transport connection.
//!
//! A [`Socket`] owns the outbound queue drained by the connection's writer
//! task, the per-connection event-listener table, the set of namespaces the
//! connection is attached to, and the stamped [`SessionToken`].

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use proto::{ConnectionId, DEFAULT_NAMESPACE, Frame, SessionToken};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

/// Close code used when a connection is dropped for failing the handshake.
pub const CLOSE_UNAUTHORIZED: u16 = 1008;

/// Async callback invoked for an inbound event on a socket or namespace.
pub type EventHandler =
    Arc<dyn Fn(Arc<Socket>, Value) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Wraps an async closure as an [`EventHandler`].
pub fn event_handler<F, Fut>(f: F) -> EventHandler
where
    F: Fn(Arc<Socket>, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |socket, data| Box::pin(f(socket, data)))
}

/// Item queued for the connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialized [`Frame`].
    Text(String),
    /// Close the connection with a code and reason.
    Close { code: u16, reason: String },
}

struct Listener {
    id: u64,
    once: bool,
    handler: EventHandler,
}

/// A live transport connection.
pub struct Socket {
    id: ConnectionId,
    remote: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Outbound>,
    token: OnceLock<SessionToken>,
    listeners: Mutex<HashMap<String, Vec<Listener>>>,
    next_listener: AtomicU64,
    namespaces: Mutex<BTreeSet<String>>,
    grace_timer: Mutex<Option<AbortHandle>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("authenticated", &self.is_authenticated())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Socket {
    /// Creates a socket and the receiving end of its outbound queue.
    pub fn new(
        id: ConnectionId,
        remote: Option<SocketAddr>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let socket = Arc::new(Self {
            id,
            remote,
            outbound,
            token: OnceLock::new(),
            listeners: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            namespaces: Mutex::new(BTreeSet::new()),
            grace_timer: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        (socket, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote
    }

    /// Token stamped by the handshake, if any.
    pub fn token(&self) -> Option<&SessionToken> {
        self.token.get()
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.get().is_some()
    }

    /// Stores the token. Returns `false` if one was already stamped.
    pub(crate) fn stamp_token(&self, token: SessionToken) -> bool {
        self.token.set(token).is_ok()
    }

    /// Sends an event on the default namespace.
    pub fn emit(&self, event: &str, data: Value) -> bool {
        self.send_frame(&Frame::event(event, data))
    }

    /// Sends a pre-built frame.
    pub fn send_frame(&self, frame: &Frame) -> bool {
        match frame.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!(conn_id = %self.id, "Failed to encode frame: {e}");
                false
            }
        }
    }

    /// Queues an already encoded frame.
    pub(crate) fn send_text(&self, text: String) -> bool {
        if self.is_closed() {
            return false;
        }
        self.outbound.send(Outbound::Text(text)).is_ok()
    }

    /// Asks the writer task to close the connection.
    pub fn close(&self, code: u16, reason: &str) {
        debug!(conn_id = %self.id, code, reason, "Closing connection");
        let _ = self.outbound.send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.mark_closed();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Registers a listener for `event`.
    pub fn on(&self, event: &str, handler: EventHandler) -> u64 {
        self.add_listener(event, handler, false)
    }

    /// Registers a listener removed after its first invocation.
    pub fn once(&self, event: &str, handler: EventHandler) -> u64 {
        self.add_listener(event, handler, true)
    }

    fn add_listener(&self, event: &str, handler: EventHandler, once: bool) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(Listener { id, once, handler });
        id
    }

    /// Removes one listener by the id returned from [`Socket::on`].
    pub fn remove_listener(&self, event: &str, id: u64) -> bool {
        let mut listeners = self.listeners.lock();
        let Some(list) = listeners.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|l| l.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            listeners.remove(event);
        }
        removed
    }

    /// Drops every listener bound to this socket.
    pub fn remove_all_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub fn listener_count(&self, event: &str) -> usize {
        self.listeners.lock().get(event).map_or(0, Vec::len)
    }

    /// Invokes the listeners of `event` in registration order.
    ///
    /// The table is snapshotted first, so handlers may add or remove listeners.
    pub async fn fire(self: &Arc<Self>, event: &str, data: Value) -> usize {
        let handlers: Vec<EventHandler> = {
            let mut listeners = self.listeners.lock();
            let Some(list) = listeners.get_mut(event) else {
                return 0;
            };
            let handlers = list.iter().map(|l| l.handler.clone()).collect();
            list.retain(|l| !l.once);
            if list.is_empty() {
                listeners.remove(event);
            }
            handlers
        };

        let count = handlers.len();
        for handler in handlers {
            handler(self.clone(), data.clone()).await;
        }
        count
    }

    /// Names of the namespaces this connection is attached to.
    pub fn namespaces(&self) -> Vec<String> {
        self.namespaces.lock().iter().cloned().collect()
    }

    pub(crate) fn add_namespace(&self, nsp: &str) {
        self.namespaces.lock().insert(nsp.to_string());
    }

    pub(crate) fn remove_namespace(&self, nsp: &str) {
        if nsp != DEFAULT_NAMESPACE || self.is_closed() {
            self.namespaces.lock().remove(nsp);
        }
    }

    /// Arms the grace timer, aborting any previous one.
    pub(crate) fn set_grace_timer(&self, handle: AbortHandle) {
        if let Some(previous) = self.grace_timer.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Cancels the grace timer. Returns `true` if one was armed.
    pub(crate) fn cancel_grace_timer(&self) -> bool {
        match self.grace_timer.lock().take() {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn socket() -> (Arc<Socket>, mpsc::UnboundedReceiver<Outbound>) {
        Socket::new(ConnectionId::from("c1"), None)
    }

    fn counter_handler(counter: Arc<AtomicU64>) -> EventHandler {
        event_handler(move |_socket, _data| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
    }

    #[test]
    fn emit_queues_encoded_event_frame() {
        let (socket, mut rx) = socket();
        assert!(socket.emit("authenticated", Value::Null));

        let Outbound::Text(text) = rx.try_recv().expect("queued") else {
            panic!("expected text frame");
        };
        let frame = Frame::decode(&text).expect("frame");
        assert_eq!(frame, Frame::event("authenticated", Value::Null));
    }

    #[test]
    fn close_queues_close_and_blocks_further_emits() {
        let (socket, mut rx) = socket();
        socket.close(CLOSE_UNAUTHORIZED, "unauthorized");
        assert!(socket.is_closed());
        assert!(!socket.emit("late", Value::Null));

        assert_eq!(
            rx.try_recv().expect("close queued"),
            Outbound::Close {
                code: CLOSE_UNAUTHORIZED,
                reason: "unauthorized".to_string()
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn token_can_only_be_stamped_once() {
        let (socket, _rx) = socket();
        assert!(!socket.is_authenticated());
        assert!(socket.stamp_token(SessionToken::from_resolver(json!({"userId": "a"})).expect("object")));
        assert!(!socket.stamp_token(SessionToken::from_resolver(json!({"userId": "b"})).expect("object")));
        assert_eq!(
            socket.token().and_then(SessionToken::user_id).as_deref(),
            Some("a")
        );
    }

    #[tokio::test]
    async fn fire_runs_listeners_and_drops_once_listeners() {
        let (socket, _rx) = socket();
        let hits = Arc::new(AtomicU64::new(0));
        socket.on("lb-ping", counter_handler(hits.clone()));
        socket.once("lb-ping", counter_handler(hits.clone()));

        assert_eq!(socket.fire("lb-ping", Value::Null).await, 2);
        assert_eq!(socket.fire("lb-ping", Value::Null).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(socket.listener_count("lb-ping"), 1);
    }

    #[tokio::test]
    async fn remove_all_listeners_releases_every_event() {
        let (socket, _rx) = socket();
        let hits = Arc::new(AtomicU64::new(0));
        socket.on("a", counter_handler(hits.clone()));
        socket.on("b", counter_handler(hits.clone()));

        socket.remove_all_listeners();
        assert_eq!(socket.fire("a", Value::Null).await, 0);
        assert_eq!(socket.fire("b", Value::Null).await, 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_listener_by_id() {
        let (socket, _rx) = socket();
        let hits = Arc::new(AtomicU64::new(0));
        let id = socket.on("a", counter_handler(hits));
        assert!(socket.remove_listener("a", id));
        assert!(!socket.remove_listener("a", id));
        assert_eq!(socket.listener_count("a"), 0);
    }

    #[tokio::test]
    async fn cancel_grace_timer_aborts_task() {
        let (socket, _rx) = socket();
        let task = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        });
        socket.set_grace_timer(task.abort_handle());
        assert!(socket.cancel_grace_timer());
        assert!(!socket.cancel_grace_timer());
        assert!(task.await.expect_err("aborted").is_cancelled());
    }

    #[test]
    fn default_namespace_membership_survives_detach_until_closed() {
        let (socket, _rx) = socket();
        socket.add_namespace("/");
        socket.add_namespace("/chat");
        socket.remove_namespace("/");
        socket.remove_namespace("/chat");
        assert_eq!(socket.namespaces(), vec!["/".to_string()]);

        socket.mark_closed();
        socket.remove_namespace("/");
        assert!(socket.namespaces().is_empty());
    }
}
