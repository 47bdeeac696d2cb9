//! Namespaces: named broadcast channels multiplexed over one transport.
//!
//! Each namespace keeps two views of its members. `sockets` is the raw
//! membership list: every connection that attached. `connected` is the
//! visible index that broadcasts and namespace handlers use; unauthenticated
//! connections are kept out of it until [`NamespaceRegistry::restore`] runs.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use proto::{ClusterPacket, ConnectionId, DEFAULT_NAMESPACE, Frame, normalize_namespace};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cluster::Fanout;
use crate::socket::{EventHandler, Socket};

/// A named logical channel.
pub struct Namespace {
    name: String,
    sockets: RwLock<Vec<Arc<Socket>>>,
    connected: DashMap<ConnectionId, Arc<Socket>>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    handlers: RwLock<HashMap<String, Vec<EventHandler>>>,
    fanout: Arc<Fanout>,
}

impl Namespace {
    fn new(name: String, fanout: Arc<Fanout>) -> Self {
        Self {
            name,
            sockets: RwLock::new(Vec::new()),
            connected: DashMap::new(),
            rooms: DashMap::new(),
            handlers: RwLock::new(HashMap::new()),
            fanout,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Adds a connection to the raw list; `recognised` also admits it to `connected`.
    pub fn attach(&self, socket: &Arc<Socket>, recognised: bool) {
        {
            let mut sockets = self.sockets.write();
            if !sockets.iter().any(|s| s.id() == socket.id()) {
                sockets.push(socket.clone());
            }
        }
        socket.add_namespace(&self.name);
        if recognised {
            self.connected.insert(socket.id().clone(), socket.clone());
        } else {
            debug!(nsp = %self.name, conn_id = %socket.id(), "Attached without recognition");
        }
    }

    /// Removes a connection from every view of this namespace.
    pub fn detach(&self, id: &ConnectionId) -> bool {
        let removed = {
            let mut sockets = self.sockets.write();
            let before = sockets.len();
            let mut detached = None;
            sockets.retain(|s| {
                if s.id() == id {
                    detached = Some(s.clone());
                    false
                } else {
                    true
                }
            });
            if let Some(socket) = detached {
                socket.remove_namespace(&self.name);
            }
            sockets.len() != before
        };
        self.connected.remove(id);
        self.rooms.retain(|_, members| {
            members.remove(id);
            !members.is_empty()
        });
        removed
    }

    /// Whether the raw membership list holds `id`.
    pub fn contains_socket(&self, id: &ConnectionId) -> bool {
        self.sockets.read().iter().any(|s| s.id() == id)
    }

    /// Whether `id` is in the visible `connected` index.
    pub fn is_connected(&self, id: &ConnectionId) -> bool {
        self.connected.contains_key(id)
    }

    pub fn socket_count(&self) -> usize {
        self.sockets.read().len()
    }

    pub fn connected_count(&self) -> usize {
        self.connected.len()
    }

    pub fn connected_ids(&self) -> Vec<ConnectionId> {
        self.connected.iter().map(|e| e.key().clone()).collect()
    }

    /// Re-admits `socket` to `connected` if it is in the raw list.
    pub fn restore(&self, socket: &Arc<Socket>) -> bool {
        if self.contains_socket(socket.id()) {
            self.connected.insert(socket.id().clone(), socket.clone());
            true
        } else {
            false
        }
    }

    /// Adds a member to a room.
    pub fn join(&self, room: &str, socket: &Socket) {
        debug!(nsp = %self.name, room, conn_id = %socket.id(), "Joining room");
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(socket.id().clone());
    }

    pub fn leave(&self, room: &str, id: &ConnectionId) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(id);
        }
        self.rooms.remove_if(room, |_, members| members.is_empty());
    }

    pub fn room_members(&self, room: &str) -> Vec<ConnectionId> {
        self.rooms
            .get(room)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Registers a handler for events sent on this namespace.
    pub fn on(&self, event: &str, handler: EventHandler) {
        self.handlers
            .write()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Runs namespace handlers for an inbound event. Unrecognised senders are dropped.
    pub async fn dispatch(&self, socket: &Arc<Socket>, event: &str, data: Value) -> usize {
        if !self.is_connected(socket.id()) {
            debug!(nsp = %self.name, conn_id = %socket.id(), event, "Dropping event from unrecognised member");
            return 0;
        }
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(event)
            .cloned()
            .unwrap_or_default();
        for handler in &handlers {
            handler(socket.clone(), data.clone()).await;
        }
        handlers.len()
    }

    /// Broadcasts to every connected member here and on other instances.
    pub async fn emit(&self, event: &str, data: Value) -> usize {
        let delivered = self.deliver_local(None, event, &data);
        self.fanout.publish(&self.name, None, event, &data).await;
        delivered
    }

    /// Broadcasts to the connected members of `room` here and on other instances.
    pub async fn emit_to(&self, room: &str, event: &str, data: Value) -> usize {
        let delivered = self.deliver_local(Some(room), event, &data);
        self.fanout.publish(&self.name, Some(room), event, &data).await;
        delivered
    }

    /// Delivers to local members only; returns the number of sockets reached.
    pub fn deliver_local(&self, room: Option<&str>, event: &str, data: &Value) -> usize {
        let frame = Frame::namespaced(self.name.clone(), event, data.clone());
        let text = match frame.encode() {
            Ok(text) => text,
            Err(e) => {
                warn!(nsp = %self.name, event, "Failed to encode broadcast: {e}");
                return 0;
            }
        };

        let targets: Vec<Arc<Socket>> = match room {
            None => self.connected.iter().map(|e| e.value().clone()).collect(),
            Some(room) => self
                .room_members(room)
                .iter()
                .filter_map(|id| self.connected.get(id).map(|e| e.value().clone()))
                .collect(),
        };

        targets
            .iter()
            .filter(|socket| socket.send_text(text.clone()))
            .count()
    }
}

/// Lazily created set of namespaces exposed by the transport.
pub struct NamespaceRegistry {
    namespaces: DashMap<String, Arc<Namespace>>,
    fanout: Arc<Fanout>,
}

impl NamespaceRegistry {
    pub fn new(fanout: Arc<Fanout>) -> Self {
        let registry = Self {
            namespaces: DashMap::new(),
            fanout,
        };
        registry.of(DEFAULT_NAMESPACE);
        registry
    }

    /// Returns the namespace, creating it on first reference.
    pub fn of(&self, name: &str) -> Arc<Namespace> {
        let name = normalize_namespace(name);
        self.namespaces
            .entry(name.clone())
            .or_insert_with(|| {
                debug!(nsp = %name, "Creating namespace");
                Arc::new(Namespace::new(name.clone(), self.fanout.clone()))
            })
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Namespace>> {
        self.namespaces
            .get(&normalize_namespace(name))
            .map(|e| e.value().clone())
    }

    pub fn default_namespace(&self) -> Arc<Namespace> {
        self.of(DEFAULT_NAMESPACE)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.namespaces.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.iter().map(|e| e.value().clone()).collect()
    }

    /// Re-admits an authenticated socket to every namespace whose raw list holds it.
    ///
    /// Returns the number of namespaces it was restored into.
    pub fn restore(&self, socket: &Arc<Socket>) -> usize {
        let restored = self
            .snapshot()
            .iter()
            .filter(|nsp| nsp.restore(socket))
            .count();
        debug!(conn_id = %socket.id(), restored, "Namespaces restored");
        restored
    }

    /// Removes a connection from every namespace.
    pub fn detach_all(&self, id: &ConnectionId) {
        for nsp in self.snapshot() {
            nsp.detach(id);
        }
    }

    /// Delivers a packet received from another instance to local members.
    pub fn deliver_remote(&self, packet: &ClusterPacket) -> usize {
        self.of(&packet.nsp)
            .deliver_local(packet.room.as_deref(), &packet.event, &packet.data)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::socket::{Outbound, event_handler};

    fn registry() -> NamespaceRegistry {
        NamespaceRegistry::new(Arc::new(Fanout::new()))
    }

    fn socket(id: &str) -> (Arc<Socket>, mpsc::UnboundedReceiver<Outbound>) {
        Socket::new(ConnectionId::from(id), None)
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(Outbound::Text(text)) = rx.try_recv() {
            frames.push(Frame::decode(&text).expect("frame"));
        }
        frames
    }

    #[test]
    fn default_namespace_exists_and_names_are_normalised() {
        let registry = registry();
        assert_eq!(registry.names(), vec!["/".to_string()]);
        let chat = registry.of("chat");
        assert_eq!(chat.name(), "/chat");
        assert!(Arc::ptr_eq(&chat, &registry.of("/chat")));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn unrecognised_attach_stays_out_of_connected_until_restored() {
        let registry = registry();
        let (a, _rx) = socket("a");
        let chat = registry.of("/chat");
        let lobby = registry.of("/lobby");

        chat.attach(&a, false);
        registry.default_namespace().attach(&a, false);
        assert!(chat.contains_socket(a.id()));
        assert!(!chat.is_connected(a.id()));

        assert_eq!(registry.restore(&a), 2);
        assert!(chat.is_connected(a.id()));
        assert!(registry.default_namespace().is_connected(a.id()));
        assert!(!lobby.is_connected(a.id()));
    }

    #[test]
    fn broadcast_reaches_only_connected_members() {
        let registry = registry();
        let chat = registry.of("/chat");
        let (a, mut rx_a) = socket("a");
        let (b, mut rx_b) = socket("b");
        chat.attach(&a, true);
        chat.attach(&b, false);

        assert_eq!(chat.deliver_local(None, "msg", &json!("hi")), 1);
        assert_eq!(
            drain_events(&mut rx_a),
            vec![Frame::namespaced("/chat", "msg", json!("hi"))]
        );
        assert!(drain_events(&mut rx_b).is_empty());
    }

    #[test]
    fn room_delivery_filters_members() {
        let registry = registry();
        let root = registry.default_namespace();
        let (a, mut rx_a) = socket("a");
        let (b, mut rx_b) = socket("b");
        root.attach(&a, true);
        root.attach(&b, true);
        root.join("flint", &a);

        assert_eq!(root.deliver_local(Some("flint"), "sync", &Value::Null), 1);
        assert_eq!(drain_events(&mut rx_a).len(), 1);
        assert!(drain_events(&mut rx_b).is_empty());

        root.leave("flint", a.id());
        assert!(root.room_members("flint").is_empty());
    }

    #[test]
    fn detach_all_clears_membership_and_rooms() {
        let registry = registry();
        let (a, _rx) = socket("a");
        let chat = registry.of("/chat");
        chat.attach(&a, true);
        chat.join("room", &a);

        registry.detach_all(a.id());
        assert!(!chat.contains_socket(a.id()));
        assert!(!chat.is_connected(a.id()));
        assert!(chat.room_members("room").is_empty());
        assert!(!chat.restore(&a));
    }

    #[test]
    fn attach_twice_keeps_single_entry() {
        let registry = registry();
        let (a, _rx) = socket("a");
        let chat = registry.of("/chat");
        chat.attach(&a, false);
        chat.attach(&a, true);
        assert_eq!(chat.socket_count(), 1);
        assert_eq!(chat.connected_count(), 1);
        assert_eq!(a.namespaces(), vec!["/chat".to_string()]);
    }

    #[tokio::test]
    async fn dispatch_runs_handlers_only_for_connected_senders() {
        let registry = registry();
        let chat = registry.of("/chat");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        chat.on(
            "typing",
            event_handler(move |_socket, _data| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let (a, _rx) = socket("a");
        chat.attach(&a, false);
        assert_eq!(chat.dispatch(&a, "typing", Value::Null).await, 0);

        chat.restore(&a);
        assert_eq!(chat.dispatch(&a, "typing", Value::Null).await, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn deliver_remote_targets_packet_namespace() {
        let registry = registry();
        let (a, mut rx_a) = socket("a");
        registry.of("/chat").attach(&a, true);

        let packet = ClusterPacket {
            origin: "other".to_string(),
            nsp: "/chat".to_string(),
            room: None,
            event: "msg".to_string(),
            data: json!(1),
        };
        assert_eq!(registry.deliver_remote(&packet), 1);
        assert_eq!(drain_events(&mut rx_a).len(), 1);
    }
}
