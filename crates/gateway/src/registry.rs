//! Ordered table of live connections.

use std::sync::Arc;

use parking_lot::RwLock;
use proto::ConnectionId;
use tracing::debug;

use crate::socket::Socket;

/// Live connections in connection order.
#[derive(Default)]
pub struct ConnectionRegistry {
    sockets: RwLock<Vec<Arc<Socket>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a connection. Returns `false` if the id is already registered.
    pub fn add(&self, socket: Arc<Socket>) -> bool {
        let mut sockets = self.sockets.write();
        if sockets.iter().any(|s| s.id() == socket.id()) {
            return false;
        }
        debug!(conn_id = %socket.id(), "Connection registered");
        sockets.push(socket);
        true
    }

    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<Socket>> {
        let mut sockets = self.sockets.write();
        let index = sockets.iter().position(|s| s.id() == id)?;
        debug!(conn_id = %id, "Connection unregistered");
        Some(sockets.remove(index))
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Arc<Socket>> {
        self.sockets.read().iter().find(|s| s.id() == id).cloned()
    }

    /// Copy of the current table; later mutations do not affect it.
    pub fn snapshot(&self) -> Vec<Arc<Socket>> {
        self.sockets.read().clone()
    }

    /// Calls `f` for every connection present when the call started.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Socket>),
    {
        for socket in self.snapshot() {
            f(&socket);
        }
    }

    /// First connection (in connection order) whose token carries `user_id`.
    pub fn find_by_user(&self, user_id: Option<&str>) -> Option<Arc<Socket>> {
        let user_id = user_id.filter(|u| !u.is_empty())?;
        self.sockets
            .read()
            .iter()
            .find(|s| {
                s.token()
                    .and_then(|t| t.user_id())
                    .is_some_and(|u| u == user_id)
            })
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.sockets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.read().is_empty()
    }
}
