//! Lifecycle signals published to the host application.

use std::net::SocketAddr;

use proto::{ConnectionId, SessionToken};
use tokio::sync::broadcast;
use tracing::trace;

const SIGNAL_CAPACITY: usize = 256;

/// Notification about the gateway or one of its connections.
#[derive(Debug, Clone, PartialEq)]
pub enum HostSignal {
    /// The transport is listening.
    ConnectionStarted { addr: SocketAddr },
    /// A connection passed the credential-store handshake.
    SocketAuthenticated {
        id: ConnectionId,
        token: SessionToken,
    },
    /// A connection went away.
    SocketDisconnect { id: ConnectionId },
}

/// Broadcast bus for [`HostSignal`]s. Slow receivers lose the oldest signals.
#[derive(Clone)]
pub struct SignalBus {
    tx: broadcast::Sender<HostSignal>,
}

impl Default for SignalBus {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(SIGNAL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, signal: HostSignal) {
        trace!(?signal, "Host signal");
        // Nobody listening is fine.
        let _ = self.tx.send(signal);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostSignal> {
        self.tx.subscribe()
    }
}
