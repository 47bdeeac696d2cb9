use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtoError;
use crate::message::DEFAULT_NAMESPACE;

/// Inbound request to authenticate a connection.
pub const AUTHENTICATION: &str = "authentication";
/// Outbound notice that the handshake succeeded.
pub const AUTHENTICATED: &str = "authenticated";
/// Outbound notice that the grace period expired.
pub const UNAUTHORIZED: &str = "unauthorized";
/// Join the reserved broadcast group.
pub const GROUP_REGISTER: &str = "fl-reg";
/// Liveness probe request.
pub const PING: &str = "lb-ping";
/// Liveness probe response carrying a wall-clock timestamp in seconds.
pub const PONG: &str = "lb-pong";
/// Envelope asking the gateway to re-broadcast `{event, data}` to everyone.
pub const RELAY: &str = "ME:RT:1://event";
/// Local event fired on a socket when its connection ends.
pub const DISCONNECT: &str = "disconnect";

/// Event names that custom auth resolvers may not claim.
pub const RESERVED_EVENTS: &[&str] = &[AUTHENTICATION, GROUP_REGISTER, PING, RELAY, DISCONNECT];

fn default_nsp() -> String {
    DEFAULT_NAMESPACE.to_string()
}

/// WebSocket frame envelope shared by the gateway and its clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// Attach the connection to a namespace.
    #[serde(rename = "connect")]
    Connect { nsp: String },
    /// Detach the connection from a namespace.
    #[serde(rename = "disconnect")]
    Disconnect { nsp: String },
    /// Named event on a namespace.
    #[serde(rename = "event")]
    Event {
        #[serde(default = "default_nsp")]
        nsp: String,
        event: String,
        #[serde(default)]
        data: Value,
    },
}

impl Frame {
    /// Builds an event frame on the default namespace.
    pub fn event(event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            nsp: default_nsp(),
            event: event.into(),
            data,
        }
    }

    /// Builds an event frame on a specific namespace.
    pub fn namespaced(nsp: impl Into<String>, event: impl Into<String>, data: Value) -> Self {
        Self::Event {
            nsp: nsp.into(),
            event: event.into(),
            data,
        }
    }

    /// Parses a text message into a frame.
    pub fn decode(text: &str) -> Result<Self, ProtoError> {
        serde_json::from_str(text).map_err(|e| ProtoError::MalformedFrame(e.to_string()))
    }

    /// Serializes the frame into a text message.
    pub fn encode(&self) -> Result<String, ProtoError> {
        serde_json::to_string(self).map_err(|e| ProtoError::Serialization(e.to_string()))
    }
}

/// Payload of the [`RELAY`] event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayEnvelope {
    /// Event name to broadcast.
    pub event: String,
    /// Event payload.
    #[serde(default)]
    pub data: Value,
}

/// Broadcast fanned out between gateway instances by a cluster adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterPacket {
    /// Instance id of the publishing gateway.
    pub origin: String,
    /// Target namespace.
    pub nsp: String,
    /// Optional room inside the namespace; `None` targets every member.
    pub room: Option<String>,
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: Value,
}
