//! Shared protocol types for the realtime gateway and its clients.
//!
//! This crate defines the WebSocket frame envelope, event names, token
//! payloads, cluster packets and strongly-typed error enums shared across
//! the workspace.

pub mod error;
pub mod event;
pub mod message;
pub mod token;

/// Re-export of all protocol error types.
pub use error::*;
/// Re-export of frame/envelope types and event names.
pub use event::{ClusterPacket, Frame, RelayEnvelope};
/// Re-export of connection identity types.
pub use message::{ConnectionId, DEFAULT_NAMESPACE, FLINT_GROUP, normalize_namespace};
/// Re-export of authentication token types.
pub use token::{
    AuthRequest, CredentialQuery, CredentialRecord, INTERNAL_MARKER, SessionToken, TokenKind,
};
