//! Realtime WebSocket gateway: authentication handshake, namespace
//! restoration, cluster fan-out and internal loopback sessions.

pub mod auth;
pub mod bootstrap;
pub mod client;
pub mod cluster;
pub mod config;
pub mod credentials;
pub mod facade;
pub mod namespace;
pub mod registry;
pub mod server;
mod session;
pub mod signal;
pub mod socket;

/// Handshake types and custom resolvers.
pub use auth::{AuthHandshake, AuthResolver, AuthSettings, ResolverHandler, resolver_handler};
/// Internal loopback sessions.
pub use bootstrap::{InternalChannelBootstrap, InternalClients, loopback_url};
/// Frame-protocol client.
pub use client::{ClientEmitter, GatewayClient};
/// Cluster adapters and startup selection.
pub use cluster::{ADAPTERS, ClusterAdapter, ClusterMode, select_adapter};
/// Gateway configuration types.
pub use config::{GatewayConfig, RealtimeConfig, ServerConfig};
/// Credential stores.
pub use credentials::{MemoryTokenStore, SqliteTokenStore, TokenValidator};
/// Gateway facade.
pub use facade::Gateway;
/// Namespaces and their registry.
pub use namespace::{Namespace, NamespaceRegistry};
/// Live connection table.
pub use registry::ConnectionRegistry;
/// Host lifecycle signals.
pub use signal::{HostSignal, SignalBus};
/// Server-side connection handle.
pub use socket::{EventHandler, Socket, event_handler};
