use thiserror::Error;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration loading/validation error.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Gateway transport/runtime error.
    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// Internal protocol type error.
    #[error("Proto error: {0}")]
    Proto(#[from] ProtoError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required field was not provided.
    #[error("Missing required field: {0}")]
    MissingField(String),

    /// A field has an invalid value and reason.
    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    /// Filesystem read error.
    #[error("IO error reading config: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error.
    #[error("TOML parse error: {0}")]
    Toml(String),
}

impl ConfigError {
    /// Shorthand for [`ConfigError::InvalidValue`].
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Gateway errors
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network/connection-level failure.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Listener could not be bound.
    #[error("Bind error: {0}")]
    Bind(String),

    /// Cluster adapter failed to connect, publish or subscribe.
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Custom auth resolver registration was structurally invalid.
    #[error("Invalid auth resolver: {0}")]
    InvalidResolver(String),

    /// Operation requires a running gateway.
    #[error("Gateway is not connected")]
    NotConnected,

    /// Credential store failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Startup configuration rejected by the gateway.
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

/// Internal proto errors
#[derive(Debug, Error)]
pub enum ProtoError {
    /// Authentication payload could not be decoded into a token.
    #[error("Malformed token: {0}")]
    MalformedToken(String),

    /// Inbound frame is not a valid envelope.
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Generic serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}
