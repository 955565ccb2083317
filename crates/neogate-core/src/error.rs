//! Error types shared across the gateway crates.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed record. Dropped, never retried.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Device rejected by the allow/deny policy.
    #[error("Forbidden device: {0}")]
    ForbiddenDevice(String),

    /// The event storage has no room for the record.
    #[error("Event storage is full")]
    QueueFull,

    /// The record could not be durably stored.
    #[error("Persistence failure: {0}")]
    Persistence(String),

    /// Uplink is disconnected or a publish was not acknowledged.
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// No reply arrived before the request deadline.
    #[error("RPC request {0} timed out")]
    RpcTimeout(u64),

    /// A new configuration failed to apply and was rolled back.
    #[error("Reconfiguration failed: {0}")]
    Reconfiguration(String),

    /// Error raised inside a connector.
    #[error("Connector error: {0}")]
    Connector(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Entity not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the error means the link is down and the work should be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::LinkUnavailable(_) | Error::QueueFull)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(e: toml::ser::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(e: regex::Error) -> Self {
        Error::Config(format!("invalid device filter pattern: {}", e))
    }
}
