//! Error types for the storage crate.

use thiserror::Error;

pub use neogate_core::error::Error as GatewayError;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Storage error types.
#[derive(Debug, Error)]
pub enum Error {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Storage/Database error.
    #[error("Storage error: {0}")]
    Storage(String),

    /// The backend has reached its configured capacity.
    #[error("Event storage is full")]
    QueueFull,

    /// The backend was stopped.
    #[error("Event storage is stopped")]
    Closed,
}

impl From<Error> for GatewayError {
    fn from(e: Error) -> Self {
        match e {
            Error::QueueFull => GatewayError::QueueFull,
            Error::Serialization(s) => GatewayError::Serialization(s),
            Error::Io(e) => GatewayError::Persistence(e.to_string()),
            Error::Storage(s) => GatewayError::Persistence(s),
            Error::Closed => GatewayError::Persistence("event storage is stopped".into()),
        }
    }
}

// External error conversions
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<base64::DecodeError> for Error {
    fn from(e: base64::DecodeError) -> Self {
        Error::Serialization(format!("Invalid record encoding: {}", e))
    }
}

impl From<redb::Error> for Error {
    fn from(e: redb::Error) -> Self {
        Error::Storage(format!("Redb error: {}", e))
    }
}

impl From<redb::TransactionError> for Error {
    fn from(e: redb::TransactionError) -> Self {
        Error::Storage(format!("Redb transaction error: {}", e))
    }
}

impl From<redb::TableError> for Error {
    fn from(e: redb::TableError) -> Self {
        Error::Storage(format!("Redb table error: {}", e))
    }
}

impl From<redb::StorageError> for Error {
    fn from(e: redb::StorageError) -> Self {
        Error::Storage(format!("Redb storage error: {}", e))
    }
}

impl From<redb::CommitError> for Error {
    fn from(e: redb::CommitError) -> Self {
        Error::Storage(format!("Redb commit error: {}", e))
    }
}

impl From<redb::DatabaseError> for Error {
    fn from(e: redb::DatabaseError) -> Self {
        Error::Storage(format!("Redb database error: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_gateway_error() {
        assert!(matches!(GatewayError::from(Error::QueueFull), GatewayError::QueueFull));
        assert!(matches!(
            GatewayError::from(Error::Storage("disk".into())),
            GatewayError::Persistence(_)
        ));
        assert!(matches!(GatewayError::from(Error::Closed), GatewayError::Persistence(_)));
    }
}
