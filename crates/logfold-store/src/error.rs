//! Error types for logfold-store
//!
//! Every failure the store can produce surfaces through [`StoreError`].
//! Nothing is swallowed to keep logging alive: callers decide whether a
//! failed emit is itself worth reporting elsewhere.

use thiserror::Error;

/// Errors that can occur in store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Invalid or contradictory configuration, detected before the store starts
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Backend unreachable during the connect handshake or a test probe
    #[error("Connection error: {0}")]
    Connection(String),

    /// Uniqueness conflict on the fingerprint that the bounded retry could not resolve
    #[error("Duplicate fingerprint {fingerprint} in {container}")]
    Conflict {
        /// Container the write targeted
        container: String,
        /// Fingerprint that conflicted
        fingerprint: String,
    },

    /// Any other backend failure during a read or write
    #[error("Storage error: {0}")]
    Storage(String),

    /// Payload could not be reduced to a storable document
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Create a new Configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new Connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a new Conflict error
    pub fn conflict(container: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self::Conflict {
            container: container.into(),
            fingerprint: fingerprint.into(),
        }
    }

    /// Create a new Storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a new Serialization error
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization(message.into())
    }

    /// Storage error for an operation that exceeded its time bound
    pub fn timed_out(operation: &str, timeout_ms: u64) -> Self {
        Self::Storage(format!("{operation} timed out after {timeout_ms}ms"))
    }

    /// Whether this is a uniqueness conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for StoreError {
    fn from(err: toml::de::Error) -> Self {
        StoreError::Configuration(err.to_string())
    }
}

macro_rules! redb_storage_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for StoreError {
                fn from(err: $ty) -> Self {
                    StoreError::Storage(err.to_string())
                }
            }
        )*
    };
}

redb_storage_error!(
    redb::Error,
    redb::TransactionError,
    redb::TableError,
    redb::StorageError,
    redb::CommitError,
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_error() {
        let err = StoreError::conflict("logfold.records", "abc123");
        assert!(err.is_conflict());
        assert!(err.to_string().contains("abc123"));
        assert!(err.to_string().contains("logfold.records"));
    }

    #[test]
    fn test_timed_out_is_storage() {
        let err = StoreError::timed_out("upsert", 1000);
        assert!(matches!(err, StoreError::Storage(_)));
        assert!(err.to_string().contains("1000ms"));
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: StoreError = json_err.into();
        assert!(matches!(err, StoreError::Serialization(_)));
    }

    #[test]
    fn test_toml_error_conversion() {
        let toml_err = toml::from_str::<toml::Value>("= nope").unwrap_err();
        let err: StoreError = toml_err.into();
        assert!(matches!(err, StoreError::Configuration(_)));
    }
}
