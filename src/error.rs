//! Error types for the RPC transport.

use std::fmt;

use thiserror::Error;

/// Main error type for transport operations
#[derive(Error, Debug)]
pub enum RpcError {
    // ─────────────────────────────────────────────────────────────────────
    // Socket Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Socket error on {address}: {reason}")]
    Socket { address: String, reason: String },

    /// Wrong operation for the socket kind. Always a programming error.
    #[error("Capability error: {0}")]
    Capability(String),

    // ─────────────────────────────────────────────────────────────────────
    // Setup Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    // ─────────────────────────────────────────────────────────────────────
    // Codec Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Envelope error: {0}")]
    Envelope(String),

    #[error("Unsupported envelope version: {0}")]
    UnsupportedEnvelopeVersion(String),

    // ─────────────────────────────────────────────────────────────────────
    // Remote / Directory Errors
    // ─────────────────────────────────────────────────────────────────────
    /// A handler on the far side failed; re-raised at the caller.
    #[error("Remote error: {exc_type} {value}\n{traceback}")]
    Remote {
        exc_type: String,
        value: String,
        traceback: String,
    },

    #[error("Matchmaker error: {0}")]
    MatchMaker(String),

    #[error("Directory error: {0}")]
    Directory(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RpcError {
    pub fn socket(address: impl Into<String>, reason: impl fmt::Display) -> Self {
        Self::Socket {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redis::RedisError> for RpcError {
    fn from(err: redis::RedisError) -> Self {
        Self::Directory(err.to_string())
    }
}

impl From<config::ConfigError> for RpcError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type alias for transport operations
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RpcError::socket("tcp://127.0.0.1:9501", "Address already in use");
        assert_eq!(
            err.to_string(),
            "Socket error on tcp://127.0.0.1:9501: Address already in use"
        );

        let err = RpcError::Timeout("No match from matchmaker.".to_string());
        assert_eq!(err.to_string(), "Timeout: No match from matchmaker.");
        assert!(err.is_timeout());

        let err = RpcError::Remote {
            exc_type: "ValueError".to_string(),
            value: "bad id".to_string(),
            traceback: "line 1".to_string(),
        };
        assert_eq!(err.to_string(), "Remote error: ValueError bad id\nline 1");
        assert!(!err.is_timeout());
    }

    #[test]
    fn test_json_error_maps_to_serialization() {
        let err: RpcError = serde_json::from_str::<serde_json::Value>("{not json")
            .unwrap_err()
            .into();
        assert!(matches!(err, RpcError::Serialization(_)));
    }
}
