// packages/engine/src/utils/errors.rs
//! Engine error types
//!
//! Hooks never surface errors to the triggering operation; these types cover
//! the fallible plumbing around them (configuration, table writes, packet
//! mutation, scenario replay).

use crate::packet::buffer::PacketError;
use crate::state::store::StoreError;
use thiserror::Error;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EngineError>;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Keyed table operation failed
    #[error("Table operation failed: {0}")]
    Store(#[from] StoreError),

    /// Packet buffer access outside the captured bytes
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    /// Scenario replay could not be completed
    #[error("Replay failed: {0}")]
    ReplayFailed(String),

    /// Observability backend could not be installed
    #[error("Observability setup failed: {0}")]
    ObservabilityFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<config::ConfigError> for EngineError {
    fn from(err: config::ConfigError) -> Self {
        EngineError::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for EngineError {
    fn from(err: serde_yaml::Error) -> Self {
        EngineError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_conversion() {
        let err: EngineError = StoreError::KeyExists.into();
        assert!(matches!(err, EngineError::Store(StoreError::KeyExists)));
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn test_config_error_display() {
        let err = EngineError::ConfigError("proxy_port must be non-zero".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: proxy_port must be non-zero"
        );
    }
}
