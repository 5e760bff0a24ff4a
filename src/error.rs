//! Error types for the playback core.

use crate::types::PlayerCapability;
use thiserror::Error;

/// Main error type for sources, players and the pipeline.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The source could not be reached or opened. Retryable.
    #[error("Source unavailable: {0}")]
    SourceUnavailable(String),

    /// A single record could not be decoded.
    #[error("Decode error at offset {offset}: {reason}")]
    Decode { offset: u64, reason: String },

    /// The active player does not support the requested action.
    #[error("Capability not supported: {0}")]
    CapabilityUnsupported(PlayerCapability),

    /// The operation was superseded by a newer one (pause, seek, close).
    #[error("Operation cancelled")]
    Cancelled,

    /// The operation requires an initialized source.
    #[error("Player not initialized")]
    NotInitialized,

    #[error("Player is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown source format: {0}")]
    UnknownFormat(String),

    #[error("Asset not found: {0}")]
    AssetNotFound(String),

    #[error("Unsupported asset scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Service call failed: {0}")]
    Service(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl PlayerError {
    /// Whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlayerError::SourceUnavailable(_) | PlayerError::Io(_))
    }
}

impl From<serde_json::Error> for PlayerError {
    fn from(e: serde_json::Error) -> Self {
        PlayerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for PlayerError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        PlayerError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for PlayerError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        PlayerError::Deserialization(e.to_string())
    }
}

/// Result type for playback operations.
pub type Result<T> = std::result::Result<T, PlayerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(PlayerError::SourceUnavailable("gone".into()).is_retryable());
        assert!(!PlayerError::Cancelled.is_retryable());
        assert!(!PlayerError::CapabilityUnsupported(PlayerCapability::Advertise).is_retryable());
    }

    #[test]
    fn test_capability_message() {
        let err = PlayerError::CapabilityUnsupported(PlayerCapability::CallServices);
        assert_eq!(err.to_string(), "Capability not supported: callServices");
    }
}
