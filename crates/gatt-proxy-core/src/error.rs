//! Error types for GATT proxy operations
//!
//! This module provides the error taxonomy shared by the remote link,
//! the local server, the relay and the hardware adapters.

use thiserror::Error;
use uuid::Uuid;

use crate::gatt::{AttResult, CharacteristicId};

/// Main error type for GATT proxy operations
#[derive(Error, Debug)]
pub enum ProxyError {
    // ===== Link Errors =====
    /// Operation requires a ready remote link
    #[error("Remote link is not connected")]
    NotConnected,

    /// Identifier was not part of the configured topology
    #[error("Unknown identifier: {0}")]
    UnknownIdentifier(String),

    /// Characteristic has no bound remote handle
    #[error("Unknown characteristic: {0}")]
    UnknownCharacteristic(CharacteristicId),

    /// Characteristic lacks the capability the operation needs
    #[error("Characteristic {characteristic} does not support {capability}")]
    CapabilityUnsupported {
        /// The characteristic addressed
        characteristic: CharacteristicId,
        /// Missing capability (e.g. "notify/indicate")
        capability: &'static str,
    },

    /// Service or characteristic discovery failed
    #[error("Discovery failed: {0}")]
    DiscoveryFailed(String),

    /// The underlying radio adapter reported an error
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// A connection phase did not complete in time
    #[error("{phase} timed out after {duration_ms}ms")]
    Timeout {
        /// Phase that timed out ("scan", "discovery", ...)
        phase: &'static str,
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    // ===== Server Errors =====
    /// Operation is not valid in the current state
    #[error("Invalid state for {operation}: {state}")]
    InvalidState {
        /// Operation attempted
        operation: &'static str,
        /// State the machine was in
        state: String,
    },

    /// Publishing a mirror service failed
    #[error("Failed to publish service {service}: {reason}")]
    PublishFailed {
        /// Service being published
        service: Uuid,
        /// Failure reason
        reason: String,
    },

    // ===== Configuration Errors =====
    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON (de)serialisation failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== General Errors =====
    /// Channel closed
    #[error("Channel closed")]
    ChannelClosed,

    /// IO error wrapper
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Check if this error signals link-level trouble that should end the connection
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            ProxyError::DiscoveryFailed(_) | ProxyError::Adapter(_) | ProxyError::Timeout { .. }
        )
    }

    /// ATT result reported to a local client whose request failed with this error
    pub fn att_result(&self) -> AttResult {
        match self {
            ProxyError::UnknownCharacteristic(_) | ProxyError::UnknownIdentifier(_) => {
                AttResult::AttributeNotFound
            }
            ProxyError::CapabilityUnsupported { .. } => AttResult::RequestNotSupported,
            _ => AttResult::UnlikelyError,
        }
    }

    /// Get an error code for logging
    pub fn error_code(&self) -> &'static str {
        match self {
            ProxyError::NotConnected => "NOT_CONNECTED",
            ProxyError::UnknownIdentifier(_) => "UNKNOWN_IDENTIFIER",
            ProxyError::UnknownCharacteristic(_) => "UNKNOWN_CHARACTERISTIC",
            ProxyError::CapabilityUnsupported { .. } => "CAPABILITY_UNSUPPORTED",
            ProxyError::DiscoveryFailed(_) => "DISCOVERY_FAILED",
            ProxyError::Adapter(_) => "ADAPTER_ERROR",
            ProxyError::Timeout { .. } => "TIMEOUT",
            ProxyError::InvalidState { .. } => "INVALID_STATE",
            ProxyError::PublishFailed { .. } => "PUBLISH_FAILED",
            ProxyError::InvalidConfig(_) => "INVALID_CONFIG",
            ProxyError::Json(_) => "JSON_ERROR",
            ProxyError::ChannelClosed => "CHANNEL_CLOSED",
            ProxyError::Io(_) => "IO_ERROR",
        }
    }
}

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

// The runtime is gone once either end of a channel closes
impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ProxyError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ProxyError::ChannelClosed
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for ProxyError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        ProxyError::ChannelClosed
    }
}

#[cfg(feature = "btleplug")]
impl From<btleplug::Error> for ProxyError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => ProxyError::NotConnected,
            btleplug::Error::TimedOut(duration) => ProxyError::Timeout {
                phase: "adapter operation",
                duration_ms: duration.as_millis() as u64,
            },
            other => ProxyError::Adapter(other.to_string()),
        }
    }
}

#[cfg(feature = "bluez")]
impl From<bluer::Error> for ProxyError {
    fn from(err: bluer::Error) -> Self {
        ProxyError::Adapter(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ProxyError::NotConnected.error_code(), "NOT_CONNECTED");
        assert_eq!(
            ProxyError::DiscoveryFailed("no services".to_string()).error_code(),
            "DISCOVERY_FAILED"
        );
    }

    #[test]
    fn test_connection_fatal() {
        assert!(ProxyError::DiscoveryFailed("x".to_string()).is_connection_fatal());
        assert!(ProxyError::Timeout {
            phase: "discovery",
            duration_ms: 5000
        }
        .is_connection_fatal());
        assert!(ProxyError::Adapter("gone".to_string()).is_connection_fatal());
        assert!(!ProxyError::NotConnected.is_connection_fatal());
        assert!(!ProxyError::InvalidConfig("x".to_string()).is_connection_fatal());
    }

    #[test]
    fn test_capability_message() {
        let id = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));
        let err = ProxyError::CapabilityUnsupported {
            characteristic: id,
            capability: "notify/indicate",
        };
        assert!(err.to_string().contains("notify/indicate"));
        assert!(err.to_string().contains(&Uuid::from_u128(2).to_string()));
    }

    #[test]
    fn test_att_result_mapping() {
        assert_eq!(ProxyError::NotConnected.att_result(), AttResult::UnlikelyError);
        let id = CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2));
        assert_eq!(
            ProxyError::UnknownCharacteristic(id).att_result(),
            AttResult::AttributeNotFound
        );
    }

    #[tokio::test]
    async fn test_channel_errors_map_to_closed() {
        let (tx, rx) = tokio::sync::mpsc::channel::<u8>(1);
        drop(rx);
        let err: ProxyError = tx.send(1).await.unwrap_err().into();
        assert!(matches!(err, ProxyError::ChannelClosed));

        let (tx, rx) = tokio::sync::oneshot::channel::<u8>();
        drop(tx);
        let err: ProxyError = rx.await.unwrap_err().into();
        assert_eq!(err.error_code(), "CHANNEL_CLOSED");
    }
}
