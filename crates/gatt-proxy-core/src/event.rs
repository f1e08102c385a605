//! User-visible proxy events
//!
//! Every state transition and relay step is published as a [`ProxyEvent`]
//! on a broadcast channel, so any number of observers (a CLI log, a UI,
//! a test) can follow the proxy without touching its state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gatt::CharacteristicId;

/// A timestamped proxy event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyEvent {
    /// When the event happened
    pub timestamp: DateTime<Utc>,
    /// What happened
    pub kind: ProxyEventKind,
}

impl ProxyEvent {
    /// Stamp an event with the current time
    pub fn now(kind: ProxyEventKind) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
        }
    }

    /// Human-readable one-line description
    pub fn describe(&self) -> String {
        self.kind.describe()
    }
}

/// Kinds of proxy events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEventKind {
    /// Remote topology discovered, mirror about to be published
    LinkReady {
        /// Discovered service ids
        services: Vec<Uuid>,
    },
    /// Remote connection attempt ended
    LinkDisconnected {
        /// Reason
        reason: String,
    },
    /// Mirror published and advertised
    AdvertisingStarted {
        /// Advertised service ids
        services: Vec<Uuid>,
    },
    /// Local server stopped
    ServerStopped {
        /// Reason
        reason: String,
    },
    /// Local client read forwarded to the remote device
    ReadForwarded {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Local client write forwarded to the remote device
    WriteForwarded {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Bytes written
        len: usize,
    },
    /// Remote write completed
    WriteConfirmed {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// ATT result name
        result: String,
    },
    /// Value relayed from the remote device to the mirror
    DataRelayed {
        /// Source characteristic
        characteristic: CharacteristicId,
        /// Bytes relayed
        len: usize,
    },
    /// First local subscriber, remote notifications requested
    NotificationsRequested {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Last local subscriber gone, remote notifications released
    NotificationsReleased {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Remote notification state changed
    NotifyStateChanged {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// New state
        enabled: bool,
    },
    /// A remote operation failed
    OperationFailed {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Operation name
        operation: String,
        /// Error description
        error: String,
    },
}

impl ProxyEventKind {
    /// Human-readable one-line description
    pub fn describe(&self) -> String {
        match self {
            ProxyEventKind::LinkReady { services } => {
                format!("Connected, discovered {} services", services.len())
            }
            ProxyEventKind::LinkDisconnected { reason } => format!("Disconnected: {}", reason),
            ProxyEventKind::AdvertisingStarted { services } => {
                format!("Advertising started with {} services", services.len())
            }
            ProxyEventKind::ServerStopped { reason } => {
                format!("Advertising stopped: {}", reason)
            }
            ProxyEventKind::ReadForwarded { characteristic } => {
                format!("Read request on {}", characteristic)
            }
            ProxyEventKind::WriteForwarded {
                characteristic,
                len,
            } => format!("Write request of {} bytes on {}", len, characteristic),
            ProxyEventKind::WriteConfirmed {
                characteristic,
                result,
            } => format!("Write on {} completed: {}", characteristic, result),
            ProxyEventKind::DataRelayed {
                characteristic,
                len,
            } => format!("Received {} bytes on {}", len, characteristic),
            ProxyEventKind::NotificationsRequested { characteristic } => {
                format!("Subscribed to {}", characteristic)
            }
            ProxyEventKind::NotificationsReleased { characteristic } => {
                format!("Unsubscribed from {}", characteristic)
            }
            ProxyEventKind::NotifyStateChanged {
                characteristic,
                enabled,
            } => format!(
                "Notifications {} on {}",
                if *enabled { "enabled" } else { "disabled" },
                characteristic
            ),
            ProxyEventKind::OperationFailed {
                characteristic,
                operation,
                error,
            } => format!("{} on {} failed: {}", operation, characteristic, error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        let event = ProxyEvent::now(ProxyEventKind::LinkDisconnected {
            reason: "Bluetooth is turned off.".to_string(),
        });
        assert_eq!(event.describe(), "Disconnected: Bluetooth is turned off.");
    }

    #[test]
    fn test_serialized_tag() {
        let event = ProxyEvent::now(ProxyEventKind::WriteForwarded {
            characteristic: CharacteristicId::new(Uuid::from_u128(1), Uuid::from_u128(2)),
            len: 2,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"write_forwarded\""));
        let decoded: ProxyEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, event);
    }
}
