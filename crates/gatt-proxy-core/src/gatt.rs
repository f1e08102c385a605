//! GATT vocabulary shared by both roles
//!
//! Identifiers, opaque adapter handles, characteristic capability flags and
//! ATT result codes. Nothing here depends on a particular radio stack.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a characteristic: its service id plus its own id.
///
/// Characteristic ids are only unique within a service, so relay
/// bookkeeping is always keyed by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CharacteristicId {
    /// Owning service id
    pub service: Uuid,
    /// Characteristic id
    pub characteristic: Uuid,
}

impl CharacteristicId {
    /// Create a characteristic identity
    pub fn new(service: Uuid, characteristic: Uuid) -> Self {
        Self {
            service,
            characteristic,
        }
    }
}

impl std::fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Opaque reference to an attribute on the remote device, issued by the
/// central adapter during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RemoteHandle(pub u64);

/// Opaque reference to a published mirror attribute, issued by the
/// peripheral adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MirrorHandle(pub u64);

/// Opaque reference to a remote device seen during a scan
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a client connected to the local server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub String);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Correlation id of a single inbound ATT request on the local server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "req#{}", self.0)
    }
}

bitflags! {
    /// Capability flags of a characteristic
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        /// Value can be read
        const READ = 0x02;
        /// Value can be written without response (ATT Write Command)
        const WRITE_WITHOUT_RESPONSE = 0x04;
        /// Value can be written with response (ATT Write Request)
        const WRITE = 0x08;
        /// Value changes can be notified
        const NOTIFY = 0x10;
        /// Value changes can be indicated
        const INDICATE = 0x20;
    }
}

impl CharacteristicProperties {
    /// Whether clients may subscribe to value changes
    pub fn supports_subscription(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Whether any form of write is allowed
    pub fn is_writable(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }

    /// ATT permissions for a mirror of a characteristic with these properties
    pub fn mirror_permissions(&self) -> AttributePermissions {
        if self.is_writable() {
            AttributePermissions::Writeable
        } else {
            AttributePermissions::Readable
        }
    }
}

/// ATT permissions granted on a published mirror characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributePermissions {
    /// Read only
    Readable,
    /// Writes accepted
    Writeable,
}

/// How a value is written to the remote device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// ATT Write Request, remote confirms
    WithResponse,
    /// ATT Write Command, no confirmation
    WithoutResponse,
}

/// Result code attached to read/write completions.
///
/// Anything other than [`AttResult::Success`] is forwarded as-is to the
/// original requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttResult {
    /// Operation succeeded
    Success,
    /// Attribute handle is invalid
    InvalidHandle,
    /// Attribute cannot be read
    ReadNotPermitted,
    /// Attribute cannot be written
    WriteNotPermitted,
    /// Request is not supported by the server
    RequestNotSupported,
    /// Attribute not found
    AttributeNotFound,
    /// Request could not be completed for an unlikely reason
    UnlikelyError,
    /// Server ran out of resources
    InsufficientResources,
    /// Any other adapter specific code
    Other(u8),
}

impl AttResult {
    /// Numeric ATT error code (0 for success)
    pub fn code(&self) -> u8 {
        match self {
            AttResult::Success => 0x00,
            AttResult::InvalidHandle => 0x01,
            AttResult::ReadNotPermitted => 0x02,
            AttResult::WriteNotPermitted => 0x03,
            AttResult::RequestNotSupported => 0x06,
            AttResult::AttributeNotFound => 0x0A,
            AttResult::UnlikelyError => 0x0E,
            AttResult::InsufficientResources => 0x11,
            AttResult::Other(code) => *code,
        }
    }

    /// Map a numeric ATT error code back to a result
    pub fn from_code(code: u8) -> Self {
        match code {
            0x00 => AttResult::Success,
            0x01 => AttResult::InvalidHandle,
            0x02 => AttResult::ReadNotPermitted,
            0x03 => AttResult::WriteNotPermitted,
            0x06 => AttResult::RequestNotSupported,
            0x0A => AttResult::AttributeNotFound,
            0x0E => AttResult::UnlikelyError,
            0x11 => AttResult::InsufficientResources,
            other => AttResult::Other(other),
        }
    }

    /// Check for success
    pub fn is_success(&self) -> bool {
        matches!(self, AttResult::Success)
    }
}

impl std::fmt::Display for AttResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttResult::Success => write!(f, "success"),
            AttResult::InvalidHandle => write!(f, "invalidHandle"),
            AttResult::ReadNotPermitted => write!(f, "readNotPermitted"),
            AttResult::WriteNotPermitted => write!(f, "writeNotPermitted"),
            AttResult::RequestNotSupported => write!(f, "requestNotSupported"),
            AttResult::AttributeNotFound => write!(f, "attributeNotFound"),
            AttResult::UnlikelyError => write!(f, "unlikelyError"),
            AttResult::InsufficientResources => write!(f, "insufficientResources"),
            AttResult::Other(code) => write!(f, "error(0x{:02X})", code),
        }
    }
}
