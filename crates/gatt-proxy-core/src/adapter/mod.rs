//! Radio adapter capability boundary
//!
//! The proxy core never talks to a Bluetooth stack directly. It issues
//! commands through two traits and receives completions as events:
//!
//! - [`CentralAdapter`] / [`CentralEvent`] - the client role facing the
//!   remote device (scan, connect, discover, read, write, subscribe)
//! - [`PeripheralAdapter`] / [`PeripheralEvent`] - the server role facing
//!   local clients (publish, advertise, respond, notify)
//!
//! Command methods only dispatch: they must not block and report
//! completion later through the adapter's event sender. An `Err` return
//! means the command could not even be issued.
//!
//! # Feature Requirements
//!
//! - `btleplug`: [`BtleplugCentral`] on top of btleplug. Requires
//!   `libdbus-1-dev` on Linux.
//! - `bluez`: [`BluezPeripheral`] on top of BlueZ via bluer (Linux only).

#[cfg(feature = "btleplug")]
mod central;
#[cfg(feature = "btleplug")]
pub use central::BtleplugCentral;

#[cfg(feature = "bluez")]
mod peripheral;
#[cfg(feature = "bluez")]
pub use peripheral::BluezPeripheral;

#[cfg(any(feature = "bluez", test))]
mod registration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::gatt::{
    AttResult, AttributePermissions, CharacteristicProperties, ClientId, DeviceId, MirrorHandle,
    RemoteHandle, RequestId, WriteMode,
};

/// Sender half adapters use to deliver central-role events
pub type CentralEventSender = mpsc::UnboundedSender<CentralEvent>;

/// Receiver half consumed by the remote link
pub type CentralEventReceiver = mpsc::UnboundedReceiver<CentralEvent>;

/// Sender half adapters use to deliver peripheral-role events
pub type PeripheralEventSender = mpsc::UnboundedSender<PeripheralEvent>;

/// Receiver half consumed by the local server
pub type PeripheralEventReceiver = mpsc::UnboundedReceiver<PeripheralEvent>;

/// Client-role radio operations
pub trait CentralAdapter: Send + 'static {
    /// Start scanning for advertising devices
    fn start_scan(&self, target_name: &str) -> Result<()>;

    /// Stop an active scan
    fn stop_scan(&self);

    /// Connect to a discovered device
    fn connect(&self, device: &DeviceId) -> Result<()>;

    /// Cancel a pending connection or tear down an established one
    fn disconnect(&self, device: &DeviceId);

    /// Discover the primary services of a connected device
    fn discover_services(&self, device: &DeviceId) -> Result<()>;

    /// Discover the characteristics of one discovered service
    fn discover_characteristics(&self, device: &DeviceId, service: RemoteHandle) -> Result<()>;

    /// Read a characteristic value; completes with [`CentralEvent::ValueUpdated`]
    fn read_value(&self, characteristic: RemoteHandle) -> Result<()>;

    /// Write a characteristic value; with response completes with
    /// [`CentralEvent::WriteCompleted`]
    fn write_value(&self, characteristic: RemoteHandle, value: Bytes, mode: WriteMode)
        -> Result<()>;

    /// Enable or disable notifications; completes with
    /// [`CentralEvent::NotifyStateChanged`]
    fn set_notify(&self, characteristic: RemoteHandle, enabled: bool) -> Result<()>;
}

/// A service reported by remote service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredService {
    /// Service id
    pub uuid: Uuid,
    /// Adapter reference for the service
    pub handle: RemoteHandle,
}

/// A characteristic reported by remote characteristic discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    /// Characteristic id
    pub uuid: Uuid,
    /// Adapter reference for the characteristic
    pub handle: RemoteHandle,
    /// Capabilities advertised by the remote device
    pub properties: CharacteristicProperties,
}

/// Events delivered by a [`CentralAdapter`]
#[derive(Debug, Clone)]
pub enum CentralEvent {
    /// Radio power state changed
    PowerChanged {
        /// Whether the radio is powered on
        powered: bool,
    },
    /// Scanning could not start or was aborted by the stack
    ScanFailed {
        /// Failure reason
        reason: String,
    },
    /// A device was seen while scanning
    DeviceDiscovered {
        /// Device reference
        device: DeviceId,
        /// Name the platform exposes for the device
        name: Option<String>,
        /// Local name field of the advertisement
        local_name: Option<String>,
    },
    /// Connection established
    Connected {
        /// Device reference
        device: DeviceId,
    },
    /// Connection attempt failed
    ConnectFailed {
        /// Device reference
        device: DeviceId,
        /// Failure reason
        reason: String,
    },
    /// Connection lost or closed
    Disconnected {
        /// Device reference
        device: DeviceId,
        /// Reason given by the stack
        reason: String,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Device reference
        device: DeviceId,
        /// Discovered services or an error
        result: std::result::Result<Vec<DiscoveredService>, String>,
    },
    /// Characteristic discovery for one service finished
    CharacteristicsDiscovered {
        /// Device reference
        device: DeviceId,
        /// Service the characteristics belong to
        service: RemoteHandle,
        /// Discovered characteristics or an error
        result: std::result::Result<Vec<DiscoveredCharacteristic>, String>,
    },
    /// A write with response completed
    WriteCompleted {
        /// Characteristic written
        characteristic: RemoteHandle,
        /// ATT result of the write
        result: AttResult,
    },
    /// A read completed or a notification/indication arrived
    ValueUpdated {
        /// Characteristic whose value changed
        characteristic: RemoteHandle,
        /// New value or an error
        result: std::result::Result<Bytes, String>,
    },
    /// Notification state changed for a characteristic
    NotifyStateChanged {
        /// Characteristic addressed
        characteristic: RemoteHandle,
        /// New notification state or an error
        result: std::result::Result<bool, String>,
    },
}

/// Server-role radio operations
pub trait PeripheralAdapter: Send + 'static {
    /// Publish a mirror service; completes with [`PeripheralEvent::ServicePublished`]
    fn publish(&self, service: &ServiceSpec) -> Result<()>;

    /// Remove every published service
    fn unpublish_all(&self);

    /// Start advertising; completes with [`PeripheralEvent::AdvertisingStarted`]
    fn start_advertising(&self, local_name: &str, services: &[Uuid]) -> Result<()>;

    /// Stop advertising
    fn stop_advertising(&self);

    /// Answer an inbound read or write request
    fn respond(&self, request: RequestId, result: AttResult, value: Option<Bytes>);

    /// Push a value to subscribed clients
    fn notify(&self, characteristic: MirrorHandle, value: Bytes, clients: &[ClientId])
        -> Result<()>;
}

/// Description of a mirror characteristic to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicSpec {
    /// Characteristic id
    pub uuid: Uuid,
    /// Capabilities copied from the remote characteristic
    pub properties: CharacteristicProperties,
    /// ATT permissions derived from the properties
    pub permissions: AttributePermissions,
}

/// Description of a mirror service to publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    /// Service id
    pub uuid: Uuid,
    /// Characteristics in order
    pub characteristics: Vec<CharacteristicSpec>,
}

/// Handles assigned by the adapter to a published service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedService {
    /// Handle of the service
    pub handle: MirrorHandle,
    /// Handles of its characteristics, keyed by characteristic id
    pub characteristics: Vec<(Uuid, MirrorHandle)>,
}

/// One inbound write from a local client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    /// Correlation id for the response
    pub request: RequestId,
    /// Writing client
    pub client: ClientId,
    /// Target mirror characteristic
    pub characteristic: MirrorHandle,
    /// Written bytes
    pub value: Bytes,
    /// Whether the client expects a response (Write Request vs Write Command)
    pub response_required: bool,
}

/// Events delivered by a [`PeripheralAdapter`]
#[derive(Debug, Clone)]
pub enum PeripheralEvent {
    /// Radio power state changed
    PowerChanged {
        /// Whether the radio is powered on
        powered: bool,
    },
    /// A service finished publishing
    ServicePublished {
        /// Service id
        service: Uuid,
        /// Assigned handles or an error
        result: std::result::Result<PublishedService, String>,
    },
    /// Advertising started (or failed to)
    AdvertisingStarted {
        /// Ok or the failure reason
        result: std::result::Result<(), String>,
    },
    /// The stack stopped advertising on its own
    AdvertisingStopped {
        /// Reason given by the stack
        reason: String,
    },
    /// A local client read a mirror characteristic
    ReadRequested {
        /// Correlation id for the response
        request: RequestId,
        /// Reading client
        client: ClientId,
        /// Target mirror characteristic
        characteristic: MirrorHandle,
    },
    /// One or more writes arrived, in order
    WriteRequested {
        /// The writes, in arrival order
        requests: Vec<WriteRequest>,
    },
    /// A local client subscribed to a mirror characteristic
    Subscribed {
        /// Target mirror characteristic
        characteristic: MirrorHandle,
        /// Subscribing client
        client: ClientId,
    },
    /// A local client unsubscribed from a mirror characteristic
    Unsubscribed {
        /// Target mirror characteristic
        characteristic: MirrorHandle,
        /// Unsubscribing client
        client: ClientId,
    },
}
