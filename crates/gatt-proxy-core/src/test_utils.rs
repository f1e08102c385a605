//! Test utilities for exercising the proxy without a radio
//!
//! [`MockCentral`] and [`MockPeripheral`] record every command the proxy
//! issues; tests play the adapter's part by pushing [`CentralEvent`]s and
//! [`PeripheralEvent`]s into the proxy's event channels. [`TestFixture`]
//! provides a one-service, one-characteristic configuration and the
//! matching adapter events.
//!
//! # Example
//!
//! ```rust,ignore
//! let central = MockCentral::new();
//! let (central_tx, central_rx) = mpsc::unbounded_channel();
//! // ... build the proxy with central.clone() and central_rx
//! central_tx.send(TestFixture::device_discovered())?;
//! assert!(wait_until(Duration::from_secs(1), || central.connected_to(&TestFixture::device())).await);
//! ```

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::adapter::{
    CentralAdapter, CentralEvent, DiscoveredCharacteristic, DiscoveredService, PeripheralAdapter,
    PeripheralEvent, PublishedService, ServiceSpec, WriteRequest,
};
use crate::config::{ProxyConfig, ProxyConfigBuilder};
use crate::error::{ProxyError, Result};
use crate::gatt::{
    AttResult, CharacteristicId, CharacteristicProperties, ClientId, DeviceId, MirrorHandle,
    RemoteHandle, RequestId, WriteMode,
};
use crate::topology::Topology;

/// A command recorded by [`MockCentral`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CentralCall {
    /// `start_scan(target)`
    StartScan(String),
    /// `stop_scan()`
    StopScan,
    /// `connect(device)`
    Connect(DeviceId),
    /// `disconnect(device)`
    Disconnect(DeviceId),
    /// `discover_services(device)`
    DiscoverServices(DeviceId),
    /// `discover_characteristics(device, service)`
    DiscoverCharacteristics(DeviceId, RemoteHandle),
    /// `read_value(characteristic)`
    Read(RemoteHandle),
    /// `write_value(characteristic, value, mode)`
    Write(RemoteHandle, Bytes, WriteMode),
    /// `set_notify(characteristic, enabled)`
    SetNotify(RemoteHandle, bool),
}

/// Central adapter that records calls instead of touching a radio
#[derive(Debug, Clone, Default)]
pub struct MockCentral {
    calls: Arc<Mutex<Vec<CentralCall>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockCentral {
    /// Create a new mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<CentralCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching a predicate
    pub fn count(&self, pred: impl Fn(&CentralCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Make every fallible command return an adapter error
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Whether a connect to the device was issued
    pub fn connected_to(&self, device: &DeviceId) -> bool {
        self.calls().contains(&CentralCall::Connect(device.clone()))
    }

    /// Values written so far, in order
    pub fn writes(&self) -> Vec<(RemoteHandle, Bytes, WriteMode)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                CentralCall::Write(handle, value, mode) => Some((*handle, value.clone(), *mode)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: CentralCall) -> Result<()> {
        self.calls.lock().push(call);
        if *self.failing.lock() {
            return Err(ProxyError::Adapter("simulated failure".to_string()));
        }
        Ok(())
    }
}

impl CentralAdapter for MockCentral {
    fn start_scan(&self, target_name: &str) -> Result<()> {
        self.record(CentralCall::StartScan(target_name.to_string()))
    }

    fn stop_scan(&self) {
        self.calls.lock().push(CentralCall::StopScan);
    }

    fn connect(&self, device: &DeviceId) -> Result<()> {
        self.record(CentralCall::Connect(device.clone()))
    }

    fn disconnect(&self, device: &DeviceId) {
        self.calls.lock().push(CentralCall::Disconnect(device.clone()));
    }

    fn discover_services(&self, device: &DeviceId) -> Result<()> {
        self.record(CentralCall::DiscoverServices(device.clone()))
    }

    fn discover_characteristics(&self, device: &DeviceId, service: RemoteHandle) -> Result<()> {
        self.record(CentralCall::DiscoverCharacteristics(device.clone(), service))
    }

    fn read_value(&self, characteristic: RemoteHandle) -> Result<()> {
        self.record(CentralCall::Read(characteristic))
    }

    fn write_value(&self, characteristic: RemoteHandle, value: Bytes, mode: WriteMode) -> Result<()> {
        self.record(CentralCall::Write(characteristic, value, mode))
    }

    fn set_notify(&self, characteristic: RemoteHandle, enabled: bool) -> Result<()> {
        self.record(CentralCall::SetNotify(characteristic, enabled))
    }
}

/// A command recorded by [`MockPeripheral`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeripheralCall {
    /// `publish(service)`
    Publish(ServiceSpec),
    /// `unpublish_all()`
    UnpublishAll,
    /// `start_advertising(name, services)`
    StartAdvertising {
        /// Advertised local name
        name: String,
        /// Advertised service ids
        services: Vec<Uuid>,
    },
    /// `stop_advertising()`
    StopAdvertising,
    /// `respond(request, result, value)`
    Respond {
        /// Request answered
        request: RequestId,
        /// Result sent
        result: AttResult,
        /// Value sent with a read response
        value: Option<Bytes>,
    },
    /// `notify(characteristic, value, clients)`
    Notify {
        /// Mirror characteristic
        characteristic: MirrorHandle,
        /// Pushed value
        value: Bytes,
        /// Receiving clients
        clients: Vec<ClientId>,
    },
}

/// Peripheral adapter that records calls instead of touching a radio
#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    calls: Arc<Mutex<Vec<PeripheralCall>>>,
    failing: Arc<Mutex<bool>>,
}

impl MockPeripheral {
    /// Create a new mock
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call so far, in order
    pub fn calls(&self) -> Vec<PeripheralCall> {
        self.calls.lock().clone()
    }

    /// Number of calls matching a predicate
    pub fn count(&self, pred: impl Fn(&PeripheralCall) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Forget recorded calls
    pub fn clear(&self) {
        self.calls.lock().clear();
    }

    /// Make every fallible command return an adapter error
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    /// Services published so far
    pub fn published(&self) -> Vec<ServiceSpec> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Publish(spec) => Some(spec.clone()),
                _ => None,
            })
            .collect()
    }

    /// Responses sent so far, in order
    pub fn responses(&self) -> Vec<(RequestId, AttResult, Option<Bytes>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Respond {
                    request,
                    result,
                    value,
                } => Some((*request, *result, value.clone())),
                _ => None,
            })
            .collect()
    }

    /// Notifications pushed so far, in order
    pub fn notifications(&self) -> Vec<(MirrorHandle, Bytes, Vec<ClientId>)> {
        self.calls
            .lock()
            .iter()
            .filter_map(|c| match c {
                PeripheralCall::Notify {
                    characteristic,
                    value,
                    clients,
                } => Some((*characteristic, value.clone(), clients.clone())),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: PeripheralCall) -> Result<()> {
        self.calls.lock().push(call);
        if *self.failing.lock() {
            return Err(ProxyError::Adapter("simulated failure".to_string()));
        }
        Ok(())
    }
}

impl PeripheralAdapter for MockPeripheral {
    fn publish(&self, service: &ServiceSpec) -> Result<()> {
        self.record(PeripheralCall::Publish(service.clone()))
    }

    fn unpublish_all(&self) {
        self.calls.lock().push(PeripheralCall::UnpublishAll);
    }

    fn start_advertising(&self, local_name: &str, services: &[Uuid]) -> Result<()> {
        self.record(PeripheralCall::StartAdvertising {
            name: local_name.to_string(),
            services: services.to_vec(),
        })
    }

    fn stop_advertising(&self) {
        self.calls.lock().push(PeripheralCall::StopAdvertising);
    }

    fn respond(&self, request: RequestId, result: AttResult, value: Option<Bytes>) {
        self.calls.lock().push(PeripheralCall::Respond {
            request,
            result,
            value,
        });
    }

    fn notify(&self, characteristic: MirrorHandle, value: Bytes, clients: &[ClientId]) -> Result<()> {
        self.record(PeripheralCall::Notify {
            characteristic,
            value,
            clients: clients.to_vec(),
        })
    }
}

/// Canned configuration and adapter events for a one-service proxy
pub struct TestFixture;

impl TestFixture {
    /// Advertised name of the simulated remote device
    pub const TARGET_NAME: &'static str = "Test Sensor";
    /// Service `S1`
    pub const S1: Uuid = Uuid::from_u128(0x0000_5100_0000_1000_8000_0080_5f9b_34fb);
    /// Characteristic `C1` of `S1`
    pub const C1: Uuid = Uuid::from_u128(0x0000_c100_0000_1000_8000_0080_5f9b_34fb);
    /// Service `S2`, used by two-service scenarios
    pub const S2: Uuid = Uuid::from_u128(0x0000_5200_0000_1000_8000_0080_5f9b_34fb);
    /// Characteristic `C2` of `S2`
    pub const C2: Uuid = Uuid::from_u128(0x0000_c200_0000_1000_8000_0080_5f9b_34fb);
    /// Remote handle of `S1`
    pub const S1_HANDLE: RemoteHandle = RemoteHandle(1);
    /// Remote handle of `C1`
    pub const C1_HANDLE: RemoteHandle = RemoteHandle(2);
    /// Remote handle of `S2`
    pub const S2_HANDLE: RemoteHandle = RemoteHandle(3);
    /// Remote handle of `C2`
    pub const C2_HANDLE: RemoteHandle = RemoteHandle(4);
    /// Mirror handle of `S1`
    pub const S1_MIRROR: MirrorHandle = MirrorHandle(10);
    /// Mirror handle of `C1`
    pub const C1_MIRROR: MirrorHandle = MirrorHandle(11);

    /// `S1` with `C1`, targeting [`TestFixture::TARGET_NAME`]
    pub fn config() -> ProxyConfig {
        ProxyConfigBuilder::new()
            .target_name(Self::TARGET_NAME)
            .service(Self::S1, [Self::C1])
            .build()
    }

    /// `S1`/`C1` plus `S2`/`C2`
    pub fn two_service_config() -> ProxyConfig {
        ProxyConfigBuilder::new()
            .target_name(Self::TARGET_NAME)
            .service(Self::S1, [Self::C1])
            .service(Self::S2, [Self::C2])
            .build()
    }

    /// Full identity of `C1`
    pub fn c1() -> CharacteristicId {
        CharacteristicId::new(Self::S1, Self::C1)
    }

    /// Read, write and notify
    pub fn c1_properties() -> CharacteristicProperties {
        CharacteristicProperties::READ | CharacteristicProperties::WRITE | CharacteristicProperties::NOTIFY
    }

    /// The simulated remote device
    pub fn device() -> DeviceId {
        DeviceId("AA:BB:CC:DD:EE:FF".to_string())
    }

    /// The target seen while scanning, matched by its local name only
    pub fn device_discovered() -> CentralEvent {
        CentralEvent::DeviceDiscovered {
            device: Self::device(),
            name: None,
            local_name: Some(Self::TARGET_NAME.to_uppercase()),
        }
    }

    /// Connection established
    pub fn connected() -> CentralEvent {
        CentralEvent::Connected {
            device: Self::device(),
        }
    }

    /// `S1` discovered
    pub fn services_discovered() -> CentralEvent {
        CentralEvent::ServicesDiscovered {
            device: Self::device(),
            result: Ok(vec![DiscoveredService {
                uuid: Self::S1,
                handle: Self::S1_HANDLE,
            }]),
        }
    }

    /// `C1` discovered with the given properties
    pub fn characteristics_discovered(properties: CharacteristicProperties) -> CentralEvent {
        CentralEvent::CharacteristicsDiscovered {
            device: Self::device(),
            service: Self::S1_HANDLE,
            result: Ok(vec![DiscoveredCharacteristic {
                uuid: Self::C1,
                handle: Self::C1_HANDLE,
                properties,
            }]),
        }
    }

    /// A value from `C1`
    pub fn value_updated(value: &[u8]) -> CentralEvent {
        CentralEvent::ValueUpdated {
            characteristic: Self::C1_HANDLE,
            result: Ok(Bytes::copy_from_slice(value)),
        }
    }

    /// Topology as the link hands it over once `C1` is discovered
    pub fn ready_topology(properties: CharacteristicProperties) -> Topology {
        let config = Self::config();
        let mut topology = Topology::build(&config.services);
        // Ids come from the same config, so binding cannot fail
        let _ = topology.bind_remote_service(Self::S1, Self::S1_HANDLE);
        let _ = topology.bind_remote(&Self::c1(), Self::C1_HANDLE, properties);
        topology
    }

    /// `S1` published with `C1` at [`TestFixture::C1_MIRROR`]
    pub fn service_published() -> PeripheralEvent {
        PeripheralEvent::ServicePublished {
            service: Self::S1,
            result: Ok(PublishedService {
                handle: Self::S1_MIRROR,
                characteristics: vec![(Self::C1, Self::C1_MIRROR)],
            }),
        }
    }

    /// A local client reads `C1`
    pub fn read_requested(request: u64, client: &str) -> PeripheralEvent {
        PeripheralEvent::ReadRequested {
            request: RequestId(request),
            client: ClientId(client.to_string()),
            characteristic: Self::C1_MIRROR,
        }
    }

    /// A local client writes `C1`
    pub fn write_requested(request: u64, value: &[u8], response_required: bool) -> PeripheralEvent {
        PeripheralEvent::WriteRequested {
            requests: vec![WriteRequest {
                request: RequestId(request),
                client: ClientId("writer".to_string()),
                characteristic: Self::C1_MIRROR,
                value: Bytes::copy_from_slice(value),
                response_required,
            }],
        }
    }

    /// A local client subscribes to `C1`
    pub fn subscribed(client: &str) -> PeripheralEvent {
        PeripheralEvent::Subscribed {
            characteristic: Self::C1_MIRROR,
            client: ClientId(client.to_string()),
        }
    }

    /// A local client unsubscribes from `C1`
    pub fn unsubscribed(client: &str) -> PeripheralEvent {
        PeripheralEvent::Unsubscribed {
            characteristic: Self::C1_MIRROR,
            client: ClientId(client.to_string()),
        }
    }
}

/// Poll a condition until it holds or the timeout elapses
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
