//! Remote link - client-role state machine
//!
//! Owns the connection to the real peripheral and walks it through
//! `Idle → Scanning → Connecting → DiscoveringServices →
//! DiscoveringCharacteristics → Ready`, ending in `Disconnected(reason)`.
//! A fresh [`RemoteLink::connect`] re-enters `Scanning`.
//!
//! All adapter completions are fed through [`RemoteLink::handle_adapter_event`]
//! and validated against the current state first, so a late callback from a
//! torn-down connection never reaches the relay.
//!
//! # Example
//!
//! ```rust,ignore
//! let (events_tx, events_rx) = mpsc::unbounded_channel();
//! let link = RemoteLink::new(central, &config, events_tx);
//! tokio::spawn(link.run(command_rx, central_events));
//! command_tx.send(LinkCommand::Connect)?;
//! ```

use bytes::Bytes;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::adapter::{
    CentralAdapter, CentralEvent, CentralEventReceiver, DiscoveredCharacteristic, DiscoveredService,
};
use crate::config::{ProxyConfig, ServiceConfig};
use crate::deadline::{sleep_until, Deadline};
use crate::error::{ProxyError, Result};
use crate::gatt::{
    AttResult, CharacteristicId, CharacteristicProperties, DeviceId, RemoteHandle, WriteMode,
};
use crate::topology::Topology;

/// Disconnect reason used when a radio reports it is powered off
pub const POWERED_OFF_REASON: &str = "Bluetooth is turned off.";

/// Connection state of the remote link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// Never connected
    Idle,
    /// Looking for the target device
    Scanning,
    /// Connection requested
    Connecting,
    /// Waiting for service discovery
    DiscoveringServices,
    /// Waiting for characteristic discovery
    DiscoveringCharacteristics,
    /// Topology complete, operations allowed
    Ready,
    /// Connection attempt over
    Disconnected(String),
}

impl LinkState {
    /// Whether a connection attempt is in progress or established
    pub fn is_active(&self) -> bool {
        !matches!(self, LinkState::Idle | LinkState::Disconnected(_))
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Scanning => write!(f, "scanning"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::DiscoveringServices => write!(f, "discovering services"),
            LinkState::DiscoveringCharacteristics => write!(f, "discovering characteristics"),
            LinkState::Ready => write!(f, "ready"),
            LinkState::Disconnected(reason) => write!(f, "disconnected ({})", reason),
        }
    }
}

/// Remote operation kinds, used to tag failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Value read
    Read,
    /// Value write
    Write,
    /// Enable notifications
    Subscribe,
    /// Disable notifications
    Unsubscribe,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Read => write!(f, "read"),
            Operation::Write => write!(f, "write"),
            Operation::Subscribe => write!(f, "subscribe"),
            Operation::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Commands accepted by the remote link actor
#[derive(Debug)]
pub enum LinkCommand {
    /// Start a connection attempt
    Connect,
    /// Tear down the current attempt
    Disconnect {
        /// Reason reported with the `Disconnected` transition
        reason: String,
    },
    /// Read a characteristic
    Read {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Write a characteristic
    Write {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Bytes to write
        value: Bytes,
        /// Whether a completion is expected
        with_response: bool,
    },
    /// Enable notifications on a characteristic
    RegisterNotify {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Disable notifications on a characteristic
    UnregisterNotify {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
}

/// Events emitted by the remote link
#[derive(Debug)]
pub enum LinkEvent {
    /// Remote topology fully discovered
    Ready {
        /// Read-only snapshot with every remote handle bound
        topology: Topology,
    },
    /// Connection attempt over
    Disconnected {
        /// Human-readable reason
        reason: String,
    },
    /// A value arrived from the remote device (read or notification)
    DataReceived {
        /// Source characteristic
        characteristic: CharacteristicId,
        /// Raw bytes
        value: Bytes,
    },
    /// A remote write completed
    WriteCompleted {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Result reported by the remote device
        result: AttResult,
    },
    /// Notification state changed on the remote device
    NotifyChanged {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// New state
        enabled: bool,
    },
    /// A single operation could not be issued
    OperationFailed {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Operation attempted
        operation: Operation,
        /// Why it failed
        error: ProxyError,
    },
}

/// Client-role state machine for the remote peripheral
pub struct RemoteLink<C: CentralAdapter> {
    adapter: C,
    target_name: String,
    services: Vec<ServiceConfig>,
    scan_timeout: Option<Duration>,
    discovery_timeout: Duration,
    state: LinkState,
    device: Option<DeviceId>,
    topology: Topology,
    deadline: Option<Deadline>,
    events_tx: mpsc::UnboundedSender<LinkEvent>,
    state_tx: watch::Sender<LinkState>,
}

impl<C: CentralAdapter> RemoteLink<C> {
    /// Create an idle link for the configured target
    pub fn new(adapter: C, config: &ProxyConfig, events_tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        let (state_tx, _) = watch::channel(LinkState::Idle);
        Self {
            adapter,
            target_name: config.target_name.clone(),
            services: config.services.clone(),
            scan_timeout: config.link.scan_timeout,
            discovery_timeout: config.link.discovery_timeout,
            state: LinkState::Idle,
            device: None,
            topology: Topology::build(&config.services),
            deadline: None,
            events_tx,
            state_tx,
        }
    }

    /// Current state
    pub fn state(&self) -> &LinkState {
        &self.state
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Topology of the current connection attempt
    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Device the link is connecting or connected to
    pub fn device(&self) -> Option<&DeviceId> {
        self.device.as_ref()
    }

    /// When the current phase times out, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    /// Start scanning for the target. A no-op while an attempt is in progress.
    pub fn connect(&mut self) -> Result<()> {
        if self.state.is_active() {
            debug!("Connect ignored, link is {}", self.state);
            return Ok(());
        }

        info!("Scanning for '{}'", self.target_name);
        self.topology = Topology::build(&self.services);
        self.device = None;
        self.set_state(LinkState::Scanning);
        self.deadline = self.scan_timeout.map(|d| Deadline::after("scan", d));

        if let Err(e) = self.adapter.start_scan(&self.target_name) {
            self.finish(format!("Failed to start scanning: {}", e));
            return Err(e);
        }
        Ok(())
    }

    /// Cancel the attempt or tear down the connection.
    ///
    /// Emits `Disconnected` exactly once per attempt; repeated calls are no-ops.
    pub fn disconnect(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        match &self.state {
            LinkState::Idle | LinkState::Disconnected(_) => {
                debug!("Disconnect ignored, link is {}", self.state);
                return;
            }
            LinkState::Scanning => self.adapter.stop_scan(),
            _ => {
                if let Some(device) = &self.device {
                    self.adapter.disconnect(device);
                }
            }
        }
        self.finish(reason);
    }

    /// Request a read of a characteristic
    pub fn read_data(&mut self, id: &CharacteristicId) -> Result<()> {
        let (handle, properties) = self.ready_handle(id)?;
        if !properties.contains(CharacteristicProperties::READ) {
            return Err(ProxyError::CapabilityUnsupported {
                characteristic: *id,
                capability: "read",
            });
        }
        trace!("Reading {}", id);
        self.adapter.read_value(handle)
    }

    /// Request a write of a characteristic.
    ///
    /// A characteristic that only supports write-without-response is written
    /// as a command and, if a response was requested, confirmed at once.
    pub fn write_data(&mut self, id: &CharacteristicId, value: Bytes, with_response: bool) -> Result<()> {
        let (handle, properties) = self.ready_handle(id)?;
        if !properties.is_writable() {
            return Err(ProxyError::CapabilityUnsupported {
                characteristic: *id,
                capability: "write",
            });
        }

        let mode = if properties.contains(CharacteristicProperties::WRITE)
            && (with_response || !properties.contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE))
        {
            WriteMode::WithResponse
        } else {
            WriteMode::WithoutResponse
        };

        trace!("Writing {} bytes to {} ({:?})", value.len(), id, mode);
        self.adapter.write_value(handle, value, mode)?;

        if with_response && mode == WriteMode::WithoutResponse {
            self.emit(LinkEvent::WriteCompleted {
                characteristic: *id,
                result: AttResult::Success,
            });
        }
        Ok(())
    }

    /// Enable notifications on a characteristic
    pub fn register_notify(&mut self, id: &CharacteristicId) -> Result<()> {
        self.set_notify(id, true)
    }

    /// Disable notifications on a characteristic
    pub fn unregister_notify(&mut self, id: &CharacteristicId) -> Result<()> {
        self.set_notify(id, false)
    }

    fn set_notify(&mut self, id: &CharacteristicId, enabled: bool) -> Result<()> {
        let (handle, properties) = self.ready_handle(id)?;
        if !properties.supports_subscription() {
            return Err(ProxyError::CapabilityUnsupported {
                characteristic: *id,
                capability: "notify/indicate",
            });
        }
        debug!("Setting notify={} on {}", enabled, id);
        self.adapter.set_notify(handle, enabled)
    }

    fn ready_handle(&self, id: &CharacteristicId) -> Result<(RemoteHandle, CharacteristicProperties)> {
        if self.state != LinkState::Ready {
            return Err(ProxyError::NotConnected);
        }
        let descriptor = self
            .topology
            .characteristic(id)
            .ok_or(ProxyError::UnknownCharacteristic(*id))?;
        let handle = descriptor
            .remote_handle
            .ok_or(ProxyError::UnknownCharacteristic(*id))?;
        Ok((handle, descriptor.properties))
    }

    /// Apply a command from the relay
    pub fn handle_command(&mut self, command: LinkCommand) {
        let (characteristic, operation, result) = match command {
            LinkCommand::Connect => {
                if let Err(e) = self.connect() {
                    warn!("Connect failed: {}", e);
                }
                return;
            }
            LinkCommand::Disconnect { reason } => {
                self.disconnect(reason);
                return;
            }
            LinkCommand::Read { characteristic } => {
                (characteristic, Operation::Read, self.read_data(&characteristic))
            }
            LinkCommand::Write {
                characteristic,
                value,
                with_response,
            } => (
                characteristic,
                Operation::Write,
                self.write_data(&characteristic, value, with_response),
            ),
            LinkCommand::RegisterNotify { characteristic } => (
                characteristic,
                Operation::Subscribe,
                self.register_notify(&characteristic),
            ),
            LinkCommand::UnregisterNotify { characteristic } => (
                characteristic,
                Operation::Unsubscribe,
                self.unregister_notify(&characteristic),
            ),
        };

        if let Err(error) = result {
            debug!("{} on {} failed: {}", operation, characteristic, error);
            self.emit(LinkEvent::OperationFailed {
                characteristic,
                operation,
                error,
            });
        }
    }

    /// Apply an adapter completion
    pub fn handle_adapter_event(&mut self, event: CentralEvent) {
        match event {
            CentralEvent::PowerChanged { powered } => self.on_power_changed(powered),
            CentralEvent::ScanFailed { reason } => {
                if self.state == LinkState::Scanning {
                    self.finish(format!("Scan failed: {}", reason));
                }
            }
            CentralEvent::DeviceDiscovered {
                device,
                name,
                local_name,
            } => self.on_device_discovered(device, name, local_name),
            CentralEvent::Connected { device } => self.on_connected(device),
            CentralEvent::ConnectFailed { device, reason } => {
                if self.is_current(&device) && self.state == LinkState::Connecting {
                    self.finish(format!("Failed to connect: {}", reason));
                }
            }
            CentralEvent::Disconnected { device, reason } => {
                if self.is_current(&device) && self.state.is_active() {
                    self.finish(reason);
                } else {
                    trace!("Ignoring disconnect of {}", device);
                }
            }
            CentralEvent::ServicesDiscovered { device, result } => {
                if self.is_current(&device) {
                    self.on_services_discovered(result);
                }
            }
            CentralEvent::CharacteristicsDiscovered {
                device,
                service,
                result,
            } => {
                if self.is_current(&device) {
                    self.on_characteristics_discovered(service, result);
                }
            }
            CentralEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                if let Some(id) = self.resolve_ready(characteristic) {
                    self.emit(LinkEvent::WriteCompleted {
                        characteristic: id,
                        result,
                    });
                }
            }
            CentralEvent::ValueUpdated {
                characteristic,
                result,
            } => {
                if let Some(id) = self.resolve_ready(characteristic) {
                    match result {
                        Ok(value) => {
                            trace!("Received {} bytes from {}", value.len(), id);
                            self.emit(LinkEvent::DataReceived {
                                characteristic: id,
                                value,
                            });
                        }
                        Err(e) => self.fail(ProxyError::Adapter(format!(
                            "Failed to update value of {}: {}",
                            id, e
                        ))),
                    }
                }
            }
            CentralEvent::NotifyStateChanged {
                characteristic,
                result,
            } => {
                if let Some(id) = self.resolve_ready(characteristic) {
                    match result {
                        Ok(enabled) => {
                            info!("Notifications {} on {}", if enabled { "enabled" } else { "disabled" }, id);
                            self.emit(LinkEvent::NotifyChanged {
                                characteristic: id,
                                enabled,
                            });
                        }
                        Err(e) => self.fail(ProxyError::Adapter(format!(
                            "Failed to change notification state of {}: {}",
                            id, e
                        ))),
                    }
                }
            }
        }
    }

    /// Fire the armed deadline, ending the attempt with a timeout
    pub fn on_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        let error = deadline.timeout_error();
        warn!("Remote link {} while {}", error, self.state);

        let missing: Vec<String> = if self.state == LinkState::Scanning {
            Vec::new()
        } else {
            self.topology
                .characteristic_ids()
                .filter(|id| {
                    self.topology
                        .characteristic(id)
                        .is_some_and(|c| c.remote_handle.is_none())
                })
                .map(|id| id.to_string())
                .collect()
        };

        if missing.is_empty() {
            self.disconnect(error.to_string());
        } else {
            self.disconnect(format!("{} (missing: {})", error, missing.join(", ")));
        }
    }

    /// Run the link actor until the command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LinkCommand>,
        mut adapter_events: CentralEventReceiver,
    ) {
        info!("Remote link started, target '{}'", self.target_name);

        loop {
            let deadline = self.deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(event) = adapter_events.recv() => self.handle_adapter_event(event),
                _ = sleep_until(deadline) => self.on_deadline(),
            }
        }

        self.disconnect("Proxy shut down");
        info!("Remote link stopped");
    }

    fn on_power_changed(&mut self, powered: bool) {
        if powered {
            info!("Central radio powered on");
        } else if self.state.is_active() {
            warn!("Central radio powered off");
            self.disconnect(POWERED_OFF_REASON);
        } else {
            info!("Central radio powered off");
        }
    }

    fn on_device_discovered(&mut self, device: DeviceId, name: Option<String>, local_name: Option<String>) {
        if self.state != LinkState::Scanning {
            trace!("Ignoring discovery of {} while {}", device, self.state);
            return;
        }
        if !self.matches_target(name.as_deref()) && !self.matches_target(local_name.as_deref()) {
            trace!("Ignoring device {} ({:?} / {:?})", device, name, local_name);
            return;
        }

        info!("Found '{}' at {}, connecting", self.target_name, device);
        self.adapter.stop_scan();
        self.device = Some(device.clone());
        self.set_state(LinkState::Connecting);
        self.deadline = Some(Deadline::after("discovery", self.discovery_timeout));

        if let Err(e) = self.adapter.connect(&device) {
            self.finish(format!("Failed to connect: {}", e));
        }
    }

    fn on_connected(&mut self, device: DeviceId) {
        if !self.is_current(&device) || self.state != LinkState::Connecting {
            debug!("Ignoring duplicate connect signal from {}", device);
            return;
        }

        info!("Connected to {}", device);
        self.topology = Topology::build(&self.services);
        self.set_state(LinkState::DiscoveringServices);

        if let Err(e) = self.adapter.discover_services(&device) {
            self.fail(ProxyError::DiscoveryFailed(format!(
                "Service discovery could not start: {}",
                e
            )));
        }
    }

    fn on_services_discovered(&mut self, result: std::result::Result<Vec<DiscoveredService>, String>) {
        if !matches!(
            self.state,
            LinkState::DiscoveringServices | LinkState::DiscoveringCharacteristics
        ) {
            debug!("Ignoring service discovery result while {}", self.state);
            return;
        }
        let Some(device) = self.device.clone() else {
            return;
        };

        let services = match result {
            Ok(services) => services,
            Err(e) => {
                self.fail(ProxyError::DiscoveryFailed(format!(
                    "Error discovering services: {}",
                    e
                )));
                return;
            }
        };

        let mut matched = Vec::new();
        for service in services {
            match self.topology.bind_remote_service(service.uuid, service.handle) {
                Ok(()) => {
                    debug!("Discovered service {}", service.uuid);
                    matched.push(service);
                }
                Err(_) => trace!("Ignoring unexpected service {}", service.uuid),
            }
        }

        if matched.is_empty() {
            if self.state == LinkState::DiscoveringServices {
                self.fail(ProxyError::DiscoveryFailed(format!(
                    "No expected services found on {}",
                    device
                )));
            }
            return;
        }

        self.set_state(LinkState::DiscoveringCharacteristics);
        for service in matched {
            if let Err(e) = self.adapter.discover_characteristics(&device, service.handle) {
                self.fail(ProxyError::DiscoveryFailed(format!(
                    "Characteristic discovery for service {} could not start: {}",
                    service.uuid, e
                )));
                return;
            }
        }
    }

    fn on_characteristics_discovered(
        &mut self,
        service: RemoteHandle,
        result: std::result::Result<Vec<DiscoveredCharacteristic>, String>,
    ) {
        if self.state != LinkState::DiscoveringCharacteristics {
            debug!("Ignoring characteristic discovery result while {}", self.state);
            return;
        }
        let Some(service_id) = self.topology.service_by_remote_handle(service) else {
            trace!("Ignoring characteristics of unknown service handle {:?}", service);
            return;
        };

        let characteristics = match result {
            Ok(characteristics) => characteristics,
            Err(e) => {
                self.fail(ProxyError::DiscoveryFailed(format!(
                    "Error discovering characteristics of service {}: {}",
                    service_id, e
                )));
                return;
            }
        };

        let mut bound = 0usize;
        for characteristic in characteristics {
            let id = CharacteristicId::new(service_id, characteristic.uuid);
            match self
                .topology
                .bind_remote(&id, characteristic.handle, characteristic.properties)
            {
                Ok(()) => {
                    debug!("Discovered characteristic {} {:?}", id, characteristic.properties);
                    bound += 1;
                }
                Err(_) => trace!("Ignoring unexpected characteristic {}", id),
            }
        }

        if bound == 0 {
            self.fail(ProxyError::DiscoveryFailed(format!(
                "No expected characteristics found in service {}",
                service_id
            )));
            return;
        }

        if self.topology.is_remote_complete() {
            info!(
                "Remote topology complete ({} services), link ready",
                self.topology.services().len()
            );
            self.deadline = None;
            self.set_state(LinkState::Ready);
            self.emit(LinkEvent::Ready {
                topology: self.topology.clone(),
            });
        }
    }

    fn resolve_ready(&self, handle: RemoteHandle) -> Option<CharacteristicId> {
        if self.state != LinkState::Ready {
            debug!("Ignoring late completion for {:?} while {}", handle, self.state);
            return None;
        }
        let id = self.topology.find_by_remote_handle(handle);
        if id.is_none() {
            debug!("Ignoring completion for unknown handle {:?}", handle);
        }
        id
    }

    fn matches_target(&self, name: Option<&str>) -> bool {
        name.is_some_and(|n| n.to_lowercase() == self.target_name.to_lowercase())
    }

    fn is_current(&self, device: &DeviceId) -> bool {
        self.device.as_ref() == Some(device)
    }

    fn fail(&mut self, error: ProxyError) {
        warn!("Connection attempt failed [{}]: {}", error.error_code(), error);
        self.disconnect(error.to_string());
    }

    fn finish(&mut self, reason: String) {
        info!("Remote link disconnected: {}", reason);
        self.topology = Topology::build(&self.services);
        self.device = None;
        self.deadline = None;
        self.set_state(LinkState::Disconnected(reason.clone()));
        self.emit(LinkEvent::Disconnected { reason });
    }

    fn set_state(&mut self, state: LinkState) {
        if self.state == state {
            return;
        }
        debug!("Remote link: {} -> {}", self.state, state);
        self.state = state.clone();
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: LinkEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("Link event receiver dropped");
        }
    }
}
