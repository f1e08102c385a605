//! Local server - server-role state machine
//!
//! Publishes a mirror of the remote topology, advertises it, and keeps
//! every inbound request from a local client open until the relay
//! supplies an answer from the remote side.
//!
//! States: `Idle → Publishing → Advertising → Stopped(reason)`.
//!
//! Requests are only ever answered from here:
//!
//! - reads are resolved by [`LocalServer::data_received`]
//! - writes are resolved by [`LocalServer::confirm_write`]
//! - anything still open when the server stops is failed with
//!   [`AttResult::UnlikelyError`]

mod requests;
mod subscriptions;

pub use requests::{OpenRequest, OpenRequests};
pub use subscriptions::SubscriptionRegistry;

use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::adapter::{
    CharacteristicSpec, PeripheralAdapter, PeripheralEvent, PeripheralEventReceiver,
    PublishedService, ServiceSpec, WriteRequest,
};
use crate::config::ProxyConfig;
use crate::deadline::{sleep_until, Deadline};
use crate::error::{ProxyError, Result};
use crate::gatt::{AttResult, CharacteristicId, ClientId, MirrorHandle, RequestId};
use crate::link::POWERED_OFF_REASON;
use crate::topology::{ServiceDescriptor, Topology};

/// Why the server stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit stop, usually because the remote link went away
    Requested(String),
    /// The peripheral radio powered off
    PoweredOff,
    /// Publishing or advertising failed
    Error(String),
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Requested(reason) => f.write_str(reason),
            StopReason::PoweredOff => f.write_str(POWERED_OFF_REASON),
            StopReason::Error(error) => f.write_str(error),
        }
    }
}

/// State of the local server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerState {
    /// Nothing published
    Idle,
    /// Mirror services being published
    Publishing,
    /// Mirror published and advertised
    Advertising,
    /// Stopped with a reason
    Stopped(StopReason),
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerState::Idle => write!(f, "idle"),
            ServerState::Publishing => write!(f, "publishing"),
            ServerState::Advertising => write!(f, "advertising"),
            ServerState::Stopped(reason) => write!(f, "stopped ({})", reason),
        }
    }
}

/// Commands accepted by the local server actor
#[derive(Debug)]
pub enum ServerCommand {
    /// Publish and advertise a mirror of the topology
    StartAdvertising {
        /// Snapshot with remote handles bound
        topology: Topology,
    },
    /// Stop advertising and fail everything still open
    StopAdvertising {
        /// Reason reported with the `Stopped` transition
        reason: StopReason,
    },
    /// A value arrived from the remote device
    DataReceived {
        /// Source characteristic
        characteristic: CharacteristicId,
        /// Raw bytes
        value: Bytes,
    },
    /// Resolve all open writes on a characteristic
    ConfirmWrite {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Result to answer with
        result: AttResult,
    },
    /// Resolve all open reads on a characteristic with a failure
    FailReads {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Result to answer with
        result: AttResult,
    },
}

/// Events emitted by the local server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// Mirror is published and advertised
    AdvertisingStarted {
        /// Advertised service ids
        services: Vec<Uuid>,
    },
    /// Server stopped
    Stopped {
        /// Why
        reason: StopReason,
    },
    /// A local client read a characteristic
    ReadRequested {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// A local client wrote a characteristic
    WriteRequested {
        /// Target characteristic
        characteristic: CharacteristicId,
        /// Written bytes
        value: Bytes,
    },
    /// First local subscriber arrived
    RegisterForNotifications {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
    /// Last local subscriber left
    UnregisterFromNotifications {
        /// Target characteristic
        characteristic: CharacteristicId,
    },
}

/// Snapshot of the server for status queries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStatus {
    /// Current state
    pub state: ServerState,
    /// Reads awaiting remote data
    pub open_reads: usize,
    /// Writes awaiting remote confirmation
    pub open_writes: usize,
    /// Characteristics with at least one local subscriber
    pub subscribed_characteristics: usize,
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self {
            state: ServerState::Idle,
            open_reads: 0,
            open_writes: 0,
            subscribed_characteristics: 0,
        }
    }
}

/// Server-role state machine for the local mirror
pub struct LocalServer<P: PeripheralAdapter> {
    adapter: P,
    local_name: String,
    publish_timeout: Duration,
    state: ServerState,
    topology: Option<Topology>,
    pending_publish: HashSet<Uuid>,
    open: OpenRequests,
    subscriptions: SubscriptionRegistry,
    cache: HashMap<CharacteristicId, Bytes>,
    deadline: Option<Deadline>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    status_tx: watch::Sender<ServerStatus>,
}

impl<P: PeripheralAdapter> LocalServer<P> {
    /// Create an idle server
    pub fn new(adapter: P, config: &ProxyConfig, events_tx: mpsc::UnboundedSender<ServerEvent>) -> Self {
        let (status_tx, _) = watch::channel(ServerStatus::default());
        Self {
            adapter,
            local_name: config.advertised_name().to_string(),
            publish_timeout: config.server.publish_timeout,
            state: ServerState::Idle,
            topology: None,
            pending_publish: HashSet::new(),
            open: OpenRequests::new(),
            subscriptions: SubscriptionRegistry::new(),
            cache: HashMap::new(),
            deadline: None,
            events_tx,
            status_tx,
        }
    }

    /// Current state
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Observe status snapshots
    pub fn watch_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_tx.subscribe()
    }

    /// Current status snapshot
    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            state: self.state.clone(),
            open_reads: self.open.total_reads(),
            open_writes: self.open.total_writes(),
            subscribed_characteristics: self.subscriptions.subscribed_characteristics(),
        }
    }

    /// Mirrored topology, while published
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    /// Open reads on a characteristic
    pub fn open_read_count(&self, characteristic: &CharacteristicId) -> usize {
        self.open.read_count(characteristic)
    }

    /// Open writes on a characteristic
    pub fn open_write_count(&self, characteristic: &CharacteristicId) -> usize {
        self.open.write_count(characteristic)
    }

    /// Last value received for a characteristic
    pub fn cached_value(&self, characteristic: &CharacteristicId) -> Option<&Bytes> {
        self.cache.get(characteristic)
    }

    /// Local clients subscribed to a characteristic
    pub fn subscribers(&self, characteristic: &CharacteristicId) -> Vec<ClientId> {
        self.subscriptions.subscribers(characteristic)
    }

    /// When publishing times out, if armed
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline.map(|d| d.at)
    }

    /// Publish a mirror of every topology entry, then advertise.
    ///
    /// Valid from `Idle` or `Stopped`.
    pub fn start_advertising(&mut self, topology: Topology) -> Result<()> {
        if matches!(self.state, ServerState::Publishing | ServerState::Advertising) {
            return Err(ProxyError::InvalidState {
                operation: "start_advertising",
                state: self.state.to_string(),
            });
        }

        self.open = OpenRequests::new();
        self.subscriptions.clear();
        self.cache.clear();

        let specs: Vec<ServiceSpec> = topology.services().iter().map(service_spec).collect();
        self.pending_publish = specs.iter().map(|s| s.uuid).collect();
        self.topology = Some(topology);
        self.set_state(ServerState::Publishing);
        self.deadline = Some(Deadline::after("publish", self.publish_timeout));

        for spec in &specs {
            info!(
                "Publishing service {} ({} characteristics)",
                spec.uuid,
                spec.characteristics.len()
            );
            if let Err(e) = self.adapter.publish(spec) {
                self.stop(StopReason::Error(publish_error(spec.uuid, &e)));
                return Err(ProxyError::PublishFailed {
                    service: spec.uuid,
                    reason: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop advertising, fail everything still open and unpublish.
    ///
    /// Always reports the `Stopped` transition, except when already stopped.
    pub fn stop(&mut self, reason: StopReason) {
        match self.state {
            ServerState::Stopped(_) => {
                debug!("Stop ignored, server is {}", self.state);
                return;
            }
            ServerState::Idle => {
                info!("Local server stopped before publishing: {}", reason);
                self.set_state(ServerState::Stopped(reason.clone()));
                self.emit(ServerEvent::Stopped { reason });
                return;
            }
            ServerState::Publishing | ServerState::Advertising => {}
        }

        let open = self.open.drain_all();
        if !open.is_empty() {
            info!("Failing {} open requests", open.len());
        }
        for request in open {
            self.adapter
                .respond(request.request, AttResult::UnlikelyError, None);
        }

        self.subscriptions.clear();
        self.cache.clear();
        self.adapter.stop_advertising();
        self.adapter.unpublish_all();
        self.topology = None;
        self.pending_publish.clear();
        self.deadline = None;

        info!("Local server stopped: {}", reason);
        self.set_state(ServerState::Stopped(reason.clone()));
        self.emit(ServerEvent::Stopped { reason });
    }

    /// Update the cached value, answer open reads and notify subscribers
    pub fn data_received(&mut self, characteristic: &CharacteristicId, value: Bytes) {
        if self.state != ServerState::Advertising {
            debug!("Dropping data for {} while {}", characteristic, self.state);
            return;
        }
        let Some(mirror) = self
            .topology
            .as_ref()
            .and_then(|t| t.characteristic(characteristic))
            .map(|c| c.mirror_handle)
        else {
            warn!("Data received for unknown characteristic {}", characteristic);
            return;
        };

        self.cache.insert(*characteristic, value.clone());

        for request in self.open.take_reads(characteristic) {
            trace!("Answering {} from {}", request.request, request.client);
            self.adapter
                .respond(request.request, AttResult::Success, Some(value.clone()));
        }

        let subscribers = self.subscriptions.subscribers(characteristic);
        if subscribers.is_empty() {
            return;
        }
        match mirror {
            Some(handle) => {
                trace!("Notifying {} subscribers of {}", subscribers.len(), characteristic);
                if let Err(e) = self.adapter.notify(handle, value, &subscribers) {
                    warn!("Failed to notify subscribers of {}: {}", characteristic, e);
                }
            }
            None => warn!("No mirror handle for {}", characteristic),
        }
    }

    /// Resolve every open write on a characteristic with the given result
    pub fn confirm_write(&mut self, characteristic: &CharacteristicId, result: AttResult) {
        let writes = self.open.take_writes(characteristic);
        if writes.is_empty() {
            debug!("No open writes on {} to confirm", characteristic);
            return;
        }
        debug!("Confirming {} writes on {}: {}", writes.len(), characteristic, result);
        for request in writes {
            self.adapter.respond(request.request, result, None);
        }
    }

    /// Resolve every open read on a characteristic with a failure
    pub fn fail_reads(&mut self, characteristic: &CharacteristicId, result: AttResult) {
        for request in self.open.take_reads(characteristic) {
            debug!("Failing {} on {}: {}", request.request, characteristic, result);
            self.adapter.respond(request.request, result, None);
        }
    }

    /// Apply a command from the relay
    pub fn handle_command(&mut self, command: ServerCommand) {
        match command {
            ServerCommand::StartAdvertising { topology } => {
                if let Err(e) = self.start_advertising(topology) {
                    warn!("Could not start advertising: {}", e);
                }
            }
            ServerCommand::StopAdvertising { reason } => self.stop(reason),
            ServerCommand::DataReceived {
                characteristic,
                value,
            } => self.data_received(&characteristic, value),
            ServerCommand::ConfirmWrite {
                characteristic,
                result,
            } => self.confirm_write(&characteristic, result),
            ServerCommand::FailReads {
                characteristic,
                result,
            } => self.fail_reads(&characteristic, result),
        }
        self.publish_status();
    }

    /// Apply an adapter event
    pub fn handle_adapter_event(&mut self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::PowerChanged { powered } => {
                if powered {
                    info!("Peripheral radio powered on");
                } else {
                    warn!("Peripheral radio powered off");
                    self.stop(StopReason::PoweredOff);
                }
            }
            PeripheralEvent::ServicePublished { service, result } => {
                self.on_service_published(service, result)
            }
            PeripheralEvent::AdvertisingStarted { result } => self.on_advertising_started(result),
            PeripheralEvent::AdvertisingStopped { reason } => {
                if self.state == ServerState::Advertising {
                    self.stop(StopReason::Error(format!("Advertising stopped: {}", reason)));
                }
            }
            PeripheralEvent::ReadRequested {
                request,
                client,
                characteristic,
            } => self.on_read_requested(request, client, characteristic),
            PeripheralEvent::WriteRequested { requests } => {
                for request in requests {
                    self.on_write_requested(request);
                }
            }
            PeripheralEvent::Subscribed {
                characteristic,
                client,
            } => self.on_subscribed(characteristic, client),
            PeripheralEvent::Unsubscribed {
                characteristic,
                client,
            } => self.on_unsubscribed(characteristic, client),
        }
        self.publish_status();
    }

    /// Fire the armed deadline, stopping a publish that took too long
    pub fn on_deadline(&mut self) {
        let Some(deadline) = self.deadline.take() else {
            return;
        };
        if self.state == ServerState::Publishing {
            let error = deadline.timeout_error();
            warn!("Local server {}", error);
            self.stop(StopReason::Error(error.to_string()));
            self.publish_status();
        }
    }

    /// Run the server actor until the command channel closes
    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ServerCommand>,
        mut adapter_events: PeripheralEventReceiver,
    ) {
        info!("Local server started as '{}'", self.local_name);

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

        self.stop(StopReason::Requested("Proxy shut down".to_string()));
        info!("Local server stopped");
    }

    fn on_service_published(
        &mut self,
        service: Uuid,
        result: std::result::Result<PublishedService, String>,
    ) {
        if self.state != ServerState::Publishing || !self.pending_publish.contains(&service) {
            debug!("Ignoring publish result for {} while {}", service, self.state);
            return;
        }

        let published = match result {
            Ok(published) => published,
            Err(e) => {
                let reason = publish_error(service, &e);
                warn!("{}", reason);
                self.stop(StopReason::Error(reason));
                return;
            }
        };

        let Some(topology) = self.topology.as_mut() else {
            return;
        };
        if let Err(e) = topology.bind_mirror_service(service, published.handle) {
            warn!("Published unexpected service: {}", e);
        }
        for (uuid, handle) in published.characteristics {
            if let Err(e) = topology.bind_mirror(&CharacteristicId::new(service, uuid), handle) {
                warn!("Published unexpected characteristic: {}", e);
            }
        }
        debug!("Service {} published", service);
        self.pending_publish.remove(&service);

        if !self.pending_publish.is_empty() {
            return;
        }

        if !topology.is_complete() {
            self.stop(StopReason::Error(
                "Published services do not cover the expected topology".to_string(),
            ));
            return;
        }

        let services = topology.service_ids();
        info!(
            "All services published, advertising '{}' with {} services",
            self.local_name,
            services.len()
        );
        if let Err(e) = self.adapter.start_advertising(&self.local_name, &services) {
            self.stop(StopReason::Error(advertising_error(&e)));
        }
    }

    fn on_advertising_started(&mut self, result: std::result::Result<(), String>) {
        if self.state != ServerState::Publishing || !self.pending_publish.is_empty() {
            debug!("Ignoring advertising result while {}", self.state);
            return;
        }
        match result {
            Ok(()) => {
                let services = self
                    .topology
                    .as_ref()
                    .map(Topology::service_ids)
                    .unwrap_or_default();
                self.deadline = None;
                self.set_state(ServerState::Advertising);
                info!("Advertising started");
                self.emit(ServerEvent::AdvertisingStarted { services });
            }
            Err(e) => {
                let reason = advertising_error(&e);
                warn!("{}", reason);
                self.stop(StopReason::Error(reason));
            }
        }
    }

    fn on_read_requested(&mut self, request: RequestId, client: ClientId, handle: MirrorHandle) {
        let characteristic = match self.resolve(handle) {
            Ok(id) => id,
            Err(result) => {
                self.adapter.respond(request, result, None);
                return;
            }
        };
        debug!("Read {} from {} on {}", request, client, characteristic);
        self.open
            .add_read(characteristic, OpenRequest { request, client });
        self.emit(ServerEvent::ReadRequested { characteristic });
    }

    fn on_write_requested(&mut self, write: WriteRequest) {
        let characteristic = match self.resolve(write.characteristic) {
            Ok(id) => id,
            Err(result) => {
                if write.response_required {
                    self.adapter.respond(write.request, result, None);
                }
                return;
            }
        };
        debug!(
            "Write {} from {} on {} ({} bytes)",
            write.request,
            write.client,
            characteristic,
            write.value.len()
        );
        if write.response_required {
            self.open.add_write(
                characteristic,
                OpenRequest {
                    request: write.request,
                    client: write.client,
                },
            );
        }
        self.emit(ServerEvent::WriteRequested {
            characteristic,
            value: write.value,
        });
    }

    fn on_subscribed(&mut self, handle: MirrorHandle, client: ClientId) {
        let Ok(characteristic) = self.resolve(handle) else {
            debug!("Ignoring subscription from {} to {:?}", client, handle);
            return;
        };
        info!("Client {} subscribed to {}", client, characteristic);
        if self.subscriptions.subscribe(characteristic, client) {
            self.emit(ServerEvent::RegisterForNotifications { characteristic });
        }
    }

    fn on_unsubscribed(&mut self, handle: MirrorHandle, client: ClientId) {
        let Ok(characteristic) = self.resolve(handle) else {
            debug!("Ignoring unsubscription from {} to {:?}", client, handle);
            return;
        };
        info!("Client {} unsubscribed from {}", client, characteristic);
        if self.subscriptions.unsubscribe(&characteristic, &client) {
            self.emit(ServerEvent::UnregisterFromNotifications { characteristic });
        }
    }

    fn resolve(&self, handle: MirrorHandle) -> std::result::Result<CharacteristicId, AttResult> {
        if self.state != ServerState::Advertising {
            debug!("Rejecting request on {:?} while {}", handle, self.state);
            return Err(AttResult::UnlikelyError);
        }
        self.topology
            .as_ref()
            .and_then(|t| t.find_by_mirror_handle(handle))
            .ok_or(AttResult::AttributeNotFound)
    }

    fn set_state(&mut self, state: ServerState) {
        debug!("Local server: {} -> {}", self.state, state);
        self.state = state;
        self.publish_status();
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(self.status());
    }

    fn emit(&self, event: ServerEvent) {
        if self.events_tx.send(event).is_err() {
            trace!("Server event receiver dropped");
        }
    }
}

fn service_spec(service: &ServiceDescriptor) -> ServiceSpec {
    ServiceSpec {
        uuid: service.id,
        characteristics: service
            .characteristics
            .iter()
            .map(|c| CharacteristicSpec {
                uuid: c.id,
                properties: c.properties,
                permissions: c.properties.mirror_permissions(),
            })
            .collect(),
    }
}

fn publish_error(service: Uuid, error: &dyn std::fmt::Display) -> String {
    format!(
        "There was an error when adding the service {}, error: {}",
        service, error
    )
}

fn advertising_error(error: &dyn std::fmt::Display) -> String {
    format!("There was an error in starting the advertising: {}", error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{AttributePermissions, CharacteristicProperties};
    use crate::test_utils::{MockPeripheral, PeripheralCall, TestFixture};

    fn create_test_server() -> (
        LocalServer<MockPeripheral>,
        MockPeripheral,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let peripheral = MockPeripheral::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let server = LocalServer::new(peripheral.clone(), &TestFixture::config(), tx);
        (server, peripheral, rx)
    }

    fn advertising_server() -> (
        LocalServer<MockPeripheral>,
        MockPeripheral,
        mpsc::UnboundedReceiver<ServerEvent>,
    ) {
        let (mut server, peripheral, mut rx) = create_test_server();
        server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap();
        server.handle_adapter_event(TestFixture::service_published());
        server.handle_adapter_event(PeripheralEvent::AdvertisingStarted { result: Ok(()) });
        assert_eq!(server.state(), &ServerState::Advertising);
        drain(&mut rx);
        peripheral.clear();
        (server, peripheral, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_publish_then_advertise() {
        let (mut server, peripheral, mut rx) = create_test_server();
        server
            .start_advertising(TestFixture::ready_topology(
                CharacteristicProperties::READ | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            ))
            .unwrap();
        assert_eq!(server.state(), &ServerState::Publishing);

        let published = peripheral.published();
        assert_eq!(published.len(), 1);
        let characteristic = &published[0].characteristics[0];
        assert_eq!(characteristic.uuid, TestFixture::C1);
        assert_eq!(
            characteristic.properties,
            CharacteristicProperties::READ | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
        );
        assert_eq!(characteristic.permissions, AttributePermissions::Writeable);

        // Advertising waits for every publish to complete
        assert_eq!(peripheral.count(|c| matches!(c, PeripheralCall::StartAdvertising { .. })), 0);
        server.handle_adapter_event(TestFixture::service_published());
        assert!(peripheral.calls().contains(&PeripheralCall::StartAdvertising {
            name: TestFixture::TARGET_NAME.to_string(),
            services: vec![TestFixture::S1],
        }));
        assert!(server.topology().unwrap().is_complete());

        server.handle_adapter_event(PeripheralEvent::AdvertisingStarted { result: Ok(()) });
        assert_eq!(server.state(), &ServerState::Advertising);
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::AdvertisingStarted {
                services: vec![TestFixture::S1]
            }]
        );
    }

    #[test]
    fn test_start_while_advertising_is_invalid() {
        let (mut server, _peripheral, _rx) = advertising_server();
        let err = server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidState { .. }));
    }

    #[test]
    fn test_read_answered_by_data_received() {
        let (mut server, peripheral, mut rx) = advertising_server();
        server.handle_adapter_event(TestFixture::read_requested(1, "a"));
        server.handle_adapter_event(TestFixture::read_requested(2, "b"));
        assert_eq!(server.open_read_count(&TestFixture::c1()), 2);
        assert!(peripheral.responses().is_empty());
        assert_eq!(
            drain(&mut rx),
            vec![
                ServerEvent::ReadRequested {
                    characteristic: TestFixture::c1()
                };
                2
            ]
        );

        server.data_received(&TestFixture::c1(), Bytes::from_static(&[0x42]));
        assert_eq!(server.open_read_count(&TestFixture::c1()), 0);
        assert_eq!(
            peripheral.responses(),
            vec![
                (RequestId(1), AttResult::Success, Some(Bytes::from_static(&[0x42]))),
                (RequestId(2), AttResult::Success, Some(Bytes::from_static(&[0x42]))),
            ]
        );
        assert!(peripheral.notifications().is_empty());
    }

    #[test]
    fn test_unsolicited_update_notifies_subscribers() {
        let (mut server, peripheral, mut rx) = advertising_server();
        server.handle_adapter_event(TestFixture::subscribed("a"));
        server.handle_adapter_event(TestFixture::subscribed("b"));
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::RegisterForNotifications {
                characteristic: TestFixture::c1()
            }]
        );

        server.data_received(&TestFixture::c1(), Bytes::from_static(&[0xFF]));
        assert_eq!(
            server.cached_value(&TestFixture::c1()),
            Some(&Bytes::from_static(&[0xFF]))
        );
        assert_eq!(
            peripheral.notifications(),
            vec![(
                TestFixture::C1_MIRROR,
                Bytes::from_static(&[0xFF]),
                vec![ClientId("a".to_string()), ClientId("b".to_string())]
            )]
        );
    }

    #[test]
    fn test_write_confirmation_fan_out() {
        let (mut server, peripheral, mut rx) = advertising_server();
        for n in 1..=3 {
            server.handle_adapter_event(TestFixture::write_requested(n, &[n as u8], true));
        }
        assert_eq!(server.open_write_count(&TestFixture::c1()), 3);
        assert_eq!(drain(&mut rx).len(), 3);

        server.confirm_write(&TestFixture::c1(), AttResult::Other(0x80));
        assert_eq!(server.open_write_count(&TestFixture::c1()), 0);
        let responses = peripheral.responses();
        assert_eq!(responses.len(), 3);
        assert!(responses
            .iter()
            .all(|(_, result, value)| *result == AttResult::Other(0x80) && value.is_none()));

        // Nothing left to confirm
        server.confirm_write(&TestFixture::c1(), AttResult::Success);
        assert_eq!(peripheral.responses().len(), 3);
    }

    #[test]
    fn test_batched_writes_forwarded_in_order() {
        let (mut server, _peripheral, mut rx) = advertising_server();
        let batch = |n: u64| WriteRequest {
            request: RequestId(n),
            client: ClientId("a".to_string()),
            characteristic: TestFixture::C1_MIRROR,
            value: Bytes::from(vec![n as u8]),
            response_required: true,
        };
        server.handle_adapter_event(PeripheralEvent::WriteRequested {
            requests: vec![batch(1), batch(2)],
        });
        let values: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter_map(|e| match e {
                ServerEvent::WriteRequested { value, .. } => Some(value[0]),
                _ => None,
            })
            .collect();
        assert_eq!(values, vec![1, 2]);
    }

    #[test]
    fn test_write_command_is_not_left_open() {
        let (mut server, _peripheral, mut rx) = advertising_server();
        server.handle_adapter_event(TestFixture::write_requested(1, &[7], false));
        assert_eq!(server.open_write_count(&TestFixture::c1()), 0);
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_subscription_coalescing() {
        let (mut server, _peripheral, mut rx) = advertising_server();
        for client in ["a", "b", "c"] {
            server.handle_adapter_event(TestFixture::subscribed(client));
        }
        for client in ["a", "b"] {
            server.handle_adapter_event(TestFixture::unsubscribed(client));
        }
        assert_eq!(drain(&mut rx).len(), 1);

        server.handle_adapter_event(TestFixture::unsubscribed("c"));
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::UnregisterFromNotifications {
                characteristic: TestFixture::c1()
            }]
        );
    }

    #[test]
    fn test_stop_fails_open_requests() {
        let (mut server, peripheral, mut rx) = advertising_server();
        server.handle_adapter_event(TestFixture::read_requested(1, "a"));
        server.handle_adapter_event(TestFixture::write_requested(2, &[1], true));
        drain(&mut rx);

        let reason = StopReason::Requested("Remote disconnected".to_string());
        server.stop(reason.clone());
        server.stop(reason.clone());

        let mut responses = peripheral.responses();
        responses.sort_by_key(|(request, _, _)| *request);
        assert_eq!(
            responses,
            vec![
                (RequestId(1), AttResult::UnlikelyError, None),
                (RequestId(2), AttResult::UnlikelyError, None),
            ]
        );
        assert_eq!(drain(&mut rx), vec![ServerEvent::Stopped { reason: reason.clone() }]);
        assert_eq!(server.state(), &ServerState::Stopped(reason));
        assert!(peripheral.calls().contains(&PeripheralCall::UnpublishAll));
        assert_eq!(server.status().open_reads + server.status().open_writes, 0);
    }

    #[test]
    fn test_stop_from_idle_reports_stopped() {
        let (mut server, peripheral, mut rx) = create_test_server();
        let reason = StopReason::Requested("Scan failed".to_string());
        server.stop(reason.clone());

        assert_eq!(server.state(), &ServerState::Stopped(reason.clone()));
        assert_eq!(drain(&mut rx), vec![ServerEvent::Stopped { reason }]);
        // Nothing was published, so the radio is left alone
        assert!(peripheral.calls().is_empty());

        // A later attempt can still publish
        server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap();
        assert_eq!(server.state(), &ServerState::Publishing);
    }

    #[test]
    fn test_requests_rejected_when_not_advertising_or_unknown() {
        let (mut server, peripheral, mut rx) = create_test_server();
        server.handle_adapter_event(TestFixture::read_requested(1, "a"));
        assert_eq!(
            peripheral.responses(),
            vec![(RequestId(1), AttResult::UnlikelyError, None)]
        );

        let (mut server, peripheral, _) = advertising_server();
        server.handle_adapter_event(PeripheralEvent::ReadRequested {
            request: RequestId(5),
            client: ClientId("a".to_string()),
            characteristic: MirrorHandle(999),
        });
        assert_eq!(
            peripheral.responses(),
            vec![(RequestId(5), AttResult::AttributeNotFound, None)]
        );
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn test_publish_failure_stops_with_message() {
        let (mut server, _peripheral, mut rx) = create_test_server();
        server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap();
        server.handle_adapter_event(PeripheralEvent::ServicePublished {
            service: TestFixture::S1,
            result: Err("Permission denied".to_string()),
        });

        match server.state() {
            ServerState::Stopped(StopReason::Error(reason)) => {
                assert!(reason.starts_with("There was an error when adding the service"));
                assert!(reason.contains("Permission denied"));
            }
            other => panic!("unexpected state {}", other),
        }
        assert_eq!(drain(&mut rx).len(), 1);

        // Restart from Stopped is allowed
        assert!(server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .is_ok());
    }

    #[test]
    fn test_advertising_failure_stops() {
        let (mut server, _peripheral, _rx) = create_test_server();
        server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap();
        server.handle_adapter_event(TestFixture::service_published());
        server.handle_adapter_event(PeripheralEvent::AdvertisingStarted {
            result: Err("busy".to_string()),
        });
        assert!(matches!(
            server.state(),
            ServerState::Stopped(StopReason::Error(reason))
                if reason == "There was an error in starting the advertising: busy"
        ));
    }

    #[test]
    fn test_power_off_stops() {
        let (mut server, _peripheral, mut rx) = advertising_server();
        server.handle_adapter_event(PeripheralEvent::PowerChanged { powered: false });
        assert_eq!(server.state(), &ServerState::Stopped(StopReason::PoweredOff));
        assert_eq!(
            drain(&mut rx),
            vec![ServerEvent::Stopped {
                reason: StopReason::PoweredOff
            }]
        );
        assert_eq!(StopReason::PoweredOff.to_string(), POWERED_OFF_REASON);
    }

    #[test]
    fn test_publish_deadline() {
        let (mut server, _peripheral, _rx) = create_test_server();
        server
            .start_advertising(TestFixture::ready_topology(TestFixture::c1_properties()))
            .unwrap();
        assert!(server.deadline().is_some());
        server.on_deadline();
        assert!(matches!(
            server.state(),
            ServerState::Stopped(StopReason::Error(reason)) if reason.contains("publish")
        ));
    }

    #[test]
    fn test_status_watch() {
        let (mut server, _peripheral, _rx) = advertising_server();
        let status = server.watch_status();
        server.handle_adapter_event(TestFixture::read_requested(1, "a"));
        assert_eq!(status.borrow().open_reads, 1);
        assert_eq!(status.borrow().state, ServerState::Advertising);
    }
}
