//! GattProxy - proxy runtime
//!
//! Wires a [`RemoteLink`] and a [`LocalServer`] to a [`Relay`], each state
//! machine running as its own task so their callbacks interleave freely
//! while each one stays serialized.
//!
//! # Example
//!
//! ```rust,ignore
//! use gatt_proxy_core::{GattProxy, ProxyConfig};
//!
//! let (proxy, handle) = GattProxy::new(config, central, central_rx, peripheral, peripheral_rx)?;
//! tokio::spawn(proxy.run());
//!
//! handle.connect().await?;
//! let mut events = handle.subscribe_events();
//! while let Ok(event) = events.recv().await {
//!     println!("{}", event.describe());
//! }
//! ```

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tracing::{info, warn};

use crate::adapter::{CentralAdapter, CentralEventReceiver, PeripheralAdapter, PeripheralEventReceiver};
use crate::config::ProxyConfig;
use crate::error::Result;
use crate::event::ProxyEvent;
use crate::link::{LinkEvent, LinkState, RemoteLink};
use crate::relay::{Relay, RelayStats};
use crate::server::{LocalServer, ServerEvent, ServerStatus};

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Commands that can be sent to the proxy
#[derive(Debug)]
pub enum ProxyCommand {
    /// Start a connection attempt to the remote device
    Connect,
    /// Disconnect from the remote device
    Disconnect {
        /// Reason reported with the `Disconnected` transition
        reason: String,
    },
    /// Get a status snapshot
    GetStatus(oneshot::Sender<ProxyStatus>),
    /// Shutdown the proxy
    Shutdown,
}

/// Proxy status snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyStatus {
    /// Remote link state
    pub link: LinkState,
    /// Local server status
    pub server: ServerStatus,
    /// Relay counters
    pub stats: RelayStats,
}

/// Handle for controlling a running [`GattProxy`]
#[derive(Clone)]
pub struct ProxyHandle {
    command_tx: mpsc::Sender<ProxyCommand>,
    events_tx: broadcast::Sender<ProxyEvent>,
}

impl ProxyHandle {
    /// Start a connection attempt. A no-op while one is in progress.
    pub async fn connect(&self) -> Result<()> {
        self.send(ProxyCommand::Connect).await
    }

    /// Disconnect from the remote device
    pub async fn disconnect(&self, reason: impl Into<String>) -> Result<()> {
        self.send(ProxyCommand::Disconnect {
            reason: reason.into(),
        })
        .await
    }

    /// Get a status snapshot
    pub async fn status(&self) -> Result<ProxyStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(ProxyCommand::GetStatus(tx)).await?;
        Ok(rx.await?)
    }

    /// Subscribe to proxy events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events_tx.subscribe()
    }

    /// Shutdown the proxy
    pub async fn shutdown(&self) -> Result<()> {
        self.send(ProxyCommand::Shutdown).await
    }

    async fn send(&self, command: ProxyCommand) -> Result<()> {
        Ok(self.command_tx.send(command).await?)
    }
}

/// BLE GATT proxy mirroring one remote peripheral as a local one
pub struct GattProxy<C: CentralAdapter, P: PeripheralAdapter> {
    link: RemoteLink<C>,
    server: LocalServer<P>,
    central_events: CentralEventReceiver,
    peripheral_events: PeripheralEventReceiver,
    link_events: mpsc::UnboundedReceiver<LinkEvent>,
    server_events: mpsc::UnboundedReceiver<ServerEvent>,
    command_rx: mpsc::Receiver<ProxyCommand>,
    events_tx: broadcast::Sender<ProxyEvent>,
}

impl<C: CentralAdapter, P: PeripheralAdapter> GattProxy<C, P> {
    /// Create a proxy over the two adapters and their event streams
    pub fn new(
        config: ProxyConfig,
        central: C,
        central_events: CentralEventReceiver,
        peripheral: P,
        peripheral_events: PeripheralEventReceiver,
    ) -> Result<(Self, ProxyHandle)> {
        config.validate()?;

        let (link_events_tx, link_events) = mpsc::unbounded_channel();
        let (server_events_tx, server_events) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(config.events_capacity);

        let proxy = Self {
            link: RemoteLink::new(central, &config, link_events_tx),
            server: LocalServer::new(peripheral, &config, server_events_tx),
            central_events,
            peripheral_events,
            link_events,
            server_events,
            command_rx,
            events_tx: events_tx.clone(),
        };
        let handle = ProxyHandle {
            command_tx,
            events_tx,
        };
        Ok((proxy, handle))
    }

    /// Run the proxy until shutdown or until every handle is dropped
    pub async fn run(self) -> Result<()> {
        let Self {
            link,
            server,
            central_events,
            peripheral_events,
            mut link_events,
            mut server_events,
            mut command_rx,
            events_tx,
        } = self;

        info!("Starting GATT proxy");

        let link_state = link.watch_state();
        let server_status = server.watch_status();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let link_task = tokio::spawn(link.run(link_rx, central_events));
        let server_task = tokio::spawn(server.run(server_rx, peripheral_events));
        let mut relay = Relay::new(link_tx, server_tx, events_tx);

        loop {
            tokio::select! {
                Some(event) = link_events.recv() => relay.on_link_event(event),
                Some(event) = server_events.recv() => relay.on_server_event(event),
                command = command_rx.recv() => match command {
                    Some(ProxyCommand::Connect) => relay.connect(),
                    Some(ProxyCommand::Disconnect { reason }) => relay.disconnect(reason),
                    Some(ProxyCommand::GetStatus(tx)) => {
                        let _ = tx.send(status(&link_state, &server_status, relay.stats()));
                    }
                    Some(ProxyCommand::Shutdown) | None => {
                        info!("Proxy shutdown requested");
                        break;
                    }
                },
            }
        }

        // Closing the command channels stops both actors
        drop(relay);
        if let Err(e) = link_task.await {
            warn!("Remote link task failed: {}", e);
        }
        if let Err(e) = server_task.await {
            warn!("Local server task failed: {}", e);
        }

        info!("GATT proxy stopped");
        Ok(())
    }
}

fn status(
    link: &watch::Receiver<LinkState>,
    server: &watch::Receiver<ServerStatus>,
    stats: &RelayStats,
) -> ProxyStatus {
    ProxyStatus {
        link: link.borrow().clone(),
        server: server.borrow().clone(),
        stats: stats.clone(),
    }
}
