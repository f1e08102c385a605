//! Relay mediator between the remote link and the local server
//!
//! The relay holds no protocol state of its own. It translates events from
//! one state machine into commands for the other, counts what it forwards,
//! and publishes every step as a [`ProxyEvent`].
//!
//! ```text
//!  local client          LocalServer            Relay              RemoteLink        remote device
//!  ────────────          ───────────            ─────              ──────────        ─────────────
//!  read ───────────────► ReadRequested ───────► Read ────────────► read_value ─────►
//!                        data_received ◄─────── DataReceived ◄──── ValueUpdated ◄───
//!  write ──────────────► WriteRequested ──────► Write ───────────► write_value ────►
//!                        confirm_write ◄─────── WriteCompleted ◄── WriteCompleted ◄─
//!  subscribe (first) ──► RegisterFor... ──────► RegisterNotify ──► set_notify ─────►
//!                        start_advertising ◄─── Ready ◄─────────── discovery done
//!                        stop ◄──────────────── Disconnected ◄──── disconnect
//! ```
//!
//! All cross-machine calls are unbounded channel sends, so neither state
//! machine ever waits on the other.

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::event::{ProxyEvent, ProxyEventKind};
use crate::link::{LinkCommand, LinkEvent, Operation};
use crate::server::{ServerCommand, ServerEvent, StopReason};

/// Relay counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayStats {
    /// Times the remote link became ready
    pub connections: u64,
    /// Times the remote link disconnected
    pub disconnections: u64,
    /// Local reads forwarded to the remote device
    pub reads_forwarded: u64,
    /// Local writes forwarded to the remote device
    pub writes_forwarded: u64,
    /// Remote write completions forwarded to the local server
    pub writes_confirmed: u64,
    /// Remote values forwarded to the local server
    pub values_relayed: u64,
    /// Remote subscriptions requested
    pub subscriptions: u64,
    /// Remote operations that could not be issued
    pub operation_failures: u64,
    /// Commands dropped because a state machine had exited
    pub dispatch_errors: u64,
}

/// Forwarding logic between the two state machines
pub struct Relay {
    link_tx: mpsc::UnboundedSender<LinkCommand>,
    server_tx: mpsc::UnboundedSender<ServerCommand>,
    events_tx: broadcast::Sender<ProxyEvent>,
    stats: RelayStats,
}

impl Relay {
    /// Create a relay over the two command channels
    pub fn new(
        link_tx: mpsc::UnboundedSender<LinkCommand>,
        server_tx: mpsc::UnboundedSender<ServerCommand>,
        events_tx: broadcast::Sender<ProxyEvent>,
    ) -> Self {
        Self {
            link_tx,
            server_tx,
            events_tx,
            stats: RelayStats::default(),
        }
    }

    /// Relay counters
    pub fn stats(&self) -> &RelayStats {
        &self.stats
    }

    /// Ask the remote link to start a connection attempt
    pub fn connect(&mut self) {
        self.to_link(LinkCommand::Connect);
    }

    /// Ask the remote link to disconnect
    pub fn disconnect(&mut self, reason: String) {
        self.to_link(LinkCommand::Disconnect { reason });
    }

    /// Forward an event from the remote link
    pub fn on_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Ready { topology } => {
                self.stats.connections += 1;
                let services = topology.service_ids();
                info!("Remote link ready, mirroring {} services", services.len());
                self.publish(ProxyEventKind::LinkReady { services });
                self.to_server(ServerCommand::StartAdvertising { topology });
            }
            LinkEvent::Disconnected { reason } => {
                self.stats.disconnections += 1;
                info!("Remote link disconnected: {}", reason);
                self.publish(ProxyEventKind::LinkDisconnected {
                    reason: reason.clone(),
                });
                self.to_server(ServerCommand::StopAdvertising {
                    reason: StopReason::Requested(reason),
                });
            }
            LinkEvent::DataReceived {
                characteristic,
                value,
            } => {
                self.stats.values_relayed += 1;
                self.publish(ProxyEventKind::DataRelayed {
                    characteristic,
                    len: value.len(),
                });
                self.to_server(ServerCommand::DataReceived {
                    characteristic,
                    value,
                });
            }
            LinkEvent::WriteCompleted {
                characteristic,
                result,
            } => {
                self.stats.writes_confirmed += 1;
                self.publish(ProxyEventKind::WriteConfirmed {
                    characteristic,
                    result: result.to_string(),
                });
                self.to_server(ServerCommand::ConfirmWrite {
                    characteristic,
                    result,
                });
            }
            LinkEvent::NotifyChanged {
                characteristic,
                enabled,
            } => {
                self.publish(ProxyEventKind::NotifyStateChanged {
                    characteristic,
                    enabled,
                });
            }
            LinkEvent::OperationFailed {
                characteristic,
                operation,
                error,
            } => {
                self.stats.operation_failures += 1;
                warn!("{} on {} failed: {}", operation, characteristic, error);
                self.publish(ProxyEventKind::OperationFailed {
                    characteristic,
                    operation: operation.to_string(),
                    error: error.to_string(),
                });

                let result = error.att_result();
                match operation {
                    Operation::Read => self.to_server(ServerCommand::FailReads {
                        characteristic,
                        result,
                    }),
                    Operation::Write => self.to_server(ServerCommand::ConfirmWrite {
                        characteristic,
                        result,
                    }),
                    // Subscribers would stay registered with nothing enabled remotely
                    Operation::Subscribe | Operation::Unsubscribe => {
                        if error.is_connection_fatal() {
                            self.to_link(LinkCommand::Disconnect {
                                reason: format!(
                                    "Failed to change notification state of {}: {}",
                                    characteristic, error
                                ),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Forward an event from the local server
    pub fn on_server_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::AdvertisingStarted { services } => {
                self.publish(ProxyEventKind::AdvertisingStarted { services });
            }
            ServerEvent::Stopped { reason } => {
                self.publish(ProxyEventKind::ServerStopped {
                    reason: reason.to_string(),
                });
                match reason {
                    StopReason::Requested(_) => {}
                    StopReason::PoweredOff | StopReason::Error(_) => {
                        info!("Local server stopped ({}), dropping remote link", reason);
                        self.to_link(LinkCommand::Disconnect {
                            reason: reason.to_string(),
                        });
                    }
                }
            }
            ServerEvent::ReadRequested { characteristic } => {
                self.stats.reads_forwarded += 1;
                self.publish(ProxyEventKind::ReadForwarded { characteristic });
                self.to_link(LinkCommand::Read { characteristic });
            }
            ServerEvent::WriteRequested {
                characteristic,
                value,
            } => {
                self.stats.writes_forwarded += 1;
                self.publish(ProxyEventKind::WriteForwarded {
                    characteristic,
                    len: value.len(),
                });
                self.to_link(LinkCommand::Write {
                    characteristic,
                    value,
                    with_response: true,
                });
            }
            ServerEvent::RegisterForNotifications { characteristic } => {
                self.stats.subscriptions += 1;
                self.publish(ProxyEventKind::NotificationsRequested { characteristic });
                self.to_link(LinkCommand::RegisterNotify { characteristic });
            }
            ServerEvent::UnregisterFromNotifications { characteristic } => {
                self.publish(ProxyEventKind::NotificationsReleased { characteristic });
                self.to_link(LinkCommand::UnregisterNotify { characteristic });
            }
        }
    }

    fn to_link(&mut self, command: LinkCommand) {
        if let Err(e) = self.link_tx.send(command) {
            debug!("Remote link gone, dropping {:?}", e.0);
            self.stats.dispatch_errors += 1;
        }
    }

    fn to_server(&mut self, command: ServerCommand) {
        if let Err(e) = self.server_tx.send(command) {
            debug!("Local server gone, dropping {:?}", e.0);
            self.stats.dispatch_errors += 1;
        }
    }

    fn publish(&self, kind: ProxyEventKind) {
        debug!("{}", kind.describe());
        // No subscribers is fine
        let _ = self.events_tx.send(ProxyEvent::now(kind));
    }
}
