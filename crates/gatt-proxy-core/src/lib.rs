//! BLE GATT Proxy - mirror one remote peripheral as a local one
//!
//! This crate connects to a remote Bluetooth Low Energy peripheral as a
//! central, discovers a configured set of services and characteristics,
//! republishes them as a local GATT server, and relays reads, writes and
//! notifications between local clients and the remote device.
//!
//! # Architecture
//!
//! The proxy is built from three cooperating parts:
//!
//! 1. **Remote link** ([`RemoteLink`]) - scan, connect and discover the
//!    remote device, then execute reads, writes and subscriptions on it
//! 2. **Local server** ([`LocalServer`]) - publish the mirror services,
//!    advertise them, and track outstanding client requests
//! 3. **Relay** ([`Relay`]) - forward events from each side to the other
//!
//! Radio access goes through the [`CentralAdapter`] and
//! [`PeripheralAdapter`] traits so the whole engine runs against mocks in
//! tests and against real stacks in production.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Cargo.toml: gatt-proxy-core = { version = "0.1", features = ["hardware"] }
//!
//! use gatt_proxy_core::{BluezPeripheral, BtleplugCentral, GattProxy, ProxyConfig};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_json_file("proxy.json")?;
//!
//!     let (central_tx, central_rx) = mpsc::unbounded_channel();
//!     let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
//!     let central = BtleplugCentral::new(central_tx).await?;
//!     let peripheral = BluezPeripheral::new(peripheral_tx).await?;
//!
//!     let (proxy, handle) = GattProxy::new(config, central, central_rx, peripheral, peripheral_rx)?;
//!     let runner = tokio::spawn(proxy.run());
//!
//!     handle.connect().await?;
//!     let mut events = handle.subscribe_events();
//!     while let Ok(event) = events.recv().await {
//!         println!("{}", event.describe());
//!     }
//!     runner.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `btleplug` - central-role adapter backed by btleplug
//! - `bluez` - peripheral-role adapter backed by BlueZ (Linux only)
//! - `hardware` - both adapters
//!
//! # Relay Flow
//!
//! ## Local client → remote device
//!
//! 1. Local client reads or writes a mirror characteristic
//! 2. [`LocalServer`] records the request as open and emits a [`ServerEvent`]
//! 3. [`Relay`] turns it into a [`LinkCommand`]
//! 4. [`RemoteLink`] issues the operation on the remote device
//!
//! ## Remote device → local client
//!
//! 1. Remote device answers a read or sends a notification
//! 2. [`RemoteLink`] emits [`LinkEvent::DataReceived`]
//! 3. [`Relay`] forwards the value to the [`LocalServer`]
//! 4. [`LocalServer`] answers every open read and notifies subscribers

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Core data model
pub mod config;
pub mod error;
pub mod gatt;
pub mod topology;

// Radio boundary
pub mod adapter;

// State machines
mod deadline;
pub mod link;
pub mod server;

// Relay and runtime
pub mod event;
pub mod proxy;
pub mod relay;

// Testing utilities
pub mod test_utils;

pub use config::{LinkConfig, ProxyConfig, ProxyConfigBuilder, ServerConfig, ServiceConfig};
pub use error::{ProxyError, Result};
pub use gatt::{
    AttResult, AttributePermissions, CharacteristicId, CharacteristicProperties, ClientId,
    DeviceId, MirrorHandle, RemoteHandle, RequestId, WriteMode,
};
pub use topology::{CharacteristicDescriptor, ServiceDescriptor, Topology};

pub use adapter::{
    CentralAdapter, CentralEvent, CharacteristicSpec, PeripheralAdapter, PeripheralEvent,
    PublishedService, ServiceSpec, WriteRequest,
};
#[cfg(feature = "bluez")]
pub use adapter::BluezPeripheral;
#[cfg(feature = "btleplug")]
pub use adapter::BtleplugCentral;

pub use link::{LinkCommand, LinkEvent, LinkState, Operation, RemoteLink, POWERED_OFF_REASON};
pub use server::{LocalServer, ServerCommand, ServerEvent, ServerState, ServerStatus, StopReason};

pub use event::{ProxyEvent, ProxyEventKind};
pub use proxy::{GattProxy, ProxyCommand, ProxyHandle, ProxyStatus};
pub use relay::{Relay, RelayStats};

pub use test_utils::{MockCentral, MockPeripheral, TestFixture};

pub use config::{DEFAULT_DISCOVERY_TIMEOUT_MS, DEFAULT_EVENTS_CAPACITY, DEFAULT_PUBLISH_TIMEOUT_MS};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
