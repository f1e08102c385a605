//! Central-role adapter backed by btleplug
//!
//! Every command spawns a short task on the current tokio runtime that
//! performs the btleplug call and reports the outcome as a
//! [`CentralEvent`]. Opaque [`RemoteHandle`]s are allocated here and map
//! back to btleplug services and characteristics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use btleplug::api::{
    Central, CentralEvent as BtleEvent, CentralState, Characteristic, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    CentralAdapter, CentralEvent, CentralEventSender, DiscoveredCharacteristic, DiscoveredService,
};
use crate::error::{ProxyError, Result};
use crate::gatt::{AttResult, CharacteristicProperties, DeviceId, RemoteHandle, WriteMode};

#[derive(Default)]
struct Registry {
    peripherals: HashMap<DeviceId, Peripheral>,
    services: HashMap<RemoteHandle, (DeviceId, Vec<Characteristic>)>,
    characteristics: HashMap<RemoteHandle, (DeviceId, Characteristic)>,
    notifications: Option<JoinHandle<()>>,
}

struct Inner {
    adapter: Adapter,
    events: CentralEventSender,
    scanning: AtomicBool,
    next_handle: AtomicU64,
    registry: Mutex<Registry>,
}

impl Inner {
    fn allocate(&self) -> RemoteHandle {
        RemoteHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn emit(&self, event: CentralEvent) {
        if self.events.send(event).is_err() {
            trace!("Central event dropped, receiver closed");
        }
    }

    fn peripheral(&self, device: &DeviceId) -> Result<Peripheral> {
        self.registry
            .lock()
            .peripherals
            .get(device)
            .cloned()
            .ok_or_else(|| ProxyError::Adapter(format!("Unknown device {}", device)))
    }

    fn characteristic(&self, handle: RemoteHandle) -> Result<(Peripheral, Characteristic)> {
        let registry = self.registry.lock();
        let (device, characteristic) = registry
            .characteristics
            .get(&handle)
            .ok_or_else(|| ProxyError::Adapter(format!("Unknown characteristic handle {}", handle.0)))?;
        let peripheral = registry
            .peripherals
            .get(device)
            .ok_or_else(|| ProxyError::Adapter(format!("Unknown device {}", device)))?;
        Ok((peripheral.clone(), characteristic.clone()))
    }

    fn handle_for(&self, device: &DeviceId, uuid: Uuid) -> Option<RemoteHandle> {
        self.registry
            .lock()
            .characteristics
            .iter()
            .find(|(_, (d, c))| d == device && c.uuid == uuid)
            .map(|(handle, _)| *handle)
    }

    fn forget(&self, device: &DeviceId) {
        let mut registry = self.registry.lock();
        registry.services.retain(|_, (d, _)| d != device);
        registry.characteristics.retain(|_, (d, _)| d != device);
        if let Some(task) = registry.notifications.take() {
            task.abort();
        }
    }
}

/// [`CentralAdapter`] on top of the first btleplug adapter
#[derive(Clone)]
pub struct BtleplugCentral {
    inner: Arc<Inner>,
}

impl BtleplugCentral {
    /// Open the first Bluetooth adapter and start forwarding its events
    pub async fn new(events: CentralEventSender) -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProxyError::Adapter("No Bluetooth adapter found".to_string()))?;
        info!("Using Bluetooth adapter: {}", adapter.adapter_info().await?);

        let inner = Arc::new(Inner {
            adapter,
            events,
            scanning: AtomicBool::new(false),
            next_handle: AtomicU64::new(1),
            registry: Mutex::new(Registry::default()),
        });

        let mut stream = inner.adapter.events().await?;
        let listener = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                on_adapter_event(&listener, event).await;
            }
            debug!("Adapter event stream ended");
        });

        on_state_update(&inner, inner.adapter.adapter_state().await?);

        Ok(Self { inner })
    }
}

/// Radio power carried by an adapter state, if known
fn powered(state: &CentralState) -> Option<bool> {
    match state {
        CentralState::PoweredOn => Some(true),
        CentralState::PoweredOff => Some(false),
        _ => None,
    }
}

fn on_state_update(inner: &Inner, state: CentralState) {
    let Some(powered) = powered(&state) else {
        debug!("Adapter state not known yet: {:?}", state);
        return;
    };
    if !powered {
        inner.scanning.store(false, Ordering::Relaxed);
    }
    inner.emit(CentralEvent::PowerChanged { powered });
}

async fn on_adapter_event(inner: &Arc<Inner>, event: BtleEvent) {
    match event {
        BtleEvent::StateUpdate(state) => on_state_update(inner, state),
        BtleEvent::DeviceDiscovered(id) | BtleEvent::DeviceUpdated(id) => {
            if !inner.scanning.load(Ordering::Relaxed) {
                return;
            }
            let Ok(peripheral) = inner.adapter.peripheral(&id).await else {
                return;
            };
            let local_name = match peripheral.properties().await {
                Ok(Some(properties)) => properties.local_name,
                _ => None,
            };
            let device = DeviceId(id.to_string());
            inner
                .registry
                .lock()
                .peripherals
                .insert(device.clone(), peripheral);
            inner.emit(CentralEvent::DeviceDiscovered {
                device,
                name: None,
                local_name,
            });
        }
        BtleEvent::DeviceDisconnected(id) => {
            let device = DeviceId(id.to_string());
            inner.forget(&device);
            inner.emit(CentralEvent::Disconnected {
                device,
                reason: "Remote device disconnected".to_string(),
            });
        }
        _ => {}
    }
}

fn spawn_notification_listener(inner: &Arc<Inner>, device: DeviceId, peripheral: Peripheral) {
    let listener = Arc::clone(inner);
    let task = tokio::spawn(async move {
        let mut stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to open notification stream: {}", e);
                return;
            }
        };
        while let Some(notification) = stream.next().await {
            match listener.handle_for(&device, notification.uuid) {
                Some(characteristic) => listener.emit(CentralEvent::ValueUpdated {
                    characteristic,
                    result: Ok(Bytes::from(notification.value)),
                }),
                None => trace!("Notification from unknown characteristic {}", notification.uuid),
            }
        }
    });
    if let Some(previous) = inner.registry.lock().notifications.replace(task) {
        previous.abort();
    }
}

impl CentralAdapter for BtleplugCentral {
    fn start_scan(&self, target_name: &str) -> Result<()> {
        debug!("Scanning for {}", target_name);
        self.inner.scanning.store(true, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.adapter.start_scan(ScanFilter::default()).await {
                inner.scanning.store(false, Ordering::Relaxed);
                inner.emit(CentralEvent::ScanFailed {
                    reason: e.to_string(),
                });
            }
        });
        Ok(())
    }

    fn stop_scan(&self) {
        self.inner.scanning.store(false, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = inner.adapter.stop_scan().await {
                debug!("Failed to stop scan cleanly: {}", e);
            }
        });
    }

    fn connect(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.inner.peripheral(device)?;
        let inner = Arc::clone(&self.inner);
        let device = device.clone();
        tokio::spawn(async move {
            match peripheral.connect().await {
                Ok(()) => {
                    spawn_notification_listener(&inner, device.clone(), peripheral);
                    inner.emit(CentralEvent::Connected { device });
                }
                Err(e) => inner.emit(CentralEvent::ConnectFailed {
                    device,
                    reason: e.to_string(),
                }),
            }
        });
        Ok(())
    }

    fn disconnect(&self, device: &DeviceId) {
        let Ok(peripheral) = self.inner.peripheral(device) else {
            return;
        };
        self.inner.forget(device);
        tokio::spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                debug!("Failed to disconnect cleanly: {}", e);
            }
        });
    }

    fn discover_services(&self, device: &DeviceId) -> Result<()> {
        let peripheral = self.inner.peripheral(device)?;
        let inner = Arc::clone(&self.inner);
        let device = device.clone();
        tokio::spawn(async move {
            let result = match peripheral.discover_services().await {
                Ok(()) => {
                    let mut discovered = Vec::new();
                    let mut registry = inner.registry.lock();
                    for service in peripheral.services() {
                        let handle = inner.allocate();
                        discovered.push(DiscoveredService {
                            uuid: service.uuid,
                            handle,
                        });
                        registry.services.insert(
                            handle,
                            (device.clone(), service.characteristics.into_iter().collect()),
                        );
                    }
                    Ok(discovered)
                }
                Err(e) => Err(e.to_string()),
            };
            inner.emit(CentralEvent::ServicesDiscovered { device, result });
        });
        Ok(())
    }

    fn discover_characteristics(&self, device: &DeviceId, service: RemoteHandle) -> Result<()> {
        // btleplug discovers characteristics together with their services
        let mut registry = self.inner.registry.lock();
        let characteristics = registry
            .services
            .get(&service)
            .map(|(_, characteristics)| characteristics.clone())
            .ok_or_else(|| ProxyError::Adapter(format!("Unknown service handle {}", service.0)))?;

        let mut discovered = Vec::with_capacity(characteristics.len());
        for characteristic in characteristics {
            let handle = self.inner.allocate();
            discovered.push(DiscoveredCharacteristic {
                uuid: characteristic.uuid,
                handle,
                properties: CharacteristicProperties::from_bits_truncate(
                    characteristic.properties.bits(),
                ),
            });
            registry
                .characteristics
                .insert(handle, (device.clone(), characteristic));
        }
        drop(registry);

        self.inner.emit(CentralEvent::CharacteristicsDiscovered {
            device: device.clone(),
            service,
            result: Ok(discovered),
        });
        Ok(())
    }

    fn read_value(&self, characteristic: RemoteHandle) -> Result<()> {
        let (peripheral, target) = self.inner.characteristic(characteristic)?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = peripheral
                .read(&target)
                .await
                .map(Bytes::from)
                .map_err(|e| e.to_string());
            inner.emit(CentralEvent::ValueUpdated {
                characteristic,
                result,
            });
        });
        Ok(())
    }

    fn write_value(&self, characteristic: RemoteHandle, value: Bytes, mode: WriteMode) -> Result<()> {
        let (peripheral, target) = self.inner.characteristic(characteristic)?;
        let inner = Arc::clone(&self.inner);
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        tokio::spawn(async move {
            let outcome = peripheral.write(&target, &value, write_type).await;
            if let Err(e) = &outcome {
                warn!("Write to {} failed: {}", target.uuid, e);
            }
            if mode == WriteMode::WithResponse {
                let result = match outcome {
                    Ok(()) => AttResult::Success,
                    Err(_) => AttResult::UnlikelyError,
                };
                inner.emit(CentralEvent::WriteCompleted {
                    characteristic,
                    result,
                });
            }
        });
        Ok(())
    }

    fn set_notify(&self, characteristic: RemoteHandle, enabled: bool) -> Result<()> {
        let (peripheral, target) = self.inner.characteristic(characteristic)?;
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let outcome = if enabled {
                peripheral.subscribe(&target).await
            } else {
                peripheral.unsubscribe(&target).await
            };
            inner.emit(CentralEvent::NotifyStateChanged {
                characteristic,
                result: outcome.map(|()| enabled).map_err(|e| e.to_string()),
            });
        });
        Ok(())
    }
}
