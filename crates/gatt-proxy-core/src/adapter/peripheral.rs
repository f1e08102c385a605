//! Peripheral-role adapter backed by BlueZ through bluer
//!
//! BlueZ registers a GATT application as a whole, so every publish
//! re-serves the application with all services published so far. Inbound
//! reads and writes are parked on a oneshot channel until the proxy calls
//! [`PeripheralAdapter::respond`].
//!
//! BlueZ does not report which client enabled notifications, so every
//! subscription is attributed to a single [`BLUEZ_CLIENT`].
//!
//! Registrations complete asynchronously. Handles that arrive after
//! `unpublish_all` or `stop_advertising` are dropped on arrival, which
//! unregisters them from BlueZ again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bluer::adv::{Advertisement, AdvertisementHandle};
use bluer::gatt::local::{
    Application, ApplicationHandle, Characteristic, CharacteristicNotifier, CharacteristicNotify,
    CharacteristicNotifyMethod, CharacteristicRead, CharacteristicReadRequest, CharacteristicWrite,
    CharacteristicWriteMethod, CharacteristicWriteRequest, ReqError, Service,
};
use bluer::gatt::WriteOp;
use bluer::{AdapterEvent, AdapterProperty};
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::registration::{RegistrationSlot, Ticket};
use super::{
    PeripheralAdapter, PeripheralEvent, PeripheralEventSender, PublishedService, ServiceSpec,
    WriteRequest,
};
use crate::error::{ProxyError, Result};
use crate::gatt::{
    AttResult, AttributePermissions, CharacteristicProperties, ClientId, MirrorHandle, RequestId,
};

/// Client id used for BlueZ notification sessions
pub const BLUEZ_CLIENT: &str = "bluez";

type Reply = (AttResult, Option<Bytes>);

#[derive(Default)]
struct State {
    services: Vec<(ServiceSpec, PublishedService)>,
    /// Each publish serves every service so far, superseding earlier applications
    application: RegistrationSlot<ApplicationHandle>,
    advertisement: RegistrationSlot<AdvertisementHandle>,
    pending: HashMap<RequestId, oneshot::Sender<Reply>>,
    notifiers: HashMap<MirrorHandle, mpsc::UnboundedSender<Vec<u8>>>,
}

struct Inner {
    adapter: bluer::Adapter,
    events: PeripheralEventSender,
    next_handle: AtomicU64,
    next_request: AtomicU64,
    state: Mutex<State>,
}

impl Inner {
    fn emit(&self, event: PeripheralEvent) {
        if self.events.send(event).is_err() {
            trace!("Peripheral event dropped, receiver closed");
        }
    }

    fn allocate(&self) -> MirrorHandle {
        MirrorHandle(self.next_handle.fetch_add(1, Ordering::Relaxed))
    }

    fn open_request(&self) -> (RequestId, oneshot::Receiver<Reply>) {
        let request = RequestId(self.next_request.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.state.lock().pending.insert(request, tx);
        (request, rx)
    }

    fn finish_publish(
        &self,
        ticket: Ticket,
        service: Uuid,
        published: PublishedService,
        served: bluer::Result<ApplicationHandle>,
    ) {
        let mut state = self.state.lock();
        if state.application.is_stale(ticket) {
            drop(state);
            debug!("Service {} registered after unpublish, dropping it", service);
            return;
        }

        let (result, stale) = match served {
            Ok(handle) => {
                let stale = state.application.complete(ticket, handle);
                (Ok(published), stale)
            }
            Err(e) => {
                state.services.retain(|(spec, _)| spec.uuid != service);
                (Err(e.to_string()), None)
            }
        };
        drop(state);
        drop(stale);

        self.emit(PeripheralEvent::ServicePublished { service, result });
    }

    fn finish_advertising(&self, ticket: Ticket, advertised: bluer::Result<AdvertisementHandle>) {
        let mut state = self.state.lock();
        if state.advertisement.is_stale(ticket) {
            drop(state);
            debug!("Advertisement registered after stop, dropping it");
            return;
        }

        let (result, stale) = match advertised {
            Ok(handle) => (Ok(()), state.advertisement.complete(ticket, handle)),
            Err(e) => (Err(e.to_string()), None),
        };
        drop(state);
        drop(stale);

        self.emit(PeripheralEvent::AdvertisingStarted { result });
    }
}

/// [`PeripheralAdapter`] on top of the default BlueZ adapter
#[derive(Clone)]
pub struct BluezPeripheral {
    inner: Arc<Inner>,
}

impl BluezPeripheral {
    /// Open and power the default BlueZ adapter
    pub async fn new(events: PeripheralEventSender) -> Result<Self> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        info!("Using BlueZ adapter: {}", adapter.name());

        let inner = Arc::new(Inner {
            adapter,
            events,
            next_handle: AtomicU64::new(1),
            next_request: AtomicU64::new(1),
            state: Mutex::new(State::default()),
        });
        let powered = inner.adapter.is_powered().await?;
        inner.emit(PeripheralEvent::PowerChanged { powered });

        let listener = Arc::clone(&inner);
        tokio::spawn(async move {
            let events = match listener.adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Failed to watch adapter power state: {}", e);
                    return;
                }
            };
            tokio::pin!(events);
            while let Some(event) = events.next().await {
                if let Some(powered) = power_change(&event) {
                    info!("BlueZ adapter powered {}", if powered { "on" } else { "off" });
                    listener.emit(PeripheralEvent::PowerChanged { powered });
                }
            }
            debug!("Adapter event stream ended");
        });

        Ok(Self { inner })
    }
}

fn power_change(event: &AdapterEvent) -> Option<bool> {
    match event {
        AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) => Some(*powered),
        _ => None,
    }
}

fn req_error(result: AttResult) -> ReqError {
    match result {
        AttResult::ReadNotPermitted | AttResult::WriteNotPermitted => ReqError::NotPermitted,
        AttResult::RequestNotSupported => ReqError::NotSupported,
        _ => ReqError::Failed,
    }
}

async fn await_reply(rx: oneshot::Receiver<Reply>) -> std::result::Result<Option<Bytes>, ReqError> {
    match rx.await {
        Ok((AttResult::Success, value)) => Ok(value),
        Ok((result, _)) => Err(req_error(result)),
        Err(_) => Err(ReqError::Failed),
    }
}

fn mirror_characteristic(
    inner: &Arc<Inner>,
    uuid: Uuid,
    handle: MirrorHandle,
    properties: CharacteristicProperties,
    permissions: AttributePermissions,
) -> Characteristic {
    let read = properties.contains(CharacteristicProperties::READ).then(|| {
        let inner = Arc::clone(inner);
        CharacteristicRead {
            read: true,
            fun: Box::new(move |req: CharacteristicReadRequest| {
                let inner = Arc::clone(&inner);
                Box::pin(async move {
                    let (request, rx) = inner.open_request();
                    inner.emit(PeripheralEvent::ReadRequested {
                        request,
                        client: ClientId(req.device_address.to_string()),
                        characteristic: handle,
                    });
                    await_reply(rx)
                        .await
                        .map(|value| value.map(|v| v.to_vec()).unwrap_or_default())
                })
            }),
            ..Default::default()
        }
    });

    let writable = properties.is_writable() && permissions == AttributePermissions::Writeable;
    let write = writable.then(|| {
        let inner = Arc::clone(inner);
        CharacteristicWrite {
            write: properties.contains(CharacteristicProperties::WRITE),
            write_without_response: properties
                .contains(CharacteristicProperties::WRITE_WITHOUT_RESPONSE),
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |value: Vec<u8>, req: CharacteristicWriteRequest| {
                    let inner = Arc::clone(&inner);
                    Box::pin(async move {
                        let response_required = !matches!(req.op_type, WriteOp::Command);
                        let (request, rx) = inner.open_request();
                        inner.emit(PeripheralEvent::WriteRequested {
                            requests: vec![WriteRequest {
                                request,
                                client: ClientId(req.device_address.to_string()),
                                characteristic: handle,
                                value: Bytes::from(value),
                                response_required,
                            }],
                        });
                        if !response_required {
                            inner.state.lock().pending.remove(&request);
                            return Ok(());
                        }
                        await_reply(rx).await.map(|_| ())
                    })
                },
            )),
            ..Default::default()
        }
    });

    let notify = properties.supports_subscription().then(|| {
        let inner = Arc::clone(inner);
        CharacteristicNotify {
            notify: properties.contains(CharacteristicProperties::NOTIFY),
            indicate: properties.contains(CharacteristicProperties::INDICATE),
            method: CharacteristicNotifyMethod::Fun(Box::new(
                move |mut notifier: CharacteristicNotifier| {
                    let inner = Arc::clone(&inner);
                    Box::pin(async move {
                        let (tx, mut rx) = mpsc::unbounded_channel();
                        inner.state.lock().notifiers.insert(handle, tx);
                        let client = ClientId(BLUEZ_CLIENT.to_string());
                        inner.emit(PeripheralEvent::Subscribed {
                            characteristic: handle,
                            client: client.clone(),
                        });

                        loop {
                            let value = tokio::select! {
                                _ = notifier.stopped() => None,
                                value = rx.recv() => value,
                            };
                            let Some(value) = value else { break };
                            if let Err(e) = notifier.notify(value).await {
                                debug!("Notification session ended: {}", e);
                                break;
                            }
                        }

                        inner.state.lock().notifiers.remove(&handle);
                        inner.emit(PeripheralEvent::Unsubscribed {
                            characteristic: handle,
                            client,
                        });
                    })
                },
            )),
            ..Default::default()
        }
    });

    Characteristic {
        uuid,
        read,
        write,
        notify,
        ..Default::default()
    }
}

fn application(inner: &Arc<Inner>, services: &[(ServiceSpec, PublishedService)]) -> Application {
    let services = services
        .iter()
        .map(|(spec, published)| Service {
            uuid: spec.uuid,
            primary: true,
            characteristics: spec
                .characteristics
                .iter()
                .zip(&published.characteristics)
                .map(|(characteristic, (_, handle))| {
                    mirror_characteristic(
                        inner,
                        characteristic.uuid,
                        *handle,
                        characteristic.properties,
                        characteristic.permissions,
                    )
                })
                .collect(),
            ..Default::default()
        })
        .collect();

    Application {
        services,
        ..Default::default()
    }
}

impl PeripheralAdapter for BluezPeripheral {
    fn publish(&self, service: &ServiceSpec) -> Result<()> {
        let published = PublishedService {
            handle: self.inner.allocate(),
            characteristics: service
                .characteristics
                .iter()
                .map(|c| (c.uuid, self.inner.allocate()))
                .collect(),
        };

        let (app, previous, ticket) = {
            let mut state = self.inner.state.lock();
            state.services.push((service.clone(), published.clone()));
            (
                application(&self.inner, &state.services),
                state.application.take(),
                state.application.begin(),
            )
        };
        // Unregister before serving the replacement
        drop(previous);

        let inner = Arc::clone(&self.inner);
        let uuid = service.uuid;
        tokio::spawn(async move {
            let served = inner.adapter.serve_gatt_application(app).await;
            inner.finish_publish(ticket, uuid, published, served);
        });
        Ok(())
    }

    fn unpublish_all(&self) {
        let application = {
            let mut state = self.inner.state.lock();
            state.services.clear();
            state.notifiers.clear();
            // Dropped senders fail parked requests
            state.pending.clear();
            state.application.reset()
        };
        drop(application);
    }

    fn start_advertising(&self, local_name: &str, services: &[Uuid]) -> Result<()> {
        let ticket = {
            let mut state = self.inner.state.lock();
            if state.advertisement.is_live() {
                return Err(ProxyError::Adapter("Already advertising".to_string()));
            }
            state.advertisement.begin()
        };
        let advertisement = Advertisement {
            advertisement_type: bluer::adv::Type::Peripheral,
            service_uuids: services.iter().copied().collect(),
            local_name: Some(local_name.to_string()),
            discoverable: Some(true),
            ..Default::default()
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let advertised = inner.adapter.advertise(advertisement).await;
            inner.finish_advertising(ticket, advertised);
        });
        Ok(())
    }

    fn stop_advertising(&self) {
        let advertisement = {
            self.inner.state.lock().advertisement.reset()
        };
        drop(advertisement);
    }

    fn respond(&self, request: RequestId, result: AttResult, value: Option<Bytes>) {
        match self.inner.state.lock().pending.remove(&request) {
            Some(tx) => {
                if tx.send((result, value)).is_err() {
                    debug!("Requester for {} went away", request);
                }
            }
            None => warn!("No pending request {}", request),
        }
    }

    fn notify(&self, characteristic: MirrorHandle, value: Bytes, clients: &[ClientId]) -> Result<()> {
        trace!("Notifying {} clients", clients.len());
        let state = self.inner.state.lock();
        let tx = state
            .notifiers
            .get(&characteristic)
            .ok_or_else(|| ProxyError::Adapter("No notification session".to_string()))?;
        tx.send(value.to_vec())
            .map_err(|_| ProxyError::Adapter("Notification session closed".to_string()))
    }
}
