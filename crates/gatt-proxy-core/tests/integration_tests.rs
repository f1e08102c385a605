//! Integration tests for the GATT proxy runtime
//!
//! These tests run the full proxy (remote link, local server and relay
//! actors) against mock adapters and verify:
//! - Discovery through to advertising of the mirror
//! - Read, write and notification relaying in both directions
//! - Failing open requests when the remote link drops
//! - Power loss, timeouts and shutdown

use bytes::Bytes;
use gatt_proxy_core::test_utils::{wait_until, CentralCall, PeripheralCall};
use gatt_proxy_core::{
    AttResult, CentralEvent, ClientId, GattProxy, LinkState, MockCentral, MockPeripheral,
    PeripheralEvent, ProxyConfig, ProxyConfigBuilder, ProxyError, ProxyEvent, ProxyEventKind,
    ProxyHandle, ProxyStatus, RequestId, ServerState, StopReason, TestFixture, WriteMode,
    POWERED_OFF_REASON, VERSION,
};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const WAIT: Duration = Duration::from_secs(2);

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    central: MockCentral,
    peripheral: MockPeripheral,
    central_tx: mpsc::UnboundedSender<CentralEvent>,
    peripheral_tx: mpsc::UnboundedSender<PeripheralEvent>,
    handle: ProxyHandle,
    runner: JoinHandle<gatt_proxy_core::Result<()>>,
}

impl Harness {
    fn start(config: ProxyConfig) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let central = MockCentral::new();
        let peripheral = MockPeripheral::new();
        let (central_tx, central_rx) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();

        let (proxy, handle) = GattProxy::new(
            config,
            central.clone(),
            central_rx,
            peripheral.clone(),
            peripheral_rx,
        )
        .unwrap();
        let runner = tokio::spawn(proxy.run());

        Self {
            central,
            peripheral,
            central_tx,
            peripheral_tx,
            handle,
            runner,
        }
    }

    fn remote(&self, event: CentralEvent) {
        self.central_tx.send(event).unwrap();
    }

    fn local(&self, event: PeripheralEvent) {
        self.peripheral_tx.send(event).unwrap();
    }

    async fn expect_central(&self, call: CentralCall) {
        let central = self.central.clone();
        let expected = call.clone();
        assert!(
            wait_until(WAIT, move || central.calls().contains(&expected)).await,
            "central never saw {:?}, calls: {:?}",
            call,
            self.central.calls()
        );
    }

    async fn expect_peripheral(&self, pred: impl Fn(&PeripheralCall) -> bool) {
        let peripheral = self.peripheral.clone();
        assert!(
            wait_until(WAIT, move || peripheral.count(&pred) > 0).await,
            "peripheral call missing, calls: {:?}",
            self.peripheral.calls()
        );
    }

    async fn expect_response(&self, request: u64, result: AttResult, value: Option<&[u8]>) {
        let expected = (RequestId(request), result, value.map(Bytes::copy_from_slice));
        let peripheral = self.peripheral.clone();
        assert!(
            wait_until(WAIT, move || peripheral.responses().contains(&expected)).await,
            "no {:?} response for req#{}, responses: {:?}",
            result,
            request,
            self.peripheral.responses()
        );
    }

    async fn wait_status(&self, pred: impl Fn(&ProxyStatus) -> bool) -> ProxyStatus {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let status = self.handle.status().await.unwrap();
            if pred(&status) {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "status never matched, last: {:?}",
                status
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Walk the proxy from idle to advertising the mirror of `S1`/`C1`
    async fn drive_to_advertising(&self) {
        self.handle.connect().await.unwrap();
        self.expect_central(CentralCall::StartScan(TestFixture::TARGET_NAME.to_string()))
            .await;

        self.remote(TestFixture::device_discovered());
        self.expect_central(CentralCall::Connect(TestFixture::device()))
            .await;

        self.remote(TestFixture::connected());
        self.expect_central(CentralCall::DiscoverServices(TestFixture::device()))
            .await;

        self.remote(TestFixture::services_discovered());
        self.expect_central(CentralCall::DiscoverCharacteristics(
            TestFixture::device(),
            TestFixture::S1_HANDLE,
        ))
        .await;

        self.remote(TestFixture::characteristics_discovered(
            TestFixture::c1_properties(),
        ));
        self.expect_peripheral(|c| matches!(c, PeripheralCall::Publish(_)))
            .await;

        self.local(TestFixture::service_published());
        self.expect_peripheral(|c| matches!(c, PeripheralCall::StartAdvertising { .. }))
            .await;

        self.local(PeripheralEvent::AdvertisingStarted { result: Ok(()) });
        self.wait_status(|s| s.server.state == ServerState::Advertising)
            .await;
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<ProxyEvent>,
    pred: impl Fn(&ProxyEventKind) -> bool,
) -> ProxyEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("event not published")
}

// ============================================================================
// End-to-end relaying
// ============================================================================

#[tokio::test]
async fn test_discovery_to_advertising() {
    let h = Harness::start(TestFixture::config());
    let mut events = h.handle.subscribe_events();

    h.drive_to_advertising().await;

    let status = h.handle.status().await.unwrap();
    assert_eq!(status.link, LinkState::Ready);
    assert_eq!(status.stats.connections, 1);

    let published = h.peripheral.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].uuid, TestFixture::S1);
    assert_eq!(published[0].characteristics[0].uuid, TestFixture::C1);
    assert!(h.peripheral.calls().contains(&PeripheralCall::StartAdvertising {
        name: TestFixture::TARGET_NAME.to_string(),
        services: vec![TestFixture::S1],
    }));

    let ready = next_event(&mut events, |k| matches!(k, ProxyEventKind::LinkReady { .. })).await;
    assert_eq!(ready.describe(), "Connected, discovered 1 services");
    next_event(&mut events, |k| {
        matches!(k, ProxyEventKind::AdvertisingStarted { .. })
    })
    .await;
}

#[tokio::test]
async fn test_read_write_and_notify_relay() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    // Read: answered with the remote value
    h.local(TestFixture::read_requested(1, "alice"));
    h.expect_central(CentralCall::Read(TestFixture::C1_HANDLE))
        .await;
    h.remote(TestFixture::value_updated(&[0x2A]));
    h.expect_response(1, AttResult::Success, Some(&[0x2A])).await;

    // Write: confirmed with the remote result
    h.local(TestFixture::write_requested(2, &[0x01, 0x02], true));
    h.expect_central(CentralCall::Write(
        TestFixture::C1_HANDLE,
        Bytes::from_static(&[0x01, 0x02]),
        WriteMode::WithResponse,
    ))
    .await;
    h.remote(CentralEvent::WriteCompleted {
        characteristic: TestFixture::C1_HANDLE,
        result: AttResult::Success,
    });
    h.expect_response(2, AttResult::Success, None).await;

    // Subscribe: first subscriber enables remote notifications
    h.local(TestFixture::subscribed("alice"));
    h.expect_central(CentralCall::SetNotify(TestFixture::C1_HANDLE, true))
        .await;
    h.remote(CentralEvent::NotifyStateChanged {
        characteristic: TestFixture::C1_HANDLE,
        result: Ok(true),
    });
    h.remote(TestFixture::value_updated(&[0x07]));
    let peripheral = h.peripheral.clone();
    assert!(
        wait_until(WAIT, move || {
            peripheral.notifications().contains(&(
                TestFixture::C1_MIRROR,
                Bytes::from_static(&[0x07]),
                vec![ClientId("alice".to_string())],
            ))
        })
        .await
    );

    // Last unsubscribe disables them again
    h.local(TestFixture::unsubscribed("alice"));
    h.expect_central(CentralCall::SetNotify(TestFixture::C1_HANDLE, false))
        .await;

    let status = h
        .wait_status(|s| s.stats.subscriptions == 1 && s.stats.values_relayed == 2)
        .await;
    assert_eq!(status.stats.reads_forwarded, 1);
    assert_eq!(status.stats.writes_forwarded, 1);
    assert_eq!(status.stats.writes_confirmed, 1);
    assert_eq!(status.server.open_reads, 0);
    assert_eq!(status.server.open_writes, 0);
}

#[tokio::test]
async fn test_write_error_forwarded() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    h.local(TestFixture::write_requested(9, &[0xFF], true));
    h.expect_central(CentralCall::Write(
        TestFixture::C1_HANDLE,
        Bytes::from_static(&[0xFF]),
        WriteMode::WithResponse,
    ))
    .await;
    h.remote(CentralEvent::WriteCompleted {
        characteristic: TestFixture::C1_HANDLE,
        result: AttResult::WriteNotPermitted,
    });

    h.expect_response(9, AttResult::WriteNotPermitted, None).await;
}

#[tokio::test]
async fn test_concurrent_reads_share_one_value() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    h.local(TestFixture::read_requested(1, "alice"));
    h.local(TestFixture::read_requested(2, "bob"));
    h.wait_status(|s| s.stats.reads_forwarded == 2).await;

    h.remote(TestFixture::value_updated(&[0x10]));
    h.expect_response(1, AttResult::Success, Some(&[0x10])).await;
    h.expect_response(2, AttResult::Success, Some(&[0x10])).await;
    assert_eq!(h.peripheral.responses().len(), 2);
}

// ============================================================================
// Disconnection and failure
// ============================================================================

#[tokio::test]
async fn test_remote_disconnect_fails_open_requests() {
    let h = Harness::start(TestFixture::config());
    let mut events = h.handle.subscribe_events();
    h.drive_to_advertising().await;

    h.local(TestFixture::read_requested(5, "bob"));
    h.expect_central(CentralCall::Read(TestFixture::C1_HANDLE))
        .await;

    h.remote(CentralEvent::Disconnected {
        device: TestFixture::device(),
        reason: "Connection lost".to_string(),
    });

    h.expect_response(5, AttResult::UnlikelyError, None).await;
    h.expect_peripheral(|c| *c == PeripheralCall::StopAdvertising)
        .await;
    h.expect_peripheral(|c| *c == PeripheralCall::UnpublishAll)
        .await;

    let status = h
        .wait_status(|s| matches!(s.server.state, ServerState::Stopped(_)))
        .await;
    assert_eq!(status.link, LinkState::Disconnected("Connection lost".to_string()));
    assert_eq!(
        status.server.state,
        ServerState::Stopped(StopReason::Requested("Connection lost".to_string()))
    );
    assert_eq!(status.server.open_reads, 0);

    let event = next_event(&mut events, |k| {
        matches!(k, ProxyEventKind::LinkDisconnected { .. })
    })
    .await;
    assert_eq!(event.describe(), "Disconnected: Connection lost");
}

#[tokio::test]
async fn test_notify_failure_drops_link_and_resets_subscriptions() {
    let h = Harness::start(TestFixture::config());
    let mut events = h.handle.subscribe_events();
    h.drive_to_advertising().await;

    h.central.set_failing(true);
    h.local(TestFixture::subscribed("alice"));
    h.expect_central(CentralCall::SetNotify(TestFixture::C1_HANDLE, true))
        .await;

    let status = h
        .wait_status(|s| matches!(s.server.state, ServerState::Stopped(_)))
        .await;
    let LinkState::Disconnected(reason) = &status.link else {
        panic!("link still {:?}", status.link)
    };
    assert!(reason.starts_with("Failed to change notification state of"));
    assert!(reason.contains("simulated failure"));
    assert_eq!(status.server.subscribed_characteristics, 0);
    assert_eq!(status.stats.operation_failures, 1);
    next_event(&mut events, |k| {
        matches!(k, ProxyEventKind::LinkDisconnected { .. })
    })
    .await;

    // A fresh connection enables remote notifications for the next subscriber
    h.central.set_failing(false);
    h.central.clear();
    h.peripheral.clear();
    h.drive_to_advertising().await;
    h.local(TestFixture::subscribed("bob"));
    h.expect_central(CentralCall::SetNotify(TestFixture::C1_HANDLE, true))
        .await;
}

#[tokio::test]
async fn test_reconnect_after_disconnect() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    h.handle.disconnect("User request").await.unwrap();
    h.wait_status(|s| matches!(s.server.state, ServerState::Stopped(_)))
        .await;
    h.central.clear();
    h.peripheral.clear();

    h.drive_to_advertising().await;
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.stats.connections, 2);
    assert_eq!(status.stats.disconnections, 1);
}

#[tokio::test]
async fn test_peripheral_power_off_drops_link() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    h.local(PeripheralEvent::PowerChanged { powered: false });

    let status = h
        .wait_status(|s| matches!(s.link, LinkState::Disconnected(_)))
        .await;
    assert_eq!(status.link, LinkState::Disconnected(POWERED_OFF_REASON.to_string()));
    assert_eq!(status.server.state, ServerState::Stopped(StopReason::PoweredOff));
    h.expect_central(CentralCall::Disconnect(TestFixture::device()))
        .await;
}

#[tokio::test]
async fn test_advertising_failure_drops_link() {
    let h = Harness::start(TestFixture::config());
    h.handle.connect().await.unwrap();
    h.expect_central(CentralCall::StartScan(TestFixture::TARGET_NAME.to_string()))
        .await;
    h.remote(TestFixture::device_discovered());
    h.remote(TestFixture::connected());
    h.remote(TestFixture::services_discovered());
    h.remote(TestFixture::characteristics_discovered(
        TestFixture::c1_properties(),
    ));
    h.expect_peripheral(|c| matches!(c, PeripheralCall::Publish(_)))
        .await;
    h.local(TestFixture::service_published());
    h.expect_peripheral(|c| matches!(c, PeripheralCall::StartAdvertising { .. }))
        .await;

    h.local(PeripheralEvent::AdvertisingStarted {
        result: Err("busy".to_string()),
    });

    let status = h
        .wait_status(|s| matches!(s.link, LinkState::Disconnected(_)))
        .await;
    let LinkState::Disconnected(reason) = status.link else {
        unreachable!()
    };
    assert!(reason.contains("There was an error in starting the advertising: busy"));
}

#[tokio::test]
async fn test_discovery_timeout_names_missing_characteristics() {
    let config = ProxyConfigBuilder::new()
        .target_name(TestFixture::TARGET_NAME)
        .service(TestFixture::S1, [TestFixture::C1])
        .discovery_timeout(Duration::from_millis(50))
        .build();
    let h = Harness::start(config);

    h.handle.connect().await.unwrap();
    h.expect_central(CentralCall::StartScan(TestFixture::TARGET_NAME.to_string()))
        .await;
    h.remote(TestFixture::device_discovered());
    h.remote(TestFixture::connected());

    let status = h
        .wait_status(|s| matches!(s.link, LinkState::Disconnected(_)))
        .await;
    let LinkState::Disconnected(reason) = status.link else {
        unreachable!()
    };
    assert!(reason.contains("discovery timed out after 50ms"));
    assert!(reason.contains(&TestFixture::c1().to_string()));

    // The never-published server still reports its stop
    let status = h
        .wait_status(|s| matches!(s.server.state, ServerState::Stopped(_)))
        .await;
    assert_eq!(
        status.server.state,
        ServerState::Stopped(StopReason::Requested(reason))
    );
    assert!(h.peripheral.calls().is_empty());
}

#[tokio::test]
async fn test_incomplete_topology_never_publishes() {
    let h = Harness::start(TestFixture::two_service_config());
    let mut events = h.handle.subscribe_events();

    h.handle.connect().await.unwrap();
    h.expect_central(CentralCall::StartScan(TestFixture::TARGET_NAME.to_string()))
        .await;
    h.remote(TestFixture::device_discovered());
    h.remote(TestFixture::connected());
    // Only S1 present on the remote device
    h.remote(TestFixture::services_discovered());
    h.remote(TestFixture::characteristics_discovered(
        TestFixture::c1_properties(),
    ));

    // Link never reports ready, so nothing is published
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.peripheral.published().is_empty());
    let status = h.handle.status().await.unwrap();
    assert_eq!(status.link, LinkState::DiscoveringCharacteristics);

    h.handle.disconnect("Gave up").await.unwrap();
    next_event(&mut events, |k| {
        matches!(k, ProxyEventKind::LinkDisconnected { reason } if reason == "Gave up")
    })
    .await;
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_connect_is_idempotent() {
    let h = Harness::start(TestFixture::config());
    h.handle.connect().await.unwrap();
    h.handle.connect().await.unwrap();
    h.wait_status(|s| s.link == LinkState::Scanning).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(
        h.central
            .count(|c| matches!(c, CentralCall::StartScan(_))),
        1
    );
}

#[tokio::test]
async fn test_shutdown_stops_runtime() {
    let h = Harness::start(TestFixture::config());
    h.drive_to_advertising().await;

    h.handle.shutdown().await.unwrap();
    let result = tokio::time::timeout(WAIT, h.runner).await.unwrap().unwrap();
    assert!(result.is_ok());

    // Both actors tear down on exit
    assert!(h.central.calls().contains(&CentralCall::Disconnect(TestFixture::device())));
    assert!(h.peripheral.calls().contains(&PeripheralCall::UnpublishAll));
    assert!(matches!(
        h.handle.status().await,
        Err(ProxyError::ChannelClosed)
    ));
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let (_central_tx, central_rx) = mpsc::unbounded_channel();
    let (_peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();
    let config = ProxyConfigBuilder::new().target_name("Nothing").build();

    let result = GattProxy::new(
        config,
        MockCentral::new(),
        central_rx,
        MockPeripheral::new(),
        peripheral_rx,
    );
    assert!(matches!(result, Err(ProxyError::InvalidConfig(_))));
}

#[test]
fn test_config_from_json() {
    let json = format!(
        r#"{{
            "target_name": "{}",
            "services": [{{ "uuid": "{}", "characteristics": ["{}"] }}],
            "link": {{ "discovery_timeout": "5s" }}
        }}"#,
        TestFixture::TARGET_NAME,
        TestFixture::S1,
        TestFixture::C1
    );
    let config = ProxyConfig::from_json_str(&json).unwrap();
    assert_eq!(config.advertised_name(), TestFixture::TARGET_NAME);
    assert_eq!(config.link.discovery_timeout, Duration::from_secs(5));
    assert!(config.validate().is_ok());
}

#[test]
fn test_version() {
    assert!(!VERSION.is_empty());
}
