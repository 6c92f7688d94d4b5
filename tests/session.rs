//! End-to-end session scenarios against a scripted platform adapter.
//!
//! The clock is paused (`start_paused`), so timer-driven behavior (scan
//! windows, connect deadlines, ack timeouts, retry backoff) runs
//! deterministically and instantly.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use aroma_bridge::core::bluetooth::constants::{
    UUID_CONFIG_WRITE_CHAR, UUID_DIFFUSER_SERVICE, UUID_STATUS_NOTIFY_CHAR,
};
use aroma_bridge::{
    AdapterEvent, AdapterState, BleAdapter, DeviceId, DeviceStatus, Error, SessionConfig,
    SessionController, SessionEvent, SessionHandle, SessionState, WriteToken,
};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan,
    StopScan,
    Connect(DeviceId),
    Disconnect(DeviceId),
    DiscoverServices(DeviceId),
    DiscoverCharacteristics(DeviceId, Uuid),
    SubscribeStatus(DeviceId, Uuid),
}

#[derive(Debug, Clone)]
struct WriteRecord {
    characteristic: Uuid,
    value: Vec<u8>,
    token: WriteToken,
    at: Instant,
}

/// Scripted stand-in for the platform Bluetooth stack. Records every call;
/// write completions are played back from a script (or withheld entirely so
/// the test can inject them, or let the ack deadline fire).
struct MockAdapter {
    state: Mutex<AdapterState>,
    events: mpsc::UnboundedSender<AdapterEvent>,
    calls: Mutex<Vec<Call>>,
    writes: Mutex<Vec<WriteRecord>>,
    write_script: Mutex<VecDeque<Result<(), String>>>,
    refuse_scan: Mutex<bool>,
}

impl MockAdapter {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn recorded_writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().unwrap().clone()
    }

    fn script_write_results(&self, results: impl IntoIterator<Item = Result<(), String>>) {
        self.write_script.lock().unwrap().extend(results);
    }

    fn refuse_next_scan(&self) {
        *self.refuse_scan.lock().unwrap() = true;
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    fn current_state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    async fn start_scan(&self) -> Result<(), Error> {
        self.record(Call::StartScan);
        if *self.refuse_scan.lock().unwrap() {
            return Err(Error::ScanAlreadyActive);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), Error> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<(), Error> {
        self.record(Call::Connect(id.clone()));
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<(), Error> {
        self.record(Call::Disconnect(id.clone()));
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<(), Error> {
        self.record(Call::DiscoverServices(id.clone()));
        Ok(())
    }

    async fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<(), Error> {
        self.record(Call::DiscoverCharacteristics(id.clone(), service));
        Ok(())
    }

    async fn write_characteristic(
        &self,
        _id: &DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        token: WriteToken,
    ) -> Result<(), Error> {
        self.writes.lock().unwrap().push(WriteRecord {
            characteristic,
            value,
            token,
            at: Instant::now(),
        });
        if let Some(result) = self.write_script.lock().unwrap().pop_front() {
            let _ = self.events.send(AdapterEvent::WriteCompleted { token, result });
        }
        Ok(())
    }

    async fn subscribe_status(&self, id: &DeviceId, characteristic: Uuid) -> Result<(), Error> {
        self.record(Call::SubscribeStatus(id.clone(), characteristic));
        Ok(())
    }
}

fn spawn_session(
    initial: AdapterState,
) -> (
    Arc<MockAdapter>,
    SessionHandle,
    mpsc::UnboundedReceiver<SessionEvent>,
    mpsc::UnboundedSender<AdapterEvent>,
) {
    let (adapter_tx, adapter_rx) = mpsc::unbounded_channel();
    let mock = Arc::new(MockAdapter {
        state: Mutex::new(initial),
        events: adapter_tx.clone(),
        calls: Mutex::new(Vec::new()),
        writes: Mutex::new(Vec::new()),
        write_script: Mutex::new(VecDeque::new()),
        refuse_scan: Mutex::new(false),
    });
    let (session, events) =
        SessionController::spawn(mock.clone(), adapter_rx, SessionConfig::default());
    (mock, session, events, adapter_tx)
}

async fn next_event(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
    timeout(Duration::from_secs(120), events.recv())
        .await
        .expect("timed out waiting for session event")
        .expect("session task gone")
}

async fn expect_state(events: &mut mpsc::UnboundedReceiver<SessionEvent>, expected: SessionState) {
    match next_event(events).await {
        SessionEvent::StateChanged(state) => assert_eq!(state, expected),
        other => panic!("expected transition to {:?}, got {:?}", expected, other),
    }
}

async fn expect_scan_complete(events: &mut mpsc::UnboundedReceiver<SessionEvent>) {
    match next_event(events).await {
        SessionEvent::ScanComplete => {}
        other => panic!("expected scan completion, got {:?}", other),
    }
}

/// Lets the session task drain its queue without advancing the clock.
async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

fn sighting(id: &str, name: &str, rssi: i16) -> AdapterEvent {
    AdapterEvent::DeviceDiscovered {
        id: id.to_string(),
        name: Some(name.to_string()),
        rssi: Some(rssi),
    }
}

/// Drives the session from `Idle` all the way to `Ready` on device
/// "dev-1" / "AromaX".
async fn to_ready(
    session: &SessionHandle,
    events: &mut mpsc::UnboundedReceiver<SessionEvent>,
    injector: &mpsc::UnboundedSender<AdapterEvent>,
) -> DeviceId {
    session.start_scan().unwrap();
    expect_state(events, SessionState::Scanning).await;

    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    let id = match next_event(events).await {
        SessionEvent::DeviceDiscovered(handle) => handle.id,
        other => panic!("expected discovery, got {:?}", other),
    };

    session.select_device(id.clone()).unwrap();
    expect_scan_complete(events).await;
    expect_state(events, SessionState::Connecting).await;

    injector
        .send(AdapterEvent::Connected { id: id.clone() })
        .unwrap();
    expect_state(events, SessionState::Discovering).await;

    injector
        .send(AdapterEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![Uuid::from_u128(0x180f), UUID_DIFFUSER_SERVICE],
        })
        .unwrap();
    injector
        .send(AdapterEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service: UUID_DIFFUSER_SERVICE,
            characteristics: vec![UUID_STATUS_NOTIFY_CHAR, UUID_CONFIG_WRITE_CHAR],
        })
        .unwrap();
    expect_state(events, SessionState::Ready).await;
    id
}

#[tokio::test(start_paused = true)]
async fn full_session_happy_path() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    let id = to_ready(&session, &mut events, &injector).await;

    mock.script_write_results([Ok(())]);
    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    match next_event(&mut events).await {
        SessionEvent::ConfigDelivered => {}
        other => panic!("expected delivery, got {:?}", other),
    }
    expect_state(&mut events, SessionState::Ready).await;

    // Exactly one state event per transition; nothing extra queued.
    settle().await;
    assert!(events.try_recv().is_err());

    // The wire record matches the documented layout.
    let writes = mock.recorded_writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].value, vec![60, 45]);
    assert_eq!(writes[0].characteristic, UUID_CONFIG_WRITE_CHAR);

    // Discovery ran both phases and the status characteristic was armed.
    let calls = mock.calls();
    assert!(calls.contains(&Call::DiscoverServices(id.clone())));
    assert!(calls.contains(&Call::DiscoverCharacteristics(id.clone(), UUID_DIFFUSER_SERVICE)));
    assert!(calls.contains(&Call::SubscribeStatus(id, UUID_STATUS_NOTIFY_CHAR)));
}

#[tokio::test(start_paused = true)]
async fn repeated_sightings_update_in_place() {
    let (_mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;

    injector.send(sighting("dev-1", "AromaX", -70)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(handle) => assert_eq!(handle.rssi, Some(-70)),
        other => panic!("expected discovery, got {:?}", other),
    }

    injector.send(sighting("dev-1", "AromaX", -42)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::DeviceUpdated(handle) => assert_eq!(handle.rssi, Some(-42)),
        other => panic!("expected in-place update, got {:?}", other),
    }

    // Devices that do not match the filter never surface.
    injector.send(sighting("dev-2", "Some Headset", -42)).unwrap();
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn scan_window_auto_stops_and_is_restartable() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;

    let started = Instant::now();
    expect_scan_complete(&mut events).await;
    expect_state(&mut events, SessionState::Idle).await;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(mock.calls().contains(&Call::StopScan));

    // A fresh scan works after the window expired on its own.
    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(_) => {}
        other => panic!("expected discovery, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn restarting_scan_closes_prior_window() {
    let (_mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(_) => {}
        other => panic!("expected discovery, got {:?}", other),
    }

    // Implicit restart: the prior sequence closes, the state stays Scanning.
    session.start_scan().unwrap();
    expect_scan_complete(&mut events).await;
    settle().await;
    assert!(events.try_recv().is_err());

    // The new window starts empty; the same device is New again.
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(_) => {}
        other => panic!("expected rediscovery, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn scan_rejected_while_radio_off() {
    let (mock, session, mut events, _injector) = spawn_session(AdapterState::PoweredOff);

    session.start_scan().unwrap();
    expect_state(
        &mut events,
        SessionState::Failed(Error::AdapterUnavailable(AdapterState::PoweredOff)),
    )
    .await;
    // The platform was never asked to scan.
    assert!(!mock.calls().contains(&Call::StartScan));

    // Failed is user-recoverable.
    session.reset().unwrap();
    expect_state(&mut events, SessionState::Idle).await;
}

#[tokio::test(start_paused = true)]
async fn platform_scan_refusal_is_surfaced_verbatim() {
    let (mock, session, mut events, _injector) = spawn_session(AdapterState::PoweredOn);

    mock.refuse_next_scan();
    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Failed(Error::ScanAlreadyActive)).await;
}

#[tokio::test(start_paused = true)]
async fn connect_timeout_cancels_attempt_and_ignores_late_confirmation() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    let id = match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(handle) => handle.id,
        other => panic!("expected discovery, got {:?}", other),
    };

    session.select_device(id.clone()).unwrap();
    expect_scan_complete(&mut events).await;
    expect_state(&mut events, SessionState::Connecting).await;

    // The platform never confirms; the deadline fires.
    let started = Instant::now();
    expect_state(&mut events, SessionState::Failed(Error::ConnectTimeout)).await;
    assert!(started.elapsed() >= Duration::from_secs(10));
    assert!(mock.calls().contains(&Call::Disconnect(id.clone())));

    // A late confirmation must not resurrect the cancelled attempt.
    injector.send(AdapterEvent::Connected { id: id.clone() }).unwrap();
    settle().await;
    assert!(events.try_recv().is_err());
    // The stray link is released, not adopted.
    assert!(
        mock.calls()
            .iter()
            .filter(|call| **call == Call::Disconnect(id.clone()))
            .count()
            >= 2
    );
}

#[tokio::test(start_paused = true)]
async fn connect_rejection_fails_the_session() {
    let (_mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    let id = match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(handle) => handle.id,
        other => panic!("expected discovery, got {:?}", other),
    };
    session.select_device(id.clone()).unwrap();
    expect_scan_complete(&mut events).await;
    expect_state(&mut events, SessionState::Connecting).await;

    injector
        .send(AdapterEvent::ConnectFailed {
            id,
            reason: "peer busy".to_string(),
        })
        .unwrap();
    expect_state(
        &mut events,
        SessionState::Failed(Error::ConnectRejected("peer busy".to_string())),
    )
    .await;
}

#[tokio::test(start_paused = true)]
async fn missing_service_fails_and_disconnects() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    let id = match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(handle) => handle.id,
        other => panic!("expected discovery, got {:?}", other),
    };
    session.select_device(id.clone()).unwrap();
    expect_scan_complete(&mut events).await;
    expect_state(&mut events, SessionState::Connecting).await;
    injector.send(AdapterEvent::Connected { id: id.clone() }).unwrap();
    expect_state(&mut events, SessionState::Discovering).await;

    injector
        .send(AdapterEvent::ServicesDiscovered {
            id: id.clone(),
            services: vec![Uuid::from_u128(0x1800)],
        })
        .unwrap();
    expect_state(&mut events, SessionState::Failed(Error::ServiceNotFound)).await;
    assert!(mock.calls().contains(&Call::Disconnect(id)));
}

#[tokio::test(start_paused = true)]
async fn stalled_discovery_times_out() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);

    session.start_scan().unwrap();
    expect_state(&mut events, SessionState::Scanning).await;
    injector.send(sighting("dev-1", "AromaX", -50)).unwrap();
    let id = match next_event(&mut events).await {
        SessionEvent::DeviceDiscovered(handle) => handle.id,
        other => panic!("expected discovery, got {:?}", other),
    };
    session.select_device(id.clone()).unwrap();
    expect_scan_complete(&mut events).await;
    expect_state(&mut events, SessionState::Connecting).await;
    injector.send(AdapterEvent::Connected { id: id.clone() }).unwrap();
    expect_state(&mut events, SessionState::Discovering).await;

    // The platform never reports any services.
    expect_state(&mut events, SessionState::Failed(Error::DiscoveryTimeout)).await;
    assert!(mock.calls().contains(&Call::Disconnect(id)));
}

#[tokio::test(start_paused = true)]
async fn delivery_retries_with_linear_backoff() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    to_ready(&session, &mut events, &injector).await;

    mock.script_write_results([
        Err("nack".to_string()),
        Err("nack".to_string()),
        Ok(()),
    ]);
    session.send_config(80, 10).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    match next_event(&mut events).await {
        SessionEvent::ConfigDelivered => {}
        other => panic!("expected delivery, got {:?}", other),
    }
    expect_state(&mut events, SessionState::Ready).await;

    let writes = mock.recorded_writes();
    assert_eq!(writes.len(), 3);
    for write in &writes {
        assert_eq!(write.value, vec![0x50, 0x0A]);
    }
    // Every attempt carries a fresh correlation token.
    assert_ne!(writes[0].token, writes[1].token);
    assert_ne!(writes[1].token, writes[2].token);

    // Linear backoff: ~1s, then ~2s between attempts.
    let first_gap = writes[1].at - writes[0].at;
    let second_gap = writes[2].at - writes[1].at;
    assert!(first_gap >= Duration::from_secs(1) && first_gap < Duration::from_millis(1500));
    assert!(second_gap >= Duration::from_secs(2) && second_gap < Duration::from_millis(2500));
}

#[tokio::test(start_paused = true)]
async fn delivery_failure_after_exhausted_retries_is_non_fatal() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    to_ready(&session, &mut events, &injector).await;

    mock.script_write_results([
        Err("nack".to_string()),
        Err("nack".to_string()),
        Err("nack".to_string()),
    ]);
    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    match next_event(&mut events).await {
        SessionEvent::ConfigFailed {
            reason: Error::DeliveryFailed { last_error },
        } => assert_eq!(last_error, "nack"),
        other => panic!("expected delivery failure, got {:?}", other),
    }
    // The connection stays usable.
    expect_state(&mut events, SessionState::Ready).await;
    assert_eq!(mock.recorded_writes().len(), 3);

    mock.script_write_results([Ok(())]);
    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    match next_event(&mut events).await {
        SessionEvent::ConfigDelivered => {}
        other => panic!("expected delivery, got {:?}", other),
    }
    expect_state(&mut events, SessionState::Ready).await;
}

#[tokio::test(start_paused = true)]
async fn silent_device_exhausts_ack_deadlines() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    to_ready(&session, &mut events, &injector).await;

    // No scripted completions: every attempt waits out the 5s ack deadline,
    // with 1s and 2s backoff in between.
    let started = Instant::now();
    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    match next_event(&mut events).await {
        SessionEvent::ConfigFailed {
            reason: Error::DeliveryFailed { last_error },
        } => assert_eq!(last_error, "acknowledgement timed out"),
        other => panic!("expected delivery failure, got {:?}", other),
    }
    expect_state(&mut events, SessionState::Ready).await;
    assert_eq!(mock.recorded_writes().len(), 3);
    assert!(started.elapsed() >= Duration::from_secs(18));
}

#[tokio::test(start_paused = true)]
async fn second_send_fails_fast_while_write_pending() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    to_ready(&session, &mut events, &injector).await;

    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    settle().await;

    session.send_config(30, 20).unwrap();
    match next_event(&mut events).await {
        SessionEvent::ConfigFailed {
            reason: Error::WriteInProgress,
        } => {}
        other => panic!("expected fail-fast rejection, got {:?}", other),
    }

    // The in-flight write is unaffected.
    let token = mock.recorded_writes()[0].token;
    injector
        .send(AdapterEvent::WriteCompleted {
            token,
            result: Ok(()),
        })
        .unwrap();
    match next_event(&mut events).await {
        SessionEvent::ConfigDelivered => {}
        other => panic!("expected delivery, got {:?}", other),
    }
    expect_state(&mut events, SessionState::Ready).await;
    assert_eq!(mock.recorded_writes().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn peer_disconnect_during_send_discards_late_ack() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    let id = to_ready(&session, &mut events, &injector).await;

    session.send_config(60, 45).unwrap();
    expect_state(&mut events, SessionState::Sending).await;
    settle().await;
    let token = mock.recorded_writes()[0].token;

    injector.send(AdapterEvent::Disconnected { id }).unwrap();
    expect_state(&mut events, SessionState::Idle).await;

    // The in-flight write's ack arrives after the cleanup.
    injector
        .send(AdapterEvent::WriteCompleted {
            token,
            result: Ok(()),
        })
        .unwrap();
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn local_and_peer_disconnect_share_the_cleanup_path() {
    let (_mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    to_ready(&session, &mut events, &injector).await;

    session.disconnect().unwrap();
    expect_state(&mut events, SessionState::Disconnecting).await;
    expect_state(&mut events, SessionState::Idle).await;

    // Disconnecting again is a no-op.
    session.disconnect().unwrap();
    settle().await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn radio_loss_fails_the_active_session() {
    let (mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    let id = to_ready(&session, &mut events, &injector).await;

    injector
        .send(AdapterEvent::StateChanged(AdapterState::PoweredOff))
        .unwrap();
    expect_state(
        &mut events,
        SessionState::Failed(Error::AdapterUnavailable(AdapterState::PoweredOff)),
    )
    .await;
    assert!(mock.calls().contains(&Call::Disconnect(id)));
}

#[tokio::test(start_paused = true)]
async fn status_notifications_reach_the_observer() {
    let (_mock, session, mut events, injector) = spawn_session(AdapterState::PoweredOn);
    let id = to_ready(&session, &mut events, &injector).await;

    injector
        .send(AdapterEvent::StatusNotification {
            id: id.clone(),
            characteristic: UUID_STATUS_NOTIFY_CHAR,
            value: vec![60, 45],
        })
        .unwrap();
    match next_event(&mut events).await {
        SessionEvent::StatusReported(status) => {
            assert_eq!(
                status,
                DeviceStatus {
                    intensity: 60,
                    interval: 45
                }
            )
        }
        other => panic!("expected status report, got {:?}", other),
    }

    // Malformed frames are dropped.
    injector
        .send(AdapterEvent::StatusNotification {
            id,
            characteristic: UUID_STATUS_NOTIFY_CHAR,
            value: vec![200, 45],
        })
        .unwrap();
    settle().await;
    assert!(events.try_recv().is_err());
}
