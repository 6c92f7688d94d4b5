//! The session controller: a single-task state machine composing the
//! monitor, scanner, connection manager, resolver and delivery pipeline.
//!
//! All mutable session state lives inside one spawned task fed by one
//! unbounded queue. UI intents, platform adapter events and timer
//! expirations are all messages on that queue, so no two callbacks ever
//! mutate the state concurrently and the controller needs no locks.
//! Timers are spawned sleeps that post a generation- or token-tagged
//! message back into the queue; cancelling an operation invalidates its
//! tag, which makes the late message inert.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::sleep;

use crate::core::bluetooth::constants::{
    CONNECT_TIMEOUT_SECS, DEFAULT_SCAN_WINDOW_SECS, DIFFUSER_NAME, DISCOVERY_TIMEOUT_SECS,
    MIN_RSSI_THRESHOLD, UUID_CONFIG_WRITE_CHAR, UUID_DIFFUSER_SERVICE, UUID_STATUS_NOTIFY_CHAR,
    WRITE_ACK_TIMEOUT_SECS,
};
use crate::core::bluetooth::{
    AdapterEvent, AdapterMonitor, AdapterState, BleAdapter, CharacteristicHandle,
    ConfigPayload, ConnectedDeviceState, ConnectionManager, DeliveryPipeline, DeliveryStep,
    DeviceHandle, DeviceId, DeviceStatus, ResolveStep, Resolver, Scanner, Sighting,
    StatusListener, WriteToken,
};
use crate::error::{Error, Result};

/// Where the session currently is. Owned exclusively by the controller;
/// every transition is announced through [`SessionEvent::StateChanged`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Scanning,
    Connecting,
    Discovering,
    Ready,
    Sending,
    Disconnecting,
    /// User-recoverable: an explicit reset returns the session to `Idle`.
    Failed(Error),
}

/// Events delivered to the UI observer. The observer renders these; it has
/// no access to internal state.
#[derive(Debug, Clone, Serialize)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// First sighting of a device in the current scan window.
    DeviceDiscovered(DeviceHandle),
    /// Re-sighting; the handle was updated in place (latest RSSI/name win).
    DeviceUpdated(DeviceHandle),
    /// The scan window closed (deadline, stop request, or restart).
    ScanComplete,
    /// The device acknowledged the configuration write.
    ConfigDelivered,
    /// A configuration send failed; the session itself is unaffected.
    ConfigFailed { reason: Error },
    /// The device reported its applied settings.
    StatusReported(DeviceStatus),
}

/// Tunable session behavior. The GATT contract itself (service and
/// characteristic UUIDs, wire format) is fixed in
/// [`constants`](crate::core::bluetooth::constants).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Advertised-name fragment identifying the diffuser,
    /// matched case-insensitively.
    pub device_name: String,
    /// Sightings weaker than this are ignored.
    pub min_rssi: i16,
    /// How long discovery runs before auto-stopping.
    pub scan_window: Duration,
    /// Deadline for an unconfirmed connection attempt.
    pub connect_timeout: Duration,
    /// Bounded wait for two-phase GATT discovery.
    pub discovery_timeout: Duration,
    /// Deadline for a write acknowledgement.
    pub ack_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device_name: DIFFUSER_NAME.to_string(),
            min_rssi: MIN_RSSI_THRESHOLD,
            scan_window: Duration::from_secs(DEFAULT_SCAN_WINDOW_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            discovery_timeout: Duration::from_secs(DISCOVERY_TIMEOUT_SECS),
            ack_timeout: Duration::from_secs(WRITE_ACK_TIMEOUT_SECS),
        }
    }
}

#[derive(Debug)]
enum Intent {
    StartScan,
    StopScan,
    SelectDevice(DeviceId),
    SendConfig(ConfigPayload),
    Disconnect,
    Reset,
    Shutdown,
}

/// Everything that enters the session queue.
#[derive(Debug)]
enum SessionMsg {
    Intent(Intent),
    Adapter(AdapterEvent),
    ScanWindowElapsed { generation: u64 },
    ConnectDeadline { generation: u64 },
    DiscoveryDeadline { generation: u64 },
    AckDeadline { token: WriteToken },
    RetryDelay { token: WriteToken },
}

/// A clonable handle that sends intents into the session task.
#[derive(Clone)]
pub struct SessionHandle {
    messages: mpsc::UnboundedSender<SessionMsg>,
}

impl SessionHandle {
    pub fn start_scan(&self) -> Result<()> {
        self.send(Intent::StartScan)
    }

    pub fn stop_scan(&self) -> Result<()> {
        self.send(Intent::StopScan)
    }

    pub fn select_device(&self, id: impl Into<DeviceId>) -> Result<()> {
        self.send(Intent::SelectDevice(id.into()))
    }

    /// Validates the configuration and queues it for delivery. Range errors
    /// are returned here, before anything touches the radio.
    pub fn send_config(&self, intensity: u8, interval: u8) -> Result<()> {
        let payload = ConfigPayload::new(intensity, interval)?;
        self.send(Intent::SendConfig(payload))
    }

    pub fn disconnect(&self) -> Result<()> {
        self.send(Intent::Disconnect)
    }

    /// Returns a failed session to `Idle`.
    pub fn reset(&self) -> Result<()> {
        self.send(Intent::Reset)
    }

    /// Tears the session down and stops the controller task.
    pub fn shutdown(&self) -> Result<()> {
        self.send(Intent::Shutdown)
    }

    fn send(&self, intent: Intent) -> Result<()> {
        self.messages
            .send(SessionMsg::Intent(intent))
            .map_err(|_| Error::SessionClosed)
    }
}

pub struct SessionController {
    adapter: Arc<dyn BleAdapter>,
    config: SessionConfig,
    state: SessionState,
    monitor: AdapterMonitor,
    scanner: Scanner,
    connection: ConnectionManager,
    resolver: Resolver,
    delivery: DeliveryPipeline,
    status: StatusListener,
    /// Handle of the device being connected to, promoted into
    /// `connected_state` once resolution finishes.
    pending_device: Option<DeviceHandle>,
    connected_state: Option<ConnectedDeviceState>,
    events: mpsc::UnboundedSender<SessionEvent>,
    /// Timer tasks post their expirations back into the session queue.
    timers: mpsc::UnboundedSender<SessionMsg>,
}

impl SessionController {
    /// Starts the session task. Returns the intent handle and the observer
    /// event stream.
    pub fn spawn(
        adapter: Arc<dyn BleAdapter>,
        mut adapter_events: mpsc::UnboundedReceiver<AdapterEvent>,
        config: SessionConfig,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (messages_tx, messages_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        // Every platform callback enters the same queue as intents and
        // timers.
        let forward = messages_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = adapter_events.recv().await {
                if forward.send(SessionMsg::Adapter(event)).is_err() {
                    break;
                }
            }
        });

        let controller = Self {
            monitor: AdapterMonitor::new(adapter.current_state()),
            adapter,
            config,
            state: SessionState::Idle,
            scanner: Scanner::new(),
            connection: ConnectionManager::new(),
            resolver: Resolver::new(),
            delivery: DeliveryPipeline::new(),
            status: StatusListener::new(),
            pending_device: None,
            connected_state: None,
            events: events_tx,
            timers: messages_tx.clone(),
        };
        tokio::spawn(controller.run(messages_rx));

        (
            SessionHandle {
                messages: messages_tx,
            },
            events_rx,
        )
    }

    async fn run(mut self, mut messages: mpsc::UnboundedReceiver<SessionMsg>) {
        info!("Session controller started");
        while let Some(msg) = messages.recv().await {
            if matches!(msg, SessionMsg::Intent(Intent::Shutdown)) {
                self.halt_scan().await;
                self.abandon_connection().await;
                break;
            }
            self.handle_msg(msg).await;
        }
        info!("Session controller stopped");
    }

    async fn handle_msg(&mut self, msg: SessionMsg) {
        match msg {
            SessionMsg::Intent(intent) => self.handle_intent(intent).await,
            SessionMsg::Adapter(event) => self.handle_adapter_event(event).await,
            SessionMsg::ScanWindowElapsed { generation } => {
                if self.scanner.is_active() && generation == self.scanner.generation() {
                    self.halt_scan().await;
                    if self.state == SessionState::Scanning {
                        self.set_state(SessionState::Idle);
                    }
                }
            }
            SessionMsg::ConnectDeadline { generation } => self.connect_deadline(generation).await,
            SessionMsg::DiscoveryDeadline { generation } => {
                if self.resolver.deadline_elapsed(generation) {
                    self.abandon_connection().await;
                    self.fail(Error::DiscoveryTimeout);
                }
            }
            SessionMsg::AckDeadline { token } => {
                if let Some(step) = self.delivery.ack_deadline_elapsed(token) {
                    self.apply_delivery_step(step).await;
                }
            }
            SessionMsg::RetryDelay { token } => {
                if let Some(step) = self.delivery.retry_delay_elapsed(token) {
                    self.apply_delivery_step(step).await;
                }
            }
        }
    }

    async fn handle_intent(&mut self, intent: Intent) {
        match intent {
            Intent::StartScan => self.intent_start_scan().await,
            Intent::StopScan => {
                if self.halt_scan().await && self.state == SessionState::Scanning {
                    self.set_state(SessionState::Idle);
                }
            }
            Intent::SelectDevice(id) => self.intent_select_device(id).await,
            Intent::SendConfig(payload) => self.intent_send_config(payload).await,
            Intent::Disconnect => self.intent_disconnect().await,
            Intent::Reset => self.intent_reset().await,
            Intent::Shutdown => unreachable!("handled in run()"),
        }
    }

    async fn handle_adapter_event(&mut self, event: AdapterEvent) {
        match event {
            AdapterEvent::StateChanged(state) => self.adapter_state_changed(state).await,
            AdapterEvent::DeviceDiscovered { id, name, rssi } => {
                match self.scanner.record_sighting(
                    id,
                    name,
                    rssi,
                    &self.config.device_name,
                    self.config.min_rssi,
                ) {
                    Some(Sighting::New(handle)) => {
                        self.emit(SessionEvent::DeviceDiscovered(handle))
                    }
                    Some(Sighting::Updated(handle)) => {
                        self.emit(SessionEvent::DeviceUpdated(handle))
                    }
                    None => {}
                }
            }
            AdapterEvent::Connected { id } => self.on_connected(id).await,
            AdapterEvent::ConnectFailed { id, reason } => {
                if self.connection.fail(&id) {
                    self.pending_device = None;
                    self.fail(Error::ConnectRejected(reason));
                } else {
                    debug!("Ignoring stale connection failure for {}", id);
                }
            }
            AdapterEvent::Disconnected { id } => self.on_disconnected(id).await,
            AdapterEvent::ServicesDiscovered { id, services } => {
                if let Some(step) = self.resolver.on_services(&id, &services) {
                    self.apply_resolve_step(id, step).await;
                }
            }
            AdapterEvent::CharacteristicsDiscovered {
                id,
                service,
                characteristics,
            } => {
                if let Some(step) = self.resolver.on_characteristics(&id, service, &characteristics)
                {
                    self.apply_resolve_step(id, step).await;
                }
            }
            AdapterEvent::WriteCompleted { token, result } => {
                if let Some(step) = self.delivery.on_write_completed(token, result) {
                    self.apply_delivery_step(step).await;
                }
            }
            AdapterEvent::StatusNotification {
                id,
                characteristic,
                value,
            } => {
                if let Some(status) = self.status.on_notification(&id, characteristic, &value) {
                    self.emit(SessionEvent::StatusReported(status));
                }
            }
        }
    }

    // -- Scanning ---------------------------------------------------------

    async fn intent_start_scan(&mut self) {
        match self.state {
            SessionState::Idle | SessionState::Scanning => {}
            _ => {
                warn!("Ignoring startScan intent in state {:?}", self.state);
                return;
            }
        }
        if let Err(error) = self.monitor.ensure_powered_on() {
            self.fail(error);
            return;
        }
        // Implicit restart: close any prior window before opening a new one.
        self.halt_scan().await;

        let generation = self.scanner.begin();
        if let Err(error) = self.adapter.start_scan().await {
            self.scanner.finish();
            self.fail(error);
            return;
        }
        self.schedule(
            self.config.scan_window,
            SessionMsg::ScanWindowElapsed { generation },
        );
        self.set_state(SessionState::Scanning);
    }

    /// Closes the scan window if one is open. Returns whether it was open.
    /// Leaves session state alone; callers decide where to go next.
    async fn halt_scan(&mut self) -> bool {
        if !self.scanner.finish() {
            return false;
        }
        if let Err(error) = self.adapter.stop_scan().await {
            // Physical stop failures are logged, never surfaced.
            warn!("Failed to stop scan: {}", error);
        }
        self.emit(SessionEvent::ScanComplete);
        true
    }

    // -- Connecting -------------------------------------------------------

    async fn intent_select_device(&mut self, id: DeviceId) {
        match self.state {
            SessionState::Idle | SessionState::Scanning => {}
            _ => {
                warn!("Ignoring deviceSelected intent in state {:?}", self.state);
                return;
            }
        }
        if let Err(error) = self.monitor.ensure_powered_on() {
            self.fail(error);
            return;
        }
        let Some(handle) = self.scanner.get(&id).cloned() else {
            self.fail(Error::DeviceNotFound(id));
            return;
        };
        self.halt_scan().await;

        info!(
            "Connecting to {} ({})",
            handle.name.as_deref().unwrap_or("unknown"),
            handle.id
        );
        self.pending_device = Some(handle);
        let generation = self.connection.begin(id.clone());
        if let Err(error) = self.adapter.connect(&id).await {
            self.connection.drop_connection();
            self.pending_device = None;
            self.fail(error);
            return;
        }
        self.schedule(
            self.config.connect_timeout,
            SessionMsg::ConnectDeadline { generation },
        );
        self.set_state(SessionState::Connecting);
    }

    async fn on_connected(&mut self, id: DeviceId) {
        if self.connection.confirm(&id) {
            self.begin_discovery(id).await;
        } else if self.connection.connected_device() == Some(&id) {
            debug!("Duplicate connection confirmation for {}", id);
        } else {
            // A cancelled attempt must not be resurrected by a late
            // confirmation; release the stray link.
            debug!("Dropping stray connection to {}", id);
            if let Err(error) = self.adapter.disconnect(&id).await {
                debug!("Stray link teardown failed: {}", error);
            }
        }
    }

    async fn connect_deadline(&mut self, generation: u64) {
        let Some(id) = self.connection.deadline_elapsed(generation) else {
            return;
        };
        warn!("Connection attempt to {} timed out", id);
        if let Err(error) = self.adapter.disconnect(&id).await {
            debug!("Cancelling connection attempt failed: {}", error);
        }
        self.pending_device = None;
        self.fail(Error::ConnectTimeout);
    }

    // -- Discovery --------------------------------------------------------

    async fn begin_discovery(&mut self, id: DeviceId) {
        let generation = self.resolver.begin(
            id.clone(),
            UUID_DIFFUSER_SERVICE,
            UUID_CONFIG_WRITE_CHAR,
            UUID_STATUS_NOTIFY_CHAR,
        );
        if let Err(error) = self.adapter.discover_services(&id).await {
            self.abandon_connection().await;
            self.fail(error);
            return;
        }
        self.schedule(
            self.config.discovery_timeout,
            SessionMsg::DiscoveryDeadline { generation },
        );
        self.set_state(SessionState::Discovering);
    }

    async fn apply_resolve_step(&mut self, id: DeviceId, step: ResolveStep) {
        match step {
            ResolveStep::DiscoverCharacteristics(service) => {
                if let Err(error) = self.adapter.discover_characteristics(&id, service).await {
                    self.abandon_connection().await;
                    self.fail(error);
                }
            }
            ResolveStep::Resolved { config, status } => self.finish_setup(id, config, status).await,
            ResolveStep::Failed(error) => {
                self.abandon_connection().await;
                self.fail(error);
            }
        }
    }

    async fn finish_setup(
        &mut self,
        id: DeviceId,
        config: CharacteristicHandle,
        status: Option<CharacteristicHandle>,
    ) {
        let device = self
            .pending_device
            .take()
            .unwrap_or_else(|| DeviceHandle::new(id.clone(), None, None));

        if let Some(status_char) = &status {
            self.status.arm(status_char.clone());
            if let Err(error) = self
                .adapter
                .subscribe_status(&id, status_char.characteristic)
                .await
            {
                // The write path still works without status echoes.
                warn!("Status subscription failed, continuing without: {}", error);
                self.status.disarm();
            }
        }

        info!("Device {} ready for configuration", device.id);
        self.connected_state = Some(ConnectedDeviceState {
            device,
            config_characteristic: config,
            status_characteristic: status,
        });
        self.set_state(SessionState::Ready);
    }

    // -- Delivery ---------------------------------------------------------

    async fn intent_send_config(&mut self, payload: ConfigPayload) {
        if self.connected_state.is_none() {
            self.emit(SessionEvent::ConfigFailed {
                reason: Error::NotConnected,
            });
            return;
        }
        match self.delivery.begin(payload) {
            Ok(step) => {
                self.set_state(SessionState::Sending);
                self.apply_delivery_step(step).await;
            }
            // Fail fast: only the latest configuration matters, a queued
            // stale write would apply outdated settings.
            Err(error) => self.emit(SessionEvent::ConfigFailed { reason: error }),
        }
    }

    async fn apply_delivery_step(&mut self, step: DeliveryStep) {
        let mut next = Some(step);
        while let Some(step) = next.take() {
            match step {
                DeliveryStep::Write { token, value } => {
                    let Some(connected) = self.connected_state.clone() else {
                        self.delivery.cancel();
                        return;
                    };
                    let target = &connected.config_characteristic;
                    match self
                        .adapter
                        .write_characteristic(
                            &target.device,
                            target.characteristic,
                            value.to_vec(),
                            token,
                        )
                        .await
                    {
                        Ok(()) => self.schedule(
                            self.config.ack_timeout,
                            SessionMsg::AckDeadline { token },
                        ),
                        // A locally refused write counts as a failed attempt.
                        Err(error) => {
                            next = self
                                .delivery
                                .on_write_completed(token, Err(error.to_string()))
                        }
                    }
                }
                DeliveryStep::Retry { token, delay } => {
                    self.schedule(delay, SessionMsg::RetryDelay { token });
                }
                DeliveryStep::Delivered => {
                    info!("Configuration acknowledged by device");
                    self.emit(SessionEvent::ConfigDelivered);
                    self.set_state(SessionState::Ready);
                }
                DeliveryStep::Failed(error) => {
                    // Non-fatal: the link is still usable, only this send
                    // failed.
                    self.emit(SessionEvent::ConfigFailed { reason: error });
                    self.set_state(SessionState::Ready);
                }
            }
        }
    }

    // -- Teardown ---------------------------------------------------------

    async fn intent_disconnect(&mut self) {
        self.halt_scan().await;
        if self.connection.current_device().is_some() {
            self.set_state(SessionState::Disconnecting);
            self.abandon_connection().await;
        }
        if !matches!(self.state, SessionState::Failed(_)) {
            self.set_state(SessionState::Idle);
        }
    }

    async fn on_disconnected(&mut self, id: DeviceId) {
        if self.connection.current_device() != Some(&id) {
            debug!("Ignoring disconnect event for unrelated device {}", id);
            return;
        }
        info!("Link to {} went down", id);
        // Peer-initiated disconnects share the local cleanup path.
        self.abandon_connection().await;
        self.set_state(SessionState::Idle);
    }

    async fn adapter_state_changed(&mut self, state: AdapterState) {
        if !self.monitor.update(state) || state == AdapterState::PoweredOn {
            return;
        }
        if self.state == SessionState::Idle || matches!(self.state, SessionState::Failed(_)) {
            return;
        }
        // Radio loss invalidates everything in flight.
        self.halt_scan().await;
        self.abandon_connection().await;
        self.fail(Error::AdapterUnavailable(state));
    }

    async fn intent_reset(&mut self) {
        self.halt_scan().await;
        self.abandon_connection().await;
        self.scanner.clear();
        self.set_state(SessionState::Idle);
    }

    /// The single connection cleanup path: clears the attempt and link,
    /// cancels resolution and delivery (invalidating their correlation
    /// tags), and tears the physical link down best-effort.
    async fn abandon_connection(&mut self) {
        if let Some(id) = self.connection.drop_connection() {
            if let Err(error) = self.adapter.disconnect(&id).await {
                debug!("Physical teardown of {} failed: {}", id, error);
            }
        }
        self.resolver.cancel();
        self.delivery.cancel();
        self.status.disarm();
        self.pending_device = None;
        self.connected_state = None;
    }

    // -- Plumbing ---------------------------------------------------------

    fn fail(&mut self, error: Error) {
        self.set_state(SessionState::Failed(error));
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        info!("Session state: {:?} -> {:?}", self.state, state);
        self.state = state.clone();
        self.emit(SessionEvent::StateChanged(state));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            debug!("Session observer is gone, dropping event");
        }
    }

    fn schedule(&self, delay: Duration, msg: SessionMsg) {
        let timers = self.timers.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            let _ = timers.send(msg);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_rejected_before_reaching_the_session() {
        let (messages, mut queue) = mpsc::unbounded_channel();
        let handle = SessionHandle { messages };

        assert_eq!(
            handle.send_config(150, 30),
            Err(Error::InvalidIntensity(150))
        );
        assert_eq!(handle.send_config(60, 121), Err(Error::InvalidInterval(121)));
        // Nothing entered the session queue.
        assert!(queue.try_recv().is_err());

        assert!(handle.send_config(60, 45).is_ok());
        assert!(queue.try_recv().is_ok());
    }

    #[test]
    fn default_config_matches_documented_policy() {
        let config = SessionConfig::default();
        assert_eq!(config.device_name, "Aroma");
        assert_eq!(config.scan_window, Duration::from_secs(10));
        assert_eq!(config.ack_timeout, Duration::from_secs(5));
    }
}
