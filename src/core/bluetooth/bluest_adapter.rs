//! `bluest`-backed implementation of the platform adapter capability.
//!
//! Commands spawn tasks against the OS Bluetooth stack and report their
//! outcomes as [`AdapterEvent`]s on the channel handed out at construction,
//! so the session core sees the same message-driven surface the mock
//! adapter in the tests provides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::adapter::{
    AdapterEvent, AdapterState, BleAdapter, DeviceId, WriteToken,
};
use crate::error::{Error, Result};

/// How often an established link is checked for peer-initiated loss.
/// `bluest` exposes no portable link-state stream, so the flag is polled.
const CONNECTION_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub struct BluestAdapter {
    adapter: Adapter,
    events: mpsc::UnboundedSender<AdapterEvent>,
    state: Mutex<AdapterState>,
    devices: Arc<Mutex<HashMap<DeviceId, Device>>>,
    services: Arc<Mutex<HashMap<(DeviceId, Uuid), Service>>>,
    characteristics: Arc<Mutex<HashMap<(DeviceId, Uuid), Characteristic>>>,
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BluestAdapter {
    /// Acquires the system adapter and waits for it to become available.
    /// Returns the adapter and the event channel to hand to the session.
    pub async fn new() -> Result<(Arc<Self>, mpsc::UnboundedReceiver<AdapterEvent>)> {
        let adapter = Adapter::default()
            .await
            .ok_or(Error::AdapterUnavailable(AdapterState::Unsupported))?;
        adapter
            .wait_available()
            .await
            .map_err(|e| Error::Platform(e.to_string()))?;
        info!("Bluetooth adapter is available.");

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            adapter,
            events: events_tx,
            state: Mutex::new(AdapterState::PoweredOn),
            devices: Arc::new(Mutex::new(HashMap::new())),
            services: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            scan_cancel: Mutex::new(None),
        });
        let _ = this.events.send(AdapterEvent::StateChanged(AdapterState::PoweredOn));
        Ok((this, events_rx))
    }

    fn device(&self, id: &DeviceId) -> Result<Device> {
        self.devices
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(id.clone()))
    }

    fn service(&self, id: &DeviceId, uuid: Uuid) -> Result<Service> {
        self.services
            .lock()
            .unwrap()
            .get(&(id.clone(), uuid))
            .cloned()
            .ok_or(Error::ServiceNotFound)
    }

    fn characteristic(&self, id: &DeviceId, uuid: Uuid) -> Result<Characteristic> {
        self.characteristics
            .lock()
            .unwrap()
            .get(&(id.clone(), uuid))
            .cloned()
            .ok_or(Error::CharacteristicNotFound)
    }

    /// Watches an established link and reports its loss. Ends when the
    /// device disconnects or the session goes away.
    async fn watch_connection(
        device: Device,
        id: DeviceId,
        events: mpsc::UnboundedSender<AdapterEvent>,
    ) {
        loop {
            tokio::time::sleep(CONNECTION_POLL_INTERVAL).await;
            if events.is_closed() {
                break;
            }
            if !device.is_connected().await {
                info!("Device {} reported disconnected", id);
                let _ = events.send(AdapterEvent::Disconnected { id });
                break;
            }
        }
    }
}

#[async_trait]
impl BleAdapter for BluestAdapter {
    fn current_state(&self) -> AdapterState {
        *self.state.lock().unwrap()
    }

    async fn start_scan(&self) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut guard = self.scan_cancel.lock().unwrap();
            if let Some(prev) = guard.replace(token.clone()) {
                prev.cancel();
            }
        }

        let adapter = self.adapter.clone();
        let devices = self.devices.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut scan_stream = match adapter.scan(&[]).await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to start scan: {}", e);
                    return;
                }
            };
            info!("Bluetooth scan started");

            loop {
                tokio::select! {
                    result = scan_stream.next() => {
                        match result {
                            Some(discovered) => {
                                let device = discovered.device;
                                let rssi = discovered.rssi;
                                let id = device.id().to_string();
                                let name = device.name().ok();
                                debug!("Found device - id: {}, name: {:?}, rssi: {:?}", id, name, rssi);
                                devices.lock().unwrap().insert(id.clone(), device);
                                let _ = events.send(AdapterEvent::DeviceDiscovered { id, name, rssi });
                            }
                            None => {
                                info!("Bluetooth scan stream has ended.");
                                break;
                            }
                        }
                    }
                    _ = token.cancelled() => break,
                }
            }
            debug!("Scan task finished");
        });
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = self.scan_cancel.lock().unwrap().take() {
            info!("Stopping Bluetooth scan.");
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        let adapter = self.adapter.clone();
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            if !device.is_connected().await {
                info!("Initiating connection to {}...", id);
                if let Err(e) = adapter.connect_device(&device).await {
                    warn!("Connection to {} failed: {}", id, e);
                    let _ = events.send(AdapterEvent::ConnectFailed {
                        id,
                        reason: e.to_string(),
                    });
                    return;
                }
            }
            info!("Connection to {} established", id);
            let _ = events.send(AdapterEvent::Connected { id: id.clone() });
            Self::watch_connection(device, id, events).await;
        });
        Ok(())
    }

    async fn disconnect(&self, id: &DeviceId) -> Result<()> {
        let Some(device) = self.devices.lock().unwrap().get(id).cloned() else {
            return Ok(());
        };
        self.services.lock().unwrap().retain(|(d, _), _| d != id);
        self.characteristics
            .lock()
            .unwrap()
            .retain(|(d, _), _| d != id);

        if device.is_connected().await {
            info!("Disconnecting from device {}", id);
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(|e| Error::Platform(e.to_string()))?;
        } else {
            debug!("Device {} not connected", id);
        }
        Ok(())
    }

    async fn discover_services(&self, id: &DeviceId) -> Result<()> {
        let device = self.device(id)?;
        let services_cache = self.services.clone();
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match device.discover_services().await {
                Ok(services) => {
                    let uuids: Vec<Uuid> = services.iter().map(|s| s.uuid()).collect();
                    info!("Discovered {} services on {}", uuids.len(), id);
                    {
                        let mut cache = services_cache.lock().unwrap();
                        for service in services {
                            cache.insert((id.clone(), service.uuid()), service);
                        }
                    }
                    let _ = events.send(AdapterEvent::ServicesDiscovered {
                        id,
                        services: uuids,
                    });
                }
                // The session's bounded discovery wait covers this.
                Err(e) => error!("Service discovery on {} failed: {}", id, e),
            }
        });
        Ok(())
    }

    async fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<()> {
        let target = self.service(id, service)?;
        let char_cache = self.characteristics.clone();
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match target.characteristics().await {
                Ok(characteristics) => {
                    let uuids: Vec<Uuid> = characteristics.iter().map(|c| c.uuid()).collect();
                    info!(
                        "Discovered {} characteristics under {} on {}",
                        uuids.len(),
                        service,
                        id
                    );
                    {
                        let mut cache = char_cache.lock().unwrap();
                        for characteristic in characteristics {
                            cache.insert((id.clone(), characteristic.uuid()), characteristic);
                        }
                    }
                    let _ = events.send(AdapterEvent::CharacteristicsDiscovered {
                        id,
                        service,
                        characteristics: uuids,
                    });
                }
                Err(e) => error!("Characteristic discovery on {} failed: {}", id, e),
            }
        });
        Ok(())
    }

    async fn write_characteristic(
        &self,
        id: &DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        token: WriteToken,
    ) -> Result<()> {
        let target = self.characteristic(id, characteristic)?;
        let events = self.events.clone();
        tokio::spawn(async move {
            debug!("Writing {} bytes under {:?}", value.len(), token);
            let result = target.write(&value).await.map_err(|e| e.to_string());
            let _ = events.send(AdapterEvent::WriteCompleted { token, result });
        });
        Ok(())
    }

    async fn subscribe_status(&self, id: &DeviceId, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(id, characteristic)?;
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match target.notify().await {
                Ok(mut notification_stream) => {
                    info!("Listening for status notifications...");
                    while let Some(result) = notification_stream.next().await {
                        match result {
                            Ok(value) => {
                                let _ = events.send(AdapterEvent::StatusNotification {
                                    id: id.clone(),
                                    characteristic,
                                    value,
                                });
                            }
                            Err(e) => {
                                error!("Error in notification stream: {}", e);
                                break;
                            }
                        }
                    }
                    info!("Status notification stream ended");
                }
                Err(e) => error!("Failed to subscribe to notifications: {}", e),
            }
        });
        Ok(())
    }
}
