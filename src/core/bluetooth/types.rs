//! Shared data structures for the Bluetooth session core.

use chrono::{DateTime, Utc};
use regex::Regex;
use uuid::Uuid;

use crate::core::bluetooth::adapter::DeviceId;

/// A discovered device, superseded in place on re-discovery.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DeviceHandle {
    /// Platform-specific unique identifier for the device.
    pub id: DeviceId,
    /// The advertised name, if any was seen.
    pub name: Option<String>,
    /// Best-effort MAC address extracted from the platform id
    /// (may be absent on platforms that hide the address).
    pub address: Option<String>,
    /// Signal strength at the last sighting.
    pub rssi: Option<i16>,
    /// When the device was last sighted.
    pub last_seen: DateTime<Utc>,
}

impl DeviceHandle {
    /// Creates a handle for a first sighting.
    pub fn new(id: DeviceId, name: Option<String>, rssi: Option<i16>) -> Self {
        let address = extract_mac_address(&id);
        Self {
            id,
            name,
            address,
            rssi,
            last_seen: Utc::now(),
        }
    }

    /// Folds a re-sighting into the existing handle; most recent
    /// name and RSSI win.
    pub fn sighted(&mut self, name: Option<String>, rssi: Option<i16>) {
        if name.is_some() {
            self.name = name;
        }
        self.rssi = rssi;
        self.last_seen = Utc::now();
    }

    /// Returns true if the advertised name contains `fragment`,
    /// case-insensitively.
    pub fn matches_name(&self, fragment: &str) -> bool {
        self.name
            .as_ref()
            .map(|name| name.to_lowercase().contains(&fragment.to_lowercase()))
            .unwrap_or(false)
    }
}

fn extract_mac_address(device_id_str: &str) -> Option<String> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").unwrap();
    re.find_iter(device_id_str)
        .last()
        .map(|m| m.as_str().to_string().to_uppercase())
}

/// Fully-resolved address of a characteristic on a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicHandle {
    pub device: DeviceId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// The active handles of a successfully set up connection.
#[derive(Debug, Clone)]
pub struct ConnectedDeviceState {
    /// The device the session is connected to.
    pub device: DeviceHandle,
    /// Where configuration records are written.
    pub config_characteristic: CharacteristicHandle,
    /// Where the device notifies its applied settings, when it exposes that.
    pub status_characteristic: Option<CharacteristicHandle>,
}

/// Settings the device reports as currently applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DeviceStatus {
    /// Diffusion intensity in percent.
    pub intensity: u8,
    /// Diffusion interval in minutes.
    pub interval: u8,
}
