//! Status notification handling.
//!
//! The diffuser echoes its applied settings over the status characteristic
//! as a 2-byte frame mirroring the configuration record. Frames that are
//! short, out of range, or arrive on the wrong characteristic are logged
//! and dropped.

use log::{debug, warn};
use uuid::Uuid;

use crate::core::bluetooth::adapter::DeviceId;
use crate::core::bluetooth::constants::{
    INTENSITY_MAX, INTERVAL_MAX, INTERVAL_MIN, STATUS_FRAME_SIZE,
};
use crate::core::bluetooth::types::{CharacteristicHandle, DeviceStatus};

/// Decodes one status frame.
pub fn decode_status_frame(value: &[u8]) -> Option<DeviceStatus> {
    if value.len() < STATUS_FRAME_SIZE {
        warn!("Short status frame: {:?}", value);
        return None;
    }
    let intensity = value[0];
    let interval = value[1];
    if intensity > INTENSITY_MAX || !(INTERVAL_MIN..=INTERVAL_MAX).contains(&interval) {
        warn!(
            "Status frame out of range: intensity={}, interval={}",
            intensity, interval
        );
        return None;
    }
    Some(DeviceStatus {
        intensity,
        interval,
    })
}

/// Filters and decodes notifications for the armed status characteristic.
#[derive(Debug, Default)]
pub struct StatusListener {
    armed: Option<CharacteristicHandle>,
}

impl StatusListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&mut self, characteristic: CharacteristicHandle) {
        self.armed = Some(characteristic);
    }

    pub fn disarm(&mut self) {
        self.armed = None;
    }

    /// Decodes a notification if it belongs to the armed characteristic.
    pub fn on_notification(
        &self,
        device: &DeviceId,
        characteristic: Uuid,
        value: &[u8],
    ) -> Option<DeviceStatus> {
        let armed = self.armed.as_ref()?;
        if armed.device != *device || armed.characteristic != characteristic {
            debug!("Ignoring notification from unexpected source {}", device);
            return None;
        }
        decode_status_frame(value)
    }
}
