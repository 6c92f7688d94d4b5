//! Device discovery with per-identifier de-duplication and a bounded
//! scan window.
//!
//! The scanner owns the map of sighted devices. Platform sightings are
//! folded in through [`Scanner::record_sighting`]; the session enforces the
//! window deadline with a generation-tagged timer so a window from an
//! earlier (implicitly restarted) scan cannot close the current one.

use std::collections::HashMap;

use log::debug;

use crate::core::bluetooth::adapter::DeviceId;
use crate::core::bluetooth::types::DeviceHandle;

/// Outcome of folding one platform sighting into the device map.
#[derive(Debug, Clone)]
pub enum Sighting {
    /// First sighting of this identifier in the current window.
    New(DeviceHandle),
    /// Re-sighting; the existing entry was updated in place.
    Updated(DeviceHandle),
}

#[derive(Debug, Default)]
pub struct Scanner {
    devices: HashMap<DeviceId, DeviceHandle>,
    generation: u64,
    active: bool,
}

impl Scanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Generation of the current scan window. Timer messages carrying an
    /// older generation belong to a closed window and must be dropped.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Opens a new scan window, implicitly closing any active one.
    /// Returns the new window's generation.
    pub fn begin(&mut self) -> u64 {
        self.devices.clear();
        self.generation += 1;
        self.active = true;
        self.generation
    }

    /// Closes the window. Idempotent; returns whether a scan was active.
    /// Discovered devices are retained for selection until the next
    /// [`begin`](Self::begin) or [`clear`](Self::clear).
    pub fn finish(&mut self) -> bool {
        std::mem::replace(&mut self.active, false)
    }

    /// Drops all discovery results.
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Folds one sighting into the device map, applying the name filter and
    /// the signal-strength floor. Sightings outside an active window are
    /// late platform callbacks and are dropped.
    pub fn record_sighting(
        &mut self,
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
        name_filter: &str,
        min_rssi: i16,
    ) -> Option<Sighting> {
        if !self.active {
            debug!("Dropping sighting of {} outside scan window", id);
            return None;
        }
        match rssi {
            Some(signal) if signal >= min_rssi => {}
            _ => return None,
        }

        if let Some(existing) = self.devices.get_mut(&id) {
            existing.sighted(name, rssi);
            return Some(Sighting::Updated(existing.clone()));
        }

        let handle = DeviceHandle::new(id, name, rssi);
        if !handle.matches_name(name_filter) {
            return None;
        }
        debug!(
            "Found diffuser candidate: id={}, name={:?}, rssi={:?}",
            handle.id, handle.name, handle.rssi
        );
        self.devices.insert(handle.id.clone(), handle.clone());
        Some(Sighting::New(handle))
    }

    pub fn get(&self, id: &DeviceId) -> Option<&DeviceHandle> {
        self.devices.get(id)
    }
}
