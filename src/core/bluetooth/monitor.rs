//! Radio availability tracking.

use log::info;

use crate::core::bluetooth::adapter::AdapterState;
use crate::error::{Error, Result};

/// Caches the platform-reported radio state and gates operations on it.
///
/// State changes are facts reported by the platform; nothing else may set
/// them.
#[derive(Debug)]
pub struct AdapterMonitor {
    state: AdapterState,
}

impl AdapterMonitor {
    pub fn new(initial: AdapterState) -> Self {
        Self { state: initial }
    }

    pub fn current_state(&self) -> AdapterState {
        self.state
    }

    /// Records a platform state report. Returns true if the state changed.
    pub fn update(&mut self, state: AdapterState) -> bool {
        if self.state == state {
            return false;
        }
        info!("Bluetooth adapter state: {:?} -> {:?}", self.state, state);
        self.state = state;
        true
    }

    /// Fails with `AdapterUnavailable` unless the radio is powered on.
    pub fn ensure_powered_on(&self) -> Result<()> {
        if self.state == AdapterState::PoweredOn {
            Ok(())
        } else {
            Err(Error::AdapterUnavailable(self.state))
        }
    }
}
