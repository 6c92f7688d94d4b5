//! Connection attempt bookkeeping.
//!
//! Tracks the single pending connection attempt and the single established
//! link. Attempts are generation-tagged: cancelling one (deadline, local
//! disconnect, reset) bumps nothing here but clears the pending slot, so a
//! late platform confirmation no longer matches and cannot resurrect it.

use log::debug;

use crate::core::bluetooth::adapter::DeviceId;

#[derive(Debug)]
struct ConnectAttempt {
    id: DeviceId,
    generation: u64,
}

#[derive(Debug, Default)]
pub struct ConnectionManager {
    attempt: Option<ConnectAttempt>,
    connected: Option<DeviceId>,
    generation: u64,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a connection attempt, returning its generation for the
    /// deadline timer.
    pub fn begin(&mut self, id: DeviceId) -> u64 {
        self.generation += 1;
        self.attempt = Some(ConnectAttempt {
            id,
            generation: self.generation,
        });
        self.generation
    }

    /// Handles a platform connection confirmation. Returns true when it
    /// completes the pending attempt; a stale or unexpected confirmation
    /// returns false and leaves all state untouched.
    pub fn confirm(&mut self, id: &DeviceId) -> bool {
        match &self.attempt {
            Some(attempt) if attempt.id == *id => {
                self.attempt = None;
                self.connected = Some(id.clone());
                true
            }
            _ => {
                debug!("Ignoring stale connection confirmation for {}", id);
                false
            }
        }
    }

    /// Handles a platform connection failure. Returns true when it belongs
    /// to the pending attempt.
    pub fn fail(&mut self, id: &DeviceId) -> bool {
        match &self.attempt {
            Some(attempt) if attempt.id == *id => {
                self.attempt = None;
                true
            }
            _ => false,
        }
    }

    /// Handles an attempt deadline. If the attempt of that generation is
    /// still pending it is cancelled and its device id returned; deadlines
    /// for completed or superseded attempts return None.
    pub fn deadline_elapsed(&mut self, generation: u64) -> Option<DeviceId> {
        match &self.attempt {
            Some(attempt) if attempt.generation == generation => {
                let id = attempt.id.clone();
                self.attempt = None;
                Some(id)
            }
            _ => None,
        }
    }

    pub fn connected_device(&self) -> Option<&DeviceId> {
        self.connected.as_ref()
    }

    /// Returns the device involved in the pending attempt or the
    /// established link, if any.
    pub fn current_device(&self) -> Option<&DeviceId> {
        self.connected
            .as_ref()
            .or(self.attempt.as_ref().map(|a| &a.id))
    }

    /// Clears both the pending attempt and the established link. The single
    /// cleanup path shared by local and peer-initiated disconnects; always
    /// succeeds locally.
    pub fn drop_connection(&mut self) -> Option<DeviceId> {
        let id = self.current_device().cloned();
        self.attempt = None;
        self.connected = None;
        id
    }
}
