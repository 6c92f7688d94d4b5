//! Two-phase GATT resolution: services first, then the characteristics of
//! the configuration service.
//!
//! Matching is by declared UUID, never by position; the platform may report
//! either phase in any order. The whole resolution shares one bounded wait,
//! enforced by the session through a generation-tagged deadline.

use log::debug;
use uuid::Uuid;

use crate::core::bluetooth::adapter::DeviceId;
use crate::core::bluetooth::types::CharacteristicHandle;
use crate::error::Error;

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    Services,
    Characteristics,
}

#[derive(Debug)]
struct ResolveAttempt {
    device: DeviceId,
    generation: u64,
    service: Uuid,
    config_char: Uuid,
    status_char: Uuid,
    phase: Phase,
}

/// What the session must do next after feeding a discovery result in.
#[derive(Debug)]
pub enum ResolveStep {
    /// The target service was found; discover its characteristics.
    DiscoverCharacteristics(Uuid),
    /// Both phases completed and the configuration characteristic was
    /// located.
    Resolved {
        config: CharacteristicHandle,
        status: Option<CharacteristicHandle>,
    },
    /// Discovery completed without the required identifiers.
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct Resolver {
    attempt: Option<ResolveAttempt>,
    generation: u64,
}

impl Resolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts resolution of `service`/`config_char` on `device`, returning
    /// the generation for the discovery deadline timer.
    pub fn begin(
        &mut self,
        device: DeviceId,
        service: Uuid,
        config_char: Uuid,
        status_char: Uuid,
    ) -> u64 {
        self.generation += 1;
        self.attempt = Some(ResolveAttempt {
            device,
            generation: self.generation,
            service,
            config_char,
            status_char,
            phase: Phase::Services,
        });
        self.generation
    }

    /// Feeds a service-discovery result in. Results for devices other than
    /// the one being resolved, or arriving with no resolution pending, are
    /// stale and ignored.
    pub fn on_services(&mut self, device: &DeviceId, services: &[Uuid]) -> Option<ResolveStep> {
        let attempt = self.attempt.as_mut()?;
        if attempt.device != *device || attempt.phase != Phase::Services {
            debug!("Ignoring stale service discovery result for {}", device);
            return None;
        }

        if services.contains(&attempt.service) {
            attempt.phase = Phase::Characteristics;
            Some(ResolveStep::DiscoverCharacteristics(attempt.service))
        } else {
            debug!(
                "Service {} not among {} discovered services on {}",
                attempt.service,
                services.len(),
                device
            );
            self.attempt = None;
            Some(ResolveStep::Failed(Error::ServiceNotFound))
        }
    }

    /// Feeds a characteristic-discovery result in.
    pub fn on_characteristics(
        &mut self,
        device: &DeviceId,
        service: Uuid,
        characteristics: &[Uuid],
    ) -> Option<ResolveStep> {
        let attempt = self.attempt.as_ref()?;
        if attempt.device != *device
            || attempt.service != service
            || attempt.phase != Phase::Characteristics
        {
            debug!("Ignoring stale characteristic discovery result for {}", device);
            return None;
        }

        if !characteristics.contains(&attempt.config_char) {
            self.attempt = None;
            return Some(ResolveStep::Failed(Error::CharacteristicNotFound));
        }

        let config = CharacteristicHandle {
            device: attempt.device.clone(),
            service: attempt.service,
            characteristic: attempt.config_char,
        };
        let status = characteristics
            .contains(&attempt.status_char)
            .then(|| CharacteristicHandle {
                device: attempt.device.clone(),
                service: attempt.service,
                characteristic: attempt.status_char,
            });
        self.attempt = None;
        Some(ResolveStep::Resolved { config, status })
    }

    /// Handles the discovery deadline. True when resolution of that
    /// generation was still pending (and is now abandoned).
    pub fn deadline_elapsed(&mut self, generation: u64) -> bool {
        match &self.attempt {
            Some(attempt) if attempt.generation == generation => {
                self.attempt = None;
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self) {
        self.attempt = None;
    }
}
