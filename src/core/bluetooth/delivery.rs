//! Configuration payload encoding and reliable delivery.
//!
//! Wire format: a fixed 2-byte record, `[intensity][interval]`, intensity in
//! percent (0-100) and interval in minutes (5-120). The diffuser firmware
//! depends on this layout; change it only together with the device.
//!
//! Delivery is write-with-acknowledgement. Every attempt carries a fresh
//! [`WriteToken`] so its completion callback can be matched to exactly this
//! attempt; on failure or ack timeout the write is retried up to
//! [`MAX_WRITE_ATTEMPTS`] total times with a linearly growing delay between
//! attempts. At most one write is in flight per characteristic.

use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;

use crate::core::bluetooth::adapter::WriteToken;
use crate::core::bluetooth::constants::{
    CONFIG_RECORD_SIZE, INTENSITY_MAX, INTERVAL_MAX, INTERVAL_MIN, MAX_WRITE_ATTEMPTS,
    WRITE_BACKOFF_STEP_MS,
};
use crate::error::{Error, Result};

/// A validated intensity/interval pair.
///
/// Construction is the only validation point; a payload that exists is
/// writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConfigPayload {
    intensity: u8,
    interval: u8,
}

impl ConfigPayload {
    pub fn new(intensity: u8, interval: u8) -> Result<Self> {
        if intensity > INTENSITY_MAX {
            return Err(Error::InvalidIntensity(intensity));
        }
        if !(INTERVAL_MIN..=INTERVAL_MAX).contains(&interval) {
            return Err(Error::InvalidInterval(interval));
        }
        Ok(Self {
            intensity,
            interval,
        })
    }

    pub fn intensity(&self) -> u8 {
        self.intensity
    }

    pub fn interval(&self) -> u8 {
        self.interval
    }

    /// Encodes the payload into the diffuser's wire record.
    pub fn encode(&self) -> [u8; CONFIG_RECORD_SIZE] {
        [self.intensity, self.interval]
    }
}

#[derive(Debug)]
struct PendingWrite {
    payload: ConfigPayload,
    /// Write attempts issued so far.
    attempt: u32,
    /// Token of the current attempt (in flight or scheduled for retry).
    token: WriteToken,
}

/// What the session must do next after a delivery event.
#[derive(Debug)]
pub enum DeliveryStep {
    /// Issue (or re-issue) the write under `token`.
    Write {
        token: WriteToken,
        value: [u8; CONFIG_RECORD_SIZE],
    },
    /// Wait out the backoff, then feed the token back in through
    /// [`DeliveryPipeline::retry_delay_elapsed`].
    Retry { token: WriteToken, delay: Duration },
    /// The device acknowledged the write.
    Delivered,
    /// All attempts exhausted.
    Failed(Error),
}

#[derive(Debug, Default)]
pub struct DeliveryPipeline {
    pending: Option<PendingWrite>,
    next_token: u64,
}

impl DeliveryPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_flight(&self) -> bool {
        self.pending.is_some()
    }

    fn fresh_token(&mut self) -> WriteToken {
        self.next_token += 1;
        WriteToken::new(self.next_token)
    }

    /// Starts delivering `payload`. Fails fast with `WriteInProgress` while
    /// an earlier delivery is still pending: only the latest configuration
    /// matters for this device class, and a queued stale write would apply
    /// outdated settings.
    pub fn begin(&mut self, payload: ConfigPayload) -> Result<DeliveryStep> {
        if self.pending.is_some() {
            return Err(Error::WriteInProgress);
        }
        let token = self.fresh_token();
        self.pending = Some(PendingWrite {
            payload,
            attempt: 1,
            token,
        });
        Ok(DeliveryStep::Write {
            token,
            value: payload.encode(),
        })
    }

    /// Feeds a platform write completion in. Completions whose token does
    /// not match the current attempt are stale and ignored.
    pub fn on_write_completed(
        &mut self,
        token: WriteToken,
        result: std::result::Result<(), String>,
    ) -> Option<DeliveryStep> {
        let pending = self.pending.as_ref()?;
        if pending.token != token {
            debug!("Ignoring stale write completion for {:?}", token);
            return None;
        }
        match result {
            Ok(()) => {
                self.pending = None;
                Some(DeliveryStep::Delivered)
            }
            Err(reason) => Some(self.attempt_failed(reason)),
        }
    }

    /// Handles the acknowledgement deadline of the attempt under `token`.
    pub fn ack_deadline_elapsed(&mut self, token: WriteToken) -> Option<DeliveryStep> {
        let pending = self.pending.as_ref()?;
        if pending.token != token {
            return None;
        }
        Some(self.attempt_failed("acknowledgement timed out".to_string()))
    }

    /// Handles an elapsed backoff delay: re-issues the write if the retry
    /// under `token` is still wanted.
    pub fn retry_delay_elapsed(&mut self, token: WriteToken) -> Option<DeliveryStep> {
        let pending = self.pending.as_mut()?;
        if pending.token != token {
            return None;
        }
        pending.attempt += 1;
        Some(DeliveryStep::Write {
            token,
            value: pending.payload.encode(),
        })
    }

    /// Abandons the pending delivery, if any. Its late completion callbacks
    /// no longer match any token and will be discarded.
    pub fn cancel(&mut self) {
        if self.pending.take().is_some() {
            debug!("Cancelled pending configuration write");
        }
    }

    fn attempt_failed(&mut self, reason: String) -> DeliveryStep {
        let Some(mut pending) = self.pending.take() else {
            // Callers only reach here with a matching pending write.
            return DeliveryStep::Failed(Error::DeliveryFailed { last_error: reason });
        };
        if pending.attempt >= MAX_WRITE_ATTEMPTS {
            warn!(
                "Configuration delivery failed after {} attempts: {}",
                pending.attempt, reason
            );
            return DeliveryStep::Failed(Error::DeliveryFailed { last_error: reason });
        }
        let delay = Duration::from_millis(WRITE_BACKOFF_STEP_MS * u64::from(pending.attempt));
        warn!(
            "Write attempt {} failed ({}), retrying in {:?}",
            pending.attempt, reason, delay
        );
        // Fresh token: the failed attempt's late callbacks must not touch
        // the retry.
        let token = self.fresh_token();
        pending.token = token;
        self.pending = Some(pending);
        DeliveryStep::Retry { token, delay }
    }
}
