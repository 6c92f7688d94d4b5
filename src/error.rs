//! Unified error type for the diffuser session core.

use serde::Serialize;
use thiserror::Error;

use crate::core::bluetooth::adapter::AdapterState;

/// Top-level error type used across the crate.
///
/// Variants are `Clone` and carry owned data so a failure reason can live
/// inside [`SessionState::Failed`](crate::SessionState) and be replayed to
/// the UI observer verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum Error {
    /// The Bluetooth radio is not ready for the requested operation.
    #[error("bluetooth adapter unavailable: {0:?}")]
    AdapterUnavailable(AdapterState),

    /// The platform refused to start discovery because a scan it did not
    /// hand to us is already running.
    #[error("a device scan is already active")]
    ScanAlreadyActive,

    /// The device did not confirm the connection before the deadline.
    #[error("connection attempt timed out")]
    ConnectTimeout,

    /// The platform reported a failed connection attempt.
    #[error("connection rejected: {0}")]
    ConnectRejected(String),

    /// Service discovery completed without the configuration service.
    #[error("configuration service not found on device")]
    ServiceNotFound,

    /// Characteristic discovery completed without the configuration
    /// characteristic.
    #[error("configuration characteristic not found on device")]
    CharacteristicNotFound,

    /// The platform never finished discovery within the bounded wait.
    #[error("service discovery timed out")]
    DiscoveryTimeout,

    /// A configuration write is still in flight; only one write may be
    /// pending per characteristic.
    #[error("a configuration write is already in progress")]
    WriteInProgress,

    /// All delivery attempts were exhausted.
    #[error("configuration delivery failed: {last_error}")]
    DeliveryFailed { last_error: String },

    /// Intensity outside the accepted 0-100 range.
    #[error("intensity must be between 0 and 100, got {0}")]
    InvalidIntensity(u8),

    /// Interval outside the accepted 5-120 minute range.
    #[error("interval must be between 5 and 120 minutes, got {0}")]
    InvalidInterval(u8),

    /// The requested device id was never discovered (or the scan results
    /// were cleared).
    #[error("no discovered device with id {0}")]
    DeviceNotFound(String),

    /// There is no connected device to operate on.
    #[error("no device connected")]
    NotConnected,

    /// An error reported by the platform Bluetooth stack.
    #[error("platform bluetooth error: {0}")]
    Platform(String),

    /// The session task is gone; intents can no longer be delivered.
    #[error("session is closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, Error>;
