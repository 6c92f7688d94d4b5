//! Platform BLE adapter capability.
//!
//! The session core drives the operating system's Bluetooth stack through
//! the [`BleAdapter`] trait and receives every platform callback as an
//! [`AdapterEvent`] message pushed into the session queue. Nothing in the
//! core depends on a concrete OS API.

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use crate::error::Result;

/// Platform-assigned device identifier (an address or UUID string,
/// depending on the OS).
pub type DeviceId = String;

/// Availability of the Bluetooth radio, as reported by the platform.
///
/// Owned by the adapter monitor; every other component only reads it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AdapterState {
    Unknown,
    Unsupported,
    PoweredOff,
    PoweredOn,
}

/// Correlation token for a single characteristic write attempt.
///
/// Each attempt gets a fresh token so a completion callback can be matched
/// to the exact write it belongs to; a stale token identifies a confirmation
/// for an attempt that was retried or cancelled in the meantime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct WriteToken(u64);

impl WriteToken {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }
}

/// Asynchronous messages from the platform Bluetooth stack.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// The radio changed availability.
    StateChanged(AdapterState),
    /// A device was sighted during discovery.
    DeviceDiscovered {
        id: DeviceId,
        name: Option<String>,
        rssi: Option<i16>,
    },
    /// A connection attempt was confirmed.
    Connected { id: DeviceId },
    /// A connection attempt failed.
    ConnectFailed { id: DeviceId, reason: String },
    /// The link to a device went down, locally or peer-initiated.
    Disconnected { id: DeviceId },
    /// Service discovery finished for a device.
    ServicesDiscovered { id: DeviceId, services: Vec<Uuid> },
    /// Characteristic discovery finished for a service.
    CharacteristicsDiscovered {
        id: DeviceId,
        service: Uuid,
        characteristics: Vec<Uuid>,
    },
    /// A characteristic write completed, successfully or not.
    WriteCompleted {
        token: WriteToken,
        result: std::result::Result<(), String>,
    },
    /// A value notification arrived on a subscribed characteristic.
    StatusNotification {
        id: DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
    },
}

/// Capability surface the session core requires from a platform stack.
///
/// Commands are fire-and-forget where the platform confirms asynchronously;
/// confirmations and failures arrive as [`AdapterEvent`]s on the channel the
/// implementation was constructed with. Deadlines for unconfirmed commands
/// are the session's responsibility, not the adapter's.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Last known radio availability.
    fn current_state(&self) -> AdapterState;

    /// Begin device discovery. Sightings arrive as
    /// [`AdapterEvent::DeviceDiscovered`].
    async fn start_scan(&self) -> Result<()>;

    /// Halt device discovery. Idempotent.
    async fn stop_scan(&self) -> Result<()>;

    /// Begin a connection attempt; the outcome arrives as
    /// [`AdapterEvent::Connected`] or [`AdapterEvent::ConnectFailed`].
    async fn connect(&self, id: &DeviceId) -> Result<()>;

    /// Tear down the link to a device. Idempotent.
    async fn disconnect(&self, id: &DeviceId) -> Result<()>;

    /// Discover the device's services; results arrive as
    /// [`AdapterEvent::ServicesDiscovered`].
    async fn discover_services(&self, id: &DeviceId) -> Result<()>;

    /// Discover the characteristics of one service; results arrive as
    /// [`AdapterEvent::CharacteristicsDiscovered`].
    async fn discover_characteristics(&self, id: &DeviceId, service: Uuid) -> Result<()>;

    /// Write a value with acknowledgement; the completion arrives as
    /// [`AdapterEvent::WriteCompleted`] carrying the same token.
    async fn write_characteristic(
        &self,
        id: &DeviceId,
        characteristic: Uuid,
        value: Vec<u8>,
        token: WriteToken,
    ) -> Result<()>;

    /// Subscribe to value notifications on a characteristic; values arrive
    /// as [`AdapterEvent::StatusNotification`].
    async fn subscribe_status(&self, id: &DeviceId, characteristic: Uuid) -> Result<()>;
}
