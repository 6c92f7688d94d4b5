//! Constants used throughout the session core: the GATT contract with the
//! diffuser and the default timing policy.

use uuid::Uuid;

/// Name fragment that identifies the diffuser in advertisements
/// (matched case-insensitively).
pub const DIFFUSER_NAME: &str = "Aroma";

/// The UUID of the diffuser configuration service.
///
/// Placeholder contract pending real hardware documentation; fixed here so
/// the device firmware and this bridge agree on one value.
pub const UUID_DIFFUSER_SERVICE: Uuid = Uuid::from_u128(0x41726f6d_6120_4469_6675_736f72203031);

/// The UUID of the configuration write characteristic.
pub const UUID_CONFIG_WRITE_CHAR: Uuid = Uuid::from_u128(0x41726f6d_6120_4469_6675_736f72203032);

/// The UUID of the status notification characteristic.
pub const UUID_STATUS_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x41726f6d_6120_4469_6675_736f72203033);

/// Ignore sightings weaker than this signal strength.
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Scan window before discovery auto-stops, in seconds.
pub const DEFAULT_SCAN_WINDOW_SECS: u64 = 10;

/// Deadline for an unconfirmed connection attempt, in seconds.
pub const CONNECT_TIMEOUT_SECS: u64 = 10;

/// Bounded wait for two-phase GATT discovery, in seconds.
pub const DISCOVERY_TIMEOUT_SECS: u64 = 10;

/// Deadline for a write acknowledgement, in seconds.
pub const WRITE_ACK_TIMEOUT_SECS: u64 = 5;

/// Total write attempts per configuration delivery (1 initial + 2 retries).
pub const MAX_WRITE_ATTEMPTS: u32 = 3;

/// Linear backoff step between delivery attempts, in milliseconds
/// (1s after the first failure, 2s after the second).
pub const WRITE_BACKOFF_STEP_MS: u64 = 1000;

/// Size of the configuration record written to the device.
pub const CONFIG_RECORD_SIZE: usize = 2;

/// Size of a status frame notified by the device.
pub const STATUS_FRAME_SIZE: usize = 2;

/// Highest accepted intensity, in percent.
pub const INTENSITY_MAX: u8 = 100;

/// Lowest accepted diffusion interval, in minutes.
pub const INTERVAL_MIN: u8 = 5;

/// Highest accepted diffusion interval, in minutes.
pub const INTERVAL_MAX: u8 = 120;
