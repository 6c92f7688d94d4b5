//! Bluetooth functionality for the aroma diffuser bridge.
//! This module holds the session building blocks: the platform adapter
//! capability, radio monitoring, scanning, connection handling, GATT
//! resolution, configuration delivery and status notifications.

pub mod adapter;
mod bluest_adapter;
pub mod constants;
mod connection;
mod delivery;
mod monitor;
mod notification;
mod resolver;
mod scanner;
mod types;

// Re-export types that should be publicly accessible
pub use adapter::{AdapterEvent, AdapterState, BleAdapter, DeviceId, WriteToken};
pub use bluest_adapter::BluestAdapter;
pub use connection::ConnectionManager;
pub use delivery::{ConfigPayload, DeliveryPipeline, DeliveryStep};
pub use monitor::AdapterMonitor;
pub use notification::{decode_status_frame, StatusListener};
pub use resolver::{ResolveStep, Resolver};
pub use scanner::{Scanner, Sighting};
pub use types::{CharacteristicHandle, ConnectedDeviceState, DeviceHandle, DeviceStatus};
