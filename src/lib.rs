//! Aroma diffuser bridge library
//! This is the main library for the aroma diffuser bridge: a BLE session
//! core that scans for the diffuser, connects with a timeout, resolves its
//! configuration service and delivers intensity/interval settings with
//! acknowledgement and bounded retry. The UI layer is an external observer
//! of [`SessionEvent`]s and drives the session through [`SessionHandle`]
//! intents.

// Module declarations
pub mod core;
pub mod error;

// Re-export the public surface
pub use crate::core::bluetooth::{
    AdapterEvent, AdapterState, BleAdapter, BluestAdapter, ConfigPayload, DeviceHandle,
    DeviceId, DeviceStatus, WriteToken,
};
pub use crate::core::session::{
    SessionConfig, SessionController, SessionEvent, SessionHandle, SessionState,
};
pub use crate::error::Error;

/// Initialize logging
pub fn setup_logging() {
    env_logger::init();
    log::info!("Logging initialized");
}
