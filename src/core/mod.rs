//! Core functionality for the aroma diffuser bridge
//! This module contains the session logic for interfacing with the diffuser

pub mod bluetooth;
pub mod session;

// Re-export commonly used types
pub use bluetooth::{BleAdapter, BluestAdapter, ConfigPayload, DeviceHandle};
pub use session::{SessionConfig, SessionController, SessionEvent, SessionHandle, SessionState};
