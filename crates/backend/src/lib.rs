//! dutlink Backend
//!
//! Lifecycle control for a device-under-test: power sequencing, image
//! flashing, serial capture and console attachment.

pub mod hdd;
pub mod serial;
pub mod session;

pub use hdd::hdd_args;
pub use serial::SerialCapture;
pub use session::{
    BackendSession, PowerAction, SessionState, SessionStatus, ShutdownState, StopReport,
};
