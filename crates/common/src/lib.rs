//! dutlink Common Library
//!
//! Shared types, configuration, and process plumbing for the dutlink backend.

pub mod config;
pub mod error;
pub mod frame;
pub mod process;
pub mod runner;

// Re-export commonly used types
pub use config::{BackendConfig, CommandSpec, VideoConfig};
pub use error::{Error, Result};
pub use frame::{Frame, PixelFormat};
pub use process::ProcessHandle;
pub use runner::{CommandOutput, CommandRunner, HwCommand, ResolvedCommand};

/// dutlink version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
