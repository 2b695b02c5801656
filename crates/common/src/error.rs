//! Error types for dutlink

use thiserror::Error;

/// Result type alias using dutlink Error
pub type Result<T> = std::result::Result<T, Error>;

/// dutlink error types
///
/// Frame loss and signal loss are not represented here: the capture path
/// reports them as "no frame" and recovers on its own.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("System call failed: {0}")]
    Sys(#[from] nix::errno::Errno),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Command '{command}' failed: {reason}")]
    Execution { command: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("No console registered for type '{0}'")]
    UnknownConsole(String),

    #[error("Console error: {0}")]
    Console(String),
}

impl Error {
    /// Shorthand for an execution failure of `command`
    pub fn execution(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Execution {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error aborts the enclosing operation before any side effect
    pub fn is_configuration(&self) -> bool {
        matches!(self, Error::Configuration(_) | Error::UnknownConsole(_))
    }
}
