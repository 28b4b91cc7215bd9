//! Error types for the init system.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
#[derive(Error, Debug)]
pub enum Error {
    /// Property key contains characters outside `[A-Za-z0-9_.-]`
    #[error("Invalid property key: {0:?}")]
    InvalidKey(String),

    /// Config scripts may not overwrite an existing `ro.` property
    #[error("Read-only property already set: {0}")]
    ReadOnlyProperty(String),

    /// Service not found
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    /// Service already exists
    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    /// Service failed to start
    #[error("Service failed to start: {name}: {reason}")]
    ServiceStartFailed { name: String, reason: String },

    /// Service failed to stop
    #[error("Service failed to stop: {name}: {reason}")]
    ServiceStopFailed { name: String, reason: String },

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    ProcessSpawnFailed(String),

    /// Process not found
    #[error("Process not found: PID {0}")]
    ProcessNotFound(u32),

    /// Malformed configuration line
    #[error("{}:{}: {}", .file.display(), .line, .reason)]
    ParseError {
        file: PathBuf,
        line: u32,
        reason: String,
    },

    /// Import cycle among rc files
    #[error("Cyclic import: {}", .0.display())]
    CyclicImport(PathBuf),

    /// Duplicate service definition aborts the current file
    #[error("{}: duplicate service definition: {}", .file.display(), .name)]
    DuplicateService { file: PathBuf, name: String },

    /// Unknown user or group name
    #[error("Unknown user or group: {0}")]
    UnknownIdentity(String),

    /// Unknown capability name in a service definition
    #[error("Unknown capability: {0}")]
    UnknownCapability(String),

    /// Not running as PID 1
    #[error("Not running as PID 1 (current PID: {0})")]
    NotPid1(u32),

    /// Generic configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
