//! Error types for Berth

use std::time::Duration;
use thiserror::Error;

/// Result type for Berth operations
pub type Result<T> = std::result::Result<T, BerthError>;

/// Malformed or incomplete compose declarations.
///
/// Always raised before any service is started.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Compose file parse error: {0}")]
    Parse(String),

    #[error("Variable is not set and has no default: {0}")]
    MissingVariable(String),

    #[error("Service declared more than once: {0}")]
    DuplicateService(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),

    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    #[error("Invalid duration: {0}")]
    InvalidDuration(String),

    #[error("Service '{0}' must have 'image' specified")]
    MissingImage(String),

    #[error("Service '{service}' depends on unknown service '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Circular dependency detected: {}", .0.join(" -> "))]
    CyclicDependency(Vec<String>),
}

/// Failure of a single service in the container runtime
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("failed to start: {0}")]
    Start(String),

    #[error("not ready after {0:?}")]
    Timeout(Duration),

    #[error("failed to stop: {0}")]
    Stop(String),

    #[error("cancelled")]
    Cancelled,
}

/// Berth error types
#[derive(Error, Debug)]
pub enum BerthError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Service '{service}' {cause}")]
    StartupFailed { service: String, cause: RuntimeError },

    #[error("Failed to stop services: {}", .0.join(", "))]
    StopFailed(Vec<String>),

    #[error("Startup cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
