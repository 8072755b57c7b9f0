//! Berth - compose-style service supervisor
//!
//! Berth reads a compose file, resolves it into a validated set of services
//! and brings them up through a container runtime:
//!
//! - `${VAR}` substitution against an explicit variable source
//! - Dependency-ordered, concurrent startup with readiness polling
//! - Reverse-order shutdown with error collection
//! - Docker CLI and in-memory runtimes

pub mod compose;
pub mod container;
pub mod error;
pub mod supervisor;

pub use error::{BerthError, ConfigError, Result, RuntimeError};
