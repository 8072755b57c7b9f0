//! Compose file loading
//!
//! Turns compose text plus a variable source into a validated
//! [`ResolvedConfig`]. Loading never touches the process environment or
//! starts anything; every declaration problem is reported here, before the
//! supervisor runs.

pub mod config;
pub mod graph;
pub mod interpolate;
pub mod parser;
pub mod spec;

pub use config::{ComposeConfig, ServiceConfig};
pub use graph::DependencyGraph;
pub use interpolate::{interpolate, ProcessEnvironment, VariableSource};
pub use parser::ComposeParser;
pub use spec::{HealthCheck, PortMapping, Protocol, ResolvedConfig, ServiceSpec, VolumeMount};

/// Parse, substitute and validate compose text
pub fn load<V: VariableSource + ?Sized>(
    content: &str,
    vars: &V,
) -> std::result::Result<ResolvedConfig, crate::error::ConfigError> {
    ComposeParser::load(content, vars)
}
