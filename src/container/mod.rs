//! Container runtime abstraction
//!
//! The supervisor never launches processes itself. It drives a
//! [`ContainerRuntime`], which is either the Docker CLI or an in-process
//! table used for dry runs and tests.

pub mod docker;
pub mod memory;

use crate::compose::ServiceSpec;
use crate::error::RuntimeError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

pub use docker::DockerRuntime;
pub use memory::{MemoryRuntime, RuntimeEvent};

/// Reference to a service launched by a runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeHandle {
    /// Service name
    pub service: String,
    /// Runtime specific container ID
    pub id: String,
    /// Start time
    pub started_at: DateTime<Utc>,
}

impl RuntimeHandle {
    pub fn new(service: &str, id: &str) -> Self {
        Self {
            service: service.to_string(),
            id: id.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Result of asking a runtime to stop a service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopOutcome {
    /// Service was running and is now stopped
    Stopped,
    /// Nothing was running under that name
    NotRunning,
    /// Stop was attempted and failed
    Failed(String),
}

impl StopOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, StopOutcome::Failed(_))
    }
}

/// External system that launches and stops service containers
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Launch a service; returns once the runtime accepted it, not once it
    /// is ready
    async fn start_service(&self, spec: &ServiceSpec) -> Result<RuntimeHandle, RuntimeError>;

    /// Whether the service currently accepts work
    async fn is_ready(&self, name: &str) -> bool;

    /// Stop a service
    async fn stop_service(&self, name: &str) -> StopOutcome;
}

#[async_trait]
impl<R: ContainerRuntime + ?Sized> ContainerRuntime for Arc<R> {
    async fn start_service(&self, spec: &ServiceSpec) -> Result<RuntimeHandle, RuntimeError> {
        (**self).start_service(spec).await
    }

    async fn is_ready(&self, name: &str) -> bool {
        (**self).is_ready(name).await
    }

    async fn stop_service(&self, name: &str) -> StopOutcome {
        (**self).stop_service(name).await
    }
}
