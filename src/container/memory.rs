//! In-process container runtime
//!
//! Keeps a table of "containers" without launching anything. Used for
//! `--dry-run` and as a scriptable runtime in tests: readiness can be delayed
//! by a number of polls, withheld entirely, and starts or stops can be made to
//! fail.

use super::{ContainerRuntime, RuntimeHandle, StopOutcome};
use crate::compose::ServiceSpec;
use crate::error::RuntimeError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

/// Lifecycle event recorded by [`MemoryRuntime`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    Started(String),
    Ready(String),
    Stopped(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Running,
    Stopped,
}

#[derive(Debug)]
struct Container {
    id: String,
    status: Status,
    polls: u32,
    ready: bool,
}

/// Scripted behaviour for one service
#[derive(Debug, Clone, Default)]
struct Behaviour {
    ready_after: u32,
    never_ready: bool,
    start_error: Option<String>,
    stop_error: Option<String>,
}

/// Runtime that tracks containers in memory
#[derive(Debug, Default)]
pub struct MemoryRuntime {
    /// All containers indexed by service name
    containers: Arc<RwLock<HashMap<String, Container>>>,
    behaviours: HashMap<String, Behaviour>,
    events: Mutex<Vec<RuntimeEvent>>,
}

impl MemoryRuntime {
    /// Create a runtime where every service is ready on the first poll
    pub fn new() -> Self {
        Self::default()
    }

    /// Report `name` ready only after `polls` unsuccessful polls
    pub fn ready_after(mut self, name: &str, polls: u32) -> Self {
        self.behaviour(name).ready_after = polls;
        self
    }

    /// Never report `name` ready
    pub fn never_ready(mut self, name: &str) -> Self {
        self.behaviour(name).never_ready = true;
        self
    }

    /// Reject starting `name`
    pub fn fail_start(mut self, name: &str, message: &str) -> Self {
        self.behaviour(name).start_error = Some(message.to_string());
        self
    }

    /// Fail stopping `name`
    pub fn fail_stop(mut self, name: &str, message: &str) -> Self {
        self.behaviour(name).stop_error = Some(message.to_string());
        self
    }

    fn behaviour(&mut self, name: &str) -> &mut Behaviour {
        self.behaviours.entry(name.to_string()).or_default()
    }

    /// Events in the order they happened
    pub fn events(&self) -> Vec<RuntimeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Whether `name` is currently running
    pub fn is_running(&self, name: &str) -> bool {
        self.containers
            .read()
            .map(|c| c.get(name).is_some_and(|c| c.status == Status::Running))
            .unwrap_or(false)
    }

    /// Names of running services, sorted
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .containers
            .read()
            .map(|c| {
                c.iter()
                    .filter(|(_, c)| c.status == Status::Running)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    fn record(&self, event: RuntimeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl ContainerRuntime for MemoryRuntime {
    async fn start_service(&self, spec: &ServiceSpec) -> Result<RuntimeHandle, RuntimeError> {
        let behaviour = self.behaviours.get(&spec.name).cloned().unwrap_or_default();
        if let Some(message) = behaviour.start_error {
            return Err(RuntimeError::Start(message));
        }

        let mut containers = self
            .containers
            .write()
            .map_err(|_| RuntimeError::Start("Failed to acquire write lock".to_string()))?;

        if containers
            .get(&spec.name)
            .is_some_and(|c| c.status == Status::Running)
        {
            return Err(RuntimeError::Start(format!(
                "container for {} is already running",
                spec.name
            )));
        }

        let id = Uuid::new_v4().simple().to_string()[..12].to_string();
        containers.insert(
            spec.name.clone(),
            Container {
                id: id.clone(),
                status: Status::Running,
                polls: 0,
                ready: false,
            },
        );
        drop(containers);

        self.record(RuntimeEvent::Started(spec.name.clone()));
        Ok(RuntimeHandle::new(&spec.name, &id))
    }

    async fn is_ready(&self, name: &str) -> bool {
        let behaviour = self.behaviours.get(name).cloned().unwrap_or_default();

        let Ok(mut containers) = self.containers.write() else {
            return false;
        };
        let Some(container) = containers.get_mut(name) else {
            return false;
        };
        if container.status != Status::Running || behaviour.never_ready {
            return false;
        }

        container.polls += 1;
        if container.ready || container.polls <= behaviour.ready_after {
            return container.ready;
        }

        container.ready = true;
        drop(containers);

        self.record(RuntimeEvent::Ready(name.to_string()));
        true
    }

    async fn stop_service(&self, name: &str) -> StopOutcome {
        let Ok(mut containers) = self.containers.write() else {
            return StopOutcome::Failed("Failed to acquire write lock".to_string());
        };

        let Some(container) = containers.get_mut(name) else {
            return StopOutcome::NotRunning;
        };
        if container.status != Status::Running {
            return StopOutcome::NotRunning;
        }

        if let Some(message) = self.behaviours.get(name).and_then(|b| b.stop_error.clone()) {
            return StopOutcome::Failed(message);
        }

        tracing::debug!("Stopping in-memory container {} ({})", name, container.id);
        container.status = Status::Stopped;
        container.ready = false;
        drop(containers);

        self.record(RuntimeEvent::Stopped(name.to_string()));
        StopOutcome::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lifecycle() {
        let runtime = MemoryRuntime::new();
        let spec = ServiceSpec::new("redis", "redis");

        let handle = runtime.start_service(&spec).await.unwrap();
        assert_eq!(handle.service, "redis");
        assert_eq!(handle.id.len(), 12);
        assert!(runtime.is_running("redis"));
        assert!(runtime.is_ready("redis").await);

        assert_eq!(runtime.stop_service("redis").await, StopOutcome::Stopped);
        assert!(!runtime.is_running("redis"));
        assert_eq!(runtime.stop_service("redis").await, StopOutcome::NotRunning);

        assert_eq!(
            runtime.events(),
            vec![
                RuntimeEvent::Started("redis".to_string()),
                RuntimeEvent::Ready("redis".to_string()),
                RuntimeEvent::Stopped("redis".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_ready_after_polls() {
        let runtime = MemoryRuntime::new().ready_after("postgres", 2);
        runtime
            .start_service(&ServiceSpec::new("postgres", "postgres"))
            .await
            .unwrap();

        assert!(!runtime.is_ready("postgres").await);
        assert!(!runtime.is_ready("postgres").await);
        assert!(runtime.is_ready("postgres").await);
        assert!(runtime.is_ready("postgres").await);
    }

    #[tokio::test]
    async fn test_unknown_service_is_not_ready() {
        let runtime = MemoryRuntime::new();
        assert!(!runtime.is_ready("ghost").await);
        assert_eq!(runtime.stop_service("ghost").await, StopOutcome::NotRunning);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let runtime = MemoryRuntime::new()
            .fail_start("broken", "image not found")
            .fail_stop("sticky", "device busy");

        assert_eq!(
            runtime
                .start_service(&ServiceSpec::new("broken", "nope"))
                .await
                .unwrap_err(),
            RuntimeError::Start("image not found".to_string())
        );

        runtime
            .start_service(&ServiceSpec::new("sticky", "app"))
            .await
            .unwrap();
        assert_eq!(
            runtime.stop_service("sticky").await,
            StopOutcome::Failed("device busy".to_string())
        );
        assert_eq!(runtime.running(), vec!["sticky".to_string()]);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let runtime = MemoryRuntime::new();
        let spec = ServiceSpec::new("redis", "redis");
        runtime.start_service(&spec).await.unwrap();
        assert!(runtime.start_service(&spec).await.is_err());
    }
}
