//! Supervisor handle and outcome reports

use super::state::ServiceState;
use crate::compose::ResolvedConfig;
use crate::container::RuntimeHandle;
use crate::error::{BerthError, Result, RuntimeError};
use std::collections::VecDeque;

/// A service that failed to come up
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupFailure {
    pub service: String,
    pub cause: RuntimeError,
}

/// A service that was never started
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedService {
    pub service: String,
    /// Failed dependency that blocked it; `None` when startup was cancelled
    pub blocked_by: Option<String>,
}

/// Aggregate result of a startup run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StartOutcome {
    /// Services that reached readiness, in startup order
    pub ready: Vec<String>,
    pub failures: Vec<StartupFailure>,
    pub skipped: Vec<SkippedService>,
    pub cancelled: bool,
}

impl StartOutcome {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.skipped.is_empty() && !self.cancelled
    }
}

/// Aggregate result of a stop sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopResult {
    /// Services stopped, in the order they were stopped
    pub stopped: Vec<String>,
    /// Services the runtime had nothing running for
    pub not_running: Vec<String>,
    /// Services that did not stop cleanly
    pub failed: Vec<(String, RuntimeError)>,
}

impl StopResult {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.stopped.is_empty() && self.not_running.is_empty() && self.failed.is_empty()
    }

    /// Error naming every service that failed to stop
    pub fn into_result(self) -> Result<Self> {
        if self.is_clean() {
            Ok(self)
        } else {
            Err(BerthError::StopFailed(
                self.failed.into_iter().map(|(name, _)| name).collect(),
            ))
        }
    }
}

/// State of one supervised project.
///
/// Owned by the caller between `start` and `stop`; the supervisor is the only
/// thing that mutates it.
#[derive(Debug)]
pub struct SupervisorHandle {
    config: ResolvedConfig,
    pub(super) states: Vec<ServiceState>,
    pub(super) handles: Vec<Option<RuntimeHandle>>,
    /// Indices of services the runtime accepted, in startup order
    pub(super) started: Vec<usize>,
    /// Services whose stop failed; their containers may still be up
    pub(super) stop_failed: Vec<usize>,
    pub(super) failures: Vec<StartupFailure>,
    pub(super) cancelled: bool,
    pub(super) shutdown: Option<StopResult>,
}

impl SupervisorHandle {
    pub(super) fn new(config: ResolvedConfig) -> Self {
        let len = config.len();
        Self {
            config,
            states: vec![ServiceState::Pending; len],
            handles: vec![None; len],
            started: Vec::new(),
            stop_failed: Vec::new(),
            failures: Vec::new(),
            cancelled: false,
            shutdown: None,
        }
    }

    /// Treat every declared service as running, in startup order.
    ///
    /// Used to stop a project from another process, where no handle from
    /// `start` exists.
    pub fn adopt(config: ResolvedConfig) -> Self {
        let mut handle = Self::new(config);
        let order = handle.config.graph().order().to_vec();
        for i in order {
            let name = &handle.config.services()[i].name;
            handle.handles[i] = Some(RuntimeHandle::new(name, ""));
            handle.states[i] = ServiceState::Ready;
            handle.started.push(i);
        }
        handle
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn state(&self, name: &str) -> Option<ServiceState> {
        self.config.index_of(name).map(|i| self.states[i])
    }

    /// Every service with its state, in declaration order
    pub fn states(&self) -> impl Iterator<Item = (&str, ServiceState)> {
        self.config
            .services()
            .iter()
            .zip(&self.states)
            .map(|(spec, state)| (spec.name.as_str(), *state))
    }

    pub fn runtime_handle(&self, name: &str) -> Option<&RuntimeHandle> {
        self.config
            .index_of(name)
            .and_then(|i| self.handles[i].as_ref())
    }

    /// Services the runtime accepted, in startup order
    pub fn startup_order(&self) -> Vec<&str> {
        self.started.iter().map(|&i| self.name(i)).collect()
    }

    /// Services that were started and not stopped, in startup order.
    ///
    /// Includes services whose stop failed.
    pub fn left_running(&self) -> Vec<&str> {
        self.started
            .iter()
            .filter(|&&i| self.handles[i].is_some() || self.stop_failed.contains(&i))
            .map(|&i| self.name(i))
            .collect()
    }

    /// Stop sweep performed after cancellation, if any
    pub fn shutdown(&self) -> Option<&StopResult> {
        self.shutdown.as_ref()
    }

    pub fn outcome(&self) -> StartOutcome {
        let ready = self
            .started
            .iter()
            .filter(|&&i| self.states[i] == ServiceState::Ready)
            .map(|&i| self.name(i).to_string())
            .collect();

        let skipped = self
            .config
            .graph()
            .order()
            .iter()
            .filter(|&&i| self.states[i] == ServiceState::Pending)
            .map(|&i| SkippedService {
                service: self.name(i).to_string(),
                blocked_by: self.blocker(i).map(|b| self.name(b).to_string()),
            })
            .collect();

        StartOutcome {
            ready,
            failures: self.failures.clone(),
            skipped,
            cancelled: self.cancelled,
        }
    }

    /// First fatal startup error, if any
    pub fn check(&self) -> Result<()> {
        if let Some(failure) = self.failures.first() {
            return Err(BerthError::StartupFailed {
                service: failure.service.clone(),
                cause: failure.cause.clone(),
            });
        }
        if self.cancelled {
            return Err(BerthError::Cancelled);
        }
        Ok(())
    }

    pub(super) fn name(&self, index: usize) -> &str {
        &self.config.services()[index].name
    }

    pub(super) fn transition(&mut self, index: usize, next: ServiceState) {
        let current = self.states[index];
        if current.can_transition_to(next) {
            tracing::debug!("{}: {} -> {}", self.name(index), current, next);
            self.states[index] = next;
        } else {
            tracing::warn!(
                "{}: ignoring transition {} -> {}",
                self.name(index),
                current,
                next
            );
        }
    }

    /// Nearest failed ancestor keeping `index` from starting
    fn blocker(&self, index: usize) -> Option<usize> {
        let graph = self.config.graph();
        let mut queue: VecDeque<usize> = graph.dependencies(index).iter().copied().collect();
        let mut seen = vec![false; self.states.len()];

        while let Some(dep) = queue.pop_front() {
            if std::mem::replace(&mut seen[dep], true) {
                continue;
            }
            match self.states[dep] {
                ServiceState::Failed => return Some(dep),
                ServiceState::Pending => queue.extend(graph.dependencies(dep)),
                _ => {}
            }
        }
        None
    }
}
