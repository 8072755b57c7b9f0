//! Per-service supervisor state

use serde::Serialize;
use std::fmt;

/// Service state
///
/// `Pending -> Starting -> Ready | Failed`, then `Ready -> Stopping ->
/// Stopped | Failed`. `Failed` and `Stopped` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    /// Waiting for dependencies, or never started
    Pending,
    /// Start requested, waiting for readiness
    Starting,
    /// Accepting work
    Ready,
    /// Start, readiness or stop failed
    Failed,
    /// Stop requested
    Stopping,
    /// Stopped
    Stopped,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Failed | ServiceState::Stopped)
    }

    pub fn can_transition_to(self, next: ServiceState) -> bool {
        use ServiceState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Starting, Ready)
                | (Starting, Failed)
                | (Ready, Stopping)
                | (Stopping, Stopped)
                | (Stopping, Failed)
        )
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceState::Pending => write!(f, "pending"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::Failed => write!(f, "failed"),
            ServiceState::Stopping => write!(f, "stopping"),
            ServiceState::Stopped => write!(f, "stopped"),
        }
    }
}
