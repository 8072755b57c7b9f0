//! Readiness polling

use crate::container::ContainerRuntime;
use crate::error::RuntimeError;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upper bound on the pause between two readiness polls
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Exponential backoff between polls
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.min(MAX_POLL_INTERVAL);
        Self {
            next: initial.min(max),
            max,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(self.max);
        delay
    }
}

/// Poll `runtime` until `name` is ready, `timeout` elapses or `cancel` fires
pub async fn wait_ready(
    runtime: &dyn ContainerRuntime,
    name: &str,
    timeout: Duration,
    mut backoff: Backoff,
    cancel: &CancellationToken,
) -> Result<(), RuntimeError> {
    let poll = async {
        loop {
            if runtime.is_ready(name).await {
                return;
            }
            let delay = backoff.next_delay();
            tracing::debug!("{} not ready, polling again in {:?}", name, delay);
            tokio::time::sleep(delay).await;
        }
    };

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RuntimeError::Cancelled),
        res = tokio::time::timeout(timeout, poll) => res.map_err(|_| RuntimeError::Timeout(timeout)),
    }
}
