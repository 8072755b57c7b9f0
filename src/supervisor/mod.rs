//! Dependency-ordered service supervisor
//!
//! Brings services up through a [`ContainerRuntime`]: a service is started
//! only once every service it depends on is ready, readiness is polled with
//! backoff under a per-service timeout, and services with no ordering
//! between them start concurrently. All in-flight startups are futures
//! driven by the calling task, so the state table in [`SupervisorHandle`]
//! is never shared.
//!
//! A failing service only holds back its own dependents. Nothing is rolled
//! back automatically; callers decide whether to [`Supervisor::stop`].

pub mod handle;
pub mod readiness;
pub mod state;

pub use handle::{SkippedService, StartOutcome, StartupFailure, StopResult, SupervisorHandle};
pub use state::ServiceState;

use crate::compose::{ResolvedConfig, ServiceSpec};
use crate::container::{ContainerRuntime, RuntimeHandle, StopOutcome};
use crate::error::RuntimeError;
use futures::stream::{FuturesUnordered, StreamExt};
use readiness::{wait_ready, Backoff, MAX_POLL_INTERVAL};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Supervisor tuning
#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Readiness timeout for services whose healthcheck does not imply one
    pub ready_timeout: Duration,
    /// Longest pause between readiness polls; capped at one second
    pub poll_interval: Duration,
    /// First pause between readiness polls
    pub initial_backoff: Duration,
    /// Maximum number of services starting at once; 1 starts sequentially
    pub parallelism: usize,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(60),
            poll_interval: MAX_POLL_INTERVAL,
            initial_backoff: Duration::from_millis(50),
            parallelism: usize::MAX,
        }
    }
}

/// Readiness of one service as reported by the runtime
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStatus {
    pub service: String,
    pub image: String,
    pub ready: bool,
}

/// Result of one startup future
struct BringUp {
    index: usize,
    handle: Option<RuntimeHandle>,
    result: Result<(), RuntimeError>,
}

/// Service supervisor
pub struct Supervisor {
    runtime: Arc<dyn ContainerRuntime>,
    options: SupervisorOptions,
}

impl Supervisor {
    /// Create a new supervisor
    pub fn new(runtime: Arc<dyn ContainerRuntime>, options: SupervisorOptions) -> Self {
        Self { runtime, options }
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    /// Start every service of `config` in dependency order.
    ///
    /// Always returns a handle, also when services failed; see
    /// [`SupervisorHandle::check`] and [`SupervisorHandle::outcome`]. When
    /// `cancel` fires, no further services are started and the ones already
    /// started are stopped before returning.
    pub async fn start(&self, config: ResolvedConfig, cancel: CancellationToken) -> SupervisorHandle {
        let mut handle = SupervisorHandle::new(config);
        let graph = handle.config().graph().clone();
        let parallelism = self.options.parallelism.max(1);
        let mut launched = vec![false; graph.len()];
        let mut in_flight = FuturesUnordered::new();

        tracing::info!("Starting {} services", graph.len());

        loop {
            if !cancel.is_cancelled() {
                for &index in graph.order() {
                    if in_flight.len() >= parallelism {
                        break;
                    }
                    if launched[index] {
                        continue;
                    }
                    let deps_ready = graph
                        .dependencies(index)
                        .iter()
                        .all(|&dep| handle.states[dep] == ServiceState::Ready);
                    if !deps_ready {
                        continue;
                    }

                    launched[index] = true;
                    handle.transition(index, ServiceState::Starting);
                    let spec = handle.config().services()[index].clone();
                    in_flight.push(self.bring_up(index, spec, cancel.clone()));
                }
            }

            let Some(done) = in_flight.next().await else {
                break;
            };

            if let Some(runtime_handle) = done.handle {
                handle.handles[done.index] = Some(runtime_handle);
                handle.started.push(done.index);
            }

            match done.result {
                Ok(()) => {
                    tracing::info!("Service {} is ready", handle.name(done.index));
                    handle.transition(done.index, ServiceState::Ready);
                }
                Err(cause) => {
                    let service = handle.name(done.index).to_string();
                    handle.transition(done.index, ServiceState::Failed);
                    if cause == RuntimeError::Cancelled {
                        tracing::info!("Startup of {} cancelled", service);
                    } else {
                        tracing::warn!("Service {} {}", service, cause);
                        handle.failures.push(StartupFailure { service, cause });
                    }
                }
            }
        }

        if cancel.is_cancelled() {
            tracing::warn!("Startup cancelled, stopping started services");
            handle.cancelled = true;
            let shutdown = self.stop(&mut handle).await;
            handle.shutdown = Some(shutdown);
        }

        handle
    }

    async fn bring_up(&self, index: usize, spec: ServiceSpec, cancel: CancellationToken) -> BringUp {
        tracing::info!("Starting service {} ({})", spec.name, spec.image);

        let runtime_handle = match self.runtime.start_service(&spec).await {
            Ok(h) => h,
            Err(e) => {
                return BringUp {
                    index,
                    handle: None,
                    result: Err(e),
                }
            }
        };

        let timeout = spec.readiness_timeout().unwrap_or(self.options.ready_timeout);
        let backoff = Backoff::new(
            self.options.initial_backoff,
            spec.poll_interval().unwrap_or(self.options.poll_interval),
        );
        let result = wait_ready(self.runtime.as_ref(), &spec.name, timeout, backoff, &cancel).await;

        BringUp {
            index,
            handle: Some(runtime_handle),
            result,
        }
    }

    /// Stop every started service in reverse startup order.
    ///
    /// Errors are collected, never short-circuited. Services are released
    /// from the handle as they are visited, so a second call does nothing.
    pub async fn stop(&self, handle: &mut SupervisorHandle) -> StopResult {
        let mut result = StopResult::default();

        for index in handle.started.clone().into_iter().rev() {
            if handle.handles[index].take().is_none() {
                continue;
            }

            let name = handle.name(index).to_string();
            let was_ready = handle.states[index] == ServiceState::Ready;
            if was_ready {
                handle.transition(index, ServiceState::Stopping);
            }

            tracing::info!("Stopping service {}", name);
            match self.runtime.stop_service(&name).await {
                StopOutcome::Stopped => {
                    if was_ready {
                        handle.transition(index, ServiceState::Stopped);
                    }
                    result.stopped.push(name);
                }
                StopOutcome::NotRunning => {
                    if was_ready {
                        handle.transition(index, ServiceState::Stopped);
                    }
                    result.not_running.push(name);
                }
                StopOutcome::Failed(message) => {
                    tracing::warn!("Failed to stop {}: {}", name, message);
                    if was_ready {
                        handle.transition(index, ServiceState::Failed);
                    }
                    handle.stop_failed.push(index);
                    result.failed.push((name, RuntimeError::Stop(message)));
                }
            }
        }

        result
    }

    /// Stop every declared service, whether or not this process started it
    pub async fn down(&self, config: ResolvedConfig) -> StopResult {
        let mut handle = SupervisorHandle::adopt(config);
        self.stop(&mut handle).await
    }

    /// Ask the runtime about each declared service
    pub async fn status(&self, config: &ResolvedConfig) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(config.len());
        for spec in config.startup_order() {
            statuses.push(ServiceStatus {
                service: spec.name.clone(),
                image: spec.image.clone(),
                ready: self.runtime.is_ready(&spec.name).await,
            });
        }
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::ComposeParser;
    use crate::container::{MemoryRuntime, RuntimeEvent};
    use crate::error::{BerthError, ConfigError};
    use std::collections::HashMap;

    fn config(services: Vec<ServiceSpec>) -> ResolvedConfig {
        ResolvedConfig::new(None, services).unwrap()
    }

    fn supervisor(runtime: &Arc<MemoryRuntime>) -> Supervisor {
        Supervisor::new(runtime.clone(), SupervisorOptions::default())
    }

    fn position(events: &[RuntimeEvent], wanted: &RuntimeEvent) -> Option<usize> {
        events.iter().position(|e| e == wanted)
    }

    fn started(name: &str) -> RuntimeEvent {
        RuntimeEvent::Started(name.to_string())
    }

    fn ready(name: &str) -> RuntimeEvent {
        RuntimeEvent::Ready(name.to_string())
    }

    fn stopped(name: &str) -> RuntimeEvent {
        RuntimeEvent::Stopped(name.to_string())
    }

    #[tokio::test(start_paused = true)]
    async fn test_independent_services_start_concurrently() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .ready_after("redis", 1)
                .ready_after("postgres", 1),
        );
        let config = config(vec![
            ServiceSpec::new("redis", "redis:7"),
            ServiceSpec::new("postgres", "postgres:16"),
        ]);

        let handle = supervisor(&runtime)
            .start(config, CancellationToken::new())
            .await;

        assert!(handle.check().is_ok());
        assert!(handle.outcome().is_success());
        assert_eq!(handle.state("redis"), Some(ServiceState::Ready));
        assert_eq!(handle.state("postgres"), Some(ServiceState::Ready));

        // Both were started before either reported ready.
        let events = runtime.events();
        assert!(matches!(events[0], RuntimeEvent::Started(_)));
        assert!(matches!(events[1], RuntimeEvent::Started(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_when_parallelism_is_one() {
        let runtime = Arc::new(MemoryRuntime::new().ready_after("redis", 2));
        let options = SupervisorOptions {
            parallelism: 1,
            ..Default::default()
        };
        let config = config(vec![
            ServiceSpec::new("redis", "redis:7"),
            ServiceSpec::new("postgres", "postgres:16"),
        ]);

        let handle = Supervisor::new(runtime.clone(), options)
            .start(config, CancellationToken::new())
            .await;

        assert!(handle.check().is_ok());
        assert_eq!(
            runtime.events(),
            vec![
                started("redis"),
                ready("redis"),
                started("postgres"),
                ready("postgres"),
            ]
        );
        assert_eq!(handle.startup_order(), vec!["redis", "postgres"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dependencies_ready_before_dependents_start() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .ready_after("db", 4)
                .ready_after("cache", 2)
                .ready_after("api", 1),
        );
        let services = vec![
            ServiceSpec::new("web", "nginx").depends_on("api"),
            ServiceSpec::new("api", "node").depends_on("db").depends_on("cache"),
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("cache", "redis"),
        ];
        let config = config(services.clone());

        let handle = supervisor(&runtime)
            .start(config, CancellationToken::new())
            .await;
        assert!(handle.outcome().is_success());

        let events = runtime.events();
        for service in &services {
            let start = position(&events, &started(&service.name)).unwrap();
            for dep in &service.depends_on {
                let dep_ready = position(&events, &ready(dep)).unwrap();
                assert!(
                    dep_ready < start,
                    "{} started before {} was ready",
                    service.name,
                    dep
                );
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_only_holds_back_dependents() {
        let runtime = Arc::new(MemoryRuntime::new().fail_start("db", "image not found"));
        let config = config(vec![
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("api", "node").depends_on("db"),
            ServiceSpec::new("web", "nginx").depends_on("api"),
            ServiceSpec::new("cache", "redis"),
        ]);

        let handle = supervisor(&runtime)
            .start(config, CancellationToken::new())
            .await;

        let outcome = handle.outcome();
        assert_eq!(outcome.ready, vec!["cache".to_string()]);
        assert_eq!(
            outcome.failures,
            vec![StartupFailure {
                service: "db".to_string(),
                cause: RuntimeError::Start("image not found".to_string()),
            }]
        );
        assert_eq!(
            outcome.skipped,
            vec![
                SkippedService {
                    service: "api".to_string(),
                    blocked_by: Some("db".to_string()),
                },
                SkippedService {
                    service: "web".to_string(),
                    blocked_by: Some("db".to_string()),
                },
            ]
        );

        assert_eq!(handle.state("db"), Some(ServiceState::Failed));
        assert_eq!(handle.state("api"), Some(ServiceState::Pending));

        match handle.check() {
            Err(BerthError::StartupFailed { service, cause }) => {
                assert_eq!(service, "db");
                assert_eq!(cause, RuntimeError::Start("image not found".to_string()));
            }
            other => panic!("expected StartupFailed, got {:?}", other),
        }

        // No rollback: the unrelated service keeps running.
        assert_eq!(runtime.running(), vec!["cache".to_string()]);
        assert_eq!(handle.left_running(), vec!["cache"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_readiness_timeout() {
        let runtime = Arc::new(MemoryRuntime::new().never_ready("postgres"));
        let options = SupervisorOptions {
            ready_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let config = config(vec![
            ServiceSpec::new("redis", "redis"),
            ServiceSpec::new("postgres", "postgres"),
        ]);

        let handle = Supervisor::new(runtime.clone(), options)
            .start(config, CancellationToken::new())
            .await;

        let outcome = handle.outcome();
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.failures,
            vec![StartupFailure {
                service: "postgres".to_string(),
                cause: RuntimeError::Timeout(Duration::from_secs(5)),
            }]
        );
        assert_eq!(outcome.ready, vec!["redis".to_string()]);

        // The container was launched, so it is reported as left running.
        let mut left = handle.left_running();
        left.sort();
        assert_eq!(left, vec!["postgres", "redis"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_reverse_order_and_idempotent() {
        let runtime = Arc::new(MemoryRuntime::new());
        let config = config(vec![
            ServiceSpec::new("web", "nginx").depends_on("api"),
            ServiceSpec::new("api", "node").depends_on("db"),
            ServiceSpec::new("db", "postgres"),
        ]);
        let supervisor = supervisor(&runtime);

        let mut handle = supervisor.start(config, CancellationToken::new()).await;
        assert_eq!(handle.startup_order(), vec!["db", "api", "web"]);

        let result = supervisor.stop(&mut handle).await;
        assert!(result.is_clean());
        assert_eq!(result.stopped, vec!["web", "api", "db"]);
        assert_eq!(handle.state("db"), Some(ServiceState::Stopped));
        assert!(handle.left_running().is_empty());

        let events_after_first = runtime.events();
        let second = supervisor.stop(&mut handle).await;
        assert!(second.is_empty());
        assert_eq!(runtime.events(), events_after_first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_collects_errors() {
        let runtime = Arc::new(MemoryRuntime::new().fail_stop("api", "device busy"));
        let config = config(vec![
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("api", "node").depends_on("db"),
            ServiceSpec::new("web", "nginx").depends_on("api"),
        ]);
        let supervisor = supervisor(&runtime);

        let mut handle = supervisor.start(config, CancellationToken::new()).await;
        let result = supervisor.stop(&mut handle).await;

        assert_eq!(result.stopped, vec!["web", "db"]);
        assert_eq!(
            result.failed,
            vec![("api".to_string(), RuntimeError::Stop("device busy".to_string()))]
        );
        assert_eq!(handle.state("api"), Some(ServiceState::Failed));

        match result.into_result() {
            Err(BerthError::StopFailed(names)) => assert_eq!(names, vec!["api"]),
            other => panic!("expected StopFailed, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_failed_services() {
        let runtime = Arc::new(MemoryRuntime::new().never_ready("db"));
        let options = SupervisorOptions {
            ready_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        let supervisor = Supervisor::new(runtime.clone(), options);
        let config = config(vec![ServiceSpec::new("db", "postgres")]);

        let mut handle = supervisor.start(config, CancellationToken::new()).await;
        assert_eq!(runtime.running(), vec!["db".to_string()]);

        let result = supervisor.stop(&mut handle).await;
        assert_eq!(result.stopped, vec!["db"]);
        assert_eq!(handle.state("db"), Some(ServiceState::Failed));
        assert!(runtime.running().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_started_services() {
        let runtime = Arc::new(MemoryRuntime::new().never_ready("db"));
        let config = config(vec![
            ServiceSpec::new("cache", "redis"),
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("api", "node").depends_on("db"),
        ]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let handle = supervisor(&runtime).start(config, cancel).await;

        let outcome = handle.outcome();
        assert!(outcome.cancelled);
        assert!(outcome.failures.is_empty());
        assert_eq!(
            outcome.skipped,
            vec![SkippedService {
                service: "api".to_string(),
                blocked_by: Some("db".to_string()),
            }]
        );
        assert!(matches!(handle.check(), Err(BerthError::Cancelled)));

        let shutdown = handle.shutdown().unwrap();
        assert_eq!(shutdown.stopped, vec!["db", "cache"]);
        assert!(runtime.running().is_empty());
        assert_eq!(position(&runtime.events(), &started("api")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_stop_during_cancellation_is_left_running() {
        let runtime = Arc::new(
            MemoryRuntime::new()
                .never_ready("db")
                .fail_stop("cache", "device busy"),
        );
        let config = config(vec![
            ServiceSpec::new("cache", "redis"),
            ServiceSpec::new("db", "postgres"),
        ]);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(2)).await;
            trigger.cancel();
        });

        let supervisor = supervisor(&runtime);
        let mut handle = supervisor.start(config, cancel).await;

        let shutdown = handle.shutdown().unwrap();
        assert_eq!(shutdown.stopped, vec!["db"]);
        assert_eq!(
            shutdown.failed,
            vec![("cache".to_string(), RuntimeError::Stop("device busy".to_string()))]
        );
        assert_eq!(runtime.running(), vec!["cache".to_string()]);
        assert_eq!(handle.left_running(), vec!["cache"]);

        // Already swept; the failure stays reported.
        assert!(supervisor.stop(&mut handle).await.is_empty());
        assert_eq!(handle.left_running(), vec!["cache"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversized_healthcheck_interval_does_not_abort_startup() {
        let yaml = r#"
services:
  redis:
    image: redis
  postgres:
    image: postgres
    healthcheck:
      test: pg_isready
      interval: 5000000000000000000s
      retries: 4
"#;
        let config = ComposeParser::load(yaml, &HashMap::<String, String>::new()).unwrap();
        let runtime = Arc::new(MemoryRuntime::new());

        let handle = supervisor(&runtime)
            .start(config, CancellationToken::new())
            .await;

        assert!(handle.check().is_ok());
        assert_eq!(handle.state("postgres"), Some(ServiceState::Ready));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_launches_nothing() {
        let runtime = Arc::new(MemoryRuntime::new());
        let config = config(vec![ServiceSpec::new("redis", "redis")]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let handle = supervisor(&runtime).start(config, cancel).await;

        assert!(runtime.events().is_empty());
        assert_eq!(handle.state("redis"), Some(ServiceState::Pending));
        assert_eq!(
            handle.outcome().skipped,
            vec![SkippedService {
                service: "redis".to_string(),
                blocked_by: None,
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthcheck_sets_readiness_timeout() {
        let yaml = r#"
services:
  postgres:
    image: postgres
    healthcheck:
      test: pg_isready
      interval: 1s
      retries: 3
"#;
        let config = ComposeParser::load(yaml, &HashMap::<String, String>::new()).unwrap();
        let runtime = Arc::new(MemoryRuntime::new().never_ready("postgres"));

        let handle = supervisor(&runtime)
            .start(config, CancellationToken::new())
            .await;

        assert_eq!(
            handle.outcome().failures[0].cause,
            RuntimeError::Timeout(Duration::from_secs(3))
        );
    }

    #[tokio::test]
    async fn test_down_stops_everything_in_reverse() {
        let runtime = Arc::new(MemoryRuntime::new());
        let config = config(vec![
            ServiceSpec::new("api", "node").depends_on("db"),
            ServiceSpec::new("db", "postgres"),
            ServiceSpec::new("cache", "redis"),
        ]);

        runtime.start_service(&config.services()[1]).await.unwrap();
        runtime.start_service(&config.services()[0]).await.unwrap();

        let result = supervisor(&runtime).down(config).await;
        assert_eq!(result.stopped, vec!["api", "db"]);
        assert_eq!(result.not_running, vec!["cache"]);
        assert_eq!(
            runtime.events()[2..],
            [stopped("api"), stopped("db")]
        );
    }

    #[tokio::test]
    async fn test_status_reports_readiness() {
        let runtime = Arc::new(MemoryRuntime::new());
        let config = config(vec![
            ServiceSpec::new("redis", "redis:7"),
            ServiceSpec::new("postgres", "postgres:16"),
        ]);
        runtime.start_service(&config.services()[0]).await.unwrap();

        let statuses = supervisor(&runtime).status(&config).await;
        assert_eq!(
            statuses,
            vec![
                ServiceStatus {
                    service: "redis".to_string(),
                    image: "redis:7".to_string(),
                    ready: true,
                },
                ServiceStatus {
                    service: "postgres".to_string(),
                    image: "postgres:16".to_string(),
                    ready: false,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_variable_never_reaches_start() {
        let yaml = r#"
services:
  redis:
    image: redis
  postgres:
    image: postgres
    environment:
      POSTGRES_DB: ${POSTGRES_DB}
"#;
        let runtime = Arc::new(MemoryRuntime::new());

        let result = ComposeParser::load(yaml, &HashMap::<String, String>::new());
        assert_eq!(
            result.unwrap_err(),
            ConfigError::MissingVariable("POSTGRES_DB".to_string())
        );
        assert!(runtime.events().is_empty());
    }
}
