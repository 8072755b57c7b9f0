//! Docker CLI runtime

use super::{ContainerRuntime, RuntimeHandle, StopOutcome};
use crate::compose::spec::format_duration;
use crate::compose::ServiceSpec;
use crate::error::RuntimeError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// Label carrying the project name
pub const PROJECT_LABEL: &str = "com.docker.compose.project";

/// Label carrying the service name
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

const STATE_FORMAT: &str =
    "{{if .State.Health}}{{.State.Health.Status}}{{else}}{{.State.Status}}{{end}}";

/// Runtime that drives the `docker` command line client
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    /// Client binary
    binary: PathBuf,
    /// Project name used for container names and labels
    project: String,
    /// Directory relative bind mounts are resolved against
    working_dir: PathBuf,
}

impl DockerRuntime {
    pub fn new(project: &str, working_dir: PathBuf) -> Self {
        Self {
            binary: PathBuf::from("docker"),
            project: project.to_string(),
            working_dir,
        }
    }

    /// Use a different client binary (e.g. `podman`)
    pub fn with_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Container name for a service
    pub fn container_name(&self, service: &str) -> String {
        format!("{}-{}-1", self.project, service)
    }

    /// Arguments for `docker run`
    pub fn run_args(&self, spec: &ServiceSpec) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--detach".to_string(),
            "--name".to_string(),
            self.container_name(&spec.name),
            "--label".to_string(),
            format!("{}={}", PROJECT_LABEL, self.project),
            "--label".to_string(),
            format!("{}={}", SERVICE_LABEL, spec.name),
        ];

        for port in &spec.ports {
            args.push("--publish".to_string());
            args.push(port.to_string());
        }

        for (key, value) in &spec.environment {
            args.push("--env".to_string());
            args.push(format!("{}={}", key, value));
        }

        for volume in &spec.volumes {
            let source = self.mount_source(&volume.source);
            let mode = if volume.read_only { ":ro" } else { "" };
            args.push("--volume".to_string());
            args.push(format!("{}:{}{}", source, volume.target, mode));
        }

        if let Some(check) = &spec.healthcheck {
            if check.disabled {
                args.push("--no-healthcheck".to_string());
            } else {
                if let Some(test) = &check.test {
                    args.push(format!("--health-cmd={}", test));
                }
                if let Some(interval) = check.interval {
                    args.push(format!("--health-interval={}", format_duration(interval)));
                }
                if let Some(timeout) = check.timeout {
                    args.push(format!("--health-timeout={}", format_duration(timeout)));
                }
                if let Some(retries) = check.retries {
                    args.push(format!("--health-retries={}", retries));
                }
                if let Some(start_period) = check.start_period {
                    args.push(format!(
                        "--health-start-period={}",
                        format_duration(start_period)
                    ));
                }
            }
        }

        args.push(spec.image.clone());
        args.extend(spec.command.iter().cloned());
        args
    }

    /// Bind mounts written as relative paths are anchored at the project
    /// directory; anything else is a named volume or an absolute path.
    fn mount_source(&self, source: &str) -> String {
        if source.starts_with("./") || source.starts_with("../") || source == "." {
            let relative = source.strip_prefix("./").unwrap_or(source);
            self.working_dir.join(relative).display().to_string()
        } else {
            source.to_string()
        }
    }

    async fn docker(&self, args: &[String]) -> Result<String, String> {
        tracing::debug!("{} {}", self.binary.display(), args.join(" "));

        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| format!("failed to run {}: {}", self.binary.display(), e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start_service(&self, spec: &ServiceSpec) -> Result<RuntimeHandle, RuntimeError> {
        let name = self.container_name(&spec.name);

        // A container left behind by an earlier run would block the name.
        if self
            .docker(&["rm".to_string(), "--force".to_string(), name.clone()])
            .await
            .is_ok()
        {
            tracing::debug!("Removed stale container {}", name);
        }

        let id = self
            .docker(&self.run_args(spec))
            .await
            .map_err(RuntimeError::Start)?;

        tracing::info!("Created container {} for service {}", name, spec.name);
        Ok(RuntimeHandle::new(&spec.name, &id))
    }

    async fn is_ready(&self, name: &str) -> bool {
        let args = [
            "inspect".to_string(),
            "--format".to_string(),
            STATE_FORMAT.to_string(),
            self.container_name(name),
        ];

        match self.docker(&args).await {
            Ok(state) => state == "healthy" || state == "running",
            Err(e) => {
                tracing::debug!("inspect {} failed: {}", name, e);
                false
            }
        }
    }

    /// Stops and removes the service container
    async fn stop_service(&self, name: &str) -> StopOutcome {
        let args = ["rm".to_string(), "--force".to_string(), self.container_name(name)];

        match self.docker(&args).await {
            Ok(out) if out.is_empty() => StopOutcome::NotRunning,
            Ok(_) => StopOutcome::Stopped,
            Err(e) if e.contains("No such container") => StopOutcome::NotRunning,
            Err(e) => StopOutcome::Failed(e),
        }
    }
}
