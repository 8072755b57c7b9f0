//! Berth - compose-style service supervisor
//!
//! This is the main CLI entry point for Berth.

use anyhow::Context;
use berth::compose::{ComposeParser, ProcessEnvironment, ResolvedConfig};
use berth::container::{ContainerRuntime, DockerRuntime, MemoryRuntime};
use berth::supervisor::{Supervisor, SupervisorOptions};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Berth - compose-style service supervisor
#[derive(Parser)]
#[command(name = "berth")]
#[command(version)]
#[command(about = "Bring up the services of a compose file in dependency order", long_about = None)]
struct Cli {
    /// Compose file; repeat to merge overrides
    #[arg(short, long, global = true)]
    file: Vec<PathBuf>,

    /// Project name
    #[arg(short, long, global = true)]
    project_name: Option<String>,

    /// Variables file (defaults to .env next to the compose file)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    /// Use the in-memory runtime instead of docker
    #[arg(long, global = true)]
    dry_run: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create and start services
    Up {
        /// Readiness timeout in seconds
        #[arg(short, long)]
        timeout: Option<u64>,
        /// Maximum number of services starting at once
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Stop and remove services
    Down,

    /// Print the resolved configuration
    Config {
        /// Print JSON instead of YAML
        #[arg(long)]
        json: bool,
    },

    /// List services
    Ps,
}

/// Loaded project
struct Project {
    name: String,
    dir: PathBuf,
    config: ResolvedConfig,
}

fn compose_files(cli: &Cli, cwd: &Path) -> anyhow::Result<Vec<PathBuf>> {
    if !cli.file.is_empty() {
        return Ok(cli.file.clone());
    }
    ComposeParser::find_compose_file(cwd)
        .map(|file| vec![file])
        .with_context(|| format!("no compose file found in {}", cwd.display()))
}

fn load_project(cli: &Cli) -> anyhow::Result<Project> {
    let cwd = std::env::current_dir()?;
    let files = compose_files(cli, &cwd)?;

    let dir = files[0]
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| cwd.clone());

    let env_file = match &cli.env_file {
        Some(path) => Some(path.clone()),
        None => Some(dir.join(".env")).filter(|p| p.is_file()),
    };
    let vars = ProcessEnvironment::capture(env_file.as_deref())
        .with_context(|| format!("failed to read {}", env_file.unwrap_or_default().display()))?;

    let paths: Vec<&Path> = files.iter().map(PathBuf::as_path).collect();
    let config = ComposeParser::load_files(&paths, &vars)?;

    let name = cli
        .project_name
        .clone()
        .or_else(|| config.project().map(str::to_string))
        .or_else(|| {
            dir.canonicalize()
                .ok()
                .and_then(|d| d.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        })
        .unwrap_or_else(|| "default".to_string());

    tracing::debug!("Loaded project {} with {} services", name, config.len());
    Ok(Project { name, dir, config })
}

fn runtime(cli: &Cli, project: &Project) -> Arc<dyn ContainerRuntime> {
    if cli.dry_run {
        Arc::new(MemoryRuntime::new())
    } else {
        Arc::new(DockerRuntime::new(&project.name, project.dir.clone()))
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let project = load_project(&cli)?;

    match &cli.command {
        Commands::Up { timeout, parallel } => {
            let mut options = SupervisorOptions::default();
            if let Some(secs) = timeout {
                options.ready_timeout = Duration::from_secs(*secs);
            }
            if let Some(n) = parallel {
                options.parallelism = *n;
            }

            let supervisor = Supervisor::new(runtime(&cli, &project), options);

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, shutting down");
                    on_signal.cancel();
                }
            });

            let handle = supervisor.start(project.config, cancel).await;
            let outcome = handle.outcome();

            for service in &outcome.ready {
                println!("{} ready", service);
            }

            if let Err(e) = handle.check() {
                eprintln!("Error: {}", e);
                for failure in outcome.failures.iter().skip(1) {
                    eprintln!("Error: Service '{}' {}", failure.service, failure.cause);
                }
                for skipped in &outcome.skipped {
                    match &skipped.blocked_by {
                        Some(dep) => eprintln!("{} not started: {} failed", skipped.service, dep),
                        None => eprintln!("{} not started", skipped.service),
                    }
                }
                if let Some(shutdown) = handle.shutdown() {
                    for (service, cause) in &shutdown.failed {
                        eprintln!("Error: Service '{}' {}", service, cause);
                    }
                }
                let left = handle.left_running();
                if !left.is_empty() {
                    eprintln!("Left running: {}", left.join(", "));
                }
                return Ok(ExitCode::FAILURE);
            }

            println!("Project {} is up", project.name);
        }

        Commands::Down => {
            let supervisor = Supervisor::new(runtime(&cli, &project), SupervisorOptions::default());
            let result = supervisor.down(project.config).await;

            for service in &result.stopped {
                println!("{} stopped", service);
            }
            for (service, cause) in &result.failed {
                eprintln!("Error: Service '{}' {}", service, cause);
            }
            if let Err(e) = result.into_result() {
                eprintln!("Error: {}", e);
                return Ok(ExitCode::FAILURE);
            }
        }

        Commands::Config { json } => {
            let rendered = if *json {
                serde_json::to_string_pretty(&project.config)?
            } else {
                serde_yaml::to_string(&project.config)?
            };
            println!("{}", rendered.trim_end());
        }

        Commands::Ps => {
            let supervisor = Supervisor::new(runtime(&cli, &project), SupervisorOptions::default());

            println!("{:<20} {:<30} {}", "SERVICE", "IMAGE", "STATUS");
            for status in supervisor.status(&project.config).await {
                let state = if status.ready { "ready" } else { "not ready" };
                println!("{:<20} {:<30} {}", status.service, status.image, state);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    let default = if cli.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
