//! Compose file parser

use super::config::{
    CommandConfig, ComposeConfig, DependsOnConfig, EnvironmentConfig, HealthcheckConfig,
    HealthcheckTest, ServiceConfig,
};
use super::interpolate::{interpolate, VariableSource};
use super::spec::{parse_duration, HealthCheck, ResolvedConfig, ServiceSpec};
use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default compose file names
pub const DEFAULT_COMPOSE_FILES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
];

/// Compose file parser
pub struct ComposeParser;

impl ComposeParser {
    /// Find compose file in directory
    pub fn find_compose_file(dir: &Path) -> Option<PathBuf> {
        DEFAULT_COMPOSE_FILES
            .iter()
            .map(|name| dir.join(name))
            .find(|path| path.exists())
    }

    /// Parse compose file from path
    pub fn parse_file(path: &Path) -> Result<ComposeConfig> {
        let content = std::fs::read_to_string(path)?;

        Ok(Self::parse_str(&content)?)
    }

    /// Parse compose file from string
    pub fn parse_str(content: &str) -> std::result::Result<ComposeConfig, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::Parse(format!("Failed to parse YAML: {}", e)))
    }

    /// Parse multiple compose files (with merging)
    pub fn parse_files(paths: &[&Path]) -> Result<ComposeConfig> {
        let mut config = ComposeConfig::default();

        for path in paths {
            let file_config = Self::parse_file(path)?;
            check_unique(&file_config)?;
            config = Self::merge_configs(config, file_config);
        }

        Ok(config)
    }

    /// Merge two compose configurations.
    ///
    /// Scalars of a service already declared in `base` are replaced by the
    /// overlay; ports, volumes and dependencies are appended and environment
    /// maps are merged key by key.
    pub fn merge_configs(base: ComposeConfig, overlay: ComposeConfig) -> ComposeConfig {
        let mut result = base;

        if overlay.name.is_some() {
            result.name = overlay.name;
        }

        for (name, service) in overlay.services {
            match result.services.get_mut(&name) {
                Some(existing) => merge_service(existing, service),
                None => result.services.push(name, service),
            }
        }

        result
    }

    /// Substitute variables and validate a parsed configuration
    pub fn resolve<V: VariableSource + ?Sized>(
        config: &ComposeConfig,
        vars: &V,
    ) -> std::result::Result<ResolvedConfig, ConfigError> {
        check_unique(config)?;

        let services = config
            .services
            .iter()
            .map(|(name, service)| resolve_service(name, service, vars))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let project = config
            .name
            .as_deref()
            .map(|name| interpolate(name, vars))
            .transpose()?;

        ResolvedConfig::new(project, services)
    }

    /// Parse, substitute and validate compose text
    pub fn load<V: VariableSource + ?Sized>(
        content: &str,
        vars: &V,
    ) -> std::result::Result<ResolvedConfig, ConfigError> {
        let config = Self::parse_str(content)?;
        Self::resolve(&config, vars)
    }

    /// Load and merge several compose files
    pub fn load_files<V: VariableSource + ?Sized>(paths: &[&Path], vars: &V) -> Result<ResolvedConfig> {
        let config = Self::parse_files(paths)?;
        Ok(Self::resolve(&config, vars)?)
    }
}

fn check_unique(config: &ComposeConfig) -> std::result::Result<(), ConfigError> {
    let mut seen = Vec::with_capacity(config.services.len());
    for (name, _) in config.services.iter() {
        if seen.contains(&name) {
            return Err(ConfigError::DuplicateService(name.to_string()));
        }
        seen.push(name);
    }
    Ok(())
}

fn merge_service(existing: &mut ServiceConfig, overlay: ServiceConfig) {
    if overlay.image.is_some() {
        existing.image = overlay.image;
    }
    if overlay.command.is_some() {
        existing.command = overlay.command;
    }
    if overlay.healthcheck.is_some() {
        existing.healthcheck = overlay.healthcheck;
    }

    if let Some(ports) = overlay.ports {
        existing.ports.get_or_insert_with(Vec::new).extend(ports);
    }
    if let Some(volumes) = overlay.volumes {
        existing.volumes.get_or_insert_with(Vec::new).extend(volumes);
    }

    if let Some(depends) = overlay.depends_on {
        let mut names = existing
            .depends_on
            .as_ref()
            .map(DependsOnConfig::names)
            .unwrap_or_default();
        for name in depends.names() {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        existing.depends_on = Some(DependsOnConfig::Array(names));
    }

    existing.environment = match (existing.environment.take(), overlay.environment) {
        (Some(EnvironmentConfig::Map(mut base)), Some(EnvironmentConfig::Map(extra))) => {
            base.extend(extra);
            Some(EnvironmentConfig::Map(base))
        }
        (base, None) => base,
        (_, extra) => extra,
    };
}

fn resolve_service<V: VariableSource + ?Sized>(
    name: &str,
    service: &ServiceConfig,
    vars: &V,
) -> std::result::Result<ServiceSpec, ConfigError> {
    let image = service
        .image
        .as_deref()
        .ok_or_else(|| ConfigError::MissingImage(name.to_string()))?;

    let mut spec = ServiceSpec::new(name, &interpolate(image, vars)?);

    if let Some(command) = &service.command {
        spec.command = match command {
            CommandConfig::Shell(s) => vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                interpolate(s, vars)?,
            ],
            CommandConfig::Exec(args) => args
                .iter()
                .map(|arg| interpolate(arg, vars))
                .collect::<std::result::Result<_, _>>()?,
        };
    }

    for port in service.ports.iter().flatten() {
        spec.ports.push(interpolate(&port.to_string(), vars)?.parse()?);
    }

    if let Some(environment) = &service.environment {
        spec.environment = resolve_environment(environment, vars)?;
    }

    for volume in service.volumes.iter().flatten() {
        spec.volumes.push(interpolate(volume, vars)?.parse()?);
    }

    if let Some(depends) = &service.depends_on {
        spec.depends_on = depends.names();
    }

    if let Some(check) = &service.healthcheck {
        spec.healthcheck = Some(resolve_healthcheck(check, vars)?);
    }

    Ok(spec)
}

fn resolve_environment<V: VariableSource + ?Sized>(
    environment: &EnvironmentConfig,
    vars: &V,
) -> std::result::Result<BTreeMap<String, String>, ConfigError> {
    let mut resolved = BTreeMap::new();

    match environment {
        EnvironmentConfig::Array(items) => {
            for item in items {
                match item.split_once('=') {
                    Some((key, value)) => {
                        resolved.insert(key.to_string(), interpolate(value, vars)?);
                    }
                    None => {
                        if let Some(value) = vars.get(item) {
                            resolved.insert(item.clone(), value);
                        }
                    }
                }
            }
        }
        EnvironmentConfig::Map(map) => {
            for (key, value) in map {
                match value {
                    Some(value) => {
                        resolved.insert(key.clone(), interpolate(&value.to_string(), vars)?);
                    }
                    None => {
                        if let Some(value) = vars.get(key) {
                            resolved.insert(key.clone(), value);
                        }
                    }
                }
            }
        }
    }

    Ok(resolved)
}

fn resolve_healthcheck<V: VariableSource + ?Sized>(
    check: &HealthcheckConfig,
    vars: &V,
) -> std::result::Result<HealthCheck, ConfigError> {
    let duration = |value: &Option<String>| -> std::result::Result<_, ConfigError> {
        value
            .as_deref()
            .map(|v| interpolate(v, vars).and_then(|v| parse_duration(&v)))
            .transpose()
    };

    let mut disabled = check.disable.unwrap_or(false);
    let test = match &check.test {
        Some(HealthcheckTest::Command(cmd)) => Some(interpolate(cmd, vars)?),
        Some(HealthcheckTest::Array(args)) => match args.split_first() {
            Some((kind, _)) if kind == "NONE" => {
                disabled = true;
                None
            }
            Some((kind, rest)) if kind == "CMD-SHELL" => Some(interpolate(&rest.join(" "), vars)?),
            Some((kind, rest)) if kind == "CMD" => Some(shell_words(rest, vars)?),
            Some(_) => Some(shell_words(args, vars)?),
            None => None,
        },
        None => None,
    };

    Ok(HealthCheck {
        test,
        interval: duration(&check.interval)?,
        timeout: duration(&check.timeout)?,
        retries: check.retries,
        start_period: duration(&check.start_period)?,
        disabled,
    })
}

/// Render exec-form arguments as one shell command line
fn shell_words<V: VariableSource + ?Sized>(
    args: &[String],
    vars: &V,
) -> std::result::Result<String, ConfigError> {
    let words = args
        .iter()
        .map(|arg| interpolate(arg, vars).map(|arg| shell_quote(&arg)))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(words.join(" "))
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
