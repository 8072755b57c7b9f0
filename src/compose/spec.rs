//! Validated service specifications

use super::graph::DependencyGraph;
use crate::error::ConfigError;
use regex::Regex;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

/// Docker's default healthcheck interval
pub const DEFAULT_HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Docker's default healthcheck retry count
pub const DEFAULT_HEALTHCHECK_RETRIES: u32 = 3;

/// One declared service after substitution and validation
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceSpec {
    /// Service name
    #[serde(skip)]
    pub name: String,
    /// Image reference
    pub image: String,
    /// Command override, exec form
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    /// Port mappings
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortMapping>,
    /// Environment variables
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
    /// Volume mounts
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<VolumeMount>,
    /// Services that must be ready first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Healthcheck
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheck>,
}

impl ServiceSpec {
    /// Create a new service specification
    pub fn new(name: &str, image: &str) -> Self {
        Self {
            name: name.to_string(),
            image: image.to_string(),
            command: Vec::new(),
            ports: Vec::new(),
            environment: BTreeMap::new(),
            volumes: Vec::new(),
            depends_on: Vec::new(),
            healthcheck: None,
        }
    }

    /// Add port mapping
    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push(PortMapping {
            host_ip: None,
            host,
            container,
            protocol: Protocol::Tcp,
        });
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.environment.insert(key.to_string(), value.to_string());
        self
    }

    /// Add volume mount
    pub fn volume(mut self, source: &str, target: &str) -> Self {
        self.volumes.push(VolumeMount {
            source: source.to_string(),
            target: target.to_string(),
            read_only: false,
        });
        self
    }

    /// Add dependency
    pub fn depends_on(mut self, service: &str) -> Self {
        self.depends_on.push(service.to_string());
        self
    }

    /// How long the supervisor should wait for readiness, when the
    /// healthcheck says so
    pub fn readiness_timeout(&self) -> Option<Duration> {
        let check = self.healthcheck.as_ref().filter(|h| !h.disabled)?;
        if check.interval.is_none() && check.retries.is_none() && check.start_period.is_none() {
            return None;
        }

        let interval = check.interval.unwrap_or(DEFAULT_HEALTHCHECK_INTERVAL);
        let retries = check.retries.unwrap_or(DEFAULT_HEALTHCHECK_RETRIES).max(1);
        let timeout = interval
            .checked_mul(retries)
            .and_then(|d| d.checked_add(check.start_period.unwrap_or_default()))
            .unwrap_or(Duration::MAX);
        Some(timeout)
    }

    /// Preferred readiness poll interval
    pub fn poll_interval(&self) -> Option<Duration> {
        self.healthcheck
            .as_ref()
            .filter(|h| !h.disabled)
            .and_then(|h| h.interval)
    }
}

/// Port mapping, `"[IP:]HOST:CONTAINER[/PROTOCOL]"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub host_ip: Option<String>,
    pub host: u16,
    pub container: u16,
    pub protocol: Protocol,
}

/// Network protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl FromStr for PortMapping {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPort(s.to_string());

        let (ports, protocol) = match s.split_once('/') {
            Some((ports, "tcp")) => (ports, Protocol::Tcp),
            Some((ports, "udp")) => (ports, Protocol::Udp),
            Some(_) => return Err(invalid()),
            None => (s, Protocol::Tcp),
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host, container) = match parts.as_slice() {
            [host, container] => (None, *host, *container),
            [ip, host, container] if !ip.is_empty() => (Some(ip.to_string()), *host, *container),
            _ => return Err(invalid()),
        };

        Ok(PortMapping {
            host_ip,
            host: parse_port(host).ok_or_else(invalid)?,
            container: parse_port(container).ok_or_else(invalid)?,
            protocol,
        })
    }
}

fn parse_port(s: &str) -> Option<u16> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse::<u16>().ok().filter(|p| *p > 0)
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ip) = &self.host_ip {
            write!(f, "{}:", ip)?;
        }
        write!(f, "{}:{}", self.host, self.container)?;
        if self.protocol == Protocol::Udp {
            write!(f, "/udp")?;
        }
        Ok(())
    }
}

impl Serialize for PortMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Volume mount, `"HOSTPATH:CONTAINERPATH[:ro|rw]"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeMount {
    /// Host path or named volume
    pub source: String,
    /// Absolute path in the container
    pub target: String,
    pub read_only: bool,
}

impl FromStr for VolumeMount {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidVolume(s.to_string());

        let parts: Vec<&str> = s.split(':').collect();
        let (source, target, read_only) = match parts.as_slice() {
            [source, target] => (*source, *target, false),
            [source, target, "ro"] => (*source, *target, true),
            [source, target, "rw"] => (*source, *target, false),
            _ => return Err(invalid()),
        };

        if source.is_empty() || !target.starts_with('/') {
            return Err(invalid());
        }

        Ok(VolumeMount {
            source: source.to_string(),
            target: target.to_string(),
            read_only,
        })
    }
}

impl fmt::Display for VolumeMount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.target)?;
        if self.read_only {
            write!(f, ":ro")?;
        }
        Ok(())
    }
}

impl Serialize for VolumeMount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Healthcheck handed to the runtime
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HealthCheck {
    /// Shell command run inside the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test: Option<String>,
    #[serde(serialize_with = "serialize_duration", skip_serializing_if = "Option::is_none")]
    pub interval: Option<Duration>,
    #[serde(serialize_with = "serialize_duration", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(serialize_with = "serialize_duration", skip_serializing_if = "Option::is_none")]
    pub start_period: Option<Duration>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disabled: bool,
}

fn serialize_duration<S: Serializer>(d: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
    match d {
        Some(d) => serializer.collect_str(&format_duration(*d)),
        None => serializer.serialize_none(),
    }
}

/// Render a duration in compose notation
pub fn format_duration(d: Duration) -> String {
    if d.subsec_nanos() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

fn duration_part() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(\d+(?:\.\d+)?)(ms|us|ns|h|m|s)").expect("duration pattern is valid")
    })
}

/// Parse a compose duration such as `1m30s`, `500ms` or `1.5s`
pub fn parse_duration(s: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(s.to_string());
    let text = s.trim();
    if text.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut consumed = 0;
    for caps in duration_part().captures_iter(text) {
        let whole = caps.get(0).ok_or_else(invalid)?;
        if whole.start() != consumed {
            return Err(invalid());
        }
        consumed = whole.end();

        let value: f64 = caps[1].parse().map_err(|_| invalid())?;
        let scale = match &caps[2] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" => 1e-6,
            _ => 1e-9,
        };
        total += value * scale;
    }

    if consumed != text.len() {
        return Err(invalid());
    }
    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}

/// Validated configuration: services in declaration order plus their
/// startup order
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    project: Option<String>,
    services: Vec<ServiceSpec>,
    graph: DependencyGraph,
}

impl ResolvedConfig {
    /// Validate a set of services
    pub fn new(project: Option<String>, services: Vec<ServiceSpec>) -> Result<Self, ConfigError> {
        for (i, service) in services.iter().enumerate() {
            if services[..i].iter().any(|s| s.name == service.name) {
                return Err(ConfigError::DuplicateService(service.name.clone()));
            }
        }

        let graph = DependencyGraph::build(&services)?;
        Ok(Self {
            project,
            services,
            graph,
        })
    }

    /// Project name declared in the file
    pub fn project(&self) -> Option<&str> {
        self.project.as_deref()
    }

    /// Services in declaration order
    pub fn services(&self) -> &[ServiceSpec] {
        &self.services
    }

    pub fn get(&self, name: &str) -> Option<&ServiceSpec> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.services.iter().position(|s| s.name == name)
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Services in startup order
    pub fn startup_order(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.graph.order().iter().map(move |&i| &self.services[i])
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

impl Serialize for ResolvedConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        struct Services<'a>(&'a [ServiceSpec]);

        impl Serialize for Services<'_> {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                let mut map = serializer.serialize_map(Some(self.0.len()))?;
                for service in self.0 {
                    map.serialize_entry(&service.name, service)?;
                }
                map.end()
            }
        }

        let mut map = serializer.serialize_map(None)?;
        if let Some(project) = &self.project {
            map.serialize_entry("name", project)?;
        }
        map.serialize_entry("services", &Services(&self.services))?;
        map.end()
    }
}
