//! Compose file configuration types
//!
//! These mirror the file as written, before variable substitution. See
//! [`crate::compose::spec`] for the validated form.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Compose file configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Project name
    #[serde(default)]
    pub name: Option<String>,
    /// Services
    #[serde(default)]
    pub services: ServiceEntries,
}

/// Services in declaration order.
///
/// Repeated keys are kept so that validation can report them.
#[derive(Debug, Clone, Default)]
pub struct ServiceEntries(Vec<(String, ServiceConfig)>);

impl ServiceEntries {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ServiceConfig)> {
        self.0.iter().map(|(name, service)| (name.as_str(), service))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|(n, _)| n == name)
    }

    /// First service declared under `name`
    pub fn get(&self, name: &str) -> Option<&ServiceConfig> {
        self.0.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ServiceConfig> {
        self.0.iter_mut().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn push(&mut self, name: impl Into<String>, service: ServiceConfig) {
        self.0.push((name.into(), service));
    }
}

impl IntoIterator for ServiceEntries {
    type Item = (String, ServiceConfig);
    type IntoIter = std::vec::IntoIter<(String, ServiceConfig)>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'de> Deserialize<'de> for ServiceEntries {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntriesVisitor;

        impl<'de> Visitor<'de> for EntriesVisitor {
            type Value = ServiceEntries;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a mapping of service names to service definitions")
            }

            fn visit_unit<E: serde::de::Error>(self) -> Result<Self::Value, E> {
                Ok(ServiceEntries::default())
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((name, service)) = map.next_entry::<String, Option<ServiceConfig>>()? {
                    entries.push((name, service.unwrap_or_default()));
                }
                Ok(ServiceEntries(entries))
            }
        }

        deserializer.deserialize_any(EntriesVisitor)
    }
}

impl Serialize for ServiceEntries {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, service) in &self.0 {
            map.serialize_entry(name, service)?;
        }
        map.end()
    }
}

/// Service configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Image name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Command to run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<CommandConfig>,
    /// Environment variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<EnvironmentConfig>,
    /// Port mappings, `"HOST:CONTAINER[/PROTOCOL]"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<ScalarValue>>,
    /// Volume mounts, `"HOSTPATH:CONTAINERPATH[:MODE]"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volumes: Option<Vec<String>>,
    /// Service dependencies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<DependsOnConfig>,
    /// Healthcheck configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthcheckConfig>,
}

/// Plain YAML scalar.
///
/// Compose files routinely write ports and environment values unquoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Integer(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", x),
            ScalarValue::String(s) => f.write_str(s),
        }
    }
}

impl From<&str> for ScalarValue {
    fn from(s: &str) -> Self {
        ScalarValue::String(s.to_string())
    }
}

/// Command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandConfig {
    /// Shell command string
    Shell(String),
    /// Exec form array
    Exec(Vec<String>),
}

/// Environment configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EnvironmentConfig {
    /// Array of KEY=value strings
    Array(Vec<String>),
    /// Map of key to value
    Map(BTreeMap<String, Option<ScalarValue>>),
}

/// Depends on configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DependsOnConfig {
    /// Array of service names
    Array(Vec<String>),
    /// Map of service to condition
    Map(BTreeMap<String, DependsOnCondition>),
}

impl DependsOnConfig {
    pub fn names(&self) -> Vec<String> {
        match self {
            DependsOnConfig::Array(arr) => arr.clone(),
            DependsOnConfig::Map(map) => map.keys().cloned().collect(),
        }
    }
}

/// Depends on condition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependsOnCondition {
    /// Condition to wait for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Healthcheck configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthcheckConfig {
    /// Test command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test: Option<HealthcheckTest>,
    /// Interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
    /// Timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
    /// Retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    /// Start period
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_period: Option<String>,
    /// Disable healthcheck
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable: Option<bool>,
}

/// Healthcheck test
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HealthcheckTest {
    /// Command string
    Command(String),
    /// Command array
    Array(Vec<String>),
}
