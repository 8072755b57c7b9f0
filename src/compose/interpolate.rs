//! Variable substitution for compose values
//!
//! Supported forms:
//!
//! - `${NAME}`: value of `NAME`, error if unset
//! - `${NAME:-default}`: `default` when `NAME` is unset or empty
//! - `${NAME-default}`: `default` when `NAME` is unset
//! - `$$`: a literal `$`

use crate::error::{ConfigError, Result};
use regex::{Captures, Regex};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;

/// Lookup of variable values used during substitution
pub trait VariableSource {
    fn get(&self, name: &str) -> Option<String>;
}

impl VariableSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

impl VariableSource for BTreeMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        BTreeMap::get(self, name).cloned()
    }
}

impl<S: VariableSource + ?Sized> VariableSource for &S {
    fn get(&self, name: &str) -> Option<String> {
        (**self).get(name)
    }
}

/// Snapshot of the process environment layered over an optional `.env` file.
///
/// Process variables take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct ProcessEnvironment {
    vars: HashMap<String, String>,
}

impl ProcessEnvironment {
    /// Capture the current process environment.
    ///
    /// Variables from `env_file` are loaded into the process environment
    /// first; ones already set are left alone.
    pub fn capture(env_file: Option<&Path>) -> Result<Self> {
        if let Some(path) = env_file {
            dotenv::from_path(path).map_err(|e| {
                ConfigError::Parse(format!("Failed to load {}: {}", path.display(), e))
            })?;
            tracing::debug!("Loaded variables from {}", path.display());
        }

        Ok(Self {
            vars: std::env::vars().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }
}

impl VariableSource for ProcessEnvironment {
    fn get(&self, name: &str) -> Option<String> {
        self.vars.get(name).cloned()
    }
}

fn placeholder() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\$|\$\{([A-Za-z_][A-Za-z0-9_]*)(?:(:?-)([^}]*))?\}|\$\{")
            .expect("placeholder pattern is valid")
    })
}

/// Substitute every placeholder in `input`
pub fn interpolate<V: VariableSource + ?Sized>(
    input: &str,
    vars: &V,
) -> std::result::Result<String, ConfigError> {
    if !input.contains('$') {
        return Ok(input.to_string());
    }

    let mut output = String::with_capacity(input.len());
    let mut last = 0;

    for caps in placeholder().captures_iter(input) {
        let whole = caps.get(0).expect("group 0 always matches");
        output.push_str(&input[last..whole.start()]);
        output.push_str(&substitute(&caps, input, vars)?);
        last = whole.end();
    }

    output.push_str(&input[last..]);
    Ok(output)
}

fn substitute<V: VariableSource + ?Sized>(
    caps: &Captures<'_>,
    input: &str,
    vars: &V,
) -> std::result::Result<String, ConfigError> {
    if &caps[0] == "$$" {
        return Ok("$".to_string());
    }

    let name = caps.get(1).map(|m| m.as_str()).ok_or_else(|| {
        ConfigError::Parse(format!("Invalid interpolation format in '{}'", input))
    })?;
    let value = vars.get(name);

    match (caps.get(2).map(|m| m.as_str()), caps.get(3)) {
        (Some(":-"), Some(default)) => Ok(value
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| default.as_str().to_string())),
        (Some("-"), Some(default)) => Ok(value.unwrap_or_else(|| default.as_str().to_string())),
        _ => value.ok_or_else(|| ConfigError::MissingVariable(name.to_string())),
    }
}
