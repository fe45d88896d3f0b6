//! Environment and service definitions with JSON persistence.
//!
//! Definitions are the declarative half of the system: what exists, not
//! what is running. Runtime state (service status, environment phase) is
//! owned by the state machine and coordinator and is never written to disk;
//! every process start begins with all environments inactive.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::error::EnvManagerError;

/// A service bound to an environment: a shell command template plus
/// display metadata. Immutable at runtime except through explicit edits
/// followed by [`save_environments`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceDefinition {
    /// Stable identifier, unique within the environment.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Ports the service is expected to listen on. Display only.
    #[serde(default)]
    pub ports: Vec<u16>,
    /// Command template; `$IP`/`$IPn` tokens are resolved against the
    /// environment's aliases at spawn time.
    pub command: String,
    /// Whether environment activation should start this service.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Ordering index for display.
    #[serde(default)]
    pub order: u32,
}

fn default_enabled() -> bool {
    true
}

/// An additional loopback address, optionally with a domain alias.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InterfaceAlias {
    /// The address to bind on the loopback interface.
    pub address: String,
    /// Optional hosts-style name for the address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

/// A named group of aliases and services toggled as a unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvironmentDefinition {
    /// Environment name, unique across the file.
    pub name: String,
    /// Aliases in bring-up order.
    #[serde(default)]
    pub aliases: Vec<InterfaceAlias>,
    /// Services in display order.
    #[serde(default)]
    pub services: Vec<ServiceDefinition>,
}

impl EnvironmentDefinition {
    /// Alias addresses in list order, the positional input to the resolver.
    pub fn addresses(&self) -> Vec<String> {
        self.aliases.iter().map(|a| a.address.clone()).collect()
    }

    /// Services that activation should start, in `order`.
    pub fn enabled_services(&self) -> Vec<&ServiceDefinition> {
        let mut services: Vec<_> =
            self.services.iter().filter(|s| s.enabled).collect();
        services.sort_by_key(|s| s.order);
        services
    }
}

/// Default environments file under the user's data directory.
pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/".into());
    PathBuf::from(home).join(".local/share/loopman/environments.json")
}

/// Loads the environment definitions. A missing file is an empty list,
/// not an error, so first launch works without setup.
pub fn load_environments(
    path: &Path,
) -> Result<Vec<EnvironmentDefinition>, EnvManagerError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let contents = fs::read_to_string(path).map_err(|e| {
        EnvManagerError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, path.display()),
        ))
    })?;

    let environments: Vec<EnvironmentDefinition> = serde_json::from_str(&contents)?;
    Ok(environments)
}

/// Persists the environment definitions, creating parent directories as
/// needed.
pub fn save_environments(
    path: &Path,
    environments: &[EnvironmentDefinition],
) -> Result<(), EnvManagerError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(environments)?)?;
    Ok(())
}
