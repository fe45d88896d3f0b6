//! Environment coordinator: alias bring-up/teardown and grouped service
//! control.
//!
//! An environment toggles as a unit. Activation brings aliases up strictly
//! in list order and rolls the successful prefix back on the first failure,
//! so a half-activated environment never leaks addresses. Service starts
//! after that point are independent failure domains: one service failing to
//! spawn does not undo the aliases or the other services. Deactivation is
//! best-effort on the network side; alias removal failures are logged and
//! never strand the environment in a transitional phase.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Command,
    sync::{Arc, Mutex},
    thread,
    time::Instant,
};

use strum_macros::{AsRefStr, Display};
use tracing::{debug, info, warn};

use crate::{
    config::{EnvironmentDefinition, InterfaceAlias},
    constants::TOGGLE_COOLDOWN,
    error::{ActivationError, EnvManagerError},
    resolver,
    state::{ServiceManager, ServiceStatus},
};

/// Abstraction over the privileged alias operations, so the coordinator can
/// be exercised without touching real interfaces.
pub trait AliasProvider: Send + Sync {
    /// Binds the alias address to the loopback interface.
    fn activate(&self, alias: &InterfaceAlias) -> Result<(), String>;
    /// Removes the alias address from the loopback interface.
    fn deactivate(&self, alias: &InterfaceAlias) -> Result<(), String>;
}

/// Alias provider shelling out to the platform's interface tooling.
pub struct ShellAliasProvider {
    interface: String,
}

impl ShellAliasProvider {
    pub fn new() -> Self {
        #[cfg(target_os = "macos")]
        let interface = "lo0".to_string();
        #[cfg(not(target_os = "macos"))]
        let interface = "lo".to_string();
        Self { interface }
    }

    fn run(&self, mut command: Command) -> Result<(), String> {
        let output = command.output().map_err(|e| e.to_string())?;
        if output.status.success() {
            Ok(())
        } else {
            Err(String::from_utf8_lossy(&output.stderr).trim().to_string())
        }
    }
}

impl Default for ShellAliasProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AliasProvider for ShellAliasProvider {
    fn activate(&self, alias: &InterfaceAlias) -> Result<(), String> {
        let mut command;
        #[cfg(target_os = "macos")]
        {
            command = Command::new("ifconfig");
            command.args([&self.interface, "alias", &alias.address, "up"]);
        }
        #[cfg(not(target_os = "macos"))]
        {
            command = Command::new("ip");
            command.args([
                "addr",
                "add",
                &format!("{}/32", alias.address),
                "dev",
                &self.interface,
            ]);
        }
        self.run(command)
    }

    fn deactivate(&self, alias: &InterfaceAlias) -> Result<(), String> {
        let mut command;
        #[cfg(target_os = "macos")]
        {
            command = Command::new("ifconfig");
            command.args([&self.interface, "-alias", &alias.address]);
        }
        #[cfg(not(target_os = "macos"))]
        {
            command = Command::new("ip");
            command.args([
                "addr",
                "del",
                &format!("{}/32", alias.address),
                "dev",
                &self.interface,
            ]);
        }
        self.run(command)
    }
}

/// Phase of one environment. Never persisted; every process start begins
/// with all environments inactive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum EnvPhase {
    Inactive,
    Activating,
    Active,
    Deactivating,
}

impl EnvPhase {
    pub fn is_transitional(self) -> bool {
        matches!(self, EnvPhase::Activating | EnvPhase::Deactivating)
    }
}

struct EnvRuntime {
    phase: EnvPhase,
    last_toggle: Option<Instant>,
}

impl Default for EnvRuntime {
    fn default() -> Self {
        Self {
            phase: EnvPhase::Inactive,
            last_toggle: None,
        }
    }
}

/// Orchestrates environment activation and deactivation over the service
/// manager and an alias provider. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct EnvironmentCoordinator {
    services: ServiceManager,
    aliases: Arc<dyn AliasProvider>,
    environments: Arc<Mutex<HashMap<String, EnvRuntime>>>,
    working_dir: PathBuf,
}

impl EnvironmentCoordinator {
    pub fn new(
        services: ServiceManager,
        aliases: Arc<dyn AliasProvider>,
        working_dir: PathBuf,
    ) -> Self {
        Self {
            services,
            aliases,
            environments: Arc::new(Mutex::new(HashMap::new())),
            working_dir,
        }
    }

    /// Registry key for a service scoped to its environment.
    pub fn service_key(environment: &str, service: &str) -> String {
        format!("{environment}/{service}")
    }

    /// Activates an environment: aliases strictly in order with rollback on
    /// first failure, then every enabled service independently.
    pub fn activate(&self, env: &EnvironmentDefinition) -> Result<(), ActivationError> {
        self.begin_transition(&env.name, EnvPhase::Activating, EnvPhase::Inactive)?;

        info!("Activating environment '{}'", env.name);

        let mut raised: Vec<&InterfaceAlias> = Vec::with_capacity(env.aliases.len());
        for alias in &env.aliases {
            match self.aliases.activate(alias) {
                Ok(()) => {
                    debug!("Alias {} up", alias.address);
                    raised.push(alias);
                }
                Err(reason) => {
                    let rolled_back = raised.len();
                    // Reverse of the successful prefix.
                    for done in raised.into_iter().rev() {
                        if let Err(err) = self.aliases.deactivate(done) {
                            warn!("Rollback of alias {} failed: {err}", done.address);
                        }
                    }
                    self.set_phase(&env.name, EnvPhase::Inactive);
                    return Err(ActivationError::Alias {
                        alias: alias.address.clone(),
                        reason,
                        rolled_back,
                    });
                }
            }
        }

        self.set_phase(&env.name, EnvPhase::Active);

        let addresses = env.addresses();
        for service in env.enabled_services() {
            let missing = resolver::missing_variables(&service.command, &addresses);
            if !missing.is_empty() {
                warn!(
                    "Service '{}' references unresolved tokens: {}",
                    service.id,
                    missing.join(", ")
                );
            }
            let command = resolver::resolve_command(&service.command, &addresses);
            let key = Self::service_key(&env.name, &service.id);
            if let Err(err) = self.services.start_unthrottled(
                &key,
                &command,
                &self.working_dir,
                &HashMap::new(),
            ) {
                // Independent failure domain; the rest keep starting.
                warn!("Service '{}' failed to start: {err}", service.id);
            }
        }

        info!("Environment '{}' active", env.name);
        Ok(())
    }

    /// Deactivates an environment: stops every active-or-transitional
    /// service concurrently, waits for all, then tears aliases down
    /// best-effort in reverse order.
    pub fn deactivate(&self, env: &EnvironmentDefinition) -> Result<(), EnvManagerError> {
        self.begin_transition(&env.name, EnvPhase::Deactivating, EnvPhase::Active)?;

        info!("Deactivating environment '{}'", env.name);

        let mut handles = Vec::new();
        for service in &env.services {
            let key = Self::service_key(&env.name, &service.id);
            let status = self.services.status(&key);
            if status == ServiceStatus::Stopped || status == ServiceStatus::Failed {
                continue;
            }
            let services = self.services.clone();
            let id = service.id.clone();
            handles.push(thread::spawn(move || {
                if let Err(err) = services.stop_unthrottled(&key) {
                    warn!("Failed to stop service '{id}': {err}");
                }
            }));
        }
        for handle in handles {
            let _ = handle.join();
        }

        for alias in env.aliases.iter().rev() {
            if let Err(err) = self.aliases.deactivate(alias) {
                warn!("Failed to remove alias {}: {err}", alias.address);
            } else {
                debug!("Alias {} down", alias.address);
            }
        }

        self.set_phase(&env.name, EnvPhase::Inactive);
        info!("Environment '{}' inactive", env.name);
        Ok(())
    }

    /// Current phase of an environment.
    pub fn phase(&self, name: &str) -> EnvPhase {
        self.environments
            .lock()
            .ok()
            .and_then(|e| e.get(name).map(|rt| rt.phase))
            .unwrap_or(EnvPhase::Inactive)
    }

    /// The service manager backing this coordinator.
    pub fn services(&self) -> &ServiceManager {
        &self.services
    }

    /// Rejects the toggle while transitioning or inside the cooldown
    /// window, and treats a toggle into the current phase as a no-op
    /// rejection. On success the environment enters `next`.
    fn begin_transition(
        &self,
        name: &str,
        next: EnvPhase,
        expected: EnvPhase,
    ) -> Result<(), EnvManagerError> {
        let mut environments = self.environments.lock()?;
        let runtime = environments.entry(name.to_string()).or_default();

        if runtime.phase.is_transitional() {
            return Err(EnvManagerError::Transitioning {
                entity: name.to_string(),
            });
        }
        if runtime
            .last_toggle
            .is_some_and(|at| at.elapsed() < TOGGLE_COOLDOWN)
        {
            debug!("Toggle of environment '{name}' dropped by cooldown");
            return Err(EnvManagerError::Cooldown {
                entity: name.to_string(),
            });
        }
        if runtime.phase != expected {
            return Err(EnvManagerError::Transitioning {
                entity: name.to_string(),
            });
        }

        runtime.phase = next;
        runtime.last_toggle = Some(Instant::now());
        Ok(())
    }

    fn set_phase(&self, name: &str, phase: EnvPhase) {
        if let Ok(mut environments) = self.environments.lock() {
            environments.entry(name.to_string()).or_default().phase = phase;
        }
    }
}
