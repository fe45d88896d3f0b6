//! Per-service status machine and runtime registry.
//!
//! All mutable service state lives behind one registry lock; supervisor
//! callbacks (exit, log lines) and toggle requests marshal through it, so
//! no two mutations of the same service's runtime interleave. Exit
//! classification in particular reads the status under the same lock that
//! wrote `Stopping`: a termination observed while `Stopping` is a
//! deliberate stop, anything else is a crash.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, warn};

use crate::{
    constants::{GRACE_WINDOW, TOGGLE_COOLDOWN},
    error::EnvManagerError,
    logs::{LogBuffer, LogEntry, LogStream},
    supervisor::{ExitEvent, ProcessSupervisor},
    watchdog::client::WatchdogClient,
};

/// Lifecycle status of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceStatus {
    /// Whether the service is mid-transition. New start requests are
    /// rejected in these states.
    pub fn is_transitional(self) -> bool {
        matches!(self, ServiceStatus::Starting | ServiceStatus::Stopping)
    }
}

/// Mutable runtime state for one service. Never persisted; every process
/// start begins from defaults.
struct ServiceRuntime {
    status: ServiceStatus,
    restart_count: u32,
    last_error: Option<String>,
    last_toggle: Option<Instant>,
    logs: LogBuffer,
}

impl Default for ServiceRuntime {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            restart_count: 0,
            last_error: None,
            last_toggle: None,
            logs: LogBuffer::new(),
        }
    }
}

/// Read-only view of a service's runtime state.
#[derive(Debug, Clone)]
pub struct ServiceSnapshot {
    pub status: ServiceStatus,
    pub restart_count: u32,
    pub last_error: Option<String>,
}

type Registry = Arc<Mutex<HashMap<String, ServiceRuntime>>>;

/// Drives service status transitions and owns the supervisor.
/// Cheap to clone; clones share the registry.
#[derive(Clone)]
pub struct ServiceManager {
    registry: Registry,
    supervisor: ProcessSupervisor,
}

impl ServiceManager {
    /// Builds a manager whose supervisor callbacks feed this registry.
    pub fn new(watchdog: WatchdogClient) -> Self {
        let registry: Registry = Arc::new(Mutex::new(HashMap::new()));

        let on_exit = {
            let registry = Arc::clone(&registry);
            Arc::new(move |event: ExitEvent| classify_exit(&registry, event))
                as Arc<dyn Fn(ExitEvent) + Send + Sync>
        };
        let on_log = {
            let registry = Arc::clone(&registry);
            Arc::new(move |service: &str, stream: LogStream, line: String| {
                if let Ok(mut guard) = registry.lock() {
                    guard.entry(service.to_string()).or_default().logs.push(stream, line);
                }
            }) as Arc<dyn Fn(&str, LogStream, String) + Send + Sync>
        };

        Self {
            registry,
            supervisor: ProcessSupervisor::new(watchdog, on_exit, on_log),
        }
    }

    /// User-initiated start. Debounced by the per-service cooldown.
    ///
    /// The registry has no notion of environments, so the precondition
    /// that a failed service is only restarted while its owning
    /// environment is active belongs to the caller; in the binary that is
    /// [`EnvironmentCoordinator`](crate::environment::EnvironmentCoordinator),
    /// the sole start path.
    pub fn start_service(
        &self,
        service: &str,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), EnvManagerError> {
        self.start_inner(service, command, working_dir, env, true)
    }

    /// Start on behalf of an environment activation; the environment's own
    /// cooldown already absorbed the user input.
    pub fn start_unthrottled(
        &self,
        service: &str,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<(), EnvManagerError> {
        self.start_inner(service, command, working_dir, env, false)
    }

    fn start_inner(
        &self,
        service: &str,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
        enforce_cooldown: bool,
    ) -> Result<(), EnvManagerError> {
        {
            let mut registry = self.registry.lock()?;
            let runtime = registry.entry(service.to_string()).or_default();

            if enforce_cooldown && within_cooldown(runtime.last_toggle) {
                debug!("Start of '{service}' dropped by cooldown");
                return Err(EnvManagerError::Cooldown {
                    entity: service.to_string(),
                });
            }
            if runtime.status.is_transitional() {
                return Err(EnvManagerError::Transitioning {
                    entity: service.to_string(),
                });
            }
            if runtime.status == ServiceStatus::Running {
                return Err(EnvManagerError::ServiceAlreadyRunning {
                    service: service.to_string(),
                });
            }
            if runtime.status == ServiceStatus::Failed {
                runtime.restart_count += 1;
            }

            runtime.status = ServiceStatus::Starting;
            runtime.last_error = None;
            runtime.last_toggle = Some(Instant::now());
        }

        if let Err(err) = self.supervisor.spawn(service, command, working_dir, env) {
            let mut registry = self.registry.lock()?;
            let runtime = registry.entry(service.to_string()).or_default();
            runtime.status = ServiceStatus::Failed;
            runtime.last_error = Some(err.to_string());
            return Err(err);
        }

        // Promote to running only if the process survives the grace window;
        // an earlier exit has already moved the status to failed.
        let manager = self.clone();
        let service = service.to_string();
        thread::spawn(move || {
            thread::sleep(GRACE_WINDOW);
            if let Ok(mut registry) = manager.registry.lock()
                && let Some(runtime) = registry.get_mut(&service)
                && runtime.status == ServiceStatus::Starting
                && manager.supervisor.is_running(&service)
            {
                runtime.status = ServiceStatus::Running;
                debug!("Service '{service}' is running");
            }
        });

        Ok(())
    }

    /// User-initiated stop. Debounced by the per-service cooldown;
    /// idempotent for services already stopping or stopped.
    pub fn stop_service(&self, service: &str) -> Result<(), EnvManagerError> {
        self.stop_inner(service, true)
    }

    /// Stop on behalf of an environment deactivation.
    pub fn stop_unthrottled(&self, service: &str) -> Result<(), EnvManagerError> {
        self.stop_inner(service, false)
    }

    fn stop_inner(&self, service: &str, enforce_cooldown: bool) -> Result<(), EnvManagerError> {
        {
            let mut registry = self.registry.lock()?;
            let runtime = registry.entry(service.to_string()).or_default();

            match runtime.status {
                ServiceStatus::Stopping => return Ok(()),
                ServiceStatus::Stopped => return Ok(()),
                _ => {}
            }
            if enforce_cooldown && within_cooldown(runtime.last_toggle) {
                debug!("Stop of '{service}' dropped by cooldown");
                return Err(EnvManagerError::Cooldown {
                    entity: service.to_string(),
                });
            }

            runtime.status = ServiceStatus::Stopping;
            runtime.last_toggle = Some(Instant::now());
        }

        // Blocks this worker for up to the stop timeout; the registry lock
        // is not held across it.
        let result = self.supervisor.stop(service);

        // The exit callback normally lands the terminal state. When there
        // was no process to wait on (failed service, already-gone child),
        // settle the transition here.
        let mut registry = self.registry.lock()?;
        if let Some(runtime) = registry.get_mut(service)
            && runtime.status == ServiceStatus::Stopping
        {
            runtime.status = ServiceStatus::Stopped;
            runtime.restart_count = 0;
            runtime.last_error = None;
        }
        drop(registry);

        result
    }

    /// Stops every service with a live process and settles their statuses.
    /// Used at shutdown.
    pub fn stop_all(&self, timeout: Duration) {
        let services = self.supervisor.running_services();
        if services.is_empty() {
            return;
        }

        if let Ok(mut registry) = self.registry.lock() {
            for service in &services {
                let runtime = registry.entry(service.clone()).or_default();
                if runtime.status != ServiceStatus::Stopping {
                    runtime.status = ServiceStatus::Stopping;
                }
            }
        }

        self.supervisor.stop_all(timeout);

        if let Ok(mut registry) = self.registry.lock() {
            for service in &services {
                if let Some(runtime) = registry.get_mut(service)
                    && runtime.status == ServiceStatus::Stopping
                {
                    runtime.status = ServiceStatus::Stopped;
                    runtime.restart_count = 0;
                }
            }
        } else {
            warn!("Registry poisoned during shutdown");
        }
    }

    /// Current status; unknown services report as stopped.
    pub fn status(&self, service: &str) -> ServiceStatus {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.get(service).map(|rt| rt.status))
            .unwrap_or(ServiceStatus::Stopped)
    }

    /// Runtime snapshot for display.
    pub fn snapshot(&self, service: &str) -> Option<ServiceSnapshot> {
        let registry = self.registry.lock().ok()?;
        registry.get(service).map(|rt| ServiceSnapshot {
            status: rt.status,
            restart_count: rt.restart_count,
            last_error: rt.last_error.clone(),
        })
    }

    /// Recent log entries, oldest first.
    pub fn logs(&self, service: &str) -> Vec<LogEntry> {
        self.registry
            .lock()
            .ok()
            .and_then(|r| r.get(service).map(|rt| rt.logs.entries().cloned().collect()))
            .unwrap_or_default()
    }

    /// Whether the supervisor tracks a live process for the service.
    pub fn is_running(&self, service: &str) -> bool {
        self.supervisor.is_running(service)
    }
}

fn within_cooldown(last_toggle: Option<Instant>) -> bool {
    last_toggle.is_some_and(|at| at.elapsed() < TOGGLE_COOLDOWN)
}

/// Classifies a process exit under the registry lock. `Stopping` at the
/// moment of exit means a deliberate stop; every other status means the
/// process died on its own.
fn classify_exit(registry: &Registry, event: ExitEvent) {
    let Ok(mut guard) = registry.lock() else {
        warn!("Registry poisoned; dropping exit event for '{}'", event.service);
        return;
    };
    let runtime = guard.entry(event.service.clone()).or_default();

    if runtime.status == ServiceStatus::Stopping {
        runtime.status = ServiceStatus::Stopped;
        runtime.restart_count = 0;
        runtime.last_error = None;
        debug!("Service '{}' stopped", event.service);
    } else {
        runtime.status = ServiceStatus::Failed;
        runtime.last_error = Some(describe_exit(&event));
        warn!(
            "Service '{}' exited unexpectedly: {}",
            event.service,
            runtime.last_error.as_deref().unwrap_or("unknown")
        );
    }
}

fn describe_exit(event: &ExitEvent) -> String {
    match (event.code, event.signal) {
        (Some(code), _) => format!("exited with code {code}"),
        (None, Some(signal)) => format!("terminated by signal {signal}"),
        (None, None) => "exited with unknown status".to_string(),
    }
}
