//! Process supervisor for service child processes.
//!
//! Every service runs as a shell-interpreted child in its own process group,
//! created atomically at spawn via [`CommandExt::process_group`] so there is
//! no window in which the child has exec'd but still shares the supervisor's
//! group. Group-wide signalling is the whole point: user commands are shell
//! pipelines that fork further children, and killing only the immediate
//! child leaks the rest of the tree.
//!
//! Stopping is two-phase: SIGTERM to the group (and the leader directly, as
//! a fallback), liveness polling, then SIGKILL after the timeout. The
//! watchdog client is kept in sync so an orphaned group can still be reaped
//! if this process dies first.

use std::{
    collections::HashMap,
    io::{BufRead, BufReader},
    os::unix::process::{CommandExt, ExitStatusExt},
    path::{Path, PathBuf},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, warn};

use crate::{
    constants::{KILL_SETTLE, STOP_POLL_INTERVAL, STOP_TIMEOUT},
    error::EnvManagerError,
    logs::LogStream,
    watchdog::client::WatchdogClient,
};

/// Exit information delivered to the exit handler. Classification of the
/// exit as expected or unexpected is the state machine's job, not ours.
#[derive(Debug, Clone)]
pub struct ExitEvent {
    /// Service whose process exited.
    pub service: String,
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Terminating signal, when it was killed.
    pub signal: Option<i32>,
}

/// Callback invoked on the waiter thread when a child exits.
pub type ExitHandler = Arc<dyn Fn(ExitEvent) + Send + Sync>;

/// Callback invoked from reader threads for each captured output line.
pub type LogHandler = Arc<dyn Fn(&str, LogStream, String) + Send + Sync>;

/// A live child: its leader PID doubles as the process-group ID.
struct TrackedProcess {
    pid: u32,
    pgid: i32,
    waiter: Option<thread::JoinHandle<()>>,
}

/// Supervises service child processes. Cheap to clone; all clones share the
/// same tracking state.
#[derive(Clone)]
pub struct ProcessSupervisor {
    processes: Arc<Mutex<HashMap<String, TrackedProcess>>>,
    watchdog: WatchdogClient,
    on_exit: ExitHandler,
    on_log: LogHandler,
}

impl ProcessSupervisor {
    /// Creates a supervisor wired to the given watchdog client and callbacks.
    pub fn new(watchdog: WatchdogClient, on_exit: ExitHandler, on_log: LogHandler) -> Self {
        Self {
            processes: Arc::new(Mutex::new(HashMap::new())),
            watchdog,
            on_exit,
            on_log,
        }
    }

    /// Launches `command` under `sh -c` in a fresh process group.
    ///
    /// Fails with [`EnvManagerError::ServiceAlreadyRunning`] and no side
    /// effect when a live process is already tracked for `service`. On
    /// success the group is registered with the watchdog client before this
    /// returns, stdout/stderr are wired to the log handler, and a waiter
    /// thread reaps the child and fires the exit handler.
    pub fn spawn(
        &self,
        service: &str,
        command: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<u32, EnvManagerError> {
        let mut processes = self.processes.lock()?;
        if processes.contains_key(service) {
            return Err(EnvManagerError::ServiceAlreadyRunning {
                service: service.to_string(),
            });
        }

        debug!("Launching service '{service}' with command: `{command}`");

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // New group with pgid == child pid, set atomically at launch.
            .process_group(0);

        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|source| {
            EnvManagerError::ServiceStartError {
                service: service.to_string(),
                source,
            }
        })?;

        let pid = child.id();
        let pgid = pid as i32;
        debug!("Service '{service}' started with PID {pid} (pgid {pgid})");

        // Register before any exit can race us; the waiter thread that
        // deregisters does not exist yet.
        self.watchdog.add_group(pgid);

        if let Some(out) = child.stdout.take() {
            spawn_stream_reader(service, LogStream::Stdout, out, Arc::clone(&self.on_log));
        }
        if let Some(err) = child.stderr.take() {
            spawn_stream_reader(service, LogStream::Stderr, err, Arc::clone(&self.on_log));
        }

        let waiter = {
            let service = service.to_string();
            let processes = Arc::clone(&self.processes);
            let watchdog = self.watchdog.clone();
            let on_exit = Arc::clone(&self.on_exit);
            thread::spawn(move || {
                let status = child.wait();
                let event = match status {
                    Ok(status) => ExitEvent {
                        service: service.clone(),
                        code: status.code(),
                        signal: status.signal(),
                    },
                    Err(err) => {
                        warn!("Failed to reap service '{service}': {err}");
                        ExitEvent {
                            service: service.clone(),
                            code: None,
                            signal: None,
                        }
                    }
                };

                on_exit(event);
                watchdog.remove_group(pgid);

                if let Ok(mut guard) = processes.lock()
                    && guard.get(&service).is_some_and(|p| p.pid == pid)
                {
                    guard.remove(&service);
                }
            })
        };

        processes.insert(
            service.to_string(),
            TrackedProcess {
                pid,
                pgid,
                waiter: Some(waiter),
            },
        );

        Ok(pid)
    }

    /// Stops a service with the default graceful budget.
    pub fn stop(&self, service: &str) -> Result<(), EnvManagerError> {
        self.stop_with_timeout(service, STOP_TIMEOUT)
    }

    /// Stops a service: SIGTERM to the whole group, poll for exit, escalate
    /// to SIGKILL after `timeout`. Completes immediately when no process is
    /// tracked. Blocks the calling worker thread, never the state lock.
    pub fn stop_with_timeout(
        &self,
        service: &str,
        timeout: Duration,
    ) -> Result<(), EnvManagerError> {
        let target = {
            let processes = self.processes.lock()?;
            processes.get(service).map(|p| (p.pid, p.pgid))
        };

        let Some((pid, pgid)) = target else {
            debug!("Service '{service}' has no live process; stop is a no-op");
            return Ok(());
        };

        signal_group(service, pid, pgid, nix::sys::signal::Signal::SIGTERM)?;

        let deadline = Instant::now() + timeout;
        let leader = nix::unistd::Pid::from_raw(pid as i32);
        let mut alive = true;

        while Instant::now() < deadline {
            thread::sleep(STOP_POLL_INTERVAL);
            if matches!(
                nix::sys::signal::kill(leader, None),
                Err(nix::errno::Errno::ESRCH)
            ) {
                alive = false;
                break;
            }
        }

        if alive {
            // Expected escalation path for processes that ignore SIGTERM,
            // logged below failure severity.
            warn!("Service '{service}' did not exit after SIGTERM; sending SIGKILL");
            signal_group(service, pid, pgid, nix::sys::signal::Signal::SIGKILL)?;
            thread::sleep(KILL_SETTLE);
        }

        let waiter = {
            let mut processes = self.processes.lock()?;
            processes
                .remove(service)
                .and_then(|mut p| p.waiter.take())
        };

        if let Some(handle) = waiter
            && handle.join().is_err()
        {
            warn!("Waiter thread for '{service}' panicked during stop");
        }

        debug!("Service '{service}' stopped");
        Ok(())
    }

    /// O(1) liveness query.
    pub fn is_running(&self, service: &str) -> bool {
        self.processes
            .lock()
            .map(|p| p.contains_key(service))
            .unwrap_or(false)
    }

    /// PID of the tracked process, when one exists.
    pub fn pid_of(&self, service: &str) -> Option<u32> {
        self.processes.lock().ok()?.get(service).map(|p| p.pid)
    }

    /// Services with a live tracked process.
    pub fn running_services(&self) -> Vec<String> {
        self.processes
            .lock()
            .map(|p| p.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Stops every tracked service concurrently and returns once all have
    /// confirmed termination, each bounded by `timeout`.
    pub fn stop_all(&self, timeout: Duration) {
        let services = self.running_services();
        let mut handles = Vec::with_capacity(services.len());

        for service in services {
            let supervisor = self.clone();
            handles.push(thread::spawn(move || {
                if let Err(err) = supervisor.stop_with_timeout(&service, timeout) {
                    warn!("Failed to stop service '{service}': {err}");
                }
            }));
        }

        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Sends `signal` to the whole process group and to the leader directly.
/// ESRCH means the target is already gone and is not an error; EPERM on the
/// group falls back to the direct signal.
fn signal_group(
    service: &str,
    pid: u32,
    pgid: i32,
    signal: nix::sys::signal::Signal,
) -> Result<(), EnvManagerError> {
    use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

    match killpg(Pid::from_raw(pgid), signal) {
        Ok(()) => {
            debug!("Sent {signal:?} to process group {pgid} for service '{service}'");
        }
        Err(Errno::ESRCH) => {
            debug!("Process group {pgid} for service '{service}' already gone");
        }
        Err(Errno::EPERM) => {
            warn!(
                "Insufficient permissions to signal process group {pgid} for '{service}'. Falling back to direct signal"
            );
        }
        Err(err) => {
            return Err(EnvManagerError::ServiceStopError {
                service: service.to_string(),
                source: std::io::Error::from_raw_os_error(err as i32),
            });
        }
    }

    match nix::sys::signal::kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(err) => Err(EnvManagerError::ServiceStopError {
            service: service.to_string(),
            source: std::io::Error::from_raw_os_error(err as i32),
        }),
    }
}

/// Reads a child output stream line-wise, decoding UTF-8 lossily, and feeds
/// each line to the log handler.
fn spawn_stream_reader<R>(
    service: &str,
    stream: LogStream,
    source: R,
    on_log: LogHandler,
) where
    R: std::io::Read + Send + 'static,
{
    let service = service.to_string();
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buffer = Vec::new();
        loop {
            buffer.clear();
            match reader.read_until(b'\n', &mut buffer) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buffer)
                        .trim_end_matches(['\n', '\r'])
                        .to_string();
                    on_log(&service, stream, line);
                }
                Err(err) => {
                    debug!("Log reader for '{service}' ({}) ended: {err}", stream.as_ref());
                    break;
                }
            }
        }
    });
}

/// Convenience constructor for a supervisor whose output and exits are only
/// logged, used by read-only commands and tests.
pub fn detached_log_handler() -> LogHandler {
    Arc::new(|service, stream, line| {
        debug!("[{service} {}] {line}", stream.as_ref());
    })
}

/// Default working directory for spawned services.
pub fn default_working_dir() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"))
}
