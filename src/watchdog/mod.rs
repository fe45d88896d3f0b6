//! Privileged orphan watchdog.
//!
//! The watchdog runs as a separate long-lived process. The supervising
//! application registers its PID and keeps the watchdog's view of live
//! service process groups current with full-replacement updates. If the
//! application dies while registered, the watchdog terminates every tracked
//! group so no service outlives its manager. A graceful shutdown
//! unregisters first, and the watchdog then does nothing.

pub mod client;

use std::{
    collections::BTreeSet,
    fs,
    os::unix::net::{UnixListener, UnixStream},
    path::Path,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::{
    constants::{DEATH_POLL_INTERVAL, FORCE_KILL_DELAY},
    error::WatchdogError,
    ipc::{self, ControlError, WatchdogReply, WatchdogRequest},
};

/// Returns whether a PID refers to a live process. EPERM still means the
/// process exists.
fn process_alive(pid: i32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

/// A background subscription to one process's exit.
struct DeathWatch {
    cancelled: Arc<AtomicBool>,
}

impl DeathWatch {
    /// Watches `pid` and invokes `on_death` once when it exits, unless the
    /// watch is cancelled first.
    fn spawn<F>(pid: i32, on_death: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        thread::spawn(move || {
            wait_for_exit(pid, &flag);
            if !flag.load(Ordering::SeqCst) {
                on_death();
            }
        });
        Self { cancelled }
    }

    /// Disarms the watch. The thread winds down on its own; it only needs
    /// the flag set before the process dies.
    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Drop for DeathWatch {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Blocks until `pid` exits or the watch is cancelled. On macOS and FreeBSD
/// this subscribes to the kernel's process-exit event; elsewhere it falls
/// back to liveness polling.
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
fn wait_for_exit(pid: i32, cancelled: &AtomicBool) {
    use nix::sys::event::{EventFilter, EventFlag, FilterFlag, KEvent, Kqueue};

    let Ok(kq) = Kqueue::new() else {
        poll_for_exit(pid, cancelled);
        return;
    };

    let change = KEvent::new(
        pid as usize,
        EventFilter::EVFILT_PROC,
        EventFlag::EV_ADD | EventFlag::EV_ONESHOT,
        FilterFlag::NOTE_EXIT,
        0,
        0,
    );
    let mut events = [KEvent::new(
        0,
        EventFilter::EVFILT_PROC,
        EventFlag::empty(),
        FilterFlag::empty(),
        0,
        0,
    )];

    // ESRCH on registration means the process is already gone. Any other
    // failure is not evidence of death; fall back to liveness polling.
    match kq.kevent(&[change], &mut [], None) {
        Ok(_) => {}
        Err(nix::errno::Errno::ESRCH) => return,
        Err(_) => {
            poll_for_exit(pid, cancelled);
            return;
        }
    }

    loop {
        if cancelled.load(Ordering::SeqCst) {
            return;
        }
        match kq.kevent(&[], &mut events, Some(DEATH_POLL_INTERVAL)) {
            Ok(0) => continue,
            Ok(_) => return,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => {
                poll_for_exit(pid, cancelled);
                return;
            }
        }
    }
}

#[cfg(not(any(target_os = "macos", target_os = "freebsd")))]
fn wait_for_exit(pid: i32, cancelled: &AtomicBool) {
    poll_for_exit(pid, cancelled);
}

fn poll_for_exit(pid: i32, cancelled: &AtomicBool) {
    while !cancelled.load(Ordering::SeqCst) && process_alive(pid) {
        thread::sleep(DEATH_POLL_INTERVAL);
    }
}

/// The application currently under watch.
struct Registration {
    app_pid: i32,
    registered_at: DateTime<Utc>,
    groups: BTreeSet<i32>,
    watch: Option<DeathWatch>,
}

/// The watchdog daemon: one registration slot, a tracked group set, and a
/// death watch on the registered application.
#[derive(Clone)]
pub struct OrphanWatchdog {
    state: Arc<Mutex<Option<Registration>>>,
}

impl Default for OrphanWatchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl OrphanWatchdog {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(None)),
        }
    }

    /// Serves the control socket until the process is terminated. Any stale
    /// socket file from a previous run is replaced.
    pub fn run(&self, socket: &Path) -> Result<(), ControlError> {
        if socket.exists() {
            fs::remove_file(socket)?;
        }
        let listener = UnixListener::bind(socket)?;
        info!("Watchdog listening on {}", socket.display());

        for stream in listener.incoming() {
            match stream {
                Ok(mut stream) => self.serve(&mut stream),
                Err(err) => warn!("Failed to accept watchdog connection: {err}"),
            }
        }
        Ok(())
    }

    fn serve(&self, stream: &mut UnixStream) {
        let reply = match ipc::read_request(stream) {
            Ok(request) => match self.handle_request(request) {
                Ok(()) => WatchdogReply::ok(),
                Err(err) => WatchdogReply::err(err.to_string()),
            },
            Err(err) => WatchdogReply::err(err.to_string()),
        };

        if let Err(err) = ipc::write_reply(stream, &reply) {
            warn!("Failed to reply on watchdog socket: {err}");
        }
    }

    /// Applies one control request.
    pub fn handle_request(&self, request: WatchdogRequest) -> Result<(), WatchdogError> {
        match request {
            WatchdogRequest::Register { pid } => self.register(pid),
            WatchdogRequest::UpdateGroups { groups } => self.update_groups(groups),
            WatchdogRequest::Unregister => {
                self.unregister();
                Ok(())
            }
        }
    }

    /// Registers `pid` as the supervised application and arms a death
    /// watch on it. Replacing a different application's registration first
    /// cleans up that registration's groups, whether or not the old
    /// registrant is still alive: a double-launch must not leak the old
    /// registration's tracked children. Same-pid re-registration is a
    /// refresh with no cleanup.
    fn register(&self, pid: i32) -> Result<(), WatchdogError> {
        if !process_alive(pid) {
            return Err(WatchdogError::DeadRegistrant(pid));
        }

        let stale = {
            let mut state = self
                .state
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);

            let stale = state.take().and_then(|old| {
                if let Some(watch) = &old.watch {
                    watch.cancel();
                }
                (old.app_pid != pid).then(|| (old.app_pid, old.groups))
            });

            let registered_at = Utc::now();
            debug!("Registered application PID {pid} at {registered_at}");
            *state = Some(Registration {
                app_pid: pid,
                registered_at,
                groups: BTreeSet::new(),
                watch: Some(self.arm_death_watch(pid)),
            });
            stale
        };

        if let Some((old_pid, groups)) = stale {
            info!("Replacing registration of PID {old_pid}; cleaning up its groups");
            cleanup_groups(old_pid, groups);
        }
        Ok(())
    }

    fn arm_death_watch(&self, pid: i32) -> DeathWatch {
        let state = Arc::clone(&self.state);
        DeathWatch::spawn(pid, move || {
            let taken = {
                let mut guard = state
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                match guard.as_ref() {
                    Some(reg) if reg.app_pid == pid => guard.take(),
                    _ => None,
                }
            };
            if let Some(reg) = taken {
                warn!(
                    "Application PID {pid} (registered {}) died; reaping {} group(s)",
                    reg.registered_at,
                    reg.groups.len()
                );
                cleanup_groups(pid, reg.groups);
            }
        })
    }

    /// Replaces the tracked group set wholesale. The last full sync wins.
    fn update_groups(&self, groups: Vec<i32>) -> Result<(), WatchdogError> {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match state.as_mut() {
            Some(reg) => {
                reg.groups = groups.into_iter().collect();
                debug!("Tracking {} process group(s)", reg.groups.len());
                Ok(())
            }
            None => Err(WatchdogError::NotRegistered),
        }
    }

    /// Clears the registration without any cleanup. The application is
    /// shutting down in an orderly way and will stop its own services.
    fn unregister(&self) {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(reg) = state.take() {
            if let Some(watch) = &reg.watch {
                watch.cancel();
            }
            debug!("Application PID {} unregistered", reg.app_pid);
        }
    }

    /// PID of the registered application, when one exists.
    pub fn registered_pid(&self) -> Option<i32> {
        self.state
            .lock()
            .map(|s| s.as_ref().map(|r| r.app_pid))
            .unwrap_or(None)
    }

    /// Currently tracked process groups, sorted.
    pub fn tracked_groups(&self) -> Vec<i32> {
        self.state
            .lock()
            .map(|s| {
                s.as_ref()
                    .map(|r| r.groups.iter().copied().collect())
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }
}

/// Terminates every group: SIGTERM immediately, SIGKILL after a delay for
/// anything still alive. All signal errors are ignored; the groups may be
/// partially or fully gone already.
fn cleanup_groups(app_pid: i32, groups: BTreeSet<i32>) {
    use nix::{sys::signal::Signal, sys::signal::killpg, unistd::Pid};

    if groups.is_empty() {
        debug!("No groups to clean up for application {app_pid}");
        return;
    }

    for &pgid in &groups {
        let _ = killpg(Pid::from_raw(pgid), Signal::SIGTERM);
    }
    info!("Sent SIGTERM to {} orphaned group(s)", groups.len());

    thread::spawn(move || {
        thread::sleep(FORCE_KILL_DELAY);
        for &pgid in &groups {
            let _ = killpg(Pid::from_raw(pgid), Signal::SIGKILL);
        }
    });
}
