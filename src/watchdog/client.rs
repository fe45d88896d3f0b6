//! In-application client for the orphan watchdog.
//!
//! The client mirrors the supervisor's live process-group set and pushes it
//! to the watchdog as a full replacement on every change. Full-state sync
//! keeps the protocol self-healing: a dropped update is corrected by the
//! next one, and a freshly restarted watchdog only needs one sync to be
//! current.
//!
//! Watchdog trouble is never allowed to break service management. Every
//! failure here is logged and swallowed; the watchdog is a safety net, not
//! a dependency.

use std::{
    collections::BTreeSet,
    path::PathBuf,
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use crate::ipc::{self, ControlError, WatchdogRequest};

struct ClientState {
    groups: BTreeSet<i32>,
    registered: bool,
}

/// Tracks live process groups and mirrors them to the watchdog daemon.
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct WatchdogClient {
    socket: Option<PathBuf>,
    state: Arc<Mutex<ClientState>>,
}

impl WatchdogClient {
    /// Creates a client talking to the watchdog at `socket`.
    pub fn new(socket: PathBuf) -> Self {
        Self {
            socket: Some(socket),
            state: Arc::new(Mutex::new(ClientState {
                groups: BTreeSet::new(),
                registered: false,
            })),
        }
    }

    /// Creates a client with no watchdog connection. Group tracking still
    /// works locally; every sync is a no-op.
    pub fn disabled() -> Self {
        Self {
            socket: None,
            state: Arc::new(Mutex::new(ClientState {
                groups: BTreeSet::new(),
                registered: false,
            })),
        }
    }

    /// Registers this process with the watchdog and pushes the current
    /// group set. Called at startup and lazily after a watchdog restart.
    pub fn register(&self) {
        let Some(socket) = &self.socket else { return };

        let pid = std::process::id() as i32;
        match ipc::send_request(socket, &WatchdogRequest::Register { pid }) {
            Ok(reply) if reply.ok => {
                debug!("Registered with watchdog as PID {pid}");
                if let Ok(mut state) = self.state.lock() {
                    state.registered = true;
                }
                self.push_groups(false);
            }
            Ok(reply) => {
                warn!(
                    "Watchdog refused registration: {}",
                    reply.error.unwrap_or_default()
                );
            }
            Err(ControlError::NotAvailable) => {
                debug!("Watchdog not available; running without orphan protection");
            }
            Err(err) => {
                warn!("Failed to register with watchdog: {err}");
            }
        }
    }

    /// Clears the registration on graceful shutdown. The watchdog performs
    /// no cleanup for an unregistered application.
    pub fn unregister(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.registered = false;
            state.groups.clear();
        }

        let Some(socket) = &self.socket else { return };
        match ipc::send_request(socket, &WatchdogRequest::Unregister) {
            Ok(reply) if reply.ok => debug!("Unregistered from watchdog"),
            Ok(reply) => warn!(
                "Watchdog refused unregister: {}",
                reply.error.unwrap_or_default()
            ),
            Err(ControlError::NotAvailable) => {}
            Err(err) => warn!("Failed to unregister from watchdog: {err}"),
        }
    }

    /// Records a newly spawned process group and syncs.
    pub fn add_group(&self, pgid: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.groups.insert(pgid);
        }
        self.push_groups(true);
    }

    /// Records a terminated process group and syncs.
    pub fn remove_group(&self, pgid: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.groups.remove(&pgid);
        }
        self.push_groups(true);
    }

    /// Current locally tracked group set.
    pub fn groups(&self) -> Vec<i32> {
        self.state
            .lock()
            .map(|s| s.groups.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Pushes the full group set to the watchdog. With `allow_retry`,
    /// a sync refused for lack of registration re-registers and retries
    /// exactly once; this covers a watchdog that restarted and lost its
    /// state. `register` calls back in with `allow_retry = false`, which
    /// bounds the exchange.
    fn push_groups(&self, allow_retry: bool) {
        let Some(socket) = &self.socket else { return };

        let (groups, registered) = match self.state.lock() {
            Ok(state) => (
                state.groups.iter().copied().collect::<Vec<_>>(),
                state.registered,
            ),
            Err(_) => return,
        };

        if !registered {
            // Never registered (or watchdog was down at startup); try now.
            if allow_retry {
                self.register();
            }
            return;
        }

        match ipc::send_request(socket, &WatchdogRequest::UpdateGroups { groups }) {
            Ok(reply) if reply.ok => {}
            Ok(_) if allow_retry => {
                debug!("Watchdog lost our registration; re-registering");
                if let Ok(mut state) = self.state.lock() {
                    state.registered = false;
                }
                self.register();
            }
            Ok(reply) => warn!(
                "Watchdog refused group sync: {}",
                reply.error.unwrap_or_default()
            ),
            Err(ControlError::NotAvailable) => {}
            Err(err) => warn!("Failed to sync process groups to watchdog: {err}"),
        }
    }
}
