//! Loopman manages named "environments": sets of loopback interface aliases
//! plus shell services bound to those aliases, toggled on and off as a unit.
//! Services run in their own process groups under a supervising process; a
//! separately launched privileged watchdog guarantees that spawned process
//! groups are reaped even if the supervisor itself crashes.

/// CLI interface.
pub mod cli;

/// Environment and service definitions, JSON persistence.
pub mod config;

/// Timing and capacity constants.
pub mod constants;

/// Environment coordinator: alias bring-up/teardown and grouped service control.
pub mod environment;

/// Error handling.
pub mod error;

/// IPC helpers for the watchdog control channel.
pub mod ipc;

/// Stream-tagged bounded log buffers.
pub mod logs;

/// Command template resolution against interface addresses.
pub mod resolver;

/// Service status machine and runtime registry.
pub mod state;

/// Process supervisor: spawn, track, and terminate service process groups.
pub mod supervisor;

/// Orphan watchdog daemon and its in-app client.
pub mod watchdog;
