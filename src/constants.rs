//! Timing and capacity constants shared across the supervisor, state
//! machine, coordinator, and watchdog. All are tunables, not semantic
//! commitments; the state machine only requires that the grace window is
//! short enough to stay responsive and long enough to distinguish a
//! crash-on-launch from a successful start.

use std::time::Duration;

/// Default budget for the graceful phase of a service stop before
/// escalation to SIGKILL.
pub const STOP_TIMEOUT: Duration = Duration::from_secs(3);

/// Interval at which a stopping process is probed for liveness.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Settle time after a forced kill before bookkeeping cleanup.
pub const KILL_SETTLE: Duration = Duration::from_millis(200);

/// Delay after spawn before a still-alive service is promoted from
/// `Starting` to `Running`.
pub const GRACE_WINDOW: Duration = Duration::from_millis(500);

/// Per-entity debounce for service and environment toggles.
pub const TOGGLE_COOLDOWN: Duration = Duration::from_millis(500);

/// Delay between the watchdog's graceful and forced cleanup passes after
/// the registered application dies.
pub const FORCE_KILL_DELAY: Duration = Duration::from_secs(3);

/// Interval at which the fallback death watch probes the registered PID.
pub const DEATH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Maximum retained log entries per service; oldest evicted first.
pub const LOG_BUFFER_CAP: usize = 500;
