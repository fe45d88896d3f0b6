//! Error handling for loopman.
use thiserror::Error;

/// Defines all possible errors that can occur in the environment manager.
#[derive(Debug, Error)]
pub enum EnvManagerError {
    /// Error reading or accessing the environments file.
    #[error("Failed to read environments file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing the JSON environments file.
    #[error("Invalid JSON format: {0}")]
    ConfigParseError(#[from] serde_json::Error),

    /// Error spawning a service process.
    #[error("Failed to start service '{service}': {source}")]
    ServiceStartError {
        /// The service that failed to start.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// Error stopping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// A second spawn was attempted while a live process already exists.
    #[error("Service '{service}' already has a live process")]
    ServiceAlreadyRunning {
        /// The service with the live process.
        service: String,
    },

    /// A toggle was rejected because the target is mid-transition.
    #[error("'{entity}' is transitioning; request rejected")]
    Transitioning {
        /// The service or environment being toggled.
        entity: String,
    },

    /// A toggle arrived inside the per-entity cooldown window.
    #[error("'{entity}' was toggled too recently; request dropped")]
    Cooldown {
        /// The service or environment being toggled.
        entity: String,
    },

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),
}

/// Implement the `From` trait to convert a `std::sync::PoisonError` into an `EnvManagerError`.
impl<T> From<std::sync::PoisonError<T>> for EnvManagerError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        EnvManagerError::MutexPoisonError(err.to_string())
    }
}

/// Errors surfaced when activating an environment.
#[derive(Debug, Error)]
pub enum ActivationError {
    /// An alias failed to come up; every previously raised alias was rolled back.
    #[error("Alias '{alias}' failed to activate ({reason}); rolled back {rolled_back} alias(es)")]
    Alias {
        /// Address of the alias that failed.
        alias: String,
        /// Failure detail from the alias provider.
        reason: String,
        /// Number of aliases that had succeeded and were rolled back.
        rolled_back: usize,
    },

    /// The environment is mid-transition or inside its cooldown window.
    #[error(transparent)]
    Rejected(#[from] EnvManagerError),
}

/// Error type for watchdog daemon operations.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// A group update arrived with no active registration.
    #[error("No application is registered")]
    NotRegistered,

    /// The PID presented for registration is not alive.
    #[error("Process {0} is not alive")]
    DeadRegistrant(i32),
}
