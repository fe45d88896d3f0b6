//! Command-line interface for loopman.
use std::{path::PathBuf, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for loopman.
#[derive(Parser)]
#[command(name = "loopman", version, author)]
#[command(
    about = "Manages loopback-alias environments and the services bound to them",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for loopman.
#[derive(Subcommand)]
pub enum Commands {
    /// Activate an environment and run it in the foreground until Ctrl-C.
    Up {
        /// Path to the environments file (defaults to the user data directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Name of the environment to activate.
        environment: String,
    },

    /// List the defined environments and their services.
    List {
        /// Path to the environments file (defaults to the user data directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Emit machine-readable JSON output instead of a listing.
        #[arg(long)]
        json: bool,
    },

    /// Show a service's command after alias substitution.
    Resolve {
        /// Path to the environments file (defaults to the user data directory).
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Name of the environment the service belongs to.
        environment: String,

        /// Identifier of the service to resolve.
        service: String,
    },

    /// Run the privileged orphan watchdog in the foreground.
    Watchdog {
        /// Override the control socket path.
        #[arg(long, value_name = "PATH")]
        socket: Option<PathBuf>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
