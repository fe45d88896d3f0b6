//! IPC helpers for the watchdog control channel.
//!
//! The supervising application and the privileged watchdog exchange
//! newline-delimited JSON over a unix-domain socket. Every request is
//! answered with an explicit `{ok, error}` reply; the channel never relies
//! on connection faults to signal failure.

use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::{self, BufRead, BufReader, Write},
    os::unix::net::UnixStream,
    path::PathBuf,
};
use thiserror::Error;

/// Directory under `$HOME` where runtime artifacts are stored.
fn runtime_dir() -> Result<PathBuf, ControlError> {
    let home = std::env::var("HOME").map_err(|_| ControlError::MissingHome)?;
    let path = PathBuf::from(home).join(".local/share/loopman");
    fs::create_dir_all(&path)?;
    Ok(path)
}

/// Returns the default unix socket path for the watchdog channel.
pub fn watchdog_socket_path() -> Result<PathBuf, ControlError> {
    Ok(runtime_dir()?.join("watchdog.sock"))
}

/// Request sent from the supervising application to the watchdog.
#[derive(Debug, Serialize, Deserialize)]
pub enum WatchdogRequest {
    /// Register the caller as the supervised application.
    Register {
        /// PID of the supervising application.
        pid: i32,
    },
    /// Replace the tracked process-group set wholesale.
    UpdateGroups {
        /// Every live process group, not a delta.
        groups: Vec<i32>,
    },
    /// Clear the registration on graceful shutdown; no cleanup performed.
    Unregister,
}

/// Reply sent by the watchdog for every request.
#[derive(Debug, Serialize, Deserialize)]
pub struct WatchdogReply {
    /// Whether the request was applied.
    pub ok: bool,
    /// Failure detail when `ok` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WatchdogReply {
    /// A successful reply.
    pub fn ok() -> Self {
        Self {
            ok: true,
            error: None,
        }
    }

    /// A failed reply carrying a message.
    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Errors raised by the control channel helpers.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("watchdog socket I/O failed: {0}")]
    Io(#[from] io::Error),
    #[error("failed to serialise watchdog message: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("HOME environment variable not set")]
    MissingHome,
    #[error("watchdog socket not available")]
    NotAvailable,
}

/// Sends a request to the watchdog and waits for its reply.
pub fn send_request(
    socket: &std::path::Path,
    request: &WatchdogRequest,
) -> Result<WatchdogReply, ControlError> {
    if !socket.exists() {
        return Err(ControlError::NotAvailable);
    }

    let mut stream = UnixStream::connect(socket)?;
    let payload = serde_json::to_vec(request)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;

    let mut reader = BufReader::new(stream);
    let mut reply_line = String::new();
    reader.read_line(&mut reply_line)?;

    if reply_line.trim().is_empty() {
        return Err(ControlError::NotAvailable);
    }

    Ok(serde_json::from_str(reply_line.trim())?)
}

/// Reads one request from a connected stream. Used by the watchdog accept
/// loop.
pub fn read_request(stream: &mut UnixStream) -> Result<WatchdogRequest, ControlError> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;

    if line.trim().is_empty() {
        return Err(ControlError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "empty watchdog request",
        )));
    }

    Ok(serde_json::from_str(line.trim())?)
}

/// Writes a reply back to the connected client.
pub fn write_reply(
    stream: &mut UnixStream,
    reply: &WatchdogReply,
) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(reply)?;
    stream.write_all(&payload)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
