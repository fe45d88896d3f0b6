//! Stream-tagged bounded log buffers.
//!
//! Each service keeps the most recent output lines in memory for display;
//! the buffer is capped and evicts oldest-first rather than accumulating
//! without bound.

use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use strum_macros::{AsRefStr, EnumString};

use crate::constants::LOG_BUFFER_CAP;

/// Which stream a log line arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum LogStream {
    Stdout,
    Stderr,
}

/// A single captured output line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Capture time.
    pub at: DateTime<Utc>,
    /// Originating stream.
    pub stream: LogStream,
    /// The decoded line, without its trailing newline.
    pub line: String,
}

/// Ring buffer of recent log entries for one service.
#[derive(Debug)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
    cap: usize,
}

impl LogBuffer {
    /// Creates a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(LOG_BUFFER_CAP)
    }

    /// Creates a buffer holding at most `cap` entries.
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    /// Appends a line, evicting the oldest entry when full.
    pub fn push(&mut self, stream: LogStream, line: String) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            at: Utc::now(),
            stream,
            line,
        });
    }

    /// Entries from oldest to newest.
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the buffer holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops all retained entries.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new()
    }
}
