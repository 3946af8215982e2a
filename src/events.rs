//! Events emitted by managed processes.
//!
//! Stream readers and exit watchers never write to the terminal themselves; they send
//! `Event`s to the console task in [`crate::output`].

use std::time::Duration;

use crate::output::StreamKind;

/// Severity assigned to a captured output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Warning,
    Error,
}

/// One captured line of process output.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    /// Label of the emitting process, usually the project name.
    pub label: String,
    pub stream: StreamKind,
    pub level: Level,
    pub line: String,
}

#[derive(Debug, Clone)]
pub enum Event {
    /// A native process was spawned.
    ProcessStarted {
        label: String,
        pid: Option<u32>,
        command: String,
    },
    /// A line was read from the process's stdout or stderr.
    ProcessOutput(OutputRecord),
    /// The process exited; `code` is `None` when it was terminated by a signal.
    ProcessExited {
        label: String,
        code: Option<i32>,
        runtime: Option<Duration>,
    },
    /// The process could not be launched.
    ProcessFailed { label: String, error: String },
}
