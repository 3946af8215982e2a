//! Console output for process events.
//!
//! Every producer holds an [`OutputSink`]; a single console task owns the terminal and
//! renders events in arrival order, so lines from concurrent processes never interleave.

use std::io::{IsTerminal, Write};
use std::time::Duration;

use crossterm::style::Stylize;
use strip_ansi_escapes::strip;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::events::{Event, Level, OutputRecord};

/// Indicates the source stream of a log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Cloneable sending half of the console channel.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<Event>,
}

impl OutputSink {
    /// A sink plus the raw receiving half, for callers that consume events themselves.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Sends `event`; events sent after the console has shut down are dropped.
    pub fn emit(&self, event: Event) {
        let _ = self.tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleSettings {
    /// Also print process start and exit notices.
    pub verbose: bool,
    /// Colorize warnings and errors.
    pub color: bool,
}

impl ConsoleSettings {
    pub fn detect(verbose: bool) -> Self {
        Self {
            verbose,
            color: std::io::stderr().is_terminal(),
        }
    }
}

/// Handle to the console task.
pub struct Console {
    handle: JoinHandle<()>,
}

impl Console {
    pub fn spawn(settings: ConsoleSettings) -> (OutputSink, Console) {
        let (sink, mut rx) = OutputSink::channel();
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                write_event(&event, settings);
            }
        });
        (sink, Console { handle })
    }

    /// Waits for the console to drain once every sink is dropped, at most `timeout`.
    ///
    /// Sinks held by output readers of processes left running keep the channel open,
    /// hence the bound.
    pub async fn finish(self, timeout: Duration) {
        if tokio::time::timeout(timeout, self.handle).await.is_err() {
            tracing::debug!("console did not drain before exit");
        }
    }
}

fn write_event(event: &Event, settings: ConsoleSettings) {
    let Some(text) = render_event(event, settings) else {
        return;
    };
    let to_stderr = matches!(
        event,
        Event::ProcessOutput(OutputRecord {
            stream: StreamKind::Stderr,
            ..
        }) | Event::ProcessFailed { .. }
    );
    if to_stderr {
        let _ = writeln!(std::io::stderr().lock(), "{}", text);
    } else {
        let _ = writeln!(std::io::stdout().lock(), "{}", text);
    }
}

/// Formats `event` as one console line, or `None` when it is not shown.
pub fn render_event(event: &Event, settings: ConsoleSettings) -> Option<String> {
    match event {
        Event::ProcessOutput(record) => {
            let line = format!("[{}] {}", record.label, sanitize_text(&record.line, settings.color));
            Some(match (record.level, settings.color) {
                (Level::Warning, true) => line.yellow().to_string(),
                (Level::Error, true) => line.red().to_string(),
                _ => line,
            })
        }
        Event::ProcessStarted {
            label,
            pid,
            command,
        } if settings.verbose => Some(match pid {
            Some(pid) => format!("[{}] starting (pid {}): {}", label, pid, command),
            None => format!("[{}] starting: {}", label, command),
        }),
        Event::ProcessExited {
            label,
            code,
            runtime,
        } if settings.verbose => {
            let mut line = match code {
                Some(0) => format!("[{}] process ended successfully", label),
                Some(code) => format!("[{}] process ended with code {}", label, code),
                None => format!("[{}] process ended", label),
            };
            if let Some(runtime) = runtime {
                line.push_str(&format!(" after {:.1}s", runtime.as_secs_f64()));
            }
            Some(line)
        }
        Event::ProcessFailed { label, error, .. } => {
            let line = format!("[{}] process failed: {}", label, error);
            Some(if settings.color {
                line.red().to_string()
            } else {
                line
            })
        }
        _ => None,
    }
}

/// Removes ANSI escape codes unless `keep_ansi` is set.
pub fn sanitize_text(text: &str, keep_ansi: bool) -> String {
    if keep_ansi {
        return text.to_string();
    }
    let stripped = strip(text.as_bytes());
    String::from_utf8_lossy(&stripped).to_string()
}
