//! Host platform detection and platform-specific shell-out commands.
//!
//! Everything that differs between Windows and Unix hosts when killing processes or
//! asking the OS about listeners is decided here from a [`Platform`] value, so the
//! decisions can be exercised for any host in tests.

use std::fmt;
use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Host operating system family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Windows,
    Mac,
    Linux,
    /// Linux running under the Windows subsystem (WSL).
    WindowsLinux,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::Mac
        } else if is_windows_subsystem() {
            Platform::WindowsLinux
        } else {
            Platform::Linux
        }
    }

    pub fn is_windows(self) -> bool {
        self == Platform::Windows
    }

    /// Whether Windows binaries (`*.exe`) are what the shell resolves.
    pub fn uses_windows_binaries(self) -> bool {
        matches!(self, Platform::Windows | Platform::WindowsLinux)
    }
}

fn is_windows_subsystem() -> bool {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| release.to_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

/// A program plus its argument vector, as handed to the OS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ShellCommand {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Arguments joined with single spaces.
    pub fn arguments(&self) -> String {
        self.args.join(" ")
    }

    /// Runs the command to completion with output captured, bounded by `timeout`.
    pub async fn capture(&self, timeout: Duration) -> std::io::Result<Output> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        match tokio::time::timeout(timeout, command.output()).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("{} did not finish within {:?}", self, timeout),
            )),
        }
    }
}

impl fmt::Display for ShellCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.args.is_empty() {
            f.write_str(&self.program)
        } else {
            write!(f, "{} {}", self.program, self.arguments())
        }
    }
}

/// Appends `extension` unless `name` already ends with it (case-insensitive).
pub fn add_extension(name: &str, extension: &str) -> String {
    if name.to_lowercase().ends_with(&extension.to_lowercase()) {
        name.to_string()
    } else {
        format!("{}{}", name, extension)
    }
}

/// Terminates every process with the given image name, not only ones regi launched.
pub fn kill_all_command(platform: Platform, process_name: &str) -> ShellCommand {
    if platform.is_windows() {
        ShellCommand::new(
            "taskkill",
            ["/F".to_string(), "/IM".to_string(), add_extension(process_name, ".exe")],
        )
    } else {
        ShellCommand::new("killall", [process_name])
    }
}

/// Forceful whole-tree kill of one pid. Only Windows needs a shell-out for this; Unix
/// hosts signal the process group natively.
pub fn kill_tree_command(platform: Platform, pid: u32) -> Option<ShellCommand> {
    let pid = pid.to_string();
    platform
        .is_windows()
        .then(|| ShellCommand::new("taskkill", ["/F", "/T", "/PID", pid.as_str()]))
}

/// Lists direct children of `pid`.
pub fn child_query_command(pid: u32) -> ShellCommand {
    ShellCommand::new("pgrep", ["-P", pid.to_string().as_str()])
}

pub fn netstat_command(platform: Platform) -> ShellCommand {
    let program = if platform.uses_windows_binaries() {
        "netstat.exe"
    } else {
        "netstat"
    };
    ShellCommand::new(program, ["-tna"])
}
