//! Runtime records for managed processes.
//!
//! A [`ManagedProcess`] exists before its native process does: the lifecycle manager
//! registers the record first and attaches the pid, exit code and timestamps as they
//! become known.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

/// The logical action a process performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppTask {
    Start,
    Test,
    Install,
    Build,
    Kill,
    Cleanup,
}

impl fmt::Display for AppTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AppTask::Start => "start",
            AppTask::Test => "test",
            AppTask::Install => "install",
            AppTask::Build => "build",
            AppTask::Kill => "kill",
            AppTask::Cleanup => "cleanup",
        };
        f.write_str(name)
    }
}

/// Lifecycle status. `Success` and `Failure` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppStatus {
    Running,
    Success,
    Failure,
}

impl AppStatus {
    pub fn is_terminal(self) -> bool {
        self != AppStatus::Running
    }
}

/// Output and termination policy for one process.
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Terminate the process when the owning workflow is disposed.
    pub kill_on_exit: bool,
    pub verbose: bool,
    /// Inherit the terminal instead of capturing output.
    pub raw_output: bool,
    /// Forward stdout lines to the console.
    pub show_output: bool,
    /// Case-insensitive stderr prefixes downgraded from errors to warnings.
    pub warning_indicators: Vec<String>,
    /// Report every stderr line as a warning.
    pub stderr_as_warning: bool,
}

/// What to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Display label, usually the project name.
    pub label: String,
    pub task: AppTask,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub port: Option<u16>,
    pub options: ProcessOptions,
}

impl ProcessSpec {
    pub fn new(label: impl Into<String>, task: AppTask, program: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            task,
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            port: None,
            options: ProcessOptions::default(),
        }
    }

    /// The command line as a shell would print it.
    pub fn command_line(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.program.clone());
        parts.extend(self.args.iter().cloned());
        shell_words::join(parts)
    }
}

#[derive(Debug, Default)]
struct ProcessState {
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
}

/// Shared handle to one native process and its outcome.
#[derive(Debug)]
pub struct ManagedProcess {
    id: Uuid,
    spec: ProcessSpec,
    state: Mutex<ProcessState>,
    status: watch::Sender<AppStatus>,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ManagedProcess {
    pub fn new(spec: ProcessSpec) -> Self {
        let (status, _) = watch::channel(AppStatus::Running);
        Self {
            id: Uuid::new_v4(),
            spec,
            state: Mutex::new(ProcessState::default()),
            status,
            kill_tx: Mutex::new(None),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn spec(&self) -> &ProcessSpec {
        &self.spec
    }

    pub fn label(&self) -> &str {
        &self.spec.label
    }

    pub fn kill_on_exit(&self) -> bool {
        self.spec.options.kill_on_exit
    }

    pub fn status(&self) -> AppStatus {
        *self.status.borrow()
    }

    pub fn pid(&self) -> Option<u32> {
        self.with_state(|state| state.pid)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.with_state(|state| state.exit_code)
    }

    pub fn command_line(&self) -> String {
        self.spec.command_line()
    }

    /// Waits for a terminal status.
    pub async fn wait(&self) -> AppStatus {
        let mut rx = self.status.subscribe();
        let status = match rx.wait_for(|status| status.is_terminal()).await {
            Ok(status) => *status,
            Err(_) => self.status(),
        };
        status
    }

    /// Waits for a terminal status for at most `timeout`; `None` if still running.
    pub async fn wait_for_exit(&self, timeout: Duration) -> Option<AppStatus> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }

    pub(crate) fn mark_started(&self, pid: Option<u32>) {
        self.with_state(|state| {
            state.pid = pid;
            state.started_at = Some(Utc::now());
        });
    }

    /// Wall-clock time between launch and exit, once both are known.
    pub fn runtime(&self) -> Option<Duration> {
        self.with_state(|state| match (state.started_at, state.ended_at) {
            (Some(started), Some(ended)) => (ended - started).to_std().ok(),
            _ => None,
        })
    }

    pub(crate) fn set_kill_switch(&self, tx: oneshot::Sender<()>) {
        if let Ok(mut slot) = self.kill_tx.lock() {
            *slot = Some(tx);
        }
    }

    /// Asks the exit watcher to force-kill the direct child. Returns `false` if no
    /// watcher is attached or it already finished.
    pub(crate) fn force_kill(&self) -> bool {
        let tx = self.kill_tx.lock().ok().and_then(|mut slot| slot.take());
        tx.map(|tx| tx.send(()).is_ok()).unwrap_or(false)
    }

    /// Records the exit. `Success` iff the code is zero; later calls are ignored.
    pub(crate) fn record_exit(&self, code: Option<i32>) -> bool {
        let next = if code == Some(0) {
            AppStatus::Success
        } else {
            AppStatus::Failure
        };
        self.finish(next, code)
    }

    /// Marks the process failed without an exit code (e.g. it never launched).
    pub(crate) fn record_failure(&self) -> bool {
        self.finish(AppStatus::Failure, None)
    }

    fn finish(&self, next: AppStatus, code: Option<i32>) -> bool {
        let changed = self.status.send_if_modified(|status| {
            if status.is_terminal() {
                return false;
            }
            *status = next;
            true
        });
        if changed {
            self.with_state(|state| {
                state.exit_code = code;
                state.ended_at = Some(Utc::now());
            });
        }
        changed
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut ProcessState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process() -> ManagedProcess {
        ManagedProcess::new(ProcessSpec::new("Backend", AppTask::Start, "dotnet"))
    }

    #[test]
    fn zero_exit_is_success() {
        let process = process();
        assert_eq!(process.status(), AppStatus::Running);
        assert!(process.record_exit(Some(0)));
        assert_eq!(process.status(), AppStatus::Success);
        assert_eq!(process.exit_code(), Some(0));
    }

    #[test]
    fn non_zero_or_missing_exit_is_failure() {
        let failed = process();
        failed.record_exit(Some(3));
        assert_eq!(failed.status(), AppStatus::Failure);

        let signalled = process();
        signalled.record_exit(None);
        assert_eq!(signalled.status(), AppStatus::Failure);
    }

    #[test]
    fn terminal_status_never_changes() {
        let process = process();
        process.record_exit(Some(1));
        assert!(!process.record_exit(Some(0)));
        assert!(!process.record_failure());
        assert_eq!(process.status(), AppStatus::Failure);
        assert_eq!(process.exit_code(), Some(1));
    }

    #[tokio::test]
    async fn wait_returns_once_terminal() {
        let process = std::sync::Arc::new(process());
        assert_eq!(process.wait_for_exit(Duration::from_millis(20)).await, None);

        let waiter = {
            let process = process.clone();
            tokio::spawn(async move { process.wait().await })
        };
        process.record_exit(Some(0));
        assert_eq!(waiter.await.unwrap(), AppStatus::Success);
    }

    #[tokio::test]
    async fn wait_after_exit_returns_immediately() {
        let process = process();
        process.mark_started(Some(42));
        process.record_exit(Some(2));
        assert_eq!(process.wait().await, AppStatus::Failure);
        assert_eq!(process.pid(), Some(42));
        assert!(process.runtime().is_some());
    }

    #[test]
    fn runtime_is_unknown_until_exit() {
        let process = process();
        assert_eq!(process.runtime(), None);
        process.mark_started(None);
        assert_eq!(process.runtime(), None);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(process().id(), process().id());
    }

    #[test]
    fn command_line_quotes_arguments() {
        let mut spec = ProcessSpec::new("Backend", AppTask::Test, "dotnet");
        spec.args = vec!["test".into(), "--filter".into(), "Name Space".into()];
        assert_eq!(spec.command_line(), "dotnet test --filter 'Name Space'");
    }
}
