//! Process execution and management.
//!
//! This module contains the `ProcessManager`, which owns the registry of live
//! [`ManagedProcess`] records. It spawns native processes, classifies their output into
//! console events, records exit status, and tears processes down again.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{RegiError, Result};
use crate::events::{Event, Level, OutputRecord};
use crate::output::{OutputSink, StreamKind};
use crate::platform::{kill_all_command, Platform, ShellCommand};
use crate::process::{AppStatus, AppTask, ManagedProcess, ProcessOptions, ProcessSpec};
use crate::toolchain::ToolchainAdapter;
use crate::tree;

/// How long a terminated process gets to exit before its direct child is force-killed.
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(10);

const FORCE_KILL_GRACE: Duration = Duration::from_secs(2);
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const KILL_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Manages the lifecycle and I/O of child processes.
pub struct ProcessManager {
    registry: Mutex<HashMap<Uuid, Arc<ManagedProcess>>>,
    output: OutputSink,
    platform: Platform,
    kill_timeout: Duration,
}

impl ProcessManager {
    pub fn new(output: OutputSink, platform: Platform) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            output,
            platform,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }

    pub fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    /// Registers a record for `spec`. The native process is not spawned yet.
    pub fn create(&self, spec: ProcessSpec) -> Result<Arc<ManagedProcess>> {
        let process = Arc::new(ManagedProcess::new(spec));
        self.register(process.clone())?;
        Ok(process)
    }

    /// Inserts `process` unless its id is already tracked.
    pub fn register(&self, process: Arc<ManagedProcess>) -> Result<()> {
        let mut registry = self.registry();
        if registry.contains_key(&process.id()) {
            return Err(RegiError::DuplicateProcess(process.id()));
        }
        registry.insert(process.id(), process);
        Ok(())
    }

    /// Snapshot of every tracked record.
    pub fn tracked(&self) -> Vec<Arc<ManagedProcess>> {
        self.registry().values().cloned().collect()
    }

    /// Spawns the native process behind `process`.
    ///
    /// Output is read line by line unless raw output is requested. An exit watcher
    /// records the terminal status once the process and its output readers finish.
    pub fn start(&self, process: &Arc<ManagedProcess>) -> Result<()> {
        let spec = process.spec();
        let raw = spec.options.raw_output;

        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        if !spec.env.is_empty() {
            command.envs(&spec.env);
        }
        command.stdin(Stdio::null());
        if raw {
            command.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        command.kill_on_drop(spec.options.kill_on_exit);

        #[cfg(unix)]
        unsafe {
            command.pre_exec(|| {
                let _ = libc::setpgid(0, 0);
                Ok(())
            });
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                process.record_failure();
                self.output.emit(Event::ProcessFailed {
                    label: spec.label.clone(),
                    error: source.to_string(),
                });
                return Err(RegiError::ProcessLaunch {
                    label: spec.label.clone(),
                    source,
                });
            }
        };

        let pid = child.id();
        process.mark_started(pid);
        info!(
            project = %spec.label,
            task = %spec.task,
            pid = pid.unwrap_or_default(),
            port = ?spec.port,
            "started {}",
            process.command_line()
        );
        self.output.emit(Event::ProcessStarted {
            label: spec.label.clone(),
            pid,
            command: process.command_line(),
        });

        let classifier = LineClassifier::new(&spec.options);
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(read_stream(
                process.clone(),
                StreamKind::Stdout,
                stdout,
                classifier.clone(),
                self.output.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(read_stream(
                process.clone(),
                StreamKind::Stderr,
                stderr,
                classifier,
                self.output.clone(),
            )));
        }

        let (kill_tx, kill_rx) = oneshot::channel();
        process.set_kill_switch(kill_tx);
        tokio::spawn(watch_exit(process.clone(), child, kill_rx, readers, self.output.clone()));
        Ok(())
    }

    /// Best-effort termination of `process` and its descendants. Never fails.
    pub async fn kill(&self, process: &Arc<ManagedProcess>, timeout: Duration) {
        terminate(self.platform, process.clone(), timeout, CancellationToken::new()).await;
    }

    /// Removes the record for `id` and kills its process.
    ///
    /// Returns `true` if the process was still running, `false` if it had already
    /// exited. Cancelling `cancel` cuts the wait for exit short.
    pub async fn shutdown(&self, id: Uuid, cancel: &CancellationToken) -> Result<bool> {
        let process = self
            .registry()
            .remove(&id)
            .ok_or(RegiError::UnknownProcess(id))?;
        if process.status().is_terminal() {
            return Ok(false);
        }
        terminate(self.platform, process, self.kill_timeout, cancel.clone()).await;
        Ok(true)
    }

    /// Drops every record; kills those still running when `force` is set or their
    /// policy asks for it. Returns how many processes were terminated.
    pub async fn dispose_all(&self, force: bool) -> usize {
        let drained: Vec<Arc<ManagedProcess>> =
            self.registry().drain().map(|(_, process)| process).collect();

        let mut kills = Vec::new();
        for process in drained {
            if process.status().is_terminal() || !(force || process.kill_on_exit()) {
                continue;
            }
            debug!(project = %process.label(), "disposing");
            kills.push(tokio::spawn(terminate(
                self.platform,
                process,
                self.kill_timeout,
                CancellationToken::new(),
            )));
        }
        let mut terminated = 0;
        for kill in kills {
            match kill.await {
                Ok(()) => terminated += 1,
                Err(err) => warn!(error = %err, "kill task failed"),
            }
        }
        terminated
    }

    /// Terminates every OS process with the toolchain's process name, including ones
    /// regi did not launch. Returns the number of kill commands that failed.
    pub async fn kill_all_by_toolchain(&self, adapter: &dyn ToolchainAdapter, verbose: bool) -> usize {
        for command in adapter.shutdown_commands(self.platform) {
            let status = self
                .run_shell_command(adapter.name(), AppTask::Cleanup, command, verbose)
                .await;
            if status != AppStatus::Success {
                debug!(toolchain = adapter.name(), "cleanup command did not succeed");
            }
        }

        let command = kill_all_command(self.platform, adapter.process_name());
        let status = self
            .run_shell_command(adapter.name(), AppTask::Kill, command, verbose)
            .await;
        usize::from(status != AppStatus::Success)
    }

    async fn run_shell_command(
        &self,
        label: &str,
        task: AppTask,
        command: ShellCommand,
        verbose: bool,
    ) -> AppStatus {
        let mut spec = ProcessSpec::new(label, task, command.program);
        spec.args = command.args;
        spec.options = ProcessOptions {
            kill_on_exit: true,
            verbose,
            show_output: verbose,
            stderr_as_warning: true,
            ..ProcessOptions::default()
        };
        let process = match self.create(spec) {
            Ok(process) => process,
            Err(err) => {
                warn!(error = %err, "failed to register {} process", task);
                return AppStatus::Failure;
            }
        };
        if let Err(err) = self.start(&process) {
            warn!(error = %err, "{} command failed to launch", task);
        }
        let status = match process.wait_for_exit(KILL_COMMAND_TIMEOUT).await {
            Some(status) => status,
            None => {
                warn!(command = %process.command_line(), "{} command timed out", task);
                self.kill(&process, self.kill_timeout).await;
                AppStatus::Failure
            }
        };
        self.registry().remove(&process.id());
        status
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<Uuid, Arc<ManagedProcess>>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sends the tree a graceful signal, waits up to `timeout`, then forces the direct child.
async fn terminate(
    platform: Platform,
    process: Arc<ManagedProcess>,
    timeout: Duration,
    cancel: CancellationToken,
) {
    if process.status().is_terminal() {
        return;
    }
    let Some(pid) = process.pid() else {
        debug!(project = %process.label(), "process never launched");
        process.record_failure();
        return;
    };

    tree::terminate_tree(platform, pid).await;
    let exited = tokio::select! {
        status = process.wait_for_exit(timeout) => status.is_some(),
        _ = cancel.cancelled() => false,
    };
    if exited {
        debug!(project = %process.label(), pid, "process exited");
        return;
    }

    warn!(
        project = %process.label(),
        pid,
        "process did not exit within {:?}, killing it",
        timeout
    );
    if !process.force_kill() && !process.status().is_terminal() {
        warn!(project = %process.label(), pid, "no exit watcher attached to force kill");
    }
    if process.wait_for_exit(FORCE_KILL_GRACE).await.is_none() {
        warn!(project = %process.label(), pid, "process still running after kill");
    }
}

async fn watch_exit(
    process: Arc<ManagedProcess>,
    mut child: tokio::process::Child,
    kill_rx: oneshot::Receiver<()>,
    readers: Vec<JoinHandle<()>>,
    output: OutputSink,
) {
    let waited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill_rx => None,
    };
    let status = match waited {
        Some(status) => status,
        None => {
            if let Err(err) = child.start_kill() {
                warn!(project = %process.label(), error = %err, "failed to kill process");
            }
            child.wait().await
        }
    };

    // Descendants may keep the pipes open after the child is gone.
    for reader in readers {
        if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
            debug!(project = %process.label(), "output reader still open after exit");
        }
    }

    let code = match status {
        Ok(status) => status.code(),
        Err(err) => {
            warn!(project = %process.label(), error = %err, "failed to wait for process");
            None
        }
    };
    if process.record_exit(code) {
        debug!(project = %process.label(), ?code, "process exited");
        output.emit(Event::ProcessExited {
            label: process.label().to_string(),
            code,
            runtime: process.runtime(),
        });
    }
}

/// Decides which captured lines reach the console, and at which level.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    forward_stdout: bool,
    stderr_as_warning: bool,
    warning_indicators: Vec<String>,
}

impl LineClassifier {
    pub fn new(options: &ProcessOptions) -> Self {
        Self {
            forward_stdout: options.verbose || options.show_output,
            stderr_as_warning: options.stderr_as_warning,
            warning_indicators: options
                .warning_indicators
                .iter()
                .map(|indicator| indicator.to_lowercase())
                .collect(),
        }
    }

    pub fn classify(&self, stream: StreamKind, line: &str) -> Option<Level> {
        match stream {
            StreamKind::Stdout => self.forward_stdout.then_some(Level::Info),
            StreamKind::Stderr => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    return None;
                }
                let lowered = trimmed.to_lowercase();
                if self.stderr_as_warning {
                    return Some(Level::Warning);
                }
                if self
                    .warning_indicators
                    .iter()
                    .any(|indicator| lowered.starts_with(indicator.as_str()))
                {
                    Some(Level::Warning)
                } else {
                    Some(Level::Error)
                }
            }
        }
    }
}

async fn read_stream<R>(
    process: Arc<ManagedProcess>,
    stream: StreamKind,
    reader: R,
    classifier: LineClassifier,
    output: OutputSink,
) where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(err) => {
                warn!(project = %process.label(), ?stream, error = %err, "output reader failed");
                // Drain to EOF so the child never writes into a closed pipe.
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }
        while matches!(buf.last(), Some(b'\n' | b'\r')) {
            buf.pop();
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        let Some(level) = classifier.classify(stream, &line) else {
            continue;
        };
        output.emit(Event::ProcessOutput(OutputRecord {
            label: process.label().to_string(),
            stream,
            level,
            line,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(show_output: bool, indicators: &[&str]) -> ProcessOptions {
        ProcessOptions {
            kill_on_exit: true,
            show_output,
            warning_indicators: indicators.iter().map(|i| i.to_string()).collect(),
            ..ProcessOptions::default()
        }
    }

    #[test]
    fn stderr_lines_are_warnings_only_with_an_indicator_prefix() {
        let classifier = LineClassifier::new(&options(false, &["WARN", "npm warn"]));
        assert_eq!(classifier.classify(StreamKind::Stderr, "   "), None);
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "warning: deprecated"),
            Some(Level::Warning)
        );
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "NPM WARN old lockfile"),
            Some(Level::Warning)
        );
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "error: it broke"),
            Some(Level::Error)
        );
    }

    #[test]
    fn kill_command_stderr_is_a_warning() {
        let mut kill = options(false, &[]);
        kill.stderr_as_warning = true;
        let classifier = LineClassifier::new(&kill);
        assert_eq!(
            classifier.classify(StreamKind::Stderr, "dotnet: no process found"),
            Some(Level::Warning)
        );
        assert_eq!(classifier.classify(StreamKind::Stderr, ""), None);
    }

    #[test]
    fn stdout_is_forwarded_only_when_requested() {
        let quiet = LineClassifier::new(&options(false, &[]));
        assert_eq!(quiet.classify(StreamKind::Stdout, "hello"), None);
        let shown = LineClassifier::new(&options(true, &[]));
        assert_eq!(shown.classify(StreamKind::Stdout, "hello"), Some(Level::Info));
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (sink, _rx) = OutputSink::channel();
        let manager = ProcessManager::new(sink, Platform::current());
        let process = manager
            .create(ProcessSpec::new("Backend", AppTask::Start, "true"))
            .unwrap();
        assert!(matches!(
            manager.register(process.clone()),
            Err(RegiError::DuplicateProcess(id)) if id == process.id()
        ));
        assert_eq!(manager.tracked().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_of_unknown_id_fails() {
        let (sink, _rx) = OutputSink::channel();
        let manager = ProcessManager::new(sink, Platform::current());
        let id = Uuid::new_v4();
        assert!(matches!(
            manager.shutdown(id, &CancellationToken::new()).await,
            Err(RegiError::UnknownProcess(unknown)) if unknown == id
        ));
    }

    #[tokio::test]
    async fn launch_failure_marks_the_process_failed() {
        let (sink, _rx) = OutputSink::channel();
        let manager = ProcessManager::new(sink, Platform::current());
        let process = manager
            .create(ProcessSpec::new(
                "Missing",
                AppTask::Build,
                "/nonexistent/regi-test-binary",
            ))
            .unwrap();
        assert!(matches!(
            manager.start(&process),
            Err(RegiError::ProcessLaunch { .. })
        ));
        assert_eq!(process.status(), AppStatus::Failure);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;

        fn shell(label: &str, script: &str, options: ProcessOptions) -> ProcessSpec {
            let mut spec = ProcessSpec::new(label, AppTask::Test, "sh");
            spec.args = vec!["-c".into(), script.into()];
            spec.options = options;
            spec
        }

        #[tokio::test]
        async fn exit_code_decides_the_terminal_status() {
            let (sink, _rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current());

            let passing = manager
                .create(shell("pass", "exit 0", options(false, &[])))
                .unwrap();
            let failing = manager
                .create(shell("fail", "exit 3", options(false, &[])))
                .unwrap();
            manager.start(&passing).unwrap();
            manager.start(&failing).unwrap();

            assert_eq!(passing.wait().await, AppStatus::Success);
            assert_eq!(failing.wait().await, AppStatus::Failure);
            assert_eq!(failing.exit_code(), Some(3));
            assert!(passing.pid().is_some());
            assert!(passing.runtime().is_some());
        }

        #[tokio::test]
        async fn captured_output_is_classified() {
            let (sink, mut rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current());
            let script = "echo 'WARN: careful' >&2; echo '' >&2; echo broken >&2; echo ignored";
            let process = manager
                .create(shell("noisy", script, options(false, &["warn"])))
                .unwrap();
            manager.start(&process).unwrap();
            process.wait().await;

            let mut records = Vec::new();
            let mut exited = false;
            while let Ok(event) = rx.try_recv() {
                match event {
                    Event::ProcessOutput(record) => records.push((record.level, record.line)),
                    Event::ProcessExited { code, .. } => {
                        exited = true;
                        assert_eq!(code, Some(0));
                    }
                    _ => {}
                }
            }
            assert!(exited);
            assert_eq!(
                records,
                vec![
                    (Level::Warning, "WARN: careful".to_string()),
                    (Level::Error, "broken".to_string()),
                ]
            );
        }

        #[tokio::test]
        async fn invalid_utf8_output_does_not_stall_the_child() {
            let (sink, mut rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current());
            let script = "printf 'caf\\351\\n'; sleep 0.2; \
                i=0; while [ $i -lt 20000 ]; do echo line $i; i=$((i+1)); done; \
                echo after >&2; exit 0";
            let process = manager
                .create(shell("latin1", script, options(true, &[])))
                .unwrap();
            manager.start(&process).unwrap();

            assert_eq!(process.wait().await, AppStatus::Success);
            assert_eq!(process.exit_code(), Some(0));

            let mut stdout = Vec::new();
            let mut stderr = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let Event::ProcessOutput(record) = event {
                    match record.stream {
                        StreamKind::Stdout => stdout.push(record.line),
                        StreamKind::Stderr => stderr.push(record.line),
                    }
                }
            }
            assert_eq!(stdout.first().map(String::as_str), Some("caf\u{FFFD}"));
            assert_eq!(stdout.len(), 20_001);
            assert_eq!(stdout.last().map(String::as_str), Some("line 19999"));
            assert_eq!(stderr, vec!["after".to_string()]);
        }

        #[tokio::test]
        async fn environment_and_working_directory_reach_the_child() {
            let (sink, mut rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current());
            let dir = tempfile::tempdir().unwrap();
            let mut spec = shell("env", "echo \"$BACKEND_PORT\"; pwd", options(true, &[]));
            spec.env.insert("BACKEND_PORT".into(), "http://localhost:9081".into());
            spec.cwd = Some(dir.path().to_path_buf());
            let process = manager.create(spec).unwrap();
            manager.start(&process).unwrap();
            assert_eq!(process.wait().await, AppStatus::Success);

            let mut lines = Vec::new();
            while let Ok(event) = rx.try_recv() {
                if let Event::ProcessOutput(record) = event {
                    lines.push(record.line);
                }
            }
            assert_eq!(lines[0], "http://localhost:9081");
            let reported = std::fs::canonicalize(&lines[1]).unwrap();
            assert_eq!(reported, std::fs::canonicalize(dir.path()).unwrap());
            assert!(std::env::var("BACKEND_PORT").is_err());
        }

        #[tokio::test]
        async fn kill_terminates_a_running_process() {
            let (sink, _rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current());
            let process = manager
                .create(shell("sleeper", "sleep 30", options(false, &[])))
                .unwrap();
            manager.start(&process).unwrap();

            manager.kill(&process, Duration::from_secs(5)).await;
            assert_eq!(process.status(), AppStatus::Failure);

            assert!(!manager.shutdown(process.id(), &CancellationToken::new()).await.unwrap());
            assert!(manager.tracked().is_empty());
        }

        #[tokio::test]
        async fn dispose_respects_kill_on_exit_unless_forced() {
            let (sink, _rx) = OutputSink::channel();
            let manager = ProcessManager::new(sink, Platform::current())
                .with_kill_timeout(Duration::from_secs(5));
            let doomed = manager
                .create(shell("doomed", "sleep 30", options(false, &[])))
                .unwrap();
            let mut keep = options(false, &[]);
            keep.kill_on_exit = false;
            let kept = manager.create(shell("kept", "sleep 30", keep)).unwrap();
            manager.start(&doomed).unwrap();
            manager.start(&kept).unwrap();

            assert_eq!(manager.dispose_all(false).await, 1);
            assert!(manager.tracked().is_empty());
            assert_eq!(doomed.status(), AppStatus::Failure);
            assert_eq!(kept.status(), AppStatus::Running);

            manager.register(kept.clone()).unwrap();
            assert_eq!(manager.dispose_all(true).await, 1);
            assert!(kept.status().is_terminal());
        }
    }
}
