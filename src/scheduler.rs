//! Parallel-then-serial task scheduling.
//!
//! Parallel tasks are spawned together and joined as a batch. Serial tasks run after the
//! whole batch finished, one at a time in enqueue order. A failing or panicking task is
//! recorded in the [`ScheduleReport`] and never stops its siblings.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Project;
use crate::error::Result;
use crate::ports::PortMonitor;

pub type TaskFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

struct ScheduledTask {
    label: String,
    future: TaskFuture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchedulerState {
    Idle,
    Filling,
    Running,
    Drained,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub label: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct ScheduleReport {
    /// Tasks that returned `Ok`.
    pub completed: usize,
    pub failures: Vec<TaskFailure>,
}

impl ScheduleReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, label: String, outcome: std::result::Result<anyhow::Result<()>, JoinError>) {
        let message = match outcome {
            Ok(Ok(())) => {
                self.completed += 1;
                return;
            }
            Ok(Err(err)) => format!("{:#}", err),
            Err(err) => join_error_message(err),
        };
        warn!(task = %label, "task failed: {}", message);
        self.failures.push(TaskFailure { label, message });
    }
}

pub struct Scheduler {
    parallel: Vec<ScheduledTask>,
    serial: Vec<ScheduledTask>,
    state: SchedulerState,
    monitor: PortMonitor,
}

impl Scheduler {
    pub fn new(monitor: PortMonitor) -> Self {
        Self {
            parallel: Vec::new(),
            serial: Vec::new(),
            state: SchedulerState::Idle,
            monitor,
        }
    }

    /// Queues `future` for the next [`Scheduler::run_all`].
    pub fn enqueue<F>(&mut self, serial: bool, label: impl Into<String>, future: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.state = SchedulerState::Filling;
        let task = ScheduledTask {
            label: label.into(),
            future: Box::pin(future),
        };
        if serial {
            self.serial.push(task);
        } else {
            self.parallel.push(task);
        }
    }

    /// Runs every queued task and drains the queues.
    pub async fn run_all(&mut self) -> ScheduleReport {
        if self.state != SchedulerState::Filling {
            debug!(state = ?self.state, "nothing queued");
            return ScheduleReport::default();
        }
        self.state = SchedulerState::Running;
        let parallel = std::mem::take(&mut self.parallel);
        let serial = std::mem::take(&mut self.serial);
        debug!(parallel = parallel.len(), serial = serial.len(), "running tasks");

        let mut report = ScheduleReport::default();
        let handles: Vec<(String, JoinHandle<anyhow::Result<()>>)> = parallel
            .into_iter()
            .map(|task| (task.label, tokio::spawn(task.future)))
            .collect();
        for (label, handle) in handles {
            report.record(label, handle.await);
        }

        for task in serial {
            let outcome = tokio::spawn(task.future).await;
            report.record(task.label, outcome);
        }

        self.state = SchedulerState::Drained;
        report
    }

    /// Readiness barrier for every project with a port.
    pub async fn wait_on_ports(
        &self,
        projects: &[Project],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pending: BTreeMap<u16, String> = projects
            .iter()
            .filter_map(|project| project.port.map(|port| (port, project.name.clone())))
            .collect();
        self.monitor.wait_until_listening(pending, timeout, cancel).await
    }
}

fn join_error_message(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("task panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("task panicked: {}", message)
    } else {
        "task panicked".to_string()
    }
}
