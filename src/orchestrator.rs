//! Workflow orchestration: start, test, build, install, kill, list and init.
//!
//! Each workflow loads the configuration from the run directory, filters the relevant
//! projects, and hands one task per project to a fresh [`Scheduler`]. Per-project
//! failures are recorded in the returned [`ProjectRun`]s and never abort the workflow.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{
    load_startup_config, write_default_config, Project, RunOptions, StartupConfig, Toolchain,
    VariableList,
};
use crate::error::{RegiError, Result};
use crate::platform::Platform;
use crate::ports::{PortMonitor, DEFAULT_POLL_INTERVAL};
use crate::process::{AppStatus, ManagedProcess};
use crate::runner::ProcessManager;
use crate::scheduler::{ScheduleReport, Scheduler, TaskFailure};
use crate::toolchain::{Action, ToolchainRegistry};

pub const DEFAULT_PORT_TIMEOUT: Duration = Duration::from_secs(120);

/// Where a workflow runs.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Directory holding the configuration document; project paths are relative to it.
    pub directory: PathBuf,
    pub platform: Platform,
}

impl RunContext {
    pub fn new(directory: impl Into<PathBuf>, platform: Platform) -> Self {
        Self {
            directory: directory.into(),
            platform,
        }
    }
}

/// What happens when ports do not open in time.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessPolicy {
    pub timeout: Duration,
    /// Delay between two port checks.
    pub poll_interval: Duration,
    /// Fail the workflow instead of logging a warning and proceeding.
    pub abort_on_timeout: bool,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_PORT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            abort_on_timeout: false,
        }
    }
}

/// A project together with the processes launched for it in one workflow.
#[derive(Debug, Clone)]
pub struct ProjectRun {
    pub project: Project,
    pub processes: Vec<Arc<ManagedProcess>>,
    /// Transient dependencies started for a test run.
    pub dependencies: Vec<Arc<ManagedProcess>>,
    /// Why the run failed before or while launching.
    pub error: Option<String>,
}

impl ProjectRun {
    pub fn new(project: Project) -> Self {
        Self {
            project,
            processes: Vec::new(),
            dependencies: Vec::new(),
            error: None,
        }
    }

    /// `Failure` if anything failed, `Running` while a process runs, else `Success`.
    pub fn status(&self) -> AppStatus {
        if self.error.is_some() || self.processes.is_empty() {
            return AppStatus::Failure;
        }
        let statuses: Vec<AppStatus> = self.processes.iter().map(|p| p.status()).collect();
        if statuses.contains(&AppStatus::Failure) {
            AppStatus::Failure
        } else if statuses.contains(&AppStatus::Running) {
            AppStatus::Running
        } else {
            AppStatus::Success
        }
    }

    pub fn failed(&self) -> bool {
        self.status() == AppStatus::Failure
    }
}

/// Result of a test, build or install workflow.
#[derive(Debug)]
pub struct WorkflowOutcome {
    pub runs: Vec<ProjectRun>,
    pub report: ScheduleReport,
}

impl WorkflowOutcome {
    /// Number of failed projects, counting tasks that died before recording a run.
    pub fn failed(&self) -> usize {
        self.runs.iter().filter(|run| run.failed()).count() + self.aborted().count()
    }

    /// Scheduler failures without a matching project run, e.g. panicked tasks.
    pub fn aborted(&self) -> impl Iterator<Item = &TaskFailure> {
        self.report
            .failures
            .iter()
            .filter(move |failure| {
                !self.runs.iter().any(|run| run.project.name == failure.label)
            })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProjectListing {
    pub apps: Vec<Project>,
    pub tests: Vec<Project>,
}

#[derive(Clone, Default)]
struct RunCollector {
    runs: Arc<Mutex<Vec<(usize, ProjectRun)>>>,
}

impl RunCollector {
    fn push(&self, index: usize, run: ProjectRun) {
        self.runs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((index, run));
    }

    fn take(&self) -> Vec<ProjectRun> {
        let mut runs = std::mem::take(&mut *self.runs.lock().unwrap_or_else(PoisonError::into_inner));
        runs.sort_by_key(|(index, _)| *index);
        runs.into_iter().map(|(_, run)| run).collect()
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    context: Arc<RunContext>,
    manager: Arc<ProcessManager>,
    toolchains: Arc<ToolchainRegistry>,
    monitor: PortMonitor,
    readiness: ReadinessPolicy,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(context: RunContext, manager: Arc<ProcessManager>, cancel: CancellationToken) -> Self {
        let monitor = PortMonitor::system(context.platform);
        Self {
            context: Arc::new(context),
            manager,
            toolchains: Arc::new(ToolchainRegistry::default()),
            monitor,
            readiness: ReadinessPolicy::default(),
            cancel,
        }
    }

    pub fn with_readiness(mut self, readiness: ReadinessPolicy) -> Self {
        self.monitor = self.monitor.with_poll_interval(readiness.poll_interval);
        self.readiness = readiness;
        self
    }

    pub fn manager(&self) -> &Arc<ProcessManager> {
        &self.manager
    }

    /// Starts every matching app, then waits until the apps with ports are listening.
    pub async fn start(&self, options: &RunOptions) -> Result<Vec<ProjectRun>> {
        let config = self.load()?;
        let options = with_port_variables(&config, options);
        let apps = options.filter(&config.apps);
        if apps.is_empty() {
            warn!("no apps matched");
            return Ok(Vec::new());
        }

        let collector = RunCollector::default();
        let mut scheduler = Scheduler::new(self.monitor.clone());
        for (index, app) in apps.into_iter().enumerate() {
            let this = self.clone();
            let options = options.clone();
            let collector = collector.clone();
            let serial = options.is_serial(&app);
            let label = app.name.clone();
            scheduler.enqueue(serial, label, async move {
                let mut run = ProjectRun::new(app);
                let dir = this.first_directory(&run.project);
                let result = this.launch(&mut run, Action::Start, &dir, &options);
                if let Err(err) = &result {
                    run.error = Some(err.to_string());
                }
                collector.push(index, run);
                result?;
                Ok(())
            });
        }
        let report = scheduler.run_all().await;
        if !report.is_success() {
            warn!(failed = report.failures.len(), "some apps failed to start");
        }

        let runs = collector.take();
        let running: Vec<Project> = runs
            .iter()
            .filter(|run| run.status() == AppStatus::Running)
            .map(|run| run.project.clone())
            .collect();
        let waited = scheduler
            .wait_on_ports(&running, self.readiness.timeout, &self.cancel)
            .await;
        self.settle(waited)?;
        Ok(runs)
    }

    /// Runs every matching test project, starting the apps it requires around it.
    pub async fn test(&self, options: &RunOptions) -> Result<WorkflowOutcome> {
        let config = Arc::new(self.load()?);
        let options = with_port_variables(&config, options);
        let tests = options.filter(&config.tests);

        let collector = RunCollector::default();
        let mut scheduler = Scheduler::new(self.monitor.clone());
        for (index, test) in tests.into_iter().enumerate() {
            let this = self.clone();
            let config = config.clone();
            let options = options.clone();
            let collector = collector.clone();
            let serial = options.is_serial(&test);
            let label = test.name.clone();
            scheduler.enqueue(serial, label, async move {
                let mut run = ProjectRun::new(test);
                let result = this.run_test(&config, &mut run, &options).await;
                finish_run(&collector, index, run, Action::Test, result)
            });
        }
        let report = scheduler.run_all().await;
        Ok(WorkflowOutcome {
            runs: collector.take(),
            report,
        })
    }

    /// Builds every matching app, one at a time.
    pub async fn build(&self, options: &RunOptions) -> Result<WorkflowOutcome> {
        let config = self.load()?;
        let options = with_port_variables(&config, options);
        let apps = options.filter(&config.apps);
        Ok(self.run_batch(apps, Action::Build, |_| true, &options).await)
    }

    /// Installs dependencies of every matching app and test, all at once.
    pub async fn install(&self, options: &RunOptions) -> Result<WorkflowOutcome> {
        let config = self.load()?;
        let options = with_port_variables(&config, options);
        let projects = options.filter(config.apps.iter().chain(&config.tests));
        Ok(self.run_batch(projects, Action::Install, |_| false, &options).await)
    }

    /// Kills every process of each toolchain used by the matching projects. Returns the
    /// number of failed kill commands.
    pub async fn kill(&self, options: &RunOptions) -> Result<usize> {
        let config = self.load()?;
        let projects = options.filter(
            config
                .apps
                .iter()
                .chain(&config.tests)
                .chain(&config.services),
        );
        let toolchains: BTreeSet<Toolchain> = projects.iter().map(|p| p.toolchain).collect();

        let mut failures = 0;
        for toolchain in toolchains {
            let adapter = match self.toolchains.get(toolchain) {
                Ok(adapter) => adapter,
                Err(err) => {
                    debug!(%toolchain, "skipping kill: {}", err);
                    continue;
                }
            };
            info!(toolchain = adapter.name(), "killing processes");
            failures += self
                .manager
                .kill_all_by_toolchain(adapter.as_ref(), options.verbose)
                .await;
        }
        Ok(failures)
    }

    pub fn list(&self, options: &RunOptions) -> Result<ProjectListing> {
        let config = self.load()?;
        Ok(ProjectListing {
            apps: options.filter(&config.apps),
            tests: options.filter(&config.tests),
        })
    }

    /// Writes a starter configuration into the run directory.
    pub fn initialize(&self) -> Result<PathBuf> {
        let path = write_default_config(&self.context.directory)?;
        info!(path = %path.display(), "created configuration");
        Ok(path)
    }

    fn load(&self) -> Result<StartupConfig> {
        load_startup_config(&self.context.directory)
    }

    fn first_directory(&self, project: &Project) -> PathBuf {
        project
            .working_directories(&self.context.directory)
            .into_iter()
            .next()
            .unwrap_or_else(|| self.context.directory.clone())
    }

    async fn run_batch(
        &self,
        projects: Vec<Project>,
        action: Action,
        serial: impl Fn(&Project) -> bool,
        options: &RunOptions,
    ) -> WorkflowOutcome {
        let collector = RunCollector::default();
        let mut scheduler = Scheduler::new(self.monitor.clone());
        for (index, project) in projects.into_iter().enumerate() {
            let this = self.clone();
            let options = options.clone();
            let collector = collector.clone();
            let label = project.name.clone();
            scheduler.enqueue(serial(&project), label, async move {
                let mut run = ProjectRun::new(project);
                let result = this.run_each_path(&mut run, action, &options).await;
                finish_run(&collector, index, run, action, result)
            });
        }
        let report = scheduler.run_all().await;
        WorkflowOutcome {
            runs: collector.take(),
            report,
        }
    }

    async fn run_test(
        &self,
        config: &StartupConfig,
        run: &mut ProjectRun,
        options: &RunOptions,
    ) -> Result<()> {
        let result = self.test_with_dependencies(config, run, options).await;
        for dependency in &run.dependencies {
            match self.manager.shutdown(dependency.id(), &self.cancel).await {
                Ok(true) => debug!(project = %dependency.label(), "stopped dependency"),
                Ok(false) => debug!(project = %dependency.label(), "dependency already exited"),
                Err(err) => warn!(project = %dependency.label(), "failed to stop dependency: {}", err),
            }
        }
        result
    }

    async fn test_with_dependencies(
        &self,
        config: &StartupConfig,
        run: &mut ProjectRun,
        options: &RunOptions,
    ) -> Result<()> {
        let mut started = Vec::new();
        for required in &run.project.requires {
            let Some(dependency) = config.resolve_requirement(required) else {
                warn!(
                    test = %run.project.name,
                    required = %required,
                    "required project not found or ambiguous, skipping"
                );
                continue;
            };
            if let Some(port) = dependency.port {
                if self.monitor.is_listening(port).await {
                    info!(project = %dependency.name, port, "already listening");
                    continue;
                }
            }

            let mut dependency_options = options.clone();
            dependency_options.variables.add_project(dependency);
            dependency_options.kill_on_exit = true;

            let mut dependency_run = ProjectRun::new(dependency.clone());
            let dir = self.first_directory(dependency);
            match self.launch(&mut dependency_run, Action::Start, &dir, &dependency_options) {
                Ok(_) => started.push(dependency.clone()),
                Err(err) => warn!(project = %dependency.name, "failed to start dependency: {}", err),
            }
            run.dependencies.extend(dependency_run.processes);
        }

        let pending: BTreeMap<u16, String> = started
            .iter()
            .filter_map(|project| project.port.map(|port| (port, project.name.clone())))
            .collect();
        let waited = self
            .monitor
            .wait_until_listening(pending, self.readiness.timeout, &self.cancel)
            .await;
        self.settle(waited)?;

        self.run_each_path(run, Action::Test, options).await
    }

    /// Runs `action` once per project path, sequentially.
    async fn run_each_path(
        &self,
        run: &mut ProjectRun,
        action: Action,
        options: &RunOptions,
    ) -> Result<()> {
        for dir in run.project.working_directories(&self.context.directory) {
            let process = self.launch(run, action, &dir, options)?;
            let status = self.wait_for(&process).await?;
            debug!(project = %run.project.name, %action, ?status, "finished");
        }
        Ok(())
    }

    fn launch(
        &self,
        run: &mut ProjectRun,
        action: Action,
        dir: &Path,
        options: &RunOptions,
    ) -> Result<Arc<ManagedProcess>> {
        let adapter = self.toolchains.get(run.project.toolchain)?;
        let platform = self.context.platform;
        let spec = match action {
            Action::Start => adapter.start(&run.project, dir, options, platform)?,
            Action::Test => adapter.test(&run.project, dir, options, platform)?,
            Action::Build => adapter.build(&run.project, dir, options, platform)?,
            Action::Install => adapter.install(&run.project, dir, options, platform)?,
        };
        let process = self.manager.create(spec)?;
        run.processes.push(process.clone());
        self.manager.start(&process)?;
        Ok(process)
    }

    async fn wait_for(&self, process: &ManagedProcess) -> Result<AppStatus> {
        tokio::select! {
            status = process.wait() => Ok(status),
            _ = self.cancel.cancelled() => Err(RegiError::Cancelled),
        }
    }

    fn settle(&self, waited: Result<()>) -> Result<()> {
        match waited {
            Err(RegiError::ReadinessTimeout { pending }) if !self.readiness.abort_on_timeout => {
                warn!(
                    ?pending,
                    "ports not listening after {:?}, continuing",
                    self.readiness.timeout
                );
                Ok(())
            }
            other => other,
        }
    }
}

fn with_port_variables(config: &StartupConfig, options: &RunOptions) -> RunOptions {
    let mut options = options.clone();
    options.variables = VariableList::from_projects(config.runnable());
    options
}

fn finish_run(
    collector: &RunCollector,
    index: usize,
    mut run: ProjectRun,
    action: Action,
    result: Result<()>,
) -> anyhow::Result<()> {
    if let Err(err) = &result {
        run.error = Some(err.to_string());
    }
    let name = run.project.name.clone();
    let failed = run.failed();
    collector.push(index, run);
    result?;
    if failed {
        bail!("{} failed for {}", action, name);
    }
    Ok(())
}
