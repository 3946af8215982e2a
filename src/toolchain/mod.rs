//! Toolchain adapters.
//!
//! Each adapter knows how one toolchain spells the install, start, test and build
//! actions, which environment a started project needs, and how to terminate the
//! toolchain's processes. The orchestrator picks adapters through [`ToolchainRegistry`].

mod dotnet;
mod node;

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::command::{build_command, split_command, DefaultArguments};
use crate::config::{Project, RunOptions, Toolchain};
use crate::error::{RegiError, Result};
use crate::platform::{Platform, ShellCommand};
use crate::process::{AppTask, ProcessOptions, ProcessSpec};

pub use dotnet::Dotnet;
pub use node::Node;

/// A project action every adapter can launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Install,
    Start,
    Test,
    Build,
}

impl Action {
    pub fn task(self) -> AppTask {
        match self {
            Action::Install => AppTask::Install,
            Action::Start => AppTask::Start,
            Action::Test => AppTask::Test,
            Action::Build => AppTask::Build,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.task().fmt(f)
    }
}

pub trait ToolchainAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    /// Program launched for every action.
    fn executable(&self, platform: Platform) -> String;

    /// OS process name targeted by `kill`.
    fn process_name(&self) -> &str;

    /// Subcommand for `action`, also the key for project arguments and overrides.
    fn subcommand(&self, action: Action) -> &'static str;

    fn default_arguments(&self) -> DefaultArguments {
        &[]
    }

    /// Subcommands used for actions the project does not override itself.
    fn default_commands(&self) -> &'static [(&'static str, &'static str)] {
        &[]
    }

    fn warning_indicators(&self) -> &'static [&'static str] {
        &[]
    }

    /// Environment telling a started project which port to bind.
    fn port_environment(&self, port: u16) -> Vec<(String, String)>;

    /// Arguments pointing `install` at a package-registry override.
    fn source_arguments(&self, source: &str) -> Vec<String>;

    /// Commands run before the blunt kill, e.g. to stop build servers.
    fn shutdown_commands(&self, _platform: Platform) -> Vec<ShellCommand> {
        Vec::new()
    }

    fn install(
        &self,
        project: &Project,
        dir: &Path,
        options: &RunOptions,
        platform: Platform,
    ) -> Result<ProcessSpec> {
        prepare(self, Action::Install, project, dir, options, platform)
    }

    fn start(
        &self,
        project: &Project,
        dir: &Path,
        options: &RunOptions,
        platform: Platform,
    ) -> Result<ProcessSpec> {
        prepare(self, Action::Start, project, dir, options, platform)
    }

    fn test(
        &self,
        project: &Project,
        dir: &Path,
        options: &RunOptions,
        platform: Platform,
    ) -> Result<ProcessSpec> {
        prepare(self, Action::Test, project, dir, options, platform)
    }

    fn build(
        &self,
        project: &Project,
        dir: &Path,
        options: &RunOptions,
        platform: Platform,
    ) -> Result<ProcessSpec> {
        prepare(self, Action::Build, project, dir, options, platform)
    }
}

/// Turns a project action into a launchable [`ProcessSpec`].
fn prepare<A>(
    adapter: &A,
    action: Action,
    project: &Project,
    dir: &Path,
    options: &RunOptions,
    platform: Platform,
) -> Result<ProcessSpec>
where
    A: ToolchainAdapter + ?Sized,
{
    let subcommand = adapter.subcommand(action);
    let project = with_default_command(adapter, subcommand, project);
    let mut command = build_command(subcommand, &project, adapter.default_arguments(), options);
    if action == Action::Install {
        if let Some(source) = project.source.as_deref().filter(|s| !s.trim().is_empty()) {
            for argument in adapter.source_arguments(source) {
                command.push(' ');
                command.push_str(&shell_words::quote(&argument));
            }
        }
    }
    let args = split_command(&command).map_err(|err| RegiError::CommandSyntax {
        label: project.name.clone(),
        message: err.to_string(),
    })?;

    let mut env: BTreeMap<String, String> = options
        .variables
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    env.extend(
        project
            .environment
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    let port = if action == Action::Start { project.port } else { None };
    if let Some(port) = port {
        env.extend(adapter.port_environment(port));
    }

    let mut spec = ProcessSpec::new(project.name.clone(), action.task(), adapter.executable(platform));
    spec.args = args;
    spec.cwd = Some(dir.to_path_buf());
    spec.env = env;
    spec.port = port;
    spec.options = ProcessOptions {
        kill_on_exit: options.kill_on_exit,
        verbose: options.verbose,
        raw_output: options.raw_output_for(&project),
        show_output: options.shows_output_for(&project),
        warning_indicators: adapter
            .warning_indicators()
            .iter()
            .map(|indicator| indicator.to_string())
            .collect(),
        stderr_as_warning: false,
    };
    Ok(spec)
}

fn with_default_command<'a, A>(adapter: &A, action: &str, project: &'a Project) -> Cow<'a, Project>
where
    A: ToolchainAdapter + ?Sized,
{
    if project.commands.contains_key(action) {
        return Cow::Borrowed(project);
    }
    match adapter
        .default_commands()
        .iter()
        .find(|(name, _)| *name == action)
    {
        Some((_, command)) => {
            let mut project = project.clone();
            project.commands.insert(action.to_string(), command.to_string());
            Cow::Owned(project)
        }
        None => Cow::Borrowed(project),
    }
}

/// Adapters keyed by toolchain tag.
#[derive(Clone)]
pub struct ToolchainRegistry {
    adapters: BTreeMap<Toolchain, Arc<dyn ToolchainAdapter>>,
}

impl ToolchainRegistry {
    /// A registry without adapters.
    pub fn empty() -> Self {
        Self {
            adapters: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, toolchain: Toolchain, adapter: Arc<dyn ToolchainAdapter>) {
        self.adapters.insert(toolchain, adapter);
    }

    pub fn get(&self, toolchain: Toolchain) -> Result<Arc<dyn ToolchainAdapter>> {
        self.adapters
            .get(&toolchain)
            .cloned()
            .ok_or(RegiError::UnsupportedToolchain(toolchain))
    }
}

impl Default for ToolchainRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Toolchain::Dotnet, Arc::new(Dotnet));
        registry.register(Toolchain::Node, Arc::new(Node));
        registry
    }
}
