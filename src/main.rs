//! regi: starts, tests, builds and installs the projects of a multi-project workspace.
//!
//! The binary parses the command line, sets up logging and the console, runs one
//! orchestrator workflow and always cleans up the processes it launched.

mod command;
mod config;
mod error;
mod events;
mod orchestrator;
mod output;
mod platform;
mod ports;
mod process;
mod runner;
mod scheduler;
mod toolchain;
mod tree;

use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::{Project, ProjectKind, RunOptions};
use crate::error::RegiError;
use crate::orchestrator::{
    Orchestrator, ProjectListing, ProjectRun, ReadinessPolicy, RunContext, WorkflowOutcome,
};
use crate::output::{Console, ConsoleSettings};
use crate::platform::Platform;
use crate::runner::{ProcessManager, DEFAULT_KILL_TIMEOUT};
use crate::toolchain::Action;

const CONSOLE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "regi",
    version,
    about = "Starts, tests, builds and installs multi-project workspaces",
    styles = help_styles(),
    color = clap::ColorChoice::Always,
    disable_help_subcommand = true
)]
struct Cli {
    /// Directory holding regi.json or startup.json (defaults to the current directory).
    #[arg(long, short = 'd', global = true)]
    directory: Option<PathBuf>,
    /// Emit log lines as JSON.
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start every app and keep them running until they exit or Ctrl+C.
    Start(WorkflowArgs),
    /// Run test projects, starting the apps they require.
    Test(WorkflowArgs),
    /// Build every app, one at a time.
    Build(WorkflowArgs),
    /// Install dependencies of every app and test.
    Install(WorkflowArgs),
    /// Kill every process of the toolchains the projects use.
    Kill(WorkflowArgs),
    /// List configured apps and tests.
    List(WorkflowArgs),
    /// Write a starter regi.json.
    Init,
    /// Show version information.
    Version,
}

impl Commands {
    fn workflow_args(&self) -> Option<&WorkflowArgs> {
        match self {
            Commands::Start(args)
            | Commands::Test(args)
            | Commands::Build(args)
            | Commands::Install(args)
            | Commands::Kill(args)
            | Commands::List(args) => Some(args),
            Commands::Init | Commands::Version => None,
        }
    }
}

#[derive(Debug, Clone, clap::Args)]
struct WorkflowArgs {
    /// Only projects whose name contains this text (case-insensitive).
    #[arg(long, short = 'n')]
    name: Option<String>,
    /// Only projects of this type.
    #[arg(long = "type", short = 't', value_enum)]
    kind: Option<ProjectKind>,
    /// Show process output, start and exit notices, and debug logs.
    #[arg(long, short = 'v')]
    verbose: bool,
    /// Run every task one after another.
    #[arg(long)]
    no_parallel: bool,
    /// Pass process output through untouched.
    #[arg(long)]
    raw_output: bool,
    /// Show the output of these projects.
    #[arg(long, value_name = "NAME", num_args = 1..)]
    show_output: Vec<String>,
    /// Kill started processes when regi exits (default).
    #[arg(long, overrides_with = "no_kill_on_exit")]
    kill_on_exit: bool,
    /// Leave started processes running when regi exits.
    #[arg(long, overrides_with = "kill_on_exit")]
    no_kill_on_exit: bool,
    /// Seconds to wait for ports to start listening.
    #[arg(long, value_name = "SECS", default_value_t = 120)]
    port_timeout: u64,
    /// Fail instead of continuing when ports do not open in time.
    #[arg(long)]
    fail_on_timeout: bool,
    /// Milliseconds between two port checks while waiting.
    #[arg(long, value_name = "MS", default_value_t = 250)]
    poll_interval: u64,
    /// Seconds a process gets to exit after being signalled before it is force-killed.
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    kill_timeout: u64,
    /// Arguments appended to every command.
    #[arg(last = true)]
    remaining: Vec<String>,
}

impl WorkflowArgs {
    fn kills_on_exit(&self) -> bool {
        self.kill_on_exit || !self.no_kill_on_exit
    }

    fn run_options(&self) -> RunOptions {
        RunOptions {
            name: self.name.clone(),
            kind: self.kind,
            verbose: self.verbose,
            no_parallel: self.no_parallel,
            raw_output: self.raw_output,
            show_output: self.show_output.clone(),
            kill_on_exit: self.kills_on_exit(),
            remaining_arguments: self.remaining.clone(),
            ..RunOptions::default()
        }
    }

    fn readiness(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            timeout: Duration::from_secs(self.port_timeout),
            poll_interval: Duration::from_millis(self.poll_interval.max(1)),
            abort_on_timeout: self.fail_on_timeout,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let verbose = cli.command.workflow_args().is_some_and(|args| args.verbose);
    init_tracing(if verbose { "regi=debug" } else { "regi=info" }, cli.log_json);

    match run(cli, verbose).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            match err.downcast_ref::<RegiError>() {
                Some(RegiError::Cancelled) => warn!("interrupted"),
                _ => error!("{:#}", err),
            }
            ExitCode::from(1)
        }
    }
}

fn init_tracing(default_filter: &str, log_json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
    );
    // Logs go to stderr; stdout carries project output.
    let layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    if log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer.json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(layer)
            .init();
    }
}

async fn run(cli: Cli, verbose: bool) -> Result<u8> {
    let directory = match cli.directory {
        Some(directory) => directory,
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    let platform = Platform::current();
    debug!(directory = %directory.display(), ?platform, "starting");

    let (sink, console) = Console::spawn(ConsoleSettings::detect(verbose));
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let kill_timeout = cli
        .command
        .workflow_args()
        .map(|args| Duration::from_secs(args.kill_timeout))
        .unwrap_or(DEFAULT_KILL_TIMEOUT);
    let manager = Arc::new(ProcessManager::new(sink, platform).with_kill_timeout(kill_timeout));
    let mut orchestrator = Orchestrator::new(
        RunContext::new(directory, platform),
        manager.clone(),
        cancel.clone(),
    );
    if let Some(args) = cli.command.workflow_args() {
        orchestrator = orchestrator.with_readiness(args.readiness());
    }

    let result = execute(&orchestrator, &cli.command, &cancel).await;

    for process in manager.tracked() {
        debug!(project = %process.label(), status = ?process.status(), "still tracked");
    }
    let disposed = manager.dispose_all(cancel.is_cancelled()).await;
    debug!(disposed, "cleanup finished");
    drop(orchestrator);
    drop(manager);
    console.finish(CONSOLE_DRAIN_TIMEOUT).await;
    result
}

async fn execute(
    orchestrator: &Orchestrator,
    command: &Commands,
    cancel: &CancellationToken,
) -> Result<u8> {
    match command {
        Commands::Start(args) => {
            let runs = orchestrator.start(&args.run_options()).await?;
            wait_for_exit(&runs, cancel).await;
            Ok(0)
        }
        Commands::Test(args) => {
            let outcome = orchestrator.test(&args.run_options()).await?;
            Ok(summarize(&outcome, Action::Test))
        }
        Commands::Build(args) => {
            let outcome = orchestrator.build(&args.run_options()).await?;
            Ok(summarize(&outcome, Action::Build))
        }
        Commands::Install(args) => {
            let outcome = orchestrator.install(&args.run_options()).await?;
            Ok(summarize(&outcome, Action::Install))
        }
        Commands::Kill(args) => {
            let failures = orchestrator.kill(&args.run_options()).await?;
            if failures > 0 {
                warn!(failures, "some kill commands failed");
            }
            Ok(exit_status(failures))
        }
        Commands::List(args) => {
            let listing = orchestrator.list(&args.run_options())?;
            print!("{}", render_listing(&listing, args.verbose));
            Ok(0)
        }
        Commands::Init => {
            let path = orchestrator.initialize()?;
            println!("Created {}", path.display());
            Ok(0)
        }
        Commands::Version => {
            println!("regi {}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
    }
}

/// Blocks until every started process exited or the run is interrupted.
async fn wait_for_exit(runs: &[ProjectRun], cancel: &CancellationToken) {
    let processes: Vec<_> = runs
        .iter()
        .flat_map(|run| run.processes.iter().cloned())
        .collect();
    if processes.is_empty() {
        return;
    }
    info!(count = processes.len(), "running, press Ctrl+C to stop");
    tokio::select! {
        _ = async {
            for process in &processes {
                process.wait().await;
            }
        } => info!("all processes exited"),
        _ = cancel.cancelled() => info!("stopping processes"),
    }
}

fn summarize(outcome: &WorkflowOutcome, action: Action) -> u8 {
    for run in outcome.runs.iter().filter(|run| run.failed()) {
        match &run.error {
            Some(error) => warn!(project = %run.project.name, "{} failed: {}", action, error),
            None => warn!(project = %run.project.name, "{} failed", action),
        }
    }
    for failure in outcome.aborted() {
        warn!(project = %failure.label, "{} aborted: {}", action, failure.message);
    }
    let failed = outcome.failed();
    info!(
        total = outcome.runs.len(),
        failed,
        "{} finished",
        action
    );
    exit_status(failed)
}

fn exit_status(failures: usize) -> u8 {
    u8::try_from(failures).unwrap_or(u8::MAX)
}

fn render_listing(listing: &ProjectListing, verbose: bool) -> String {
    let mut out = String::new();
    for (title, projects) in [("Apps", &listing.apps), ("Tests", &listing.tests)] {
        let _ = writeln!(out, "{}:", title);
        if projects.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for project in projects {
            let _ = writeln!(out, "  {}", project.name);
            if verbose {
                render_properties(&mut out, project);
            }
        }
    }
    out
}

fn render_properties(out: &mut String, project: &Project) {
    let kind = project
        .kind
        .to_possible_value()
        .map(|value| value.get_name().to_string())
        .unwrap_or_default();
    let _ = writeln!(out, "    framework: {}", project.toolchain);
    let _ = writeln!(out, "    type: {}", kind);
    if let Some(port) = project.port {
        let _ = writeln!(out, "    port: {}", port);
    }
    if !project.paths.is_empty() {
        let _ = writeln!(out, "    paths: {}", project.paths.join(", "));
    }
    if !project.requires.is_empty() {
        let _ = writeln!(out, "    requires: {}", project.requires.join(", "));
    }
    if project.serial {
        let _ = writeln!(out, "    serial: true");
    }
}

fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(error = %err, "failed to listen for SIGTERM");
                    return;
                }
            };
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if result.is_err() {
                        return;
                    }
                }
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
        }
        info!("interrupt received");
        cancel.cancel();
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Toolchain;

    fn workflow(args: &[&str]) -> WorkflowArgs {
        let cli = Cli::try_parse_from(args).unwrap();
        cli.command.workflow_args().cloned().unwrap()
    }

    #[test]
    fn start_collects_filters_and_trailing_arguments() {
        let cli = Cli::try_parse_from([
            "regi", "start", "--directory", "/work", "-n", "front", "--no-parallel", "--",
            "--urls", "http://*:1",
        ])
        .unwrap();
        assert_eq!(cli.directory, Some(PathBuf::from("/work")));
        let options = cli.command.workflow_args().unwrap().run_options();
        assert_eq!(options.name.as_deref(), Some("front"));
        assert!(options.no_parallel);
        assert!(options.kill_on_exit);
        assert_eq!(options.remaining_arguments, vec!["--urls", "http://*:1"]);
    }

    #[test]
    fn kill_on_exit_can_be_turned_off() {
        let args = workflow(&["regi", "test", "--no-kill-on-exit", "-t", "integration"]);
        assert!(!args.run_options().kill_on_exit);
        assert_eq!(args.kind, Some(ProjectKind::Integration));

        let args = workflow(&["regi", "test", "--no-kill-on-exit", "--kill-on-exit"]);
        assert!(args.run_options().kill_on_exit);
    }

    #[test]
    fn readiness_flags_map_to_the_policy() {
        let args = workflow(&[
            "regi",
            "start",
            "--port-timeout",
            "5",
            "--fail-on-timeout",
            "--poll-interval",
            "50",
        ]);
        let policy = args.readiness();
        assert_eq!(policy.timeout, Duration::from_secs(5));
        assert_eq!(policy.poll_interval, Duration::from_millis(50));
        assert!(policy.abort_on_timeout);

        let policy = workflow(&["regi", "start"]).readiness();
        assert_eq!(policy.timeout, Duration::from_secs(120));
        assert_eq!(policy.poll_interval, Duration::from_millis(250));
        assert!(!policy.abort_on_timeout);
    }

    #[test]
    fn show_output_takes_several_names() {
        let args = workflow(&["regi", "test", "--show-output", "Backend", "Frontend", "-v"]);
        assert_eq!(args.show_output, vec!["Backend", "Frontend"]);
        assert!(args.verbose);
    }

    #[test]
    fn exit_status_is_clamped() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(3), 3);
        assert_eq!(exit_status(1000), 255);
    }

    #[test]
    fn listing_shows_properties_when_verbose() {
        let listing = ProjectListing {
            apps: vec![Project {
                name: "Frontend".into(),
                toolchain: Toolchain::Node,
                port: Some(9080),
                requires: vec!["Backend".into()],
                ..Project::default()
            }],
            tests: Vec::new(),
        };
        let brief = render_listing(&listing, false);
        assert_eq!(brief, "Apps:\n  Frontend\nTests:\n  (none)\n");

        let detailed = render_listing(&listing, true);
        assert!(detailed.contains("    framework: node\n"));
        assert!(detailed.contains("    type: web\n"));
        assert!(detailed.contains("    port: 9080\n"));
        assert!(detailed.contains("    requires: Backend\n"));
    }
}
