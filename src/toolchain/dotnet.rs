use crate::command::DefaultArguments;
use crate::platform::{Platform, ShellCommand};

use super::{Action, ToolchainAdapter};

const DEFAULT_ARGUMENTS: DefaultArguments = &[("build", &["--nologo"]), ("test", &["--nologo"])];

/// The .NET SDK (`dotnet run`, `dotnet test`, ...).
#[derive(Debug, Clone, Copy, Default)]
pub struct Dotnet;

impl ToolchainAdapter for Dotnet {
    fn name(&self) -> &'static str {
        "dotnet"
    }

    fn executable(&self, _platform: Platform) -> String {
        "dotnet".to_string()
    }

    fn process_name(&self) -> &str {
        "dotnet"
    }

    fn subcommand(&self, action: Action) -> &'static str {
        match action {
            Action::Start => "run",
            Action::Test => "test",
            Action::Install => "restore",
            Action::Build => "build",
        }
    }

    fn default_arguments(&self) -> DefaultArguments {
        DEFAULT_ARGUMENTS
    }

    fn warning_indicators(&self) -> &'static [&'static str] {
        &["warn"]
    }

    fn port_environment(&self, port: u16) -> Vec<(String, String)> {
        vec![("ASPNETCORE_URLS".to_string(), format!("http://*:{}", port))]
    }

    fn source_arguments(&self, source: &str) -> Vec<String> {
        vec!["--source".to_string(), source.to_string()]
    }

    fn shutdown_commands(&self, platform: Platform) -> Vec<ShellCommand> {
        vec![ShellCommand::new(
            self.executable(platform),
            ["build-server", "shutdown"],
        )]
    }
}
