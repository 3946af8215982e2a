use crate::command::DefaultArguments;
use crate::platform::Platform;

use super::{Action, ToolchainAdapter};

const DEFAULT_ARGUMENTS: DefaultArguments = &[("install", &["--no-audit", "--no-fund"])];

/// Node projects driven through `npm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Node;

impl ToolchainAdapter for Node {
    fn name(&self) -> &'static str {
        "node"
    }

    fn executable(&self, platform: Platform) -> String {
        if platform.is_windows() {
            "npm.cmd".to_string()
        } else {
            "npm".to_string()
        }
    }

    fn process_name(&self) -> &str {
        "node"
    }

    fn subcommand(&self, action: Action) -> &'static str {
        match action {
            Action::Start => "start",
            Action::Test => "test",
            Action::Install => "install",
            Action::Build => "build",
        }
    }

    fn default_arguments(&self) -> DefaultArguments {
        DEFAULT_ARGUMENTS
    }

    // npm has no `build` subcommand; it is a package script.
    fn default_commands(&self) -> &'static [(&'static str, &'static str)] {
        &[("build", "run build")]
    }

    fn warning_indicators(&self) -> &'static [&'static str] {
        &["npm warn", "warning"]
    }

    fn port_environment(&self, port: u16) -> Vec<(String, String)> {
        vec![("PORT".to_string(), port.to_string())]
    }

    fn source_arguments(&self, source: &str) -> Vec<String> {
        vec!["--registry".to_string(), source.to_string()]
    }
}
