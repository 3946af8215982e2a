//! Configuration management for regi.
//!
//! This module defines the structure of the `regi.json` / `startup.json` document,
//! discovers and strictly parses it, and carries the per-run options and the
//! `<NAME>_PORT` variable list derived from it.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{RegiError, Result};

/// Document names, in lookup precedence order.
pub const CONFIG_FILE_NAMES: [&str; 2] = ["regi.json", "startup.json"];

/// Argument-map key that applies to every action.
pub const ANY_ACTION: &str = "*";

/// Top-level configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StartupConfig {
    #[serde(default)]
    pub apps: Vec<Project>,
    #[serde(default)]
    pub tests: Vec<Project>,
    #[serde(default)]
    pub services: Vec<Project>,
}

/// Configuration for a single project.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Project {
    /// Unique display name.
    pub name: String,
    /// Manifest locations relative to the configuration directory.
    #[serde(
        default,
        alias = "path",
        deserialize_with = "one_or_many",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub paths: Vec<String>,
    #[serde(default, rename = "framework", alias = "toolchain")]
    pub toolchain: Toolchain,
    #[serde(default, rename = "type", alias = "kind")]
    pub kind: ProjectKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Action name to subcommand override.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, String>,
    /// Action name (or `*`) to extra command-line tokens.
    #[serde(default, alias = "options", skip_serializing_if = "BTreeMap::is_empty")]
    pub arguments: BTreeMap<String, Vec<String>>,
    /// Names of apps or services that must be running first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub serial: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub raw_output: bool,
    /// Package registry override used by `install`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environment: BTreeMap<String, String>,
}

/// Toolchain a project is built with.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Toolchain {
    Dotnet,
    Node,
    #[default]
    Any,
}

impl fmt::Display for Toolchain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Toolchain::Dotnet => "dotnet",
            Toolchain::Node => "node",
            Toolchain::Any => "any",
        };
        f.write_str(name)
    }
}

/// What a project is.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    /// Web application or long-running service.
    #[default]
    #[serde(alias = "service")]
    Web,
    /// Unit test suite.
    #[serde(alias = "unit-test")]
    Unit,
    /// Integration test suite.
    #[serde(alias = "integration-test")]
    Integration,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(path) => vec![path],
        OneOrMany::Many(paths) => paths,
    })
}

impl Project {
    /// Directories the project's actions run in, one per configured path.
    ///
    /// A path naming a file (e.g. a `package.json` or `.csproj`) runs in the file's
    /// directory. A project without paths runs in `root`.
    pub fn working_directories(&self, root: &Path) -> Vec<PathBuf> {
        if self.paths.is_empty() {
            return vec![root.to_path_buf()];
        }
        self.paths
            .iter()
            .map(|path| {
                let full = root.join(path);
                if full.is_dir() {
                    full
                } else {
                    full.parent()
                        .map(Path::to_path_buf)
                        .unwrap_or_else(|| root.to_path_buf())
                }
            })
            .collect()
    }

    /// Case-insensitive substring match used for `requires` and `--name`.
    pub fn name_contains(&self, needle: &str) -> bool {
        self.name.to_lowercase().contains(&needle.to_lowercase())
    }
}

impl StartupConfig {
    /// Apps followed by services, the pool `requires` entries resolve against.
    pub fn runnable(&self) -> impl Iterator<Item = &Project> {
        self.apps.iter().chain(self.services.iter())
    }

    /// Resolves a `requires` entry to a single app or service.
    ///
    /// An exact (case-insensitive) name wins; otherwise the entry must be a substring of
    /// exactly one name. Ambiguous or unknown entries resolve to `None`.
    pub fn resolve_requirement(&self, required: &str) -> Option<&Project> {
        if let Some(exact) = self
            .runnable()
            .find(|p| p.name.eq_ignore_ascii_case(required))
        {
            return Some(exact);
        }
        let mut matches = self.runnable().filter(|p| p.name_contains(required));
        match (matches.next(), matches.next()) {
            (Some(project), None) => Some(project),
            _ => None,
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let mut seen = HashSet::new();
        for project in self.apps.iter().chain(&self.tests).chain(&self.services) {
            if project.name.trim().is_empty() {
                return Err("project name must not be empty".to_string());
            }
            if !seen.insert(project.name.to_lowercase()) {
                return Err(format!("duplicate project name: {}", project.name));
            }
        }
        Ok(())
    }
}

/// Finds the configuration document in `root`, honoring [`CONFIG_FILE_NAMES`] order.
pub fn find_config(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(RegiError::DirectoryNotFound(root.to_path_buf()));
    }
    CONFIG_FILE_NAMES
        .iter()
        .map(|name| root.join(name))
        .find(|path| path.is_file())
        .ok_or_else(|| RegiError::ConfigurationMissing(root.to_path_buf()))
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<StartupConfig> {
    let raw = std::fs::read_to_string(path)?;
    let malformed = |message: String| RegiError::ConfigurationMalformed {
        path: path.to_path_buf(),
        message,
    };
    let config: StartupConfig = serde_json::from_str(&raw).map_err(|e| malformed(e.to_string()))?;
    config.validate().map_err(malformed)?;
    Ok(config)
}

/// Discovers and loads the configuration for the run directory `root`.
pub fn load_startup_config(root: &Path) -> Result<StartupConfig> {
    let path = find_config(root)?;
    tracing::debug!(path = %path.display(), "loading configuration");
    load_config(&path)
}

/// Writes a starter `regi.json` into `root` and returns its path.
pub fn write_default_config(root: &Path) -> Result<PathBuf> {
    if !root.is_dir() {
        return Err(RegiError::DirectoryNotFound(root.to_path_buf()));
    }
    if let Ok(existing) = find_config(root) {
        return Err(RegiError::ConfigurationExists(existing));
    }
    let path = root.join(CONFIG_FILE_NAMES[0]);
    let raw = serde_json::to_string_pretty(&default_config())
        .map_err(|e| RegiError::Io(std::io::Error::other(e)))?;
    std::fs::write(&path, raw + "\n")?;
    Ok(path)
}

fn default_config() -> StartupConfig {
    StartupConfig {
        apps: vec![
            Project {
                name: "Backend".to_string(),
                paths: vec!["Backend".to_string()],
                toolchain: Toolchain::Dotnet,
                kind: ProjectKind::Web,
                port: Some(5000),
                ..Project::default()
            },
            Project {
                name: "Frontend".to_string(),
                paths: vec!["Frontend/package.json".to_string()],
                toolchain: Toolchain::Node,
                kind: ProjectKind::Web,
                port: Some(3000),
                requires: vec!["Backend".to_string()],
                ..Project::default()
            },
        ],
        tests: vec![Project {
            name: "UnitTests".to_string(),
            paths: vec!["UnitTests".to_string()],
            toolchain: Toolchain::Dotnet,
            kind: ProjectKind::Unit,
            ..Project::default()
        }],
        services: Vec::new(),
    }
}

/// `<NAME>_PORT` variables handed to every launched process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableList {
    vars: BTreeMap<String, String>,
}

impl VariableList {
    pub fn from_projects<'a>(projects: impl IntoIterator<Item = &'a Project>) -> Self {
        let mut list = Self::default();
        for project in projects {
            list.add_project(project);
        }
        list
    }

    /// Adds the project's endpoint variable. Projects without a port are ignored.
    pub fn add_project(&mut self, project: &Project) {
        if let Some(port) = project.port {
            self.vars.insert(
                port_variable_name(&project.name),
                format!("http://localhost:{}", port),
            );
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

/// Upper-cases `name`, maps every non-alphanumeric character to `_`, appends `_PORT`.
pub fn port_variable_name(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_PORT", normalized)
}

/// Options for one workflow invocation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Case-insensitive substring filter on project names.
    pub name: Option<String>,
    pub kind: Option<ProjectKind>,
    pub verbose: bool,
    /// Forces every task into the serial class.
    pub no_parallel: bool,
    pub raw_output: bool,
    /// Projects whose stdout is shown even when not verbose.
    pub show_output: Vec<String>,
    pub kill_on_exit: bool,
    /// Trailing arguments appended to every command.
    pub remaining_arguments: Vec<String>,
    pub variables: VariableList,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            name: None,
            kind: None,
            verbose: false,
            no_parallel: false,
            raw_output: false,
            show_output: Vec::new(),
            kill_on_exit: true,
            remaining_arguments: Vec::new(),
            variables: VariableList::default(),
        }
    }
}

impl RunOptions {
    pub fn matches(&self, project: &Project) -> bool {
        let name_ok = self
            .name
            .as_deref()
            .map(|name| project.name_contains(name))
            .unwrap_or(true);
        let kind_ok = self.kind.map(|kind| project.kind == kind).unwrap_or(true);
        name_ok && kind_ok
    }

    pub fn filter<'a>(&self, projects: impl IntoIterator<Item = &'a Project>) -> Vec<Project> {
        projects
            .into_iter()
            .filter(|project| self.matches(project))
            .cloned()
            .collect()
    }

    pub fn is_serial(&self, project: &Project) -> bool {
        self.no_parallel || project.serial
    }

    pub fn shows_output_for(&self, project: &Project) -> bool {
        self.verbose
            || self
                .show_output
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&project.name))
    }

    pub fn raw_output_for(&self, project: &Project) -> bool {
        self.raw_output || project.raw_output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"
{
  "apps": [
    {
      "name": "SampleApp1",
      "path": "SampleApp1/SampleApp1.csproj",
      "framework": "dotnet",
      "type": "web",
      "port": 9080,
      "arguments": { "*": ["--foo bar"] }
    },
    {
      "name": "SampleNodeApp",
      "paths": ["SampleNodeApp/package.json"],
      "toolchain": "node",
      "kind": "service",
      "port": 9081,
      "commands": { "start": "run dev" },
      "rawOutput": true,
      "environment": { "NODE_ENV": "development" }
    }
  ],
  "tests": [
    { "name": "SampleTests", "framework": "dotnet", "type": "unit", "requires": ["SampleApp1"], "serial": true },
    { "name": "IntegrationTests", "framework": "dotnet", "type": "integration" }
  ]
}
"#;

    #[test]
    fn parses_projects_with_aliases() {
        let config: StartupConfig = serde_json::from_str(GOOD).unwrap();
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.tests.len(), 2);
        assert!(config.services.is_empty());

        let app = &config.apps[0];
        assert_eq!(app.paths, vec!["SampleApp1/SampleApp1.csproj"]);
        assert_eq!(app.toolchain, Toolchain::Dotnet);
        assert_eq!(app.port, Some(9080));
        assert_eq!(app.arguments["*"], vec!["--foo bar"]);

        let node = &config.apps[1];
        assert_eq!(node.toolchain, Toolchain::Node);
        assert_eq!(node.kind, ProjectKind::Web);
        assert_eq!(node.commands["start"], "run dev");
        assert!(node.raw_output);
        assert_eq!(node.environment["NODE_ENV"], "development");

        assert!(config.tests[0].serial);
        assert_eq!(config.tests[1].kind, ProjectKind::Integration);
    }

    #[test]
    fn unknown_fields_are_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regi.json");
        std::fs::write(&path, r#"{ "apps": [{ "name": "a", "bogus": 1 }] }"#).unwrap();

        let err = load_config(&path).unwrap_err();
        match err {
            RegiError::ConfigurationMalformed { path: reported, message } => {
                assert_eq!(reported, path);
                assert!(message.contains("bogus"), "{}", message);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn wrong_enum_value_is_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("startup.json");
        std::fs::write(&path, r#"{ "tests": [{ "name": "t", "type": "smoke" }] }"#).unwrap();

        assert!(matches!(
            load_startup_config(dir.path()),
            Err(RegiError::ConfigurationMalformed { .. })
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("regi.json");
        std::fs::write(
            &path,
            r#"{ "apps": [{ "name": "api" }], "services": [{ "name": "API" }] }"#,
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("duplicate project name"), "{err}");
    }

    #[test]
    fn missing_directory_and_document_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            load_startup_config(dir.path()),
            Err(RegiError::ConfigurationMissing(_))
        ));
        assert!(matches!(
            load_startup_config(&dir.path().join("nope")),
            Err(RegiError::DirectoryNotFound(_))
        ));
    }

    #[test]
    fn regi_json_wins_over_startup_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("startup.json"), r#"{ "apps": [{ "name": "old" }] }"#)
            .unwrap();
        std::fs::write(dir.path().join("regi.json"), r#"{ "apps": [{ "name": "new" }] }"#)
            .unwrap();

        let config = load_startup_config(dir.path()).unwrap();
        assert_eq!(config.apps[0].name, "new");
    }

    #[test]
    fn init_writes_a_loadable_document_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_default_config(dir.path()).unwrap();
        assert_eq!(path, dir.path().join("regi.json"));

        let config = load_startup_config(dir.path()).unwrap();
        assert_eq!(config.apps.len(), 2);
        assert_eq!(config.tests.len(), 1);

        assert!(matches!(
            write_default_config(dir.path()),
            Err(RegiError::ConfigurationExists(_))
        ));
    }

    #[test]
    fn port_variables_are_normalized() {
        assert_eq!(port_variable_name("frontend"), "FRONTEND_PORT");
        assert_eq!(port_variable_name("my-api.v2"), "MY_API_V2_PORT");

        let config: StartupConfig = serde_json::from_str(GOOD).unwrap();
        let vars = VariableList::from_projects(config.apps.iter().chain(&config.tests));
        let pairs: Vec<(&str, &str)> = vars
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("SAMPLEAPP1_PORT", "http://localhost:9080"),
                ("SAMPLENODEAPP_PORT", "http://localhost:9081"),
            ]
        );
    }

    #[test]
    fn filters_by_name_and_kind() {
        let config: StartupConfig = serde_json::from_str(GOOD).unwrap();

        let options = RunOptions {
            name: Some("node".into()),
            ..RunOptions::default()
        };
        assert_eq!(options.filter(&config.apps).len(), 1);
        assert!(options.filter(&config.tests).is_empty());

        let options = RunOptions {
            kind: Some(ProjectKind::Integration),
            ..RunOptions::default()
        };
        let tests = options.filter(&config.tests);
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].name, "IntegrationTests");
    }

    #[test]
    fn requirements_resolve_to_exactly_one_project() {
        let config: StartupConfig = serde_json::from_str(
            r#"{
              "apps": [{ "name": "Backend" }, { "name": "BackendWorker" }, { "name": "Frontend" }],
              "services": [{ "name": "Database" }]
            }"#,
        )
        .unwrap();

        assert_eq!(config.resolve_requirement("backend").unwrap().name, "Backend");
        assert_eq!(config.resolve_requirement("front").unwrap().name, "Frontend");
        assert_eq!(config.resolve_requirement("data").unwrap().name, "Database");
        assert!(config.resolve_requirement("back").is_none());
        assert!(config.resolve_requirement("cache").is_none());
    }

    #[test]
    fn working_directories_use_parent_of_manifest_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("web")).unwrap();
        let project = Project {
            name: "web".into(),
            paths: vec!["web".into(), "api/Api.csproj".into()],
            ..Project::default()
        };

        let dirs = project.working_directories(dir.path());
        assert_eq!(dirs, vec![dir.path().join("web"), dir.path().join("api")]);

        let bare = Project {
            name: "bare".into(),
            ..Project::default()
        };
        assert_eq!(bare.working_directories(dir.path()), vec![dir.path().to_path_buf()]);
    }
}
