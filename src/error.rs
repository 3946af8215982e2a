//! Error types for the orchestration engine.
//!
//! Engine modules return [`RegiError`]; task bodies and the binary entry point work with
//! `anyhow::Result` and attach context on top.

use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

use crate::config::Toolchain;

/// Result type alias using [`RegiError`].
pub type Result<T> = std::result::Result<T, RegiError>;

#[derive(Debug, Error)]
pub enum RegiError {
    /// The run directory does not exist.
    #[error("could not find directory: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// Neither `regi.json` nor `startup.json` exists in the run directory.
    #[error("could not find regi.json or startup.json in directory: {}", .0.display())]
    ConfigurationMissing(PathBuf),

    /// The configuration document could not be parsed or failed validation.
    #[error("configuration file was not properly formatted: {}\n{message}", path.display())]
    ConfigurationMalformed { path: PathBuf, message: String },

    /// `init` was asked to write a document over an existing one.
    #[error("configuration file already exists: {}", .0.display())]
    ConfigurationExists(PathBuf),

    /// The native process could not be spawned.
    #[error("failed to launch {label}: {source}")]
    ProcessLaunch {
        label: String,
        #[source]
        source: std::io::Error,
    },

    /// A built command line could not be split into arguments.
    #[error("could not parse command for {label}: {message}")]
    CommandSyntax { label: String, message: String },

    #[error("no managed process with id {0}")]
    UnknownProcess(Uuid),

    #[error("managed process with id {0} already exists")]
    DuplicateProcess(Uuid),

    /// No adapter is registered for the project's toolchain.
    #[error("no toolchain adapter registered for {0}")]
    UnsupportedToolchain(Toolchain),

    /// Some ports were never observed listening before the deadline.
    #[error("timed out waiting for ports to listen: {}", format_ports(.pending))]
    ReadinessTimeout { pending: Vec<u16> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_ports(ports: &[u16]) -> String {
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
