//! Error types returned at the launcher's API boundaries.
//!
//! - [`ConfigError`]: the optional configuration file could not be used.
//! - [`LaunchError`]: the supervised server could not be started.
//!
//! Both expose `as_label()` for stable snake_case log labels. Expected runtime
//! conditions such as an unreachable port or a process that is already gone are
//! not errors; they are reported through outcome enums instead.

use std::{io, path::PathBuf};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read launcher config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse launcher config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::Read { .. } => "config_read",
            Self::Parse { .. } => "config_parse",
        }
    }
}

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("server install directory does not exist or is not a directory: {}", .0.display())]
    MissingInstallRoot(PathBuf),
    #[error("python executable does not exist or is not a file: {}", .0.display())]
    MissingExecutable(PathBuf),
    #[error("server entry script not found: {}", .0.display())]
    MissingEntryScript(PathBuf),
    #[error("failed to prepare server log {}: {source}", .path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to spawn server process with command {command:?}: {source}")]
    Spawn {
        command: Vec<String>,
        #[source]
        source: io::Error,
    },
    #[error("a server process is already tracked (pid {pid})")]
    AlreadyRunning { pid: u32 },
}

impl LaunchError {
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::MissingInstallRoot(_) => "launch_missing_install_root",
            Self::MissingExecutable(_) => "launch_missing_executable",
            Self::MissingEntryScript(_) => "launch_missing_entry_script",
            Self::LogSink { .. } => "launch_log_sink",
            Self::Spawn { .. } => "launch_spawn",
            Self::AlreadyRunning { .. } => "launch_already_running",
        }
    }

    /// Path-validation failures are configuration problems; retrying cannot help.
    pub fn is_path_error(&self) -> bool {
        matches!(
            self,
            Self::MissingInstallRoot(_) | Self::MissingExecutable(_) | Self::MissingEntryScript(_)
        )
    }
}
