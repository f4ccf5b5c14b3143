use std::path::{Path, PathBuf};

use url::Url;

use crate::{config::LauncherConfig, error::LaunchError};

/// Fully resolved command line and endpoints for one server launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub python: PathBuf,
    pub script: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub listen_host: String,
    pub connect_host: String,
    pub port: u16,
}

impl LaunchPlan {
    pub fn from_config(config: &LauncherConfig) -> Self {
        let python = config
            .python_executable
            .clone()
            .unwrap_or_else(|| detect_python_executable(&config.install_root));
        let script = config.install_root.join(&config.entry_script);

        let mut args = vec![
            format!("--listen={}", config.listen_host),
            format!("--port={}", config.port),
        ];
        if let Some(extra) = config.extra_args.as_deref() {
            match shlex::split(extra) {
                Some(pieces) => args.extend(pieces),
                None => tracing::warn!(
                    target: "startup",
                    "ignoring unparsable extra server args: {extra}"
                ),
            }
        }

        Self {
            python,
            script,
            args,
            cwd: config.install_root.clone(),
            listen_host: config.listen_host.clone(),
            connect_host: config.connect_host().to_string(),
            port: config.port,
        }
    }

    /// Checks the install root, interpreter and entry script, in that order.
    pub fn validate(&self) -> Result<(), LaunchError> {
        if !self.cwd.is_dir() {
            return Err(LaunchError::MissingInstallRoot(self.cwd.clone()));
        }
        if !self.python.is_file() {
            return Err(LaunchError::MissingExecutable(self.python.clone()));
        }
        if !self.script.is_file() {
            return Err(LaunchError::MissingEntryScript(self.script.clone()));
        }
        Ok(())
    }

    pub fn debug_command(&self) -> Vec<String> {
        let mut parts = vec![
            self.python.display().to_string(),
            self.script.display().to_string(),
        ];
        parts.extend(self.args.iter().cloned());
        parts
    }

    /// Address the UI is sent to once the server accepts connections.
    pub fn server_url(&self) -> String {
        let host = if self.connect_host.contains(':') && !self.connect_host.starts_with('[') {
            format!("[{}]", self.connect_host)
        } else {
            self.connect_host.clone()
        };
        let raw = format!("http://{host}:{}/", self.port);
        match Url::parse(&raw) {
            Ok(url) => url.to_string(),
            Err(error) => {
                tracing::warn!(target: "runtime", "server url '{raw}' failed to parse: {error}");
                raw
            }
        }
    }
}

/// Looks for the interpreter of the virtualenv shipped inside the install root.
pub fn detect_python_executable(install_root: &Path) -> PathBuf {
    let venv = install_root.join(".venv");
    let windows_style = venv.join("Scripts").join("python.exe");
    let unix_style = venv.join("bin").join("python");
    let unix_style3 = venv.join("bin").join("python3");

    for candidate in [&windows_style, &unix_style, &unix_style3] {
        if candidate.is_file() {
            return candidate.clone();
        }
    }

    if cfg!(target_os = "windows") {
        windows_style
    } else {
        unix_style
    }
}
