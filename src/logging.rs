use std::{
    env,
    fs::{self, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing_subscriber::{
    fmt::{time::ChronoLocal, writer::MakeWriterExt},
    util::{SubscriberInitExt, TryInitError},
    EnvFilter,
};

use crate::{LAUNCHER_LOG_FILE, LOG_DIR_ENV, SERVER_LOG_FILE};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f %z";

/// `COMFYUI_LAUNCHER_LOG_DIR`, then the configured directory, then a temp fallback.
pub fn resolve_log_dir(configured: Option<&Path>) -> PathBuf {
    resolve_log_dir_from(env::var(LOG_DIR_ENV).ok(), configured)
}

fn resolve_log_dir_from(env_value: Option<String>, configured: Option<&Path>) -> PathBuf {
    if let Some(custom) = env_value {
        let candidate = PathBuf::from(custom.trim());
        if !candidate.as_os_str().is_empty() {
            return candidate;
        }
    }

    if let Some(dir) = configured.filter(|dir| !dir.as_os_str().is_empty()) {
        return dir.to_path_buf();
    }

    env::temp_dir().join("comfyui-launcher").join("logs")
}

pub fn launcher_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(LAUNCHER_LOG_FILE)
}

/// Sink for the server's combined stdout/stderr; truncated on every launch.
pub fn server_log_path(log_dir: &Path) -> PathBuf {
    log_dir.join(SERVER_LOG_FILE)
}

/// Installs the global subscriber writing to stderr and `<log_dir>/launcher.log`.
///
/// `RUST_LOG` wins over the default level. Calling this when a subscriber is
/// already installed keeps the existing one and still returns the log path.
pub fn init_tracing(log_dir: &Path, debug: bool) -> io::Result<PathBuf> {
    fs::create_dir_all(log_dir)?;
    let path = launcher_log_path(log_dir);
    let file = OpenOptions::new().create(true).append(true).open(&path)?;

    let installed = tracing_subscriber::fmt()
        .with_env_filter(level_filter(debug))
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(true)
        .with_ansi(false)
        .with_writer(io::stderr.and(Mutex::new(file)))
        .try_init();

    match installed {
        Ok(()) => tracing::info!(target: "startup", "launcher log: {}", path.display()),
        Err(error) => tracing::debug!(target: "startup", "tracing already initialized: {error}"),
    }
    Ok(path)
}

/// Stderr-only subscriber for when `launcher.log` cannot be opened.
///
/// Errors when a global subscriber is already installed; the caller decides
/// how to report that, since tracing may not be reachable.
pub fn init_stderr_fallback(debug: bool) -> Result<(), TryInitError> {
    tracing_subscriber::fmt()
        .with_env_filter(level_filter(debug))
        .with_timer(ChronoLocal::new(TIMESTAMP_FORMAT.to_string()))
        .with_target(true)
        .with_writer(io::stderr)
        .finish()
        .try_init()
}

fn level_filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }))
}
