use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::{error::ConfigError, CONFIG_ENV_PREFIX, CONFIG_PATH_ENV};

const DEFAULT_LISTEN_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8188;
const DEFAULT_ENTRY_SCRIPT: &str = "main.py";
const DEFAULT_INSTALL_DIR: &str = "ComfyUI";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Server installation root; also the child's working directory.
    pub install_root: PathBuf,
    /// Auto-detected inside `<install_root>/.venv` when unset.
    pub python_executable: Option<PathBuf>,
    pub entry_script: String,
    /// Shell-style string appended to the server command line.
    pub extra_args: Option<String>,
    /// Host the server is told to bind.
    pub listen_host: String,
    /// Host the launcher probes; falls back to `listen_host`.
    pub connect_host: Option<String>,
    pub port: u16,
    pub log_dir: Option<PathBuf>,
    pub debug: bool,
    pub timeouts: Timeouts,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            install_root: PathBuf::from(DEFAULT_INSTALL_DIR),
            python_executable: None,
            entry_script: DEFAULT_ENTRY_SCRIPT.to_string(),
            extra_args: None,
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            connect_host: None,
            port: DEFAULT_PORT,
            log_dir: None,
            debug: false,
            timeouts: Timeouts::default(),
        }
    }
}

/// Every bounded wait in the launcher, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub ui_ready_ms: u64,
    pub redirect_max_wait_ms: u64,
    pub redirect_check_interval_ms: u64,
    pub redirect_fade_ms: u64,
    pub probe_connect_ms: u64,
    pub graceful_stop_ms: u64,
    pub force_kill_wait_ms: u64,
    pub port_reclaim_ms: u64,
    pub monitor_poll_interval_ms: u64,
    pub step_pause_ms: u64,
    pub poller_join_ms: u64,
    pub actor_join_ms: u64,
    pub tray_join_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ui_ready_ms: 20_000,
            redirect_max_wait_ms: 120_000,
            redirect_check_interval_ms: 2_000,
            redirect_fade_ms: 1_500,
            probe_connect_ms: 1_000,
            graceful_stop_ms: 10_000,
            force_kill_wait_ms: 5_000,
            port_reclaim_ms: 5_000,
            monitor_poll_interval_ms: 1_000,
            step_pause_ms: 500,
            poller_join_ms: 3_000,
            actor_join_ms: 10_000,
            tray_join_ms: 2_000,
        }
    }
}

impl Timeouts {
    pub fn ui_ready(&self) -> Duration {
        Duration::from_millis(self.ui_ready_ms)
    }

    pub fn redirect_max_wait(&self) -> Duration {
        Duration::from_millis(self.redirect_max_wait_ms)
    }

    pub fn redirect_check_interval(&self) -> Duration {
        Duration::from_millis(self.redirect_check_interval_ms)
    }

    pub fn redirect_fade(&self) -> Duration {
        Duration::from_millis(self.redirect_fade_ms)
    }

    pub fn probe_connect(&self) -> Duration {
        Duration::from_millis(self.probe_connect_ms)
    }

    pub fn graceful_stop(&self) -> Duration {
        Duration::from_millis(self.graceful_stop_ms)
    }

    pub fn force_kill_wait(&self) -> Duration {
        Duration::from_millis(self.force_kill_wait_ms)
    }

    pub fn port_reclaim(&self) -> Duration {
        Duration::from_millis(self.port_reclaim_ms)
    }

    pub fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    pub fn step_pause(&self) -> Duration {
        Duration::from_millis(self.step_pause_ms)
    }

    pub fn poller_join(&self) -> Duration {
        Duration::from_millis(self.poller_join_ms)
    }

    pub fn actor_join(&self) -> Duration {
        Duration::from_millis(self.actor_join_ms)
    }

    pub fn tray_join(&self) -> Duration {
        Duration::from_millis(self.tray_join_ms)
    }

    /// Pulls every timeout into its allowed window, e.g. after reading a file.
    pub fn clamp_to_bounds(&mut self) {
        for (suffix, slot, min_ms, max_ms) in self.slots() {
            let clamped = (*slot).clamp(min_ms, max_ms);
            if clamped != *slot {
                tracing::warn!(
                    target: "startup",
                    "timeout {} = {}ms is outside [{min_ms}, {max_ms}]ms, clamped to {clamped}ms",
                    suffix.to_ascii_lowercase(),
                    *slot
                );
                *slot = clamped;
            }
        }
    }

    // (env suffix, slot, min, max)
    fn slots(&mut self) -> [(&'static str, &mut u64, u64, u64); 13] {
        [
            ("UI_READY_MS", &mut self.ui_ready_ms, 1_000, 600_000),
            ("REDIRECT_MAX_WAIT_MS", &mut self.redirect_max_wait_ms, 1_000, 3_600_000),
            ("REDIRECT_CHECK_INTERVAL_MS", &mut self.redirect_check_interval_ms, 50, 60_000),
            ("REDIRECT_FADE_MS", &mut self.redirect_fade_ms, 0, 10_000),
            ("PROBE_CONNECT_MS", &mut self.probe_connect_ms, 50, 30_000),
            ("GRACEFUL_STOP_MS", &mut self.graceful_stop_ms, 100, 120_000),
            ("FORCE_KILL_WAIT_MS", &mut self.force_kill_wait_ms, 100, 60_000),
            ("PORT_RECLAIM_MS", &mut self.port_reclaim_ms, 0, 60_000),
            ("MONITOR_POLL_INTERVAL_MS", &mut self.monitor_poll_interval_ms, 20, 60_000),
            ("STEP_PAUSE_MS", &mut self.step_pause_ms, 0, 10_000),
            ("POLLER_JOIN_MS", &mut self.poller_join_ms, 100, 60_000),
            ("ACTOR_JOIN_MS", &mut self.actor_join_ms, 100, 300_000),
            ("TRAY_JOIN_MS", &mut self.tray_join_ms, 100, 60_000),
        ]
    }
}

impl LauncherConfig {
    /// Defaults, then the optional JSON file, then `COMFYUI_LAUNCHER_*` variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides(|name| env::var(name).ok());
        Ok(config)
    }

    /// Config file path from the first CLI argument, else `COMFYUI_LAUNCHER_CONFIG`.
    pub fn path_from_args<I>(args: I) -> Option<PathBuf>
    where
        I: IntoIterator<Item = String>,
    {
        args.into_iter()
            .nth(1)
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .or_else(|| {
                env::var(CONFIG_PATH_ENV)
                    .ok()
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty())
            })
            .map(PathBuf::from)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.timeouts.clamp_to_bounds();
        Ok(config)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |suffix: &str| {
            let name = format!("{CONFIG_ENV_PREFIX}{suffix}");
            lookup(&name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
                .map(|value| (name, value))
        };

        if let Some((_, value)) = var("INSTALL_ROOT") {
            self.install_root = PathBuf::from(value);
        }
        if let Some((_, value)) = var("PYTHON_EXECUTABLE") {
            self.python_executable = Some(PathBuf::from(value));
        }
        if let Some((_, value)) = var("ENTRY_SCRIPT") {
            self.entry_script = value;
        }
        if let Some((_, value)) = var("EXTRA_ARGS") {
            self.extra_args = Some(value);
        }
        if let Some((_, value)) = var("LISTEN_HOST") {
            self.listen_host = value;
        }
        if let Some((_, value)) = var("CONNECT_HOST") {
            self.connect_host = Some(value);
        }
        if let Some((name, value)) = var("PORT") {
            match value.parse::<u16>() {
                Ok(port) if port > 0 => self.port = port,
                _ => tracing::warn!(
                    target: "startup",
                    "invalid {name}='{value}', keeping port {}",
                    self.port
                ),
            }
        }
        if let Some((_, value)) = var("LOG_DIR") {
            self.log_dir = Some(PathBuf::from(value));
        }
        if let Some((name, value)) = var("DEBUG") {
            match parse_bool(&value) {
                Some(debug) => self.debug = debug,
                None => tracing::warn!(target: "startup", "invalid {name}='{value}', ignored"),
            }
        }

        for (suffix, slot, min_ms, max_ms) in self.timeouts.slots() {
            if let Some((name, raw)) = var(suffix) {
                *slot = parse_clamped_ms(&raw, &name, *slot, min_ms, max_ms, |message| {
                    tracing::warn!(target: "startup", "{message}")
                });
            }
        }
    }

    pub fn connect_host(&self) -> &str {
        self.connect_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .unwrap_or(&self.listen_host)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_clamped_ms<F>(
    raw: &str,
    env_name: &str,
    fallback_ms: u64,
    min_ms: u64,
    max_ms: u64,
    mut log: F,
) -> u64
where
    F: FnMut(String),
{
    match raw.trim().parse::<u128>() {
        Ok(parsed) if parsed < min_ms as u128 => {
            log(format!(
                "{env_name}='{raw}' is below minimum {min_ms}ms, clamped to {min_ms}ms"
            ));
            min_ms
        }
        Ok(parsed) if parsed > max_ms as u128 => {
            log(format!(
                "{env_name}='{raw}' is above maximum {max_ms}ms, clamped to {max_ms}ms"
            ));
            max_ms
        }
        Ok(parsed) => parsed as u64,
        Err(_) => {
            log(format!(
                "invalid {env_name}='{raw}', fallback to {fallback_ms}ms"
            ));
            fallback_ms
        }
    }
}
