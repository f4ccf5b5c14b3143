//! Desktop launcher core for a local ComfyUI server: starts the server as a
//! supervised child process, keeps the UI informed while it comes up, and tears
//! every actor down in a fixed order on exit.

pub mod app;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event_bus;
pub mod exit_state;
pub mod latch;
pub mod launch_plan;
pub mod logging;
pub mod monitor;
pub mod os_signals;
pub mod port_preempt;
pub mod process_control;
pub mod redirect_poller;
pub mod supervisor;
pub mod tray;
pub mod ui_bridge;

use std::time::Duration;

pub use app::AppContext;
pub use config::{LauncherConfig, Timeouts};
pub use coordinator::ShutdownCoordinator;
pub use error::{ConfigError, LaunchError};
pub use event_bus::{ActorId, AppEvent, EventBus, EventKind, Handler};
pub use latch::Latch;
pub use process_control::TerminationOutcome;
pub use supervisor::{ExitReport, ProcessSupervisor, SupervisorState};
pub use ui_bridge::UiBridge;

pub const CONFIG_ENV_PREFIX: &str = "COMFYUI_LAUNCHER_";
pub const CONFIG_PATH_ENV: &str = "COMFYUI_LAUNCHER_CONFIG";
pub const LOG_DIR_ENV: &str = "COMFYUI_LAUNCHER_LOG_DIR";
pub const LAUNCHER_LOG_FILE: &str = "launcher.log";
pub const SERVER_LOG_FILE: &str = "server.log";

pub const TRAY_MENU_SHOW_WINDOW: &str = "tray_show_window";
pub const TRAY_MENU_TOGGLE_WINDOW: &str = "tray_toggle_window";
pub const TRAY_MENU_QUIT: &str = "tray_quit";

const FORCE_KILL_RETRY_MIN_WAIT_MS: u64 = 200;
const FORCE_KILL_RETRY_MAX_WAIT_MS: u64 = 1_500;
const STOP_REQUEST_FAILURE_WAIT_MS: u64 = 350;
/// Delay passed to each single-attempt availability check.
const AVAILABILITY_CHECK_DELAY: Duration = Duration::from_millis(100);

#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(target_os = "windows")]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
