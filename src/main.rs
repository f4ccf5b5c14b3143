use std::{env, process::ExitCode, sync::Arc};

use comfyui_launcher::{
    app::{AppContext, LaunchSession},
    logging,
    tray::ChannelTray,
    ui_bridge::HeadlessUi,
    LauncherConfig,
};

fn main() -> ExitCode {
    let config_path = LauncherConfig::path_from_args(env::args());
    let loaded = LauncherConfig::load(config_path.as_deref());
    let configured_log_dir = loaded
        .as_ref()
        .ok()
        .and_then(|config| config.log_dir.clone());
    let debug = loaded.as_ref().map(|config| config.debug).unwrap_or(false);

    let log_dir = logging::resolve_log_dir(configured_log_dir.as_deref());
    if let Err(error) = logging::init_tracing(&log_dir, debug) {
        if let Err(fallback_error) = logging::init_stderr_fallback(debug) {
            eprintln!("comfyui-launcher: stderr logging unavailable: {fallback_error}");
        }
        tracing::warn!(
            target: "startup",
            "could not open launcher log in {}: {error}",
            log_dir.display()
        );
    }

    let config = match loaded {
        Ok(config) => config,
        Err(error) => {
            tracing::error!(target: "startup", "[{}] {error}", error.as_label());
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        target: "startup",
        "launcher starting: install_root={}, listen={}:{}, connect_host={}",
        config.install_root.display(),
        config.listen_host,
        config.port,
        config.connect_host()
    );

    let ctx = AppContext::new(config);
    let ui = Arc::new(HeadlessUi::new());
    // No icon here; holding the sender keeps the tray loop polling until shutdown.
    let (tray, _tray_menu) = ChannelTray::channel();

    let session = match LaunchSession::start(&ctx, ui, tray, true) {
        Ok(session) => session,
        Err(error) => {
            tracing::error!(target: "startup", "failed to start launcher: {error}");
            return ExitCode::FAILURE;
        }
    };
    session.ui_events().content_loaded();

    let exit = session.wait_and_teardown();
    if !exit.teardown.late_actors.is_empty() {
        tracing::warn!(
            target: "shutdown",
            "actors that missed their deadline: {:?}",
            exit.teardown.late_actors
        );
    }
    tracing::info!(target: "shutdown", "launcher exiting with code {}", exit.exit_code());
    if exit.exit_code() == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
