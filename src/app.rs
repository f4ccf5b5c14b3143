use std::{io, path::PathBuf, sync::Arc, thread::JoinHandle, time::Duration};

use crate::{
    config::LauncherConfig,
    coordinator::{join_with_timeout, ShutdownCoordinator, TeardownReport},
    event_bus::EventBus,
    latch::Latch,
    logging,
    monitor::BackgroundMonitor,
    os_signals,
    supervisor::ProcessSupervisor,
    tray::{self, TrayBackend},
    ui_bridge::{self, UiBridge, UiEvents, UiSubscriptions},
};

/// Everything the actors share, built once at startup and passed by reference.
pub struct AppContext {
    pub bus: Arc<EventBus>,
    pub cancel: Latch,
    pub config: Arc<LauncherConfig>,
    pub supervisor: Arc<ProcessSupervisor>,
    pub log_dir: PathBuf,
}

impl AppContext {
    pub fn new(config: LauncherConfig) -> Self {
        let supervisor = ProcessSupervisor::new(&config);
        Self::with_supervisor(config, supervisor)
    }

    pub fn with_supervisor(config: LauncherConfig, supervisor: ProcessSupervisor) -> Self {
        let log_dir = logging::resolve_log_dir(config.log_dir.as_deref());
        Self {
            bus: Arc::new(EventBus::new()),
            cancel: Latch::new(),
            config: Arc::new(config),
            supervisor: Arc::new(supervisor),
            log_dir,
        }
    }

    pub fn server_log_path(&self) -> PathBuf {
        logging::server_log_path(&self.log_dir)
    }
}

/// A running launcher: actors started, waiting for someone to ask it to exit.
pub struct LaunchSession {
    coordinator: ShutdownCoordinator,
    ui_events: UiEvents,
    presenter: UiSubscriptions,
    signal_watcher: Option<JoinHandle<()>>,
    signal_join: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionExit {
    pub critical_error: Option<String>,
    pub teardown: TeardownReport,
}

impl SessionExit {
    pub fn exit_code(&self) -> i32 {
        if self.critical_error.is_some() {
            1
        } else {
            0
        }
    }
}

impl LaunchSession {
    /// Wires presenter, coordinator, tray and monitor onto `ctx`. The UI is
    /// expected to report content loaded through [`LaunchSession::ui_events`].
    pub fn start<B: TrayBackend>(
        ctx: &AppContext,
        ui: Arc<dyn UiBridge>,
        tray_backend: B,
        watch_os_signals: bool,
    ) -> io::Result<Self> {
        let presenter = ui_bridge::attach_ui_presenter(&ctx.bus, ui.clone(), ctx.cancel.clone());
        let coordinator = ShutdownCoordinator::new(ctx, ui.clone());
        let ui_events = UiEvents::new(ctx.bus.clone(), coordinator.handle(), ctx.config.debug);

        let signal_watcher = if watch_os_signals {
            match os_signals::install_signal_watcher(coordinator.handle()) {
                Ok(watcher) => watcher,
                Err(error) => {
                    tracing::warn!(target: "startup", "failed to install signal handlers: {error}");
                    None
                }
            }
        } else {
            None
        };

        let mut session = Self {
            coordinator,
            ui_events,
            presenter,
            signal_watcher,
            signal_join: ctx.config.timeouts.poller_join(),
        };

        let tray = tray::spawn_tray(
            tray_backend,
            ctx.bus.clone(),
            session.coordinator.handle(),
            ctx.config.timeouts.tray_join(),
        );
        match tray {
            Ok(actor) => session.coordinator.register(actor),
            Err(error) => {
                tracing::error!(target: "startup", "failed to start tray: {error}");
                session.abort();
                return Err(error);
            }
        }

        match BackgroundMonitor::spawn(ctx, ui) {
            Ok(actor) => session.coordinator.register(actor),
            Err(error) => {
                tracing::error!(target: "startup", "failed to start background monitor: {error}");
                session.abort();
                return Err(error);
            }
        }

        tracing::info!(target: "startup", "launcher setup complete: tray and background monitor running");
        Ok(session)
    }

    pub fn ui_events(&self) -> &UiEvents {
        &self.ui_events
    }

    pub fn coordinator(&self) -> &ShutdownCoordinator {
        &self.coordinator
    }

    fn abort(&mut self) {
        self.coordinator.shutdown();
        if let Some(watcher) = self.signal_watcher.take() {
            join_with_timeout(watcher, self.signal_join, "signal-watcher");
        }
    }

    /// Blocks until shutdown is requested, then runs the teardown.
    pub fn wait_and_teardown(mut self) -> SessionExit {
        let teardown = self.coordinator.run_until_shutdown();
        if let Some(watcher) = self.signal_watcher.take() {
            join_with_timeout(watcher, self.signal_join, "signal-watcher");
        }
        self.presenter.detach();
        SessionExit {
            critical_error: self.coordinator.critical_error(),
            teardown,
        }
    }
}
