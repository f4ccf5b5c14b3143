//! The background actor that brings the server up and watches it.
//!
//! Pipeline: wait for the UI content, clear the port, launch, start the
//! redirect poller, then supervise until the server exits or the launcher is
//! cancelled. Cancellation is re-checked around every step and wait so a late
//! cancel can never start a launch. Cleanup always runs on the way out.

use std::{
    io,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    sync::Arc,
    thread::{self, JoinHandle},
};

use crate::{
    app::AppContext,
    config::Timeouts,
    coordinator::{join_with_timeout, ActorHandle},
    event_bus::{panic_message, ActorId, AppEvent, EventBus, EventKind, Handler},
    latch::Latch,
    port_preempt::PortPreemption,
    redirect_poller::{PollOutcome, RedirectPoller},
    supervisor::{AvailabilityProbe, ProcessSupervisor},
    ui_bridge::UiBridge,
};

pub const STATUS_INITIALIZING: &str = "Initializing...";
pub const STATUS_STARTING_SERVER: &str = "Starting server process...";
pub const UI_NOT_READY_MESSAGE: &str = "GUI did not load correctly. Check launcher logs.";
pub const MONITOR_FAILED_MESSAGE: &str = "The launcher's background monitor failed. Check launcher logs.";

pub fn clearing_port_status(port: u16) -> String {
    format!("Clearing network port {port}...")
}

/// How the pipeline ended, before cleanup. A panic still goes through cleanup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipelineEnd {
    Cancelled,
    UiNotReady,
    LaunchFailed,
    ServerExited,
    Panicked,
}

pub struct BackgroundMonitor {
    bus: Arc<EventBus>,
    supervisor: Arc<ProcessSupervisor>,
    ui: Arc<dyn UiBridge>,
    cancel: Latch,
    content_ready: Latch,
    completion: Latch,
    content_handler: Handler,
    timeouts: Timeouts,
    server_log: PathBuf,
}

impl BackgroundMonitor {
    /// Subscribes to `ContentLoaded` before the thread starts, so a load that
    /// lands while the thread is still spinning up is not missed.
    pub fn spawn(ctx: &AppContext, ui: Arc<dyn UiBridge>) -> io::Result<ActorHandle> {
        let content_ready = Latch::new();
        let ready = content_ready.clone();
        let content_handler = Handler::new("background-monitor:content-loaded", move |_| {
            ready.set();
        });
        ctx.bus
            .subscribe(EventKind::ContentLoaded, content_handler.clone());

        let completion = Latch::new();
        let timeouts = ctx.config.timeouts;
        let monitor = Self {
            bus: ctx.bus.clone(),
            supervisor: ctx.supervisor.clone(),
            ui,
            cancel: ctx.cancel.clone(),
            content_ready,
            completion: completion.clone(),
            content_handler: content_handler.clone(),
            timeouts,
            server_log: ctx.server_log_path(),
        };

        match thread::Builder::new()
            .name(ActorId::Monitor.as_label().to_string())
            .spawn(move || monitor.run())
        {
            Ok(join) => Ok(ActorHandle::new(
                ActorId::Monitor,
                completion,
                join,
                timeouts.actor_join(),
            )),
            Err(error) => {
                ctx.bus.unsubscribe(EventKind::ContentLoaded, &content_handler);
                Err(error)
            }
        }
    }

    fn run(self) {
        tracing::info!(target: "startup", "background monitor started");
        let poller_stop = Latch::new();
        let mut poller = None;

        let pipeline =
            panic::catch_unwind(AssertUnwindSafe(|| self.run_pipeline(&poller_stop, &mut poller)));
        let end = match pipeline {
            Ok(end) => end,
            Err(payload) => {
                tracing::error!(
                    target: "runtime",
                    "background monitor panicked: {}",
                    panic_message(payload.as_ref())
                );
                self.publish_critical(MONITOR_FAILED_MESSAGE.to_string());
                PipelineEnd::Panicked
            }
        };
        tracing::info!(target: "runtime", "background monitor pipeline ended: {end:?}");

        self.cleanup(&poller_stop, poller);
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_set()
    }

    /// Sleeps for the step pause; `true` means cancellation arrived meanwhile.
    fn pause(&self) -> bool {
        self.cancel.wait_timeout(self.timeouts.step_pause())
    }

    fn publish_critical(&self, message: String) {
        if self.cancelled() {
            tracing::info!(target: "startup", "suppressing critical error during shutdown: {message}");
            return;
        }
        self.bus.publish(AppEvent::CriticalError { message });
    }

    fn run_pipeline(
        &self,
        poller_stop: &Latch,
        poller: &mut Option<JoinHandle<PollOutcome>>,
    ) -> PipelineEnd {
        if self.cancelled() {
            return PipelineEnd::Cancelled;
        }

        tracing::info!(target: "startup", "waiting for window content to load");
        let ready = Latch::wait_any_timeout(
            &[&self.content_ready, &self.cancel],
            self.timeouts.ui_ready(),
        );
        if self.cancelled() {
            return PipelineEnd::Cancelled;
        }
        if ready.is_none() {
            tracing::error!(
                target: "startup",
                "window content not loaded within {}ms, aborting launch",
                self.timeouts.ui_ready().as_millis()
            );
            self.publish_critical(UI_NOT_READY_MESSAGE.to_string());
            return PipelineEnd::UiNotReady;
        }

        self.ui.set_status(STATUS_INITIALIZING);
        if self.pause() {
            return PipelineEnd::Cancelled;
        }

        let port = self.supervisor.plan().port;
        self.ui.set_status(&clearing_port_status(port));
        match self.supervisor.preempt_port() {
            PortPreemption::Free | PortPreemption::Reclaimed { .. } => {}
            PortPreemption::StillBusy { pid } => tracing::warn!(
                target: "startup",
                "port {port} still busy after killing pid {pid}; launch may fail"
            ),
            PortPreemption::Failed(reason) => tracing::warn!(
                target: "startup",
                "could not clear port {port}: {reason}; launch may fail"
            ),
        }
        if self.pause() || self.cancelled() {
            return PipelineEnd::Cancelled;
        }

        self.ui.set_status(STATUS_STARTING_SERVER);
        let info = match self.supervisor.launch(&self.server_log) {
            Ok(info) => info,
            Err(error) => {
                self.publish_critical(format!("Could not start the ComfyUI server: {error}"));
                return PipelineEnd::LaunchFailed;
            }
        };
        if self.cancelled() {
            return PipelineEnd::Cancelled;
        }
        tracing::info!(target: "startup", "server process started: pid={}", info.pid);

        let probe: Arc<dyn AvailabilityProbe> = self.supervisor.clone();
        let redirect = RedirectPoller::new(
            probe,
            self.ui.clone(),
            self.supervisor.plan().server_url(),
            &self.timeouts,
            self.cancel.clone(),
            poller_stop.clone(),
        );
        match redirect.spawn() {
            Ok(handle) => *poller = Some(handle),
            Err(error) => {
                self.publish_critical(format!("Could not start the redirect loop: {error}"));
                return PipelineEnd::LaunchFailed;
            }
        }

        tracing::info!(target: "runtime", "monitoring server process pid={}", info.pid);
        loop {
            if let Some(report) = self.supervisor.poll_exit() {
                tracing::warn!(
                    target: "runtime",
                    "server process exited on its own: pid={}, code={:?}",
                    report.pid,
                    report.code
                );
                self.bus.publish(AppEvent::ServerExited {
                    pid: report.pid,
                    code: report.code,
                });
                return PipelineEnd::ServerExited;
            }
            if self
                .cancel
                .wait_timeout(self.timeouts.monitor_poll_interval())
            {
                return PipelineEnd::Cancelled;
            }
        }
    }

    fn cleanup(self, poller_stop: &Latch, poller: Option<JoinHandle<PollOutcome>>) {
        tracing::info!(target: "shutdown", "background monitor cleaning up");
        poller_stop.set();
        if let Some(handle) = poller {
            if let Some(outcome) =
                join_with_timeout(handle, self.timeouts.poller_join(), "redirect-poller")
            {
                tracing::debug!(target: "shutdown", "redirect poller joined: {outcome:?}");
            }
        }

        if self.supervisor.is_tracked() {
            let outcome = self.supervisor.terminate();
            tracing::info!(target: "shutdown", "server stopped by monitor cleanup: {outcome:?}");
        }

        self.bus
            .unsubscribe(EventKind::ContentLoaded, &self.content_handler);
        self.bus.publish(AppEvent::ActorShutdownComplete {
            actor: ActorId::Monitor,
        });
        self.completion.set();
        tracing::info!(target: "shutdown", "background monitor finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::LauncherConfig,
        process_control::{OsProcessSignals, ProcessSignals},
        ui_bridge::test_support::{RecordingUi, UiCall},
    };
    use parking_lot::Mutex;
    use std::{
        env, fs,
        net::TcpListener,
        path::Path,
        process::Child,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Duration, Instant, SystemTime, UNIX_EPOCH},
    };

    fn create_temp_case_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let dir = env::temp_dir().join(format!(
            "comfyui-launcher-monitor-test-{}-{}-{}",
            std::process::id(),
            ts,
            name
        ));
        fs::create_dir_all(&dir).expect("create temp case dir");
        dir
    }

    #[derive(Default)]
    struct CountingSignals {
        stops: AtomicUsize,
    }

    impl ProcessSignals for CountingSignals {
        fn request_stop(&self, child: &mut Child) -> io::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            OsProcessSignals.request_stop(child)
        }

        fn force_kill(&self, child: &mut Child) -> io::Result<()> {
            OsProcessSignals.force_kill(child)
        }
    }

    fn recorded_events(bus: &EventBus, kinds: &[EventKind]) -> Arc<Mutex<Vec<AppEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        for kind in kinds {
            let sink = events.clone();
            bus.subscribe(
                *kind,
                Handler::new("test-recorder", move |event| sink.lock().push(event.clone())),
            );
        }
        events
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        listener.local_addr().expect("listener addr").port()
    }

    fn fast_config(dir: &Path) -> LauncherConfig {
        let mut config = LauncherConfig {
            install_root: dir.to_path_buf(),
            port: closed_port(),
            log_dir: Some(dir.join("logs")),
            ..LauncherConfig::default()
        };
        config.timeouts.step_pause_ms = 0;
        config.timeouts.port_reclaim_ms = 0;
        config.timeouts.monitor_poll_interval_ms = 20;
        config.timeouts.redirect_check_interval_ms = 20;
        config.timeouts.poller_join_ms = 1_000;
        config.timeouts.graceful_stop_ms = 2_000;
        config
    }

    fn context_with_signals(config: LauncherConfig, signals: Arc<CountingSignals>) -> AppContext {
        let supervisor = ProcessSupervisor::with_signals(&config, signals);
        AppContext::with_supervisor(config, supervisor)
    }

    #[test]
    fn missing_install_root_publishes_critical_error_without_launching() {
        let dir = create_temp_case_dir("missing-root");
        let missing = dir.join("absent");
        let mut config = fast_config(&dir);
        config.install_root = missing.clone();
        config.python_executable = Some(dir.join("python"));
        let ctx = AppContext::new(config);
        let events = recorded_events(
            &ctx.bus,
            &[EventKind::CriticalError, EventKind::ActorShutdownComplete],
        );
        let ui = Arc::new(RecordingUi::default());

        let actor = BackgroundMonitor::spawn(&ctx, ui.clone()).expect("spawn monitor");
        ctx.bus.publish(AppEvent::ContentLoaded);
        assert!(actor.completion().wait_timeout(Duration::from_secs(10)));

        let events = events.lock().clone();
        match &events[0] {
            AppEvent::CriticalError { message } => {
                assert!(message.contains(&missing.display().to_string()), "{message}")
            }
            other => panic!("unexpected first event {other:?}"),
        }
        assert_eq!(
            events[1],
            AppEvent::ActorShutdownComplete {
                actor: ActorId::Monitor
            }
        );
        assert!(!ctx.supervisor.is_tracked());
        assert!(ui.statuses().contains(&STATUS_STARTING_SERVER.to_string()));

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    /// Records like `RecordingUi` but panics on one status text.
    struct PanickingUi {
        inner: RecordingUi,
        panic_on: &'static str,
    }

    impl UiBridge for PanickingUi {
        fn set_status(&self, text: &str) {
            if text == self.panic_on {
                panic!("status display failed");
            }
            self.inner.set_status(text);
        }

        fn show_error(&self, text: &str) {
            self.inner.show_error(text);
        }

        fn show_critical_error(&self, text: &str) {
            self.inner.show_critical_error(text);
        }

        fn navigate(&self, url: &str) {
            self.inner.navigate(url);
        }

        fn show_window(&self) {
            self.inner.show_window();
        }

        fn hide_window(&self) {
            self.inner.hide_window();
        }

        fn close_window(&self) {
            self.inner.close_window();
        }

        fn is_window_open(&self) -> bool {
            self.inner.is_window_open()
        }
    }

    #[test]
    fn panicking_ui_still_runs_cleanup_and_reports_critical_error() {
        let dir = create_temp_case_dir("ui-panic");
        let ctx = AppContext::new(fast_config(&dir));
        let events = recorded_events(
            &ctx.bus,
            &[EventKind::CriticalError, EventKind::ActorShutdownComplete],
        );
        let ui = Arc::new(PanickingUi {
            inner: RecordingUi::default(),
            panic_on: STATUS_STARTING_SERVER,
        });

        let actor = BackgroundMonitor::spawn(&ctx, ui).expect("spawn monitor");
        ctx.bus.publish(AppEvent::ContentLoaded);
        assert!(actor.completion().wait_timeout(Duration::from_secs(5)));

        assert_eq!(
            events.lock().clone(),
            vec![
                AppEvent::CriticalError {
                    message: MONITOR_FAILED_MESSAGE.to_string()
                },
                AppEvent::ActorShutdownComplete {
                    actor: ActorId::Monitor
                },
            ]
        );
        assert_eq!(ctx.bus.subscriber_count(EventKind::ContentLoaded), 0);
        assert!(!ctx.supervisor.is_tracked());

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[test]
    fn ui_ready_timeout_aborts_before_launch() {
        let dir = create_temp_case_dir("ui-timeout");
        let mut config = fast_config(&dir);
        config.timeouts.ui_ready_ms = 100;
        let ctx = AppContext::new(config);
        let events = recorded_events(&ctx.bus, &[EventKind::CriticalError]);
        let ui = Arc::new(RecordingUi::default());

        let actor = BackgroundMonitor::spawn(&ctx, ui.clone()).expect("spawn monitor");
        assert!(actor.completion().wait_timeout(Duration::from_secs(5)));

        assert_eq!(
            events.lock().clone(),
            vec![AppEvent::CriticalError {
                message: UI_NOT_READY_MESSAGE.to_string()
            }]
        );
        assert!(ui.statuses().is_empty());
        assert_eq!(ctx.bus.subscriber_count(EventKind::ContentLoaded), 0);

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[test]
    fn cancellation_before_content_ready_skips_everything() {
        let dir = create_temp_case_dir("early-cancel");
        let ctx = AppContext::new(fast_config(&dir));
        let events = recorded_events(&ctx.bus, &[EventKind::CriticalError]);
        let ui = Arc::new(RecordingUi::default());

        let actor = BackgroundMonitor::spawn(&ctx, ui.clone()).expect("spawn monitor");
        ctx.cancel.set();
        assert!(actor.completion().wait_timeout(Duration::from_secs(5)));

        assert!(events.lock().is_empty());
        assert!(ui.calls().is_empty());

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn unexpected_exit_publishes_server_exited_once() {
        let dir = create_temp_case_dir("server-exit");
        fs::write(dir.join("main.py"), "exit 1\n").expect("write child script");
        let mut config = fast_config(&dir);
        config.python_executable = Some(PathBuf::from("/bin/sh"));
        let signals = Arc::new(CountingSignals::default());
        let ctx = context_with_signals(config, signals.clone());
        let events = recorded_events(&ctx.bus, &[EventKind::ServerExited]);
        let ui = Arc::new(RecordingUi::default());

        let actor = BackgroundMonitor::spawn(&ctx, ui.clone()).expect("spawn monitor");
        ctx.bus.publish(AppEvent::ContentLoaded);
        assert!(actor.completion().wait_timeout(Duration::from_secs(10)));

        let events = events.lock().clone();
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            AppEvent::ServerExited { code: Some(1), .. }
        ));
        assert_eq!(signals.stops.load(Ordering::SeqCst), 0);
        assert!(!ctx.supervisor.is_tracked());
        assert_eq!(ui.count(|call| matches!(call, UiCall::Navigate(_))), 0);

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_while_supervising_terminates_the_server() {
        let dir = create_temp_case_dir("cancel-running");
        fs::write(dir.join("main.py"), "exec sleep 30\n").expect("write child script");
        let mut config = fast_config(&dir);
        config.python_executable = Some(PathBuf::from("/bin/sh"));
        let signals = Arc::new(CountingSignals::default());
        let ctx = context_with_signals(config, signals.clone());
        let events = recorded_events(&ctx.bus, &[EventKind::ServerExited]);
        let ui = Arc::new(RecordingUi::default());

        let actor = BackgroundMonitor::spawn(&ctx, ui.clone()).expect("spawn monitor");
        ctx.bus.publish(AppEvent::ContentLoaded);

        let deadline = Instant::now() + Duration::from_secs(10);
        while !ctx.supervisor.is_tracked() {
            assert!(Instant::now() < deadline, "server never launched");
            thread::sleep(Duration::from_millis(10));
        }
        ctx.cancel.set();
        assert!(actor.completion().wait_timeout(Duration::from_secs(10)));

        assert!(!ctx.supervisor.is_tracked());
        assert_eq!(signals.stops.load(Ordering::SeqCst), 1);
        assert!(events.lock().is_empty());
        assert_eq!(
            ui.statuses()[..3],
            [
                STATUS_INITIALIZING.to_string(),
                clearing_port_status(ctx.config.port),
                STATUS_STARTING_SERVER.to_string(),
            ]
        );

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }
}
