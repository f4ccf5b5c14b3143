//! Seam between the launcher core and whatever presents it to the user.
//!
//! The core only ever pushes fire-and-forget calls through [`UiBridge`]; the
//! presentation layer reports back through [`UiEvents`], which turns window
//! callbacks into bus events and shutdown requests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{
    coordinator::{ShutdownHandle, ShutdownReason},
    event_bus::{AppEvent, EventBus, EventKind, Handler},
    latch::Latch,
};

/// Calls into the presentation layer. Implementations must not block.
pub trait UiBridge: Send + Sync {
    fn set_status(&self, text: &str);
    fn show_error(&self, text: &str);
    fn show_critical_error(&self, text: &str);
    fn navigate(&self, url: &str);
    fn show_window(&self);
    fn hide_window(&self);
    fn close_window(&self);
    /// `false` once the window has been closed or was never created.
    fn is_window_open(&self) -> bool;
}

/// Presentation for the headless binary: everything goes to the log.
#[derive(Debug, Default)]
pub struct HeadlessUi {
    closed: AtomicBool,
}

impl HeadlessUi {
    pub fn new() -> Self {
        Self::default()
    }
}

impl UiBridge for HeadlessUi {
    fn set_status(&self, text: &str) {
        tracing::info!(target: "runtime", "status: {text}");
    }

    fn show_error(&self, text: &str) {
        tracing::error!(target: "runtime", "error page: {text}");
    }

    fn show_critical_error(&self, text: &str) {
        tracing::error!(target: "runtime", "critical error page: {text}");
    }

    fn navigate(&self, url: &str) {
        tracing::info!(target: "runtime", "navigate to {url}");
    }

    fn show_window(&self) {
        tracing::debug!(target: "runtime", "show window requested (headless)");
    }

    fn hide_window(&self) {
        tracing::debug!(target: "runtime", "hide window requested (headless)");
    }

    fn close_window(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(target: "shutdown", "window released");
        }
    }

    fn is_window_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }
}

/// Bus registrations made by the presenter. Dropping this does not unsubscribe;
/// call [`UiSubscriptions::detach`].
pub struct UiSubscriptions {
    bus: Arc<EventBus>,
    entries: Vec<(EventKind, Handler)>,
}

impl UiSubscriptions {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn detach(self) {
        for (kind, handler) in &self.entries {
            self.bus.unsubscribe(*kind, handler);
        }
    }
}

/// Routes bus events to the UI. Server-exit errors are suppressed once `cancel`
/// is set, so a deliberate shutdown never shows a crash page.
pub fn attach_ui_presenter(
    bus: &Arc<EventBus>,
    ui: Arc<dyn UiBridge>,
    cancel: Latch,
) -> UiSubscriptions {
    let mut entries = Vec::with_capacity(5);

    let critical_ui = ui.clone();
    entries.push((
        EventKind::CriticalError,
        Handler::new("ui-presenter:critical-error", move |event| {
            if let AppEvent::CriticalError { message } = event {
                critical_ui.show_critical_error(message);
            }
        }),
    ));

    let exit_ui = ui.clone();
    entries.push((
        EventKind::ServerExited,
        Handler::new("ui-presenter:server-exited", move |event| {
            let AppEvent::ServerExited { pid, code } = event else {
                return;
            };
            if cancel.is_set() {
                tracing::debug!(
                    target: "runtime",
                    "server exit during shutdown, error page suppressed: pid={pid}"
                );
                return;
            }
            exit_ui.show_error(&server_exited_message(*pid, *code));
        }),
    ));

    let show_ui = ui.clone();
    entries.push((
        EventKind::ShowWindowRequested,
        Handler::new("ui-presenter:show-window", move |_| show_ui.show_window()),
    ));

    let hide_ui = ui.clone();
    entries.push((
        EventKind::HideWindowRequested,
        Handler::new("ui-presenter:hide-window", move |_| hide_ui.hide_window()),
    ));

    entries.push((
        EventKind::QuitRequested,
        Handler::new("ui-presenter:close-window", move |_| ui.close_window()),
    ));

    for (kind, handler) in &entries {
        bus.subscribe(*kind, handler.clone());
    }
    UiSubscriptions {
        bus: bus.clone(),
        entries,
    }
}

pub fn server_exited_message(pid: u32, code: Option<i32>) -> String {
    match code {
        Some(code) => format!(
            "ComfyUI server (PID: {pid}) stopped unexpectedly with exit code {code}. Check server.log."
        ),
        None => format!(
            "ComfyUI server (PID: {pid}) was terminated by a signal. Check server.log."
        ),
    }
}

/// Entry points the presentation layer calls when the window reports something.
pub struct UiEvents {
    bus: Arc<EventBus>,
    shutdown: ShutdownHandle,
    debug: bool,
    initial_load_done: AtomicBool,
}

impl UiEvents {
    pub fn new(bus: Arc<EventBus>, shutdown: ShutdownHandle, debug: bool) -> Self {
        Self {
            bus,
            shutdown,
            debug,
            initial_load_done: AtomicBool::new(false),
        }
    }

    /// Only the first load counts as "content ready"; later loads are navigations.
    pub fn content_loaded(&self) {
        if self.initial_load_done.swap(true, Ordering::SeqCst) {
            tracing::debug!(target: "runtime", "window content reloaded");
            return;
        }
        tracing::info!(target: "startup", "window content loaded");
        self.bus.publish(AppEvent::ContentLoaded);
    }

    pub fn window_shown(&self) {
        self.bus.publish(AppEvent::WindowShown);
    }

    pub fn window_hidden(&self) {
        self.bus.publish(AppEvent::WindowHidden);
    }

    pub fn close_requested(&self) {
        tracing::info!(target: "shutdown", "window close requested by user");
        self.bus.publish(AppEvent::WindowHidden);
        self.shutdown.request_shutdown(ShutdownReason::WindowClosed);
    }

    /// Returns whether the toggle is honored; it is a no-op outside debug mode.
    pub fn devtools_toggle_requested(&self) -> bool {
        if !self.debug {
            tracing::debug!(target: "runtime", "devtools toggle ignored outside debug mode");
            return false;
        }
        tracing::info!(target: "runtime", "devtools toggle requested");
        true
    }
}


#[cfg(test)]
mod tests {
    use super::{
        test_support::{RecordingUi, UiCall},
        *,
    };
    use std::sync::atomic::AtomicUsize;

    fn presenter() -> (Arc<EventBus>, Arc<RecordingUi>, Latch, UiSubscriptions) {
        let bus = Arc::new(EventBus::new());
        let ui = Arc::new(RecordingUi::default());
        let cancel = Latch::new();
        let subscriptions = attach_ui_presenter(&bus, ui.clone(), cancel.clone());
        (bus, ui, cancel, subscriptions)
    }

    #[test]
    fn presenter_routes_events_to_ui_calls() {
        let (bus, ui, _cancel, _subscriptions) = presenter();

        bus.publish(AppEvent::CriticalError {
            message: "GUI did not load".to_string(),
        });
        bus.publish(AppEvent::ShowWindowRequested);
        bus.publish(AppEvent::ServerExited { pid: 77, code: Some(1) });
        bus.publish(AppEvent::HideWindowRequested);
        bus.publish(AppEvent::QuitRequested);

        let calls = ui.calls();
        assert_eq!(calls[0], UiCall::CriticalError("GUI did not load".to_string()));
        assert_eq!(calls[1], UiCall::ShowWindow);
        assert!(matches!(&calls[2], UiCall::Error(text) if text.contains("77") && text.contains("exit code 1")));
        assert_eq!(calls[3], UiCall::HideWindow);
        assert_eq!(calls[4], UiCall::CloseWindow);
    }

    #[test]
    fn server_exit_error_is_suppressed_during_shutdown() {
        let (bus, ui, cancel, _subscriptions) = presenter();
        cancel.set();

        bus.publish(AppEvent::ServerExited { pid: 9, code: Some(0) });
        assert!(ui.calls().is_empty());
    }

    #[test]
    fn detach_removes_every_presenter_subscription() {
        let (bus, ui, _cancel, subscriptions) = presenter();
        assert_eq!(subscriptions.len(), 5);
        subscriptions.detach();

        bus.publish(AppEvent::QuitRequested);
        bus.publish(AppEvent::ShowWindowRequested);
        assert!(ui.calls().is_empty());
        assert_eq!(bus.subscriber_count(EventKind::CriticalError), 0);
    }

    #[test]
    fn only_first_content_load_is_published() {
        let bus = Arc::new(EventBus::new());
        let cancel = Latch::new();
        let shutdown = ShutdownHandle::new(bus.clone(), cancel.clone());
        let events = UiEvents::new(bus.clone(), shutdown, false);

        let loads = Arc::new(AtomicUsize::new(0));
        let counter = loads.clone();
        bus.subscribe(
            EventKind::ContentLoaded,
            Handler::new("count-loads", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        events.content_loaded();
        events.content_loaded();
        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_box_hides_window_and_requests_shutdown() {
        let bus = Arc::new(EventBus::new());
        let cancel = Latch::new();
        let shutdown = ShutdownHandle::new(bus.clone(), cancel.clone());
        let events = UiEvents::new(bus.clone(), shutdown.clone(), false);

        let hidden = Arc::new(AtomicUsize::new(0));
        let counter = hidden.clone();
        bus.subscribe(
            EventKind::WindowHidden,
            Handler::new("count-hidden", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        events.close_requested();
        assert_eq!(hidden.load(Ordering::SeqCst), 1);
        assert!(cancel.is_set());
        assert_eq!(shutdown.reason(), Some(ShutdownReason::WindowClosed));
    }

    #[test]
    fn devtools_toggle_only_honored_in_debug_mode() {
        let bus = Arc::new(EventBus::new());
        let shutdown = ShutdownHandle::new(bus.clone(), Latch::new());
        assert!(!UiEvents::new(bus.clone(), shutdown.clone(), false).devtools_toggle_requested());
        assert!(UiEvents::new(bus, shutdown, true).devtools_toggle_requested());
    }
}
