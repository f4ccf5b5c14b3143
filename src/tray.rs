use std::{
    io,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use crate::{
    coordinator::{ActorHandle, ShutdownHandle, ShutdownReason},
    event_bus::{panic_message, ActorId, AppEvent, EventBus, EventKind, Handler},
    latch::Latch,
    TRAY_MENU_QUIT, TRAY_MENU_SHOW_WINDOW, TRAY_MENU_TOGGLE_WINDOW,
};

const TRAY_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const TRAY_FAILED_MESSAGE: &str = "The tray icon stopped working. Check launcher logs.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrayMenuAction {
    ShowWindow,
    ToggleWindow,
    Quit,
}

pub fn action_from_menu_id(menu_id: &str) -> Option<TrayMenuAction> {
    match menu_id {
        TRAY_MENU_SHOW_WINDOW => Some(TrayMenuAction::ShowWindow),
        TRAY_MENU_TOGGLE_WINDOW => Some(TrayMenuAction::ToggleWindow),
        TRAY_MENU_QUIT => Some(TrayMenuAction::Quit),
        _ => None,
    }
}

/// Last known window visibility, fed by show/hide reports and requests on the
/// bus. The window starts out visible.
#[derive(Clone)]
pub struct WindowVisibility {
    visible: Arc<AtomicBool>,
    entries: Vec<(EventKind, Handler)>,
}

impl WindowVisibility {
    pub fn track(bus: &EventBus) -> Self {
        let visible = Arc::new(AtomicBool::new(true));
        let mut entries = Vec::with_capacity(4);
        for (kind, shown) in [
            (EventKind::WindowShown, true),
            (EventKind::ShowWindowRequested, true),
            (EventKind::WindowHidden, false),
            (EventKind::HideWindowRequested, false),
        ] {
            let flag = visible.clone();
            let handler = Handler::new("tray:window-visibility", move |_| {
                flag.store(shown, Ordering::SeqCst);
            });
            bus.subscribe(kind, handler.clone());
            entries.push((kind, handler));
        }
        Self { visible, entries }
    }

    pub fn is_visible(&self) -> bool {
        self.visible.load(Ordering::SeqCst)
    }

    pub fn detach(&self, bus: &EventBus) {
        for (kind, handler) in &self.entries {
            bus.unsubscribe(*kind, handler);
        }
    }
}

/// Platform tray icon. Rendering lives behind this trait; the actor only sees
/// menu ids.
pub trait TrayBackend: Send + 'static {
    /// Blocks for at most `timeout` waiting for the next menu selection.
    fn next_menu_event(&mut self, timeout: Duration) -> Option<String>;
    fn remove_icon(&mut self);
}

/// Tray without an icon: menu ids arrive over a channel. Used by the headless
/// binary and by tests.
pub struct ChannelTray {
    receiver: Receiver<String>,
}

impl ChannelTray {
    pub fn channel() -> (Self, Sender<String>) {
        let (sender, receiver) = crossbeam_channel::unbounded();
        (Self { receiver }, sender)
    }
}

impl TrayBackend for ChannelTray {
    fn next_menu_event(&mut self, timeout: Duration) -> Option<String> {
        match self.receiver.recv_timeout(timeout) {
            Ok(menu_id) => Some(menu_id),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(timeout);
                None
            }
        }
    }

    fn remove_icon(&mut self) {
        tracing::debug!(target: "shutdown", "tray channel closed");
    }
}

/// Starts the tray loop. It stops when `QuitRequested` is published or the
/// cancellation latch is set, then reports `ActorShutdownComplete { Tray }`.
pub fn spawn_tray<B: TrayBackend>(
    backend: B,
    bus: Arc<EventBus>,
    shutdown: ShutdownHandle,
    join_timeout: Duration,
) -> io::Result<ActorHandle> {
    let stop = Latch::new();
    let stop_on_quit = stop.clone();
    let quit_handler = Handler::new("tray:quit-requested", move |_| {
        stop_on_quit.set();
    });
    bus.subscribe(EventKind::QuitRequested, quit_handler.clone());
    let visibility = WindowVisibility::track(&bus);

    let completion = Latch::new();
    let done = completion.clone();
    let thread_bus = bus.clone();
    let thread_handler = quit_handler.clone();
    let thread_visibility = visibility.clone();
    let spawned = thread::Builder::new()
        .name(ActorId::Tray.as_label().to_string())
        .spawn(move || {
            let looped = panic::catch_unwind(AssertUnwindSafe(|| {
                run_tray_loop(backend, &thread_bus, &shutdown, &stop, &thread_visibility)
            }));
            if let Err(payload) = looped {
                tracing::error!(
                    target: "runtime",
                    "tray loop panicked: {}",
                    panic_message(payload.as_ref())
                );
                if !shutdown.cancel().is_set() {
                    thread_bus.publish(AppEvent::CriticalError {
                        message: TRAY_FAILED_MESSAGE.to_string(),
                    });
                }
            }
            thread_bus.unsubscribe(EventKind::QuitRequested, &thread_handler);
            thread_visibility.detach(&thread_bus);
            thread_bus.publish(AppEvent::ActorShutdownComplete {
                actor: ActorId::Tray,
            });
            done.set();
        });

    match spawned {
        Ok(join) => Ok(ActorHandle::new(ActorId::Tray, completion, join, join_timeout)),
        Err(error) => {
            bus.unsubscribe(EventKind::QuitRequested, &quit_handler);
            visibility.detach(&bus);
            Err(error)
        }
    }
}

fn run_tray_loop<B: TrayBackend>(
    mut backend: B,
    bus: &EventBus,
    shutdown: &ShutdownHandle,
    stop: &Latch,
    visibility: &WindowVisibility,
) {
    tracing::info!(target: "startup", "tray started");
    while !stop.is_set() && !shutdown.cancel().is_set() {
        let Some(menu_id) = backend.next_menu_event(TRAY_POLL_INTERVAL) else {
            continue;
        };
        handle_tray_menu_event(&menu_id, bus, shutdown, visibility.is_visible());
    }
    backend.remove_icon();
    tracing::info!(target: "shutdown", "tray stopped");
}

pub fn handle_tray_menu_event(
    menu_id: &str,
    bus: &EventBus,
    shutdown: &ShutdownHandle,
    window_visible: bool,
) {
    match action_from_menu_id(menu_id) {
        Some(TrayMenuAction::ShowWindow) => {
            bus.publish(AppEvent::ShowWindowRequested);
        }
        Some(TrayMenuAction::ToggleWindow) if window_visible => {
            bus.publish(AppEvent::HideWindowRequested);
        }
        Some(TrayMenuAction::ToggleWindow) => {
            bus.publish(AppEvent::ShowWindowRequested);
        }
        Some(TrayMenuAction::Quit) => {
            tracing::info!(target: "shutdown", "tray quit requested");
            shutdown.request_shutdown(ShutdownReason::TrayQuit);
        }
        None => tracing::debug!(target: "runtime", "ignoring unknown tray menu id '{menu_id}'"),
    }
}
