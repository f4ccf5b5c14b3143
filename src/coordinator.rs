//! Turns independent actor lifecycles into one ordered exit.
//!
//! [`ShutdownHandle::request_shutdown`] is the only way in. It never blocks:
//! it sets the cancellation latch, publishes `QuitRequested` and wakes the
//! thread parked in [`ShutdownCoordinator::run_until_shutdown`]. That thread
//! then runs the teardown exactly once: a bounded wait per registered actor,
//! followed by an unconditional sweep of the supervised process and a close of
//! the window if it is still open.

use std::{
    fmt,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::{
    app::AppContext,
    event_bus::{ActorId, AppEvent, EventBus, EventKind, Handler},
    exit_state::ExitStateMachine,
    latch::Latch,
    process_control::TerminationOutcome,
    supervisor::ProcessSupervisor,
    ui_bridge::UiBridge,
};

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Minimum join budget once an actor has signalled completion.
const JOIN_AFTER_COMPLETION: Duration = Duration::from_millis(200);
const REQUEST_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Extra slack a late caller of `shutdown()` allows the first teardown.
const TEARDOWN_WAIT_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    WindowClosed,
    TrayQuit,
    CriticalError,
    Signal,
    Requested,
}

impl ShutdownReason {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::WindowClosed => "window_closed",
            Self::TrayQuit => "tray_quit",
            Self::CriticalError => "critical_error",
            Self::Signal => "signal",
            Self::Requested => "requested",
        }
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

struct ShutdownShared {
    bus: Arc<EventBus>,
    cancel: Latch,
    requested: Latch,
    teardown_done: Latch,
    exit_state: Mutex<ExitStateMachine>,
    reason: Mutex<Option<ShutdownReason>>,
}

/// Cloneable trigger handed to every actor that may ask the launcher to exit.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownShared>,
}

impl ShutdownHandle {
    pub fn new(bus: Arc<EventBus>, cancel: Latch) -> Self {
        Self {
            inner: Arc::new(ShutdownShared {
                bus,
                cancel,
                requested: Latch::new(),
                teardown_done: Latch::new(),
                exit_state: Mutex::new(ExitStateMachine::default()),
                reason: Mutex::new(None),
            }),
        }
    }

    /// Idempotent and non-blocking. Returns `true` for the first request only.
    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        {
            let mut state = self.inner.exit_state.lock();
            if !state.mark_quit_requested() {
                tracing::debug!(
                    target: "shutdown",
                    "shutdown already requested, ignoring {reason} (state={:?})",
                    state.state()
                );
                return false;
            }
            *self.inner.reason.lock() = Some(reason);
        }

        tracing::info!(target: "shutdown", "shutdown requested: reason={reason}");
        self.inner.cancel.set();
        self.inner.bus.publish(AppEvent::QuitRequested);
        self.inner.requested.set();
        true
    }

    pub fn is_requested(&self) -> bool {
        self.inner.exit_state.lock().is_quitting()
    }

    pub fn reason(&self) -> Option<ShutdownReason> {
        *self.inner.reason.lock()
    }

    pub fn cancel(&self) -> &Latch {
        &self.inner.cancel
    }

    /// Also returns `true` if the cancellation latch was set directly.
    pub fn wait_for_request(&self, timeout: Duration) -> bool {
        Latch::wait_any_timeout(&[&self.inner.requested, &self.inner.cancel], timeout).is_some()
    }

    fn try_begin_teardown(&self) -> bool {
        self.inner.exit_state.lock().try_begin_teardown()
    }

    fn finish_teardown(&self) {
        self.inner.exit_state.lock().finish_teardown();
        self.inner.teardown_done.set();
    }
}

/// A long-lived actor thread plus the flag it sets once fully unwound.
pub struct ActorHandle {
    id: ActorId,
    completion: Latch,
    join: JoinHandle<()>,
    timeout: Duration,
}

impl ActorHandle {
    pub fn new(id: ActorId, completion: Latch, join: JoinHandle<()>, timeout: Duration) -> Self {
        Self {
            id,
            completion,
            join,
            timeout,
        }
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn completion(&self) -> &Latch {
        &self.completion
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownReport {
    /// `false` when another caller had already run (or was running) the teardown.
    pub ran: bool,
    /// Actors that missed their completion deadline.
    pub late_actors: Vec<ActorId>,
    pub final_sweep: TerminationOutcome,
}

pub struct ShutdownCoordinator {
    shutdown: ShutdownHandle,
    bus: Arc<EventBus>,
    supervisor: Arc<ProcessSupervisor>,
    ui: Arc<dyn UiBridge>,
    actors: Mutex<Vec<ActorHandle>>,
    critical_error: Arc<Mutex<Option<String>>>,
    subscriptions: Vec<(EventKind, Handler)>,
    teardown_wait: Duration,
}

impl ShutdownCoordinator {
    /// Subscribes to `CriticalError` (treated as a shutdown request) and to
    /// actor completion reports.
    pub fn new(ctx: &AppContext, ui: Arc<dyn UiBridge>) -> Self {
        let shutdown = ShutdownHandle::new(ctx.bus.clone(), ctx.cancel.clone());
        let critical_error = Arc::new(Mutex::new(None));

        let recorded = critical_error.clone();
        let trigger = shutdown.clone();
        let on_critical = Handler::new("shutdown-coordinator:critical-error", move |event| {
            if let AppEvent::CriticalError { message } = event {
                tracing::error!(target: "shutdown", "critical error: {message}");
                recorded.lock().get_or_insert_with(|| message.clone());
                trigger.request_shutdown(ShutdownReason::CriticalError);
            }
        });
        let on_actor_done = Handler::new("shutdown-coordinator:actor-complete", |event| {
            if let AppEvent::ActorShutdownComplete { actor } = event {
                tracing::info!(target: "shutdown", "actor reported shutdown complete: {actor}");
            }
        });

        let subscriptions = vec![
            (EventKind::CriticalError, on_critical),
            (EventKind::ActorShutdownComplete, on_actor_done),
        ];
        for (kind, handler) in &subscriptions {
            ctx.bus.subscribe(*kind, handler.clone());
        }

        let timeouts = &ctx.config.timeouts;
        let teardown_wait = timeouts.actor_join()
            + timeouts.tray_join()
            + timeouts.graceful_stop()
            + timeouts.force_kill_wait() * 2
            + TEARDOWN_WAIT_SLACK;

        Self {
            shutdown,
            bus: ctx.bus.clone(),
            supervisor: ctx.supervisor.clone(),
            ui,
            actors: Mutex::new(Vec::new()),
            critical_error,
            subscriptions,
            teardown_wait,
        }
    }

    pub fn handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        self.shutdown.request_shutdown(reason)
    }

    /// Actors are awaited in registration order during teardown.
    pub fn register(&self, actor: ActorHandle) {
        tracing::debug!(target: "shutdown", "registered actor {}", actor.id);
        self.actors.lock().push(actor);
    }

    /// First critical error message seen, if any.
    pub fn critical_error(&self) -> Option<String> {
        self.critical_error.lock().clone()
    }

    /// Parks the calling thread until shutdown is requested, then tears down.
    pub fn run_until_shutdown(&self) -> TeardownReport {
        while !self.shutdown.wait_for_request(REQUEST_POLL_INTERVAL) {}
        self.shutdown()
    }

    /// Runs the teardown once. Later or concurrent callers wait (bounded) for
    /// the first one to finish and get a report with `ran == false`.
    pub fn shutdown(&self) -> TeardownReport {
        self.shutdown.request_shutdown(ShutdownReason::Requested);

        if !self.shutdown.try_begin_teardown() {
            tracing::info!(target: "shutdown", "teardown already running, waiting for it");
            if !self.shutdown.inner.teardown_done.wait_timeout(self.teardown_wait) {
                tracing::warn!(
                    target: "shutdown",
                    "first teardown still running after {}ms",
                    self.teardown_wait.as_millis()
                );
            }
            return TeardownReport {
                ran: false,
                late_actors: Vec::new(),
                final_sweep: TerminationOutcome::NotRunning,
            };
        }

        tracing::info!(target: "shutdown", "teardown started");
        let actors = std::mem::take(&mut *self.actors.lock());
        let mut late_actors = Vec::new();
        for actor in actors {
            let id = actor.id;
            if !await_actor(actor) {
                late_actors.push(id);
            }
        }

        let final_sweep = self.supervisor.terminate();
        if final_sweep != TerminationOutcome::NotRunning {
            tracing::warn!(
                target: "shutdown",
                "final sweep released a server process left behind: {final_sweep:?}"
            );
        }
        if self.ui.is_window_open() {
            self.ui.close_window();
        }

        for (kind, handler) in &self.subscriptions {
            self.bus.unsubscribe(*kind, handler);
        }
        self.shutdown.finish_teardown();
        tracing::info!(target: "shutdown", "teardown finished");

        TeardownReport {
            ran: true,
            late_actors,
            final_sweep,
        }
    }
}

/// Waits for the actor's completion flag, then reaps its thread. A late actor
/// is logged and left detached.
fn await_actor(actor: ActorHandle) -> bool {
    let ActorHandle {
        id,
        completion,
        join,
        timeout,
    } = actor;
    let started = Instant::now();
    if !completion.wait_timeout(timeout) {
        tracing::warn!(
            target: "shutdown",
            "actor {id} did not signal completion within {}ms, continuing teardown",
            timeout.as_millis()
        );
        return false;
    }
    tracing::debug!(
        target: "shutdown",
        "actor {id} completed after {}ms",
        started.elapsed().as_millis()
    );
    let remaining = timeout.saturating_sub(started.elapsed());
    join_with_timeout(join, remaining.max(JOIN_AFTER_COMPLETION), id.as_label());
    true
}

/// Bounded `join`: polls `is_finished` until `timeout`, then gives up and
/// leaves the thread detached.
pub(crate) fn join_with_timeout<T>(handle: JoinHandle<T>, timeout: Duration, label: &str) -> Option<T> {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            tracing::warn!(
                target: "shutdown",
                "{label} thread still running after {}ms, detaching",
                timeout.as_millis()
            );
            return None;
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    match handle.join() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::error!(target: "shutdown", "{label} thread panicked");
            None
        }
    }
}
