//! In-process publish/subscribe bus shared by every launcher actor.
//!
//! Handlers run synchronously on the publishing thread, in subscription
//! order, against a snapshot of the registry taken when `publish` starts.
//! A panicking handler is logged and skipped; it never reaches the publisher.
//!
//! Subscriptions are not deduplicated: registering the same [`Handler`] twice
//! makes it run twice per publish, and `unsubscribe` removes one registration
//! at a time.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContentLoaded,
    WindowShown,
    WindowHidden,
    ShowWindowRequested,
    HideWindowRequested,
    QuitRequested,
    CriticalError,
    ServerExited,
    ActorShutdownComplete,
}

/// Long-lived actors that report their own teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorId {
    Monitor,
    Tray,
}

impl ActorId {
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Monitor => "background-monitor",
            Self::Tray => "tray",
        }
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    ContentLoaded,
    WindowShown,
    WindowHidden,
    ShowWindowRequested,
    HideWindowRequested,
    QuitRequested,
    CriticalError { message: String },
    /// `code` is `None` when the process was ended by a signal.
    ServerExited { pid: u32, code: Option<i32> },
    ActorShutdownComplete { actor: ActorId },
}

impl AppEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ContentLoaded => EventKind::ContentLoaded,
            Self::WindowShown => EventKind::WindowShown,
            Self::WindowHidden => EventKind::WindowHidden,
            Self::ShowWindowRequested => EventKind::ShowWindowRequested,
            Self::HideWindowRequested => EventKind::HideWindowRequested,
            Self::QuitRequested => EventKind::QuitRequested,
            Self::CriticalError { .. } => EventKind::CriticalError,
            Self::ServerExited { .. } => EventKind::ServerExited,
            Self::ActorShutdownComplete { .. } => EventKind::ActorShutdownComplete,
        }
    }
}

type HandlerFn = dyn Fn(&AppEvent) + Send + Sync;

/// A named callback. Clones share identity, which is what `unsubscribe` matches on.
#[derive(Clone)]
pub struct Handler {
    name: Arc<str>,
    callback: Arc<HandlerFn>,
}

impl Handler {
    pub fn new<F>(name: impl Into<Arc<str>>, callback: F) -> Self
    where
        F: Fn(&AppEvent) + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            callback: Arc::new(callback),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn same_as(&self, other: &Handler) -> bool {
        std::ptr::eq(
            Arc::as_ptr(&self.callback) as *const (),
            Arc::as_ptr(&other.callback) as *const (),
        )
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler").field("name", &self.name).finish()
    }
}

#[derive(Default)]
pub struct EventBus {
    registry: Mutex<HashMap<EventKind, Vec<Handler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) {
        tracing::debug!(
            target: "event_bus",
            "subscribing handler '{}' to {kind:?}",
            handler.name()
        );
        self.registry.lock().entry(kind).or_default().push(handler);
    }

    /// Removes the first registration of `handler` for `kind`.
    /// Returns `false` (and only logs) when nothing matched.
    pub fn unsubscribe(&self, kind: EventKind, handler: &Handler) -> bool {
        let mut registry = self.registry.lock();
        let removed = registry
            .get_mut(&kind)
            .and_then(|handlers| {
                handlers
                    .iter()
                    .position(|candidate| candidate.same_as(handler))
                    .map(|index| handlers.remove(index))
            })
            .is_some();
        drop(registry);

        if removed {
            tracing::debug!(
                target: "event_bus",
                "unsubscribed handler '{}' from {kind:?}",
                handler.name()
            );
        } else {
            tracing::debug!(
                target: "event_bus",
                "unsubscribe ignored: handler '{}' not registered for {kind:?}",
                handler.name()
            );
        }
        removed
    }

    /// Delivers `event` to the current subscribers of its kind.
    /// Returns how many handlers completed without panicking.
    pub fn publish(&self, event: AppEvent) -> usize {
        let kind = event.kind();
        let snapshot = self
            .registry
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        tracing::info!(
            target: "event_bus",
            "publishing {event:?} to {} subscriber(s)",
            snapshot.len()
        );

        let mut completed = 0;
        for handler in &snapshot {
            tracing::trace!(target: "event_bus", "calling '{}' for {kind:?}", handler.name());
            match panic::catch_unwind(AssertUnwindSafe(|| (handler.callback)(&event))) {
                Ok(()) => completed += 1,
                Err(payload) => tracing::error!(
                    target: "event_bus",
                    "handler '{}' panicked while handling {kind:?}: {}",
                    handler.name(),
                    panic_message(payload.as_ref())
                ),
            }
        }
        completed
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.registry.lock().get(&kind).map_or(0, Vec::len)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.registry.lock();
        let counts: HashMap<_, _> = registry
            .iter()
            .map(|(kind, handlers)| (*kind, handlers.len()))
            .collect();
        f.debug_struct("EventBus").field("subscribers", &counts).finish()
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> Handler {
        let log = Arc::clone(log);
        Handler::new(label, move |_event| log.lock().push(label.to_string()))
    }

    #[test]
    fn publish_invokes_handlers_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::QuitRequested, recorder(&log, "first"));
        bus.subscribe(EventKind::QuitRequested, recorder(&log, "second"));
        bus.subscribe(EventKind::QuitRequested, recorder(&log, "third"));

        assert_eq!(bus.publish(AppEvent::QuitRequested), 3);
        assert_eq!(*log.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn publish_only_reaches_the_matching_kind() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::WindowShown, recorder(&log, "shown"));
        bus.subscribe(EventKind::QuitRequested, recorder(&log, "quit"));

        bus.publish(AppEvent::WindowShown);
        assert_eq!(*log.lock(), vec!["shown"]);
        assert_eq!(bus.publish(AppEvent::ContentLoaded), 0);
    }

    #[test]
    fn panicking_handler_does_not_stop_later_handlers() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe(EventKind::CriticalError, recorder(&log, "before"));
        bus.subscribe(
            EventKind::CriticalError,
            Handler::new("exploding", |_event| panic!("handler blew up")),
        );
        bus.subscribe(EventKind::CriticalError, recorder(&log, "after"));

        let completed = bus.publish(AppEvent::CriticalError {
            message: "boom".to_string(),
        });

        assert_eq!(completed, 2);
        assert_eq!(*log.lock(), vec!["before", "after"]);
    }

    #[test]
    fn duplicate_subscription_runs_handler_twice() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = recorder(&log, "dup");
        bus.subscribe(EventKind::WindowHidden, handler.clone());
        bus.subscribe(EventKind::WindowHidden, handler.clone());

        bus.publish(AppEvent::WindowHidden);
        assert_eq!(log.lock().len(), 2);

        assert!(bus.unsubscribe(EventKind::WindowHidden, &handler));
        bus.publish(AppEvent::WindowHidden);
        assert_eq!(log.lock().len(), 3);
        assert_eq!(bus.subscriber_count(EventKind::WindowHidden), 1);
    }

    #[test]
    fn unsubscribe_of_unknown_handler_is_a_noop() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registered = recorder(&log, "registered");
        let stranger = recorder(&log, "stranger");
        bus.subscribe(EventKind::QuitRequested, registered);

        assert!(!bus.unsubscribe(EventKind::QuitRequested, &stranger));
        assert!(!bus.unsubscribe(EventKind::ContentLoaded, &stranger));
        assert_eq!(bus.subscriber_count(EventKind::QuitRequested), 1);
    }

    #[test]
    fn publish_uses_snapshot_taken_before_handlers_run() {
        let bus = Arc::new(EventBus::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late");
        let victim = recorder(&log, "victim");

        let mutating = {
            let bus = Arc::clone(&bus);
            let late = late.clone();
            let victim = victim.clone();
            let log = Arc::clone(&log);
            Handler::new("mutating", move |_event| {
                log.lock().push("mutating".to_string());
                bus.subscribe(EventKind::QuitRequested, late.clone());
                bus.unsubscribe(EventKind::QuitRequested, &victim);
            })
        };
        bus.subscribe(EventKind::QuitRequested, mutating.clone());
        bus.subscribe(EventKind::QuitRequested, victim);

        bus.publish(AppEvent::QuitRequested);
        assert_eq!(*log.lock(), vec!["mutating", "victim"]);

        bus.unsubscribe(EventKind::QuitRequested, &mutating);
        log.lock().clear();
        bus.publish(AppEvent::QuitRequested);
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn event_kind_matches_payload_variant() {
        assert_eq!(
            AppEvent::ServerExited { pid: 7, code: Some(1) }.kind(),
            EventKind::ServerExited
        );
        assert_eq!(
            AppEvent::ActorShutdownComplete {
                actor: ActorId::Tray
            }
            .kind(),
            EventKind::ActorShutdownComplete
        );
    }
}
