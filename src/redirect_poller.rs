use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use crate::{
    config::Timeouts, latch::Latch, supervisor::AvailabilityProbe, ui_bridge::UiBridge,
    AVAILABILITY_CHECK_DELAY,
};

pub const STATUS_WAITING_FOR_SERVER: &str = "Waiting for server to become available...";
pub const STATUS_CONNECTED: &str = "Connected to server.";
pub const REDIRECT_TIMEOUT_MESSAGE: &str =
    "ComfyUI server did not become available in time. Please check server.log.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Connected,
    TimedOut,
    Cancelled,
}

/// Polls the server until it accepts connections, then moves the UI over to it.
///
/// Each iteration makes one short availability check and then waits on the
/// stop and cancel latches for one check interval, so either latch ends the
/// loop within that interval. `max_wait` is a wall-clock ceiling: the last wait
/// is cut down to whatever time remains under it.
pub struct RedirectPoller {
    probe: Arc<dyn AvailabilityProbe>,
    ui: Arc<dyn UiBridge>,
    server_url: String,
    max_wait: Duration,
    check_interval: Duration,
    fade: Duration,
    cancel: Latch,
    stop: Latch,
}

impl RedirectPoller {
    pub fn new(
        probe: Arc<dyn AvailabilityProbe>,
        ui: Arc<dyn UiBridge>,
        server_url: String,
        timeouts: &Timeouts,
        cancel: Latch,
        stop: Latch,
    ) -> Self {
        Self {
            probe,
            ui,
            server_url,
            max_wait: timeouts.redirect_max_wait(),
            check_interval: timeouts.redirect_check_interval(),
            fade: timeouts.redirect_fade(),
            cancel,
            stop,
        }
    }

    pub fn spawn(self) -> io::Result<JoinHandle<PollOutcome>> {
        thread::Builder::new()
            .name("redirect-poller".to_string())
            .spawn(move || self.run())
    }

    fn is_cancelled(&self) -> bool {
        self.stop.is_set() || self.cancel.is_set()
    }

    pub fn run(&self) -> PollOutcome {
        tracing::info!(target: "runtime", "redirect loop started for {}", self.server_url);
        let start = Instant::now();
        let mut attempts = 0u32;
        self.ui.set_status(STATUS_WAITING_FOR_SERVER);

        let outcome = loop {
            if self.is_cancelled() {
                break PollOutcome::Cancelled;
            }
            if start.elapsed() >= self.max_wait {
                tracing::warn!(
                    target: "runtime",
                    "server not available after {}ms ({attempts} checks)",
                    self.max_wait.as_millis()
                );
                if !self.cancel.is_set() {
                    self.ui.show_error(REDIRECT_TIMEOUT_MESSAGE);
                }
                break PollOutcome::TimedOut;
            }

            attempts += 1;
            if self.probe.is_available(1, AVAILABILITY_CHECK_DELAY) {
                break self.redirect();
            }
            tracing::debug!(
                target: "runtime",
                "server not yet available, retrying in {}ms",
                self.check_interval.as_millis()
            );

            let wait = self
                .check_interval
                .min(self.max_wait.saturating_sub(start.elapsed()));
            if Latch::wait_any_timeout(&[&self.stop, &self.cancel], wait).is_some() {
                break PollOutcome::Cancelled;
            }
        };

        tracing::info!(target: "runtime", "redirect loop finished: {outcome:?} after {attempts} checks");
        outcome
    }

    fn redirect(&self) -> PollOutcome {
        tracing::info!(target: "runtime", "server is available, redirecting to {}", self.server_url);
        if !self.fade.is_zero()
            && Latch::wait_any_timeout(&[&self.stop, &self.cancel], self.fade).is_some()
        {
            return PollOutcome::Cancelled;
        }
        if self.is_cancelled() {
            return PollOutcome::Cancelled;
        }
        self.ui.navigate(&self.server_url);
        self.ui.set_status(STATUS_CONNECTED);
        PollOutcome::Connected
    }
}
