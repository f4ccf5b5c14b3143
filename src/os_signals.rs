use std::{io, thread::JoinHandle};

use crate::coordinator::ShutdownHandle;

#[cfg(unix)]
mod imp {
    use std::{
        io,
        sync::atomic::{AtomicI32, Ordering},
        time::Duration,
    };

    use crate::coordinator::{ShutdownHandle, ShutdownReason};

    const WATCH_INTERVAL: Duration = Duration::from_millis(100);

    static PENDING_SIGNAL: AtomicI32 = AtomicI32::new(0);

    extern "C" fn record_signal(signal: libc::c_int) {
        PENDING_SIGNAL.store(signal, Ordering::SeqCst);
    }

    pub(super) fn install_handlers() -> io::Result<()> {
        for signal in [libc::SIGINT, libc::SIGTERM] {
            let handler = record_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
            // SAFETY: the handler only performs an atomic store, which is
            // async-signal-safe.
            if unsafe { libc::signal(signal, handler) } == libc::SIG_ERR {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub(super) fn signal_name(signal: i32) -> &'static str {
        match signal {
            libc::SIGINT => "SIGINT",
            libc::SIGTERM => "SIGTERM",
            _ => "signal",
        }
    }

    pub(super) fn watch(shutdown: ShutdownHandle) {
        while !shutdown.cancel().wait_timeout(WATCH_INTERVAL) {
            let signal = PENDING_SIGNAL.swap(0, Ordering::SeqCst);
            if signal != 0 {
                tracing::info!(
                    target: "shutdown",
                    "received {}, requesting shutdown",
                    signal_name(signal)
                );
                shutdown.request_shutdown(ShutdownReason::Signal);
                return;
            }
        }
    }
}

/// Routes SIGINT/SIGTERM to `request_shutdown`. The watcher thread exits on
/// its own once the cancellation latch is set. Returns `None` where no
/// handler is installed.
pub fn install_signal_watcher(shutdown: ShutdownHandle) -> io::Result<Option<JoinHandle<()>>> {
    #[cfg(unix)]
    {
        imp::install_handlers()?;
        let handle = std::thread::Builder::new()
            .name("signal-watcher".to_string())
            .spawn(move || imp::watch(shutdown))?;
        Ok(Some(handle))
    }
    #[cfg(not(unix))]
    {
        drop(shutdown);
        tracing::debug!(target: "startup", "OS signal watcher not supported on this platform");
        Ok(None)
    }
}
