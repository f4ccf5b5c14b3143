use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Select, Sender};
use parking_lot::Mutex;

/// One-shot broadcast flag.
///
/// Setting the latch drops the only sender of an internal zero-capacity
/// channel, so every thread blocked in [`Latch::wait_timeout`] (or selecting
/// over several latches) wakes immediately. A latch is never unset.
#[derive(Clone)]
pub struct Latch {
    inner: Arc<LatchInner>,
}

struct LatchInner {
    set: AtomicBool,
    sender: Mutex<Option<Sender<()>>>,
    receiver: Receiver<()>,
}

impl Latch {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(LatchInner {
                set: AtomicBool::new(false),
                sender: Mutex::new(Some(sender)),
                receiver,
            }),
        }
    }

    /// Sets the latch. Returns `true` only for the call that actually flipped it.
    pub fn set(&self) -> bool {
        let sender = self.inner.sender.lock().take();
        let Some(sender) = sender else {
            return false;
        };
        self.inner.set.store(true, Ordering::Release);
        drop(sender);
        true
    }

    pub fn is_set(&self) -> bool {
        self.inner.set.load(Ordering::Acquire)
    }

    /// Blocks for at most `timeout`. Returns whether the latch is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_set() {
            return true;
        }
        match self.inner.receiver.recv_timeout(timeout) {
            Err(RecvTimeoutError::Disconnected) => true,
            Ok(()) | Err(RecvTimeoutError::Timeout) => self.is_set(),
        }
    }

    /// Waits until any of `latches` is set or `timeout` elapses, returning the
    /// index of a set latch.
    pub fn wait_any_timeout(latches: &[&Latch], timeout: Duration) -> Option<usize> {
        if let Some(index) = latches.iter().position(|latch| latch.is_set()) {
            return Some(index);
        }
        if latches.is_empty() {
            return None;
        }

        let mut select = Select::new();
        for latch in latches {
            select.recv(&latch.inner.receiver);
        }
        match select.ready_timeout(timeout) {
            Ok(index) if latches[index].is_set() => Some(index),
            _ => latches.iter().position(|latch| latch.is_set()),
        }
    }
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Latch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Latch").field("set", &self.is_set()).finish()
    }
}
