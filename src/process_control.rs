#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;
use std::{
    io,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use crate::{FORCE_KILL_RETRY_MAX_WAIT_MS, FORCE_KILL_RETRY_MIN_WAIT_MS, STOP_REQUEST_FAILURE_WAIT_MS};
#[cfg(target_os = "windows")]
use crate::CREATE_NO_WINDOW;
#[cfg(target_os = "windows")]
use windows_sys::Win32::System::Console::{GenerateConsoleCtrlEvent, CTRL_BREAK_EVENT};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a graceful-then-forced termination attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationOutcome {
    /// Nothing tracked, or the process had already exited.
    NotRunning,
    /// Exited within the grace period after the polite signal.
    Graceful,
    /// Exited after a forced kill.
    Forced,
    /// Still reported alive after every escalation step.
    Unconfirmed,
}

/// OS signalling used by the supervisor. Errors are advisory: callers log them
/// and move on to the next escalation step.
pub trait ProcessSignals: Send + Sync {
    /// Polite stop request addressed to the child's whole process group.
    fn request_stop(&self, child: &mut Child) -> io::Result<()>;
    /// Unconditional kill of the child and, where supported, its group.
    fn force_kill(&self, child: &mut Child) -> io::Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct OsProcessSignals;

#[cfg(unix)]
impl ProcessSignals for OsProcessSignals {
    fn request_stop(&self, child: &mut Child) -> io::Result<()> {
        let pid = child.id() as libc::pid_t;
        // SAFETY: killpg only reads its integer arguments.
        if unsafe { libc::killpg(pid, libc::SIGTERM) } == 0 {
            return Ok(());
        }
        let group_error = io::Error::last_os_error();
        tracing::debug!(
            target: "shutdown",
            "SIGTERM to process group {pid} failed ({group_error}), signalling pid directly"
        );
        // SAFETY: as above.
        if unsafe { libc::kill(pid, libc::SIGTERM) } == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    fn force_kill(&self, child: &mut Child) -> io::Result<()> {
        let pid = child.id() as libc::pid_t;
        // SAFETY: killpg only reads its integer arguments.
        if unsafe { libc::killpg(pid, libc::SIGKILL) } != 0 {
            tracing::debug!(
                target: "shutdown",
                "SIGKILL to process group {pid} failed: {}",
                io::Error::last_os_error()
            );
        }
        child.kill()
    }
}

#[cfg(target_os = "windows")]
impl ProcessSignals for OsProcessSignals {
    fn request_stop(&self, child: &mut Child) -> io::Result<()> {
        // The child was spawned with CREATE_NEW_PROCESS_GROUP, so its pid is
        // also the group id.
        let group = child.id();
        // SAFETY: plain value arguments; no pointers are passed.
        if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, group) } != 0 {
            tracing::debug!(target: "shutdown", "sent CTRL_BREAK_EVENT to process group {group}");
            return Ok(());
        }
        Err(io::Error::last_os_error())
    }

    fn force_kill(&self, child: &mut Child) -> io::Result<()> {
        let pid_arg = child.id().to_string();
        let tree_kill = status_to_result(run_stop_command(
            child.id(),
            "taskkill force stop",
            "taskkill",
            &["/pid", &pid_arg, "/t", "/f"],
        ));
        child.kill().or(tree_kill)
    }
}

#[cfg(target_os = "windows")]
fn status_to_result(status: io::Result<ExitStatus>) -> io::Result<()> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(io::Error::other(format!("exited with {status}"))),
        Err(error) => Err(error),
    }
}

pub fn wait_for_child_exit(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return None;
                }
                thread::sleep(EXIT_POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
            }
            Err(error) => {
                tracing::warn!(
                    target: "shutdown",
                    "failed to poll child status: pid={}, error={error}",
                    child.id()
                );
                return None;
            }
        }
    }
}

/// Runs a short-lived helper tool (`kill`, `taskkill`) with all stdio detached.
pub fn run_stop_command(
    pid: u32,
    label: &str,
    program: &str,
    args: &[&str],
) -> io::Result<ExitStatus> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .stdin(Stdio::null());
    #[cfg(target_os = "windows")]
    {
        // Avoid flashing transient console windows when invoking taskkill.
        command.creation_flags(CREATE_NO_WINDOW);
    }
    let status = command.status();

    match &status {
        Ok(exit_status) if exit_status.success() => {}
        Ok(exit_status) => tracing::warn!(
            target: "shutdown",
            "{label} returned non-zero: pid={pid}, status={exit_status:?}"
        ),
        Err(error) => tracing::warn!(
            target: "shutdown",
            "{label} failed to start: pid={pid}, error={error}"
        ),
    }

    status
}

fn compute_retry_wait(force_wait: Duration, max_retry_wait: Duration) -> Duration {
    if force_wait.is_zero() {
        Duration::ZERO
    } else {
        (force_wait / 4)
            .max(Duration::from_millis(FORCE_KILL_RETRY_MIN_WAIT_MS))
            .min(max_retry_wait)
    }
}

fn resolve_graceful_wait(
    pid: u32,
    grace: Duration,
    failure_wait_cap: Duration,
    stop_request: &io::Result<()>,
) -> Duration {
    match stop_request {
        Ok(()) => grace,
        Err(error) => {
            let shortened = grace.min(failure_wait_cap);
            tracing::warn!(
                target: "shutdown",
                "stop request failed; shorten graceful wait: pid={pid}, error={error}, requested_wait_ms={}, effective_wait_ms={}",
                grace.as_millis(),
                shortened.as_millis()
            );
            shortened
        }
    }
}

/// Polite signal, bounded wait, then forced kill with one retry.
/// `on_escalate` runs once, right before the first forced kill.
pub fn stop_child_process_gracefully<F>(
    child: &mut Child,
    signals: &dyn ProcessSignals,
    grace: Duration,
    force_wait: Duration,
    on_escalate: F,
) -> TerminationOutcome
where
    F: FnOnce(),
{
    let pid = child.id();
    match child.try_wait() {
        Ok(Some(status)) => {
            tracing::info!(target: "shutdown", "server process already exited: pid={pid}, status={status}");
            return TerminationOutcome::NotRunning;
        }
        Ok(None) => {}
        Err(error) => tracing::warn!(
            target: "shutdown",
            "failed to poll server process before stop: pid={pid}, error={error}"
        ),
    }

    let stop_request = signals.request_stop(child);
    let graceful_wait = resolve_graceful_wait(
        pid,
        grace,
        Duration::from_millis(STOP_REQUEST_FAILURE_WAIT_MS),
        &stop_request,
    );
    if let Some(status) = wait_for_child_exit(child, graceful_wait) {
        tracing::info!(target: "shutdown", "server process exited gracefully: pid={pid}, status={status}");
        return TerminationOutcome::Graceful;
    }

    tracing::warn!(
        target: "shutdown",
        "server process ignored stop request for {}ms, forcing kill: pid={pid}",
        graceful_wait.as_millis()
    );
    on_escalate();
    if let Err(error) = signals.force_kill(child) {
        tracing::warn!(target: "shutdown", "forced kill reported an error: pid={pid}, error={error}");
    }
    let retry_wait = compute_retry_wait(
        force_wait,
        Duration::from_millis(FORCE_KILL_RETRY_MAX_WAIT_MS),
    );
    if let Some(status) = wait_for_child_exit(child, retry_wait) {
        tracing::info!(target: "shutdown", "server process force-killed: pid={pid}, status={status}");
        return TerminationOutcome::Forced;
    }

    tracing::warn!(target: "shutdown", "server process still alive after forced kill, retrying: pid={pid}");
    if let Err(error) = signals.force_kill(child) {
        tracing::warn!(target: "shutdown", "forced kill retry reported an error: pid={pid}, error={error}");
    }
    match wait_for_child_exit(child, force_wait) {
        Some(status) => {
            tracing::info!(target: "shutdown", "server process force-killed on retry: pid={pid}, status={status}");
            TerminationOutcome::Forced
        }
        None => {
            tracing::error!(
                target: "shutdown",
                "server process did not terminate after forced kill and {}ms wait: pid={pid}",
                force_wait.as_millis()
            );
            TerminationOutcome::Unconfirmed
        }
    }
}
