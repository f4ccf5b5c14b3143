use std::{
    fs::{self, File, OpenOptions},
    net::{TcpStream, ToSocketAddrs},
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::process::CommandExt;
#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use parking_lot::Mutex;

use crate::{
    config::{LauncherConfig, Timeouts},
    error::LaunchError,
    launch_plan::LaunchPlan,
    port_preempt::{self, PortPreemption},
    process_control::{self, OsProcessSignals, ProcessSignals, TerminationOutcome},
};
#[cfg(target_os = "windows")]
use crate::CREATE_NEW_PROCESS_GROUP;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Launching,
    Running,
    GracefulStop,
    ForcedStop,
}

/// What the supervisor knows about the process it launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: Vec<String>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
    pub listen_host: String,
    pub connect_host: String,
    pub port: u16,
}

/// Reaped exit of the tracked process. `code` is `None` when it died from a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub pid: u32,
    pub code: Option<i32>,
}

/// Single-shot TCP reachability check used by the redirect poller.
pub trait AvailabilityProbe: Send + Sync {
    fn is_available(&self, max_attempts: u32, delay: Duration) -> bool;
}

struct SupervisedProcess {
    child: Child,
    info: ProcessInfo,
}

/// Owns the one server process for its whole life: launch, probing, reaping
/// and graceful-then-forced termination.
pub struct ProcessSupervisor {
    plan: LaunchPlan,
    timeouts: Timeouts,
    signals: Arc<dyn ProcessSignals>,
    process: Mutex<Option<SupervisedProcess>>,
    state: Mutex<SupervisorState>,
}

impl ProcessSupervisor {
    pub fn new(config: &LauncherConfig) -> Self {
        Self::with_signals(config, Arc::new(OsProcessSignals))
    }

    pub fn with_signals(config: &LauncherConfig, signals: Arc<dyn ProcessSignals>) -> Self {
        Self {
            plan: LaunchPlan::from_config(config),
            timeouts: config.timeouts,
            signals,
            process: Mutex::new(None),
            state: Mutex::new(SupervisorState::Idle),
        }
    }

    pub fn plan(&self) -> &LaunchPlan {
        &self.plan
    }

    pub fn state(&self) -> SupervisorState {
        *self.state.lock()
    }

    pub fn is_tracked(&self) -> bool {
        self.process.lock().is_some()
    }

    pub fn tracked_pid(&self) -> Option<u32> {
        self.process.lock().as_ref().map(|process| process.info.pid)
    }

    fn set_state(&self, state: SupervisorState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!(target: "runtime", "supervisor state {:?} -> {:?}", *current, state);
            *current = state;
        }
    }

    pub fn preempt_port(&self) -> PortPreemption {
        port_preempt::preempt_port(
            self.plan.port,
            &self.plan.connect_host,
            self.timeouts.port_reclaim(),
        )
    }

    /// Validates the plan, then spawns the server in its own process group with
    /// stdout and stderr merged into `log_sink`, truncated first.
    pub fn launch(&self, log_sink: &Path) -> Result<ProcessInfo, LaunchError> {
        let mut slot = self.process.lock();
        if let Some(existing) = slot.as_mut() {
            match existing.child.try_wait() {
                Ok(Some(status)) => {
                    tracing::info!(
                        target: "startup",
                        "reaping previous server process before relaunch: pid={}, status={status}",
                        existing.info.pid
                    );
                    *slot = None;
                }
                _ => {
                    return Err(LaunchError::AlreadyRunning {
                        pid: existing.info.pid,
                    })
                }
            }
        }

        self.set_state(SupervisorState::Launching);
        match self.spawn_child(log_sink) {
            Ok(process) => {
                let info = process.info.clone();
                *slot = Some(process);
                self.set_state(SupervisorState::Running);
                tracing::info!(
                    target: "startup",
                    "spawned server: pid={}, cmd={:?}, cwd={}, log={}",
                    info.pid,
                    info.command,
                    info.cwd.display(),
                    info.log_path.display()
                );
                Ok(info)
            }
            Err(error) => {
                self.set_state(SupervisorState::Idle);
                tracing::error!(
                    target: "startup",
                    "server launch failed [{}]: {error}",
                    error.as_label()
                );
                Err(error)
            }
        }
    }

    fn spawn_child(&self, log_sink: &Path) -> Result<SupervisedProcess, LaunchError> {
        self.plan.validate()?;

        let stdout_file = open_log_sink(log_sink)?;
        let stderr_file = stdout_file
            .try_clone()
            .map_err(|source| LaunchError::LogSink {
                path: log_sink.to_path_buf(),
                source,
            })?;

        let mut command = Command::new(&self.plan.python);
        command
            .arg(&self.plan.script)
            .args(&self.plan.args)
            .current_dir(&self.plan.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .env("PYTHONUNBUFFERED", "1");
        #[cfg(unix)]
        {
            command.process_group(0);
        }
        #[cfg(target_os = "windows")]
        {
            // Shares the launcher's console so CTRL_BREAK_EVENT can reach the group.
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }

        let debug_command = self.plan.debug_command();
        let child = command.spawn().map_err(|source| LaunchError::Spawn {
            command: debug_command.clone(),
            source,
        })?;

        Ok(SupervisedProcess {
            info: ProcessInfo {
                pid: child.id(),
                command: debug_command,
                cwd: self.plan.cwd.clone(),
                log_path: log_sink.to_path_buf(),
                listen_host: self.plan.listen_host.clone(),
                connect_host: self.plan.connect_host.clone(),
                port: self.plan.port,
            },
            child,
        })
    }

    /// Reaps the tracked process if it has exited on its own.
    pub fn poll_exit(&self) -> Option<ExitReport> {
        let mut slot = self.process.lock();
        let process = slot.as_mut()?;
        match process.child.try_wait() {
            Ok(Some(status)) => {
                let report = ExitReport {
                    pid: process.info.pid,
                    code: status.code(),
                };
                *slot = None;
                self.set_state(SupervisorState::Idle);
                tracing::info!(
                    target: "runtime",
                    "server process exited: pid={}, status={status}",
                    report.pid
                );
                Some(report)
            }
            Ok(None) => None,
            Err(error) => {
                tracing::warn!(
                    target: "runtime",
                    "failed to poll server process: pid={}, error={error}",
                    process.info.pid
                );
                None
            }
        }
    }

    /// Idempotent. The handle is cleared whatever the outcome; the lock is held
    /// for the whole escalation so concurrent callers see `NotRunning`.
    pub fn terminate(&self) -> TerminationOutcome {
        let mut slot = self.process.lock();
        let Some(mut process) = slot.take() else {
            tracing::debug!(target: "shutdown", "terminate: no server process tracked");
            return TerminationOutcome::NotRunning;
        };

        let pid = process.info.pid;
        self.set_state(SupervisorState::GracefulStop);
        let outcome = process_control::stop_child_process_gracefully(
            &mut process.child,
            self.signals.as_ref(),
            self.timeouts.graceful_stop(),
            self.timeouts.force_kill_wait(),
            || self.set_state(SupervisorState::ForcedStop),
        );
        self.set_state(SupervisorState::Idle);
        tracing::info!(target: "shutdown", "server process released: pid={pid}, outcome={outcome:?}");
        drop(slot);
        outcome
    }
}

impl AvailabilityProbe for ProcessSupervisor {
    fn is_available(&self, max_attempts: u32, delay: Duration) -> bool {
        let attempts = max_attempts.max(1);
        for attempt in 1..=attempts {
            if probe_tcp(
                &self.plan.connect_host,
                self.plan.port,
                self.timeouts.probe_connect(),
            ) {
                tracing::debug!(
                    target: "runtime",
                    "server reachable at {}:{} (attempt {attempt})",
                    self.plan.connect_host,
                    self.plan.port
                );
                return true;
            }
            if attempt < attempts {
                thread::sleep(delay);
            }
        }
        false
    }
}

fn open_log_sink(path: &Path) -> Result<File, LaunchError> {
    let to_error = |source| LaunchError::LogSink {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(to_error)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .map_err(to_error)
}

fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
    let timeout = timeout.max(Duration::from_millis(50));
    let addrs = match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs.collect::<Vec<_>>(),
        Err(_) => return false,
    };
    addrs
        .iter()
        .any(|address| TcpStream::connect_timeout(address, timeout).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        env,
        io,
        net::TcpListener,
        sync::atomic::{AtomicUsize, Ordering},
        time::{Instant, SystemTime, UNIX_EPOCH},
    };

    fn create_temp_case_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let dir = env::temp_dir().join(format!(
            "comfyui-launcher-supervisor-test-{}-{}-{}",
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
        kills: AtomicUsize,
    }

    impl ProcessSignals for CountingSignals {
        fn request_stop(&self, child: &mut Child) -> io::Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            OsProcessSignals.request_stop(child)
        }

        fn force_kill(&self, child: &mut Child) -> io::Result<()> {
            self.kills.fetch_add(1, Ordering::SeqCst);
            OsProcessSignals.force_kill(child)
        }
    }

    fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        listener.local_addr().expect("listener addr").port()
    }

    #[cfg(unix)]
    fn shell_supervisor(
        name: &str,
        script: &str,
    ) -> (ProcessSupervisor, Arc<CountingSignals>, PathBuf) {
        let dir = create_temp_case_dir(name);
        fs::write(dir.join("main.py"), script).expect("write child script");
        let mut config = LauncherConfig {
            install_root: dir.clone(),
            python_executable: Some(PathBuf::from("/bin/sh")),
            port: closed_port(),
            ..LauncherConfig::default()
        };
        config.timeouts.graceful_stop_ms = 2_000;
        config.timeouts.force_kill_wait_ms = 2_000;
        let signals = Arc::new(CountingSignals::default());
        let supervisor = ProcessSupervisor::with_signals(&config, signals.clone());
        (supervisor, signals, dir)
    }

    #[cfg(unix)]
    fn wait_for_exit_report(supervisor: &ProcessSupervisor) -> ExitReport {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(report) = supervisor.poll_exit() {
                return report;
            }
            assert!(Instant::now() < deadline, "child did not exit in time");
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn terminate_without_tracked_process_is_a_noop() {
        let signals = Arc::new(CountingSignals::default());
        let supervisor = ProcessSupervisor::with_signals(&LauncherConfig::default(), signals.clone());

        assert_eq!(supervisor.terminate(), TerminationOutcome::NotRunning);
        assert_eq!(supervisor.state(), SupervisorState::Idle);
        assert_eq!(signals.stops.load(Ordering::SeqCst), 0);
        assert_eq!(signals.kills.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn launch_with_missing_install_root_creates_no_handle() {
        let dir = create_temp_case_dir("missing-root");
        let missing = dir.join("not-here");
        let config = LauncherConfig {
            install_root: missing.clone(),
            python_executable: Some(dir.join("python")),
            ..LauncherConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);

        let error = supervisor
            .launch(&dir.join("server.log"))
            .expect_err("launch must fail");
        assert!(error.is_path_error());
        assert!(error.to_string().contains(&missing.display().to_string()));
        assert!(!supervisor.is_tracked());
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[test]
    fn is_available_reports_open_and_closed_ports() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
        let config = LauncherConfig {
            port: listener.local_addr().expect("listener addr").port(),
            ..LauncherConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);
        assert!(supervisor.is_available(1, Duration::from_millis(10)));

        let config = LauncherConfig {
            port: closed_port(),
            ..LauncherConfig::default()
        };
        let supervisor = ProcessSupervisor::new(&config);
        assert!(!supervisor.is_available(2, Duration::from_millis(10)));
    }

    #[cfg(unix)]
    #[test]
    fn terminate_stops_cooperative_child_without_forced_kill() {
        let (supervisor, signals, dir) = shell_supervisor("graceful", "exec sleep 30\n");
        let info = supervisor
            .launch(&dir.join("logs").join("server.log"))
            .expect("launch child");
        assert_eq!(supervisor.tracked_pid(), Some(info.pid));
        assert_eq!(supervisor.state(), SupervisorState::Running);

        assert_eq!(supervisor.terminate(), TerminationOutcome::Graceful);
        assert_eq!(signals.stops.load(Ordering::SeqCst), 1);
        assert_eq!(signals.kills.load(Ordering::SeqCst), 0);
        assert!(!supervisor.is_tracked());
        assert_eq!(supervisor.state(), SupervisorState::Idle);

        assert_eq!(supervisor.terminate(), TerminationOutcome::NotRunning);
        assert_eq!(signals.stops.load(Ordering::SeqCst), 1);

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn terminate_escalates_once_when_child_ignores_sigterm() {
        let (mut supervisor, signals, dir) =
            shell_supervisor("forced", "trap '' TERM\nsleep 30\n");
        supervisor.timeouts.graceful_stop_ms = 300;
        supervisor
            .launch(&dir.join("server.log"))
            .expect("launch child");
        // Give the shell time to install its trap.
        thread::sleep(Duration::from_millis(200));

        assert_eq!(supervisor.terminate(), TerminationOutcome::Forced);
        assert_eq!(signals.kills.load(Ordering::SeqCst), 1);
        assert!(!supervisor.is_tracked());

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn poll_exit_reaps_child_and_reports_exit_code() {
        let (supervisor, signals, dir) = shell_supervisor("exit-code", "exit 3\n");
        let info = supervisor
            .launch(&dir.join("server.log"))
            .expect("launch child");

        let report = wait_for_exit_report(&supervisor);
        assert_eq!(report, ExitReport { pid: info.pid, code: Some(3) });
        assert!(!supervisor.is_tracked());
        assert_eq!(supervisor.poll_exit(), None);
        assert_eq!(supervisor.terminate(), TerminationOutcome::NotRunning);
        assert_eq!(signals.stops.load(Ordering::SeqCst), 0);

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn launch_truncates_log_and_merges_both_streams() {
        let (supervisor, _signals, dir) = shell_supervisor(
            "log-sink",
            "echo \"args: $*\"\necho hello-err 1>&2\n",
        );
        let log_path = dir.join("server.log");
        fs::write(&log_path, "stale output from a previous run\n").expect("seed log");

        supervisor.launch(&log_path).expect("launch child");
        wait_for_exit_report(&supervisor);

        let log = fs::read_to_string(&log_path).expect("read log");
        assert!(!log.contains("stale output"));
        assert!(log.contains("--listen=127.0.0.1"));
        assert!(log.contains("hello-err"));

        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }

    #[cfg(unix)]
    #[test]
    fn second_launch_while_running_is_rejected() {
        let (supervisor, _signals, dir) = shell_supervisor("double-launch", "exec sleep 30\n");
        let info = supervisor
            .launch(&dir.join("server.log"))
            .expect("launch child");

        match supervisor.launch(&dir.join("server.log")) {
            Err(LaunchError::AlreadyRunning { pid }) => assert_eq!(pid, info.pid),
            other => panic!("unexpected relaunch result: {other:?}"),
        }
        assert_eq!(supervisor.tracked_pid(), Some(info.pid));

        supervisor.terminate();
        fs::remove_dir_all(&dir).expect("cleanup temp case dir");
    }
}
