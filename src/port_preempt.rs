use std::{
    io,
    net::{TcpStream, ToSocketAddrs},
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

use crate::process_control::run_stop_command;
#[cfg(target_os = "windows")]
use crate::CREATE_NO_WINDOW;

const RECLAIM_POLL_INTERVAL: Duration = Duration::from_millis(100);
const RECLAIM_PROBE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortPreemption {
    /// No other process was listening.
    Free,
    /// A conflicting listener was killed and the port stopped accepting.
    Reclaimed { pid: u32 },
    /// A listener was killed (or kill was attempted) but the port still accepts.
    StillBusy { pid: u32 },
    /// The listener could not be identified or killed.
    Failed(String),
}

/// Force-kills whichever process currently listens on `port`.
/// Never fails: every problem is logged and reported as an outcome.
pub fn preempt_port(port: u16, probe_host: &str, reclaim_wait: Duration) -> PortPreemption {
    tracing::debug!(target: "startup", "checking for processes listening on port {port}");
    let own_pid = std::process::id();
    let pids = match find_listening_pids(port) {
        Ok(pids) => pids,
        Err(error) => {
            tracing::warn!(
                target: "startup",
                "could not inspect listeners on port {port}: {error}"
            );
            return PortPreemption::Failed(format!("listener lookup failed: {error}"));
        }
    };

    let Some(pid) = pids.into_iter().find(|pid| *pid != own_pid) else {
        tracing::debug!(target: "startup", "no conflicting listener on port {port}");
        return PortPreemption::Free;
    };

    tracing::warn!(
        target: "startup",
        "port {port} is in use by pid {pid}, terminating it"
    );
    let kill_status = kill_listener(pid);
    match &kill_status {
        Ok(status) if status.success() => {}
        Ok(_) | Err(_) => {
            if port_accepts(probe_host, port) {
                return PortPreemption::Failed(format!(
                    "failed to kill pid {pid} listening on port {port}"
                ));
            }
        }
    }

    if wait_for_port_release(probe_host, port, reclaim_wait) {
        tracing::info!(target: "startup", "port {port} reclaimed from pid {pid}");
        PortPreemption::Reclaimed { pid }
    } else {
        tracing::warn!(
            target: "startup",
            "port {port} still accepting connections {}ms after killing pid {pid}",
            reclaim_wait.as_millis()
        );
        PortPreemption::StillBusy { pid }
    }
}

#[cfg(unix)]
fn kill_listener(pid: u32) -> io::Result<std::process::ExitStatus> {
    let pid_arg = pid.to_string();
    run_stop_command(pid, "kill -KILL", "kill", &["-KILL", &pid_arg])
}

#[cfg(target_os = "windows")]
fn kill_listener(pid: u32) -> io::Result<std::process::ExitStatus> {
    let pid_arg = pid.to_string();
    run_stop_command(pid, "taskkill force stop", "taskkill", &["/pid", &pid_arg, "/f"])
}

#[cfg(unix)]
fn find_listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let output = Command::new("lsof")
        .args(["-nP", &format!("-iTCP:{port}"), "-sTCP:LISTEN", "-t"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()?;
    // lsof exits 1 when nothing matches.
    Ok(parse_lsof_pids(&String::from_utf8_lossy(&output.stdout)))
}

#[cfg(target_os = "windows")]
fn find_listening_pids(port: u16) -> io::Result<Vec<u32>> {
    let mut command = Command::new("netstat");
    command
        .args(["-ano", "-p", "TCP"])
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .creation_flags(CREATE_NO_WINDOW);
    let output = command.output()?;
    Ok(parse_netstat_pids(&String::from_utf8_lossy(&output.stdout), port))
}

fn parse_lsof_pids(stdout: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for pid in stdout.lines().filter_map(|line| line.trim().parse::<u32>().ok()) {
        if !pids.contains(&pid) {
            pids.push(pid);
        }
    }
    pids
}

#[cfg_attr(not(target_os = "windows"), allow(dead_code))]
fn parse_netstat_pids(stdout: &str, port: u16) -> Vec<u32> {
    let suffix = format!(":{port}");
    let mut pids = Vec::new();
    for line in stdout.lines() {
        let columns: Vec<&str> = line.split_whitespace().collect();
        let [proto, local, _remote, state, pid] = columns.as_slice() else {
            continue;
        };
        if !proto.eq_ignore_ascii_case("TCP")
            || !state.eq_ignore_ascii_case("LISTENING")
            || !local.ends_with(&suffix)
        {
            continue;
        }
        if let Ok(pid) = pid.parse::<u32>() {
            if pid != 0 && !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

fn port_accepts(host: &str, port: u16) -> bool {
    match (host, port).to_socket_addrs() {
        Ok(addrs) => addrs
            .into_iter()
            .any(|address| TcpStream::connect_timeout(&address, RECLAIM_PROBE_TIMEOUT).is_ok()),
        Err(_) => false,
    }
}

fn wait_for_port_release(host: &str, port: u16, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if !port_accepts(host, port) {
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        thread::sleep(RECLAIM_POLL_INTERVAL);
    }
}
