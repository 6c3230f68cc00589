//! OS process control behind a trait, so supervision logic can be tested
//! without real processes.

use std::io;

#[cfg(unix)]
use tracing::debug;

/// Liveness checks and signals for arbitrary pids.
pub trait ProcessOps: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;

    /// Ask the process to shut down gracefully.
    fn terminate(&self, pid: u32) -> io::Result<()>;

    /// Forcefully kill the process and all of its descendants.
    fn kill_tree(&self, pid: u32) -> io::Result<()>;
}

/// Real processes: nix signals on Unix, `taskkill` on Windows.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProcessOps;

/// Pids of every transitive child of `root`, deepest last.
#[must_use]
pub fn descendants(root: u32) -> Vec<u32> {
    use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

    let mut sys = System::new();
    sys.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    let mut found = Vec::new();
    let mut frontier = vec![root];
    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent().map(|p| p.as_u32()) == Some(parent) {
                let child = pid.as_u32();
                if child != root && !found.contains(&child) {
                    found.push(child);
                    frontier.push(child);
                }
            }
        }
    }
    found
}

/// An exited child nobody reaped yet still answers signal 0.
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    use sysinfo::{Pid, ProcessRefreshKind, ProcessStatus, ProcessesToUpdate, System};

    let target = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[target]),
        true,
        ProcessRefreshKind::nothing(),
    );
    sys.process(target)
        .is_some_and(|p| matches!(p.status(), ProcessStatus::Zombie))
}

#[cfg(unix)]
mod imp {
    use {
        nix::{
            errno::Errno,
            sys::signal::{Signal, kill, killpg},
            unistd::Pid,
        },
        std::io,
    };

    fn pid(pid: u32) -> io::Result<Pid> {
        i32::try_from(pid)
            .ok()
            .filter(|p| *p > 0)
            .map(Pid::from_raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))
    }

    pub(super) fn is_alive(raw: u32) -> bool {
        let Ok(target) = pid(raw) else {
            return false;
        };
        // Signal 0 only checks existence; EPERM means it exists but is not ours.
        match kill(target, None) {
            Ok(()) | Err(Errno::EPERM) => !super::is_zombie(raw),
            Err(_) => false,
        }
    }

    pub(super) fn signal(raw: u32, signal: Signal) -> io::Result<()> {
        match kill(pid(raw)?, signal) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(io::Error::from(e)),
        }
    }

    /// Signal the process group led by `raw`, if there is one.
    pub(super) fn signal_group(raw: u32, signal: Signal) {
        if let Ok(group) = pid(raw) {
            let _ = killpg(group, signal);
        }
    }
}

#[cfg(unix)]
impl ProcessOps for SystemProcessOps {
    fn is_alive(&self, pid: u32) -> bool {
        imp::is_alive(pid)
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        imp::signal(pid, nix::sys::signal::Signal::SIGTERM)
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        use nix::sys::signal::Signal;

        // Collect first; killing the root reparents its children.
        let children = descendants(pid);
        debug!(pid, descendants = children.len(), "killing process tree");
        imp::signal_group(pid, Signal::SIGKILL);
        let result = imp::signal(pid, Signal::SIGKILL);
        for child in children {
            let _ = imp::signal(child, Signal::SIGKILL);
        }
        result
    }
}

#[cfg(windows)]
impl ProcessOps for SystemProcessOps {
    fn is_alive(&self, pid: u32) -> bool {
        use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[target]),
            true,
            ProcessRefreshKind::nothing(),
        );
        sys.process(target).is_some()
    }

    fn terminate(&self, pid: u32) -> io::Result<()> {
        taskkill(pid, false)
    }

    fn kill_tree(&self, pid: u32) -> io::Result<()> {
        taskkill(pid, true)
    }
}

#[cfg(windows)]
fn taskkill(pid: u32, force: bool) -> io::Result<()> {
    let mut cmd = std::process::Command::new("taskkill");
    cmd.args(["/PID", &pid.to_string(), "/T"]);
    if force {
        cmd.arg("/F");
    }
    let output = cmd.output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(io::Error::other(String::from_utf8_lossy(&output.stderr).trim().to_string()))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use {
        super::*,
        std::{
            process::{Command, Stdio},
            thread::sleep,
            time::{Duration, Instant},
        },
    };

    fn wait_dead(ops: &SystemProcessOps, pid: u32) -> bool {
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            if !ops.is_alive(pid) {
                return true;
            }
            sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn current_process_is_alive() {
        assert!(SystemProcessOps.is_alive(std::process::id()));
        assert!(!SystemProcessOps.is_alive(0));
    }

    #[test]
    fn kill_tree_takes_down_children() {
        let mut child = Command::new("sh")
            .args(["-c", "sleep 30 & sleep 30 & wait"])
            .stdout(Stdio::null())
            .spawn()
            .unwrap();
        let pid = child.id();
        sleep(Duration::from_millis(200));
        let kids = descendants(pid);

        SystemProcessOps.kill_tree(pid).unwrap();
        let _ = child.wait();
        assert!(!SystemProcessOps.is_alive(pid));
        for kid in kids {
            assert!(wait_dead(&SystemProcessOps, kid), "descendant {kid} survived");
        }
    }

    #[test]
    fn terminate_is_graceful_signal() {
        let mut child = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        SystemProcessOps.terminate(pid).unwrap();
        let status = child.wait().unwrap();
        assert!(!status.success());
    }
}
