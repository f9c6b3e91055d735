//! Worker process pool.
//!
//! Every accepted connection becomes one `hearth-wkr serve` process with the
//! connection socket as its stdin and the daemon's baseline hash state in the
//! environment. The daemon only remembers pids; workers own their sessions
//! outright and keep running through a daemon restart.

use std::collections::HashSet;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use tracing::{debug, warn};

use hearth_common::hashstate::{HANDOFF_ENV, ServerHandoff};

/// Spawn one session worker for an accepted connection. The worker gets its
/// own process group so client-side signal forwarding reaches the whole
/// command, not the daemon.
pub fn spawn_worker(stream: UnixStream, handoff: &ServerHandoff) -> io::Result<u32> {
    let encoded = handoff.encode().map_err(io::Error::other)?;
    let child = Command::new(worker_binary())
        .arg("serve")
        .stdin(Stdio::from(OwnedFd::from(stream)))
        .env(HANDOFF_ENV, encoded)
        .process_group(0)
        .spawn()?;
    Ok(child.id())
}

/// The worker binary ships next to the daemon; fall back to `$PATH` for
/// development layouts.
fn worker_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("hearth-wkr");
        if sibling.is_file() {
            return sibling;
        }
    }
    PathBuf::from("hearth-wkr")
}

/// Live worker pids, maintained by reaping.
#[derive(Default)]
pub struct WorkerSet {
    live: HashSet<i32>,
}

impl WorkerSet {
    pub fn new() -> WorkerSet {
        WorkerSet::default()
    }

    pub fn insert(&mut self, pid: u32) {
        self.live.insert(pid as i32);
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Collect every exited child. SIGCHLD coalesces, so one delivery may
    /// cover several exits; loop until the kernel has nothing more for us.
    /// Returns how many entries left the live set.
    pub fn reap(&mut self) -> usize {
        let before = self.live.len();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.live.remove(&pid.as_raw());
                    debug!(pid = pid.as_raw(), code, "worker exited");
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    self.live.remove(&pid.as_raw());
                    debug!(pid = pid.as_raw(), signal = %signal, "worker killed");
                }
                Ok(_) => break,
                Err(Errno::ECHILD) => {
                    // no children at all: anything still recorded is stale
                    self.live.clear();
                    break;
                }
                Err(Errno::EINTR) => continue,
                Err(err) => {
                    warn!(%err, "waitpid failed");
                    break;
                }
            }
        }
        before - self.live.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::time::{Duration, Instant};

    fn spawn_exiting(code: i32) -> u32 {
        Command::new("/bin/sh")
            .arg("-c")
            .arg(format!("exit {code}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .spawn()
            .unwrap()
            .id()
    }

    fn reap_until_empty(set: &mut WorkerSet) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !set.is_empty() {
            set.reap();
            if Instant::now() > deadline {
                panic!("workers never reaped, {} left", set.len());
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    #[serial]
    fn reap_drains_every_exited_child() {
        let mut set = WorkerSet::new();
        for code in 0..3 {
            set.insert(spawn_exiting(code));
        }
        assert_eq!(set.len(), 3);
        reap_until_empty(&mut set);
    }

    #[test]
    #[serial]
    fn echild_clears_stale_pids() {
        let mut set = WorkerSet::new();
        // a pid this process never spawned
        set.insert(0x7fff_fff0);
        set.reap();
        assert!(set.is_empty());
    }

    #[test]
    #[serial]
    fn reap_reports_how_many_left() {
        let mut set = WorkerSet::new();
        set.insert(spawn_exiting(0));
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut total = 0;
        while total == 0 && Instant::now() < deadline {
            total += set.reap();
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(total, 1);
    }

    #[test]
    fn worker_binary_is_named_after_the_worker() {
        assert_eq!(worker_binary().file_name().unwrap(), "hearth-wkr");
    }
}
