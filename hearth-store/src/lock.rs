//! Advisory repository locks.
//!
//! Two locks guard a repository: the working lock (`wlock`) for everything
//! outside `store/`, and the store lock for the logs. Both are `flock`-style
//! advisory locks held for the lifetime of a guard. The lock file carries a
//! `host:pid` note so a blocked caller can say who it is waiting for; the
//! note is informational, the lock itself is enforced by the kernel.

use std::cell::Cell;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use fs2::FileExt;
use tracing::debug;

use crate::errors::StoreError;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub struct LockGuard {
    file: File,
    desc: String,
    held: Rc<Cell<u32>>,
}

impl LockGuard {
    /// Acquire the lock at `path`. With `wait` unset the attempt is
    /// immediate; otherwise it polls until the deadline, announcing the
    /// holder through `notice` once before the first sleep.
    pub fn acquire(
        path: &Path,
        desc: &str,
        wait: Option<Duration>,
        held: Rc<Cell<u32>>,
        mut notice: impl FnMut(&str),
    ) -> Result<LockGuard, StoreError> {
        let file = open_lock_file(path)?;
        if try_lock(&file)? {
            return Ok(Self::held_guard(file, path, desc, held));
        }

        let deadline = match wait {
            Some(wait) if !wait.is_zero() => Instant::now() + wait,
            _ => {
                return Err(StoreError::LockHeld {
                    desc: desc.to_owned(),
                    holder: read_holder(path),
                });
            }
        };

        notice(&format!(
            "waiting for lock on {} held by {}\n",
            desc,
            read_holder(path)
        ));
        loop {
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
            if try_lock(&file)? {
                return Ok(Self::held_guard(file, path, desc, held));
            }
            if Instant::now() >= deadline {
                return Err(StoreError::LockHeld {
                    desc: desc.to_owned(),
                    holder: read_holder(path),
                });
            }
        }
    }

    fn held_guard(file: File, path: &Path, desc: &str, held: Rc<Cell<u32>>) -> LockGuard {
        // note the holder for whoever waits on us; informational only
        let _ = fs::write(path, format!("{}:{}", hostname(), std::process::id()));
        held.set(held.get() + 1);
        debug!(lock = desc, "acquired");
        LockGuard {
            file,
            desc: desc.to_owned(),
            held,
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(err) = self.file.unlock() {
            debug!(lock = %self.desc, %err, "failed to release");
        }
        self.held.set(self.held.get().saturating_sub(1));
        debug!(lock = %self.desc, "released");
    }
}

fn open_lock_file(path: &Path) -> Result<File, StoreError> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .map_err(StoreError::Io)
}

fn try_lock(file: &File) -> Result<bool, StoreError> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(err) => Err(StoreError::Io(err)),
    }
}

fn read_holder(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(s) if !s.trim().is_empty() => s.trim().to_owned(),
        _ => "unknown process".to_owned(),
    }
}

fn hostname() -> String {
    fs::read_to_string("/proc/sys/kernel/hostname")
        .map(|s| s.trim().to_owned())
        .ok()
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "localhost".to_owned())
}
