//! SIGINT dispositions for a parked session.
//!
//! The client forwards terminal signals to the worker's process group, so a
//! `^C` typed at a shell prompt would kill a worker that is merely waiting
//! for its next command. Between commands SIGINT is therefore ignored
//! (unless `server.shutdown-on-interrupt` asks for the opposite) and only
//! restored to the default while a command is actually running. Whatever
//! disposition the process started with comes back on teardown.

use nix::sys::signal::{SigHandler, Signal, signal};

pub struct InterruptPolicy {
    idle: SigHandler,
    previous: SigHandler,
}

impl InterruptPolicy {
    /// Install the idle disposition and remember the one it replaced.
    #[allow(unsafe_code)]
    pub fn install(shutdown_on_interrupt: bool) -> nix::Result<InterruptPolicy> {
        let idle = if shutdown_on_interrupt {
            SigHandler::SigDfl
        } else {
            SigHandler::SigIgn
        };
        // SAFETY: only SigIgn/SigDfl are installed, no handler code runs
        let previous = unsafe { signal(Signal::SIGINT, idle) }?;
        Ok(InterruptPolicy { idle, previous })
    }

    /// Default disposition for the duration of one command, so an
    /// interrupt aborts the command instead of being swallowed. The guard
    /// puts the idle disposition back.
    #[allow(unsafe_code)]
    pub fn dispatching(&self) -> nix::Result<DispatchGuard> {
        // SAFETY: disposition-only change
        unsafe { signal(Signal::SIGINT, SigHandler::SigDfl) }?;
        Ok(DispatchGuard { idle: self.idle })
    }
}

impl Drop for InterruptPolicy {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: restores a disposition observed earlier on this process
        let _ = unsafe { signal(Signal::SIGINT, self.previous) };
    }
}

pub struct DispatchGuard {
    idle: SigHandler,
}

impl Drop for DispatchGuard {
    #[allow(unsafe_code)]
    fn drop(&mut self) {
        // SAFETY: disposition-only change
        let _ = unsafe { signal(Signal::SIGINT, self.idle) };
    }
}
