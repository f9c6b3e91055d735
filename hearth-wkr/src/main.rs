//! Session worker: one process per accepted connection.
//!
//! `hearthd` accepts a connection and spawns this binary with the socket on
//! stdin. The worker immediately moves the socket off fd 0, parks
//! `/dev/null` there, and speaks the framed channel protocol until the
//! client hangs up. Because every session is its own OS process, `chdir`,
//! `setenv` and `setumask` requests mutate plain process state and commands
//! run exactly as they would in a short-lived invocation.

mod attach;
mod commands;
mod procstate;
mod session;
mod signals;
mod ui;

use std::fs::File;
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::net::UnixStream;

use anyhow::Context;
use clap::{Parser, Subcommand};
use hearth_common::address::{default_base_address, hash_address};
use hearth_common::config::{Config, LoadOptions};
use hearth_common::hashstate::{HANDOFF_ENV, HashState, ServerHandoff};
use hearth_common::logging::{LogConfig, init_logging};
use nix::unistd::{dup, dup2};
use tracing::{debug, info};

use crate::session::Session;

#[derive(Parser)]
#[command(name = "hearth-wkr", version, about = "Hearth session worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve one client session over the socket passed as stdin.
    Serve,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve => serve(),
    }
}

fn serve() -> anyhow::Result<()> {
    let stream = takeover_stdin().context("adopting the connection socket")?;
    let config = Config::load(&LoadOptions::standard())?;

    let mut log = LogConfig::from_env("warn").with_stderr();
    if let Some(dir) = config.log_dir() {
        log = log.with_file(dir, "hearth-wkr");
    }
    let _guards = init_logging(&log);

    let handoff = match std::env::var(HANDOFF_ENV) {
        Ok(raw) => ServerHandoff::decode(&raw).context("decoding server handoff")?,
        // Direct invocation (tests, debugging): stand in for a one-shot
        // server with a freshly computed baseline.
        Err(_) => {
            let base_address = default_base_address(&config);
            let hash = HashState::compute(&config);
            let address = hash_address(&base_address, &hash.config_hash);
            ServerHandoff {
                base_address,
                address,
                hash,
                mailbox: None,
            }
        }
    };

    info!(pid = std::process::id(), "session start");
    let mut session = Session::new(stream, config, handoff)?;
    match session.run() {
        Ok(()) => {
            info!("session end");
            Ok(())
        }
        Err(err) if err.is_disconnect() => {
            debug!("client disconnected");
            Ok(())
        }
        Err(err) => Err(err).context("session failed"),
    }
}

/// The accepted connection arrives as fd 0. Duplicate it onto a fresh
/// descriptor and put `/dev/null` on 0 so command stdio can never write
/// into the protocol stream.
#[allow(unsafe_code)]
fn takeover_stdin() -> anyhow::Result<UnixStream> {
    let fd = dup(0).context("duplicating stdin")?;
    // SAFETY: fd was just created by dup and has no other owner
    let stream = unsafe { UnixStream::from_raw_fd(fd) };
    let devnull = File::open("/dev/null")?;
    dup2(devnull.as_raw_fd(), 0).context("parking /dev/null on stdin")?;
    Ok(stream)
}
