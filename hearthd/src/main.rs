//! Hearth command server daemon.
//!
//! Binds the hash-qualified Unix socket, keeps the plain base address
//! pointing at it via a symlink, and turns every accepted connection into
//! one `hearth-wkr serve` process. The daemon itself never speaks the
//! channel protocol; it only listens, spawns, reaps and retires itself when
//! idle or when a newer server takes the base address.

#![forbid(unsafe_code)]

mod repocache;
mod workers;

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use tokio::net::{UnixDatagram, UnixListener};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use hearth_common::address::{default_base_address, hash_address};
use hearth_common::config::{Config, LoadOptions};
use hearth_common::hashstate::{HashState, ServerHandoff};
use hearth_common::logging::{LogConfig, init_logging};

use crate::repocache::RepoCache;
use crate::workers::WorkerSet;

#[derive(Parser)]
#[command(name = "hearthd")]
#[command(version, about = "Hearth command server daemon")]
struct Cli {
    /// Base socket address (default: `server.socket-path`, else the
    /// per-user runtime directory)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Extra configuration, `section.key=value`, applied last
    #[arg(long, value_name = "ITEM")]
    config: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(&LoadOptions::standard())?;
    for spec in &cli.config {
        config.apply_override(spec)?;
    }

    let mut log = LogConfig::from_env("info").with_stderr();
    if let Some(dir) = config.log_dir() {
        log = log.with_file(dir, "hearthd");
    }
    let _guards = init_logging(&log);

    let base = cli
        .socket
        .clone()
        .unwrap_or_else(|| default_base_address(&config));
    let hash = HashState::compute(&config);
    let qualified = hash_address(&base, &hash.config_hash);
    prepare_socket_dir(&qualified)?;

    let std_listener = bind_listener(&qualified)?;
    std_listener.set_nonblocking(true)?;
    let listener = UnixListener::from_std(std_listener)?;
    publish_symlink(&base, &qualified)?;

    let mailbox_path = qualified.with_extension("mailbox");
    let _ = fs::remove_file(&mailbox_path);
    let mailbox = UnixDatagram::bind(&mailbox_path)?;

    let handoff = ServerHandoff {
        base_address: base.clone(),
        address: qualified.clone(),
        hash,
        mailbox: Some(mailbox_path.clone()),
    };

    info!(
        address = %qualified.display(),
        base = %base.display(),
        pid = std::process::id(),
        "listening"
    );

    let outcome = serve(&listener, &mailbox, &config, &handoff).await;

    // the qualified name goes first so nobody new can dial us, then the
    // connections already in the backlog get their workers
    let _ = fs::remove_file(&qualified);
    drain_backlog(&listener, &handoff).await;
    if owns_base(&base, &qualified) {
        let _ = fs::remove_file(&base);
    }
    let _ = fs::remove_file(&mailbox_path);
    info!("daemon stopped");
    outcome
}

async fn serve(
    listener: &UnixListener,
    mailbox: &UnixDatagram,
    config: &Config,
    handoff: &ServerHandoff,
) -> Result<()> {
    let mut live = WorkerSet::new();
    let mut cache = RepoCache::new(config.repo_cache_size());
    let mut sigchld = signal(SignalKind::child())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut tick = tokio::time::interval(config.poll_interval());
    let idle_timeout = config.idle_timeout();
    let mut last_activity = Instant::now();
    let mut buf = vec![0u8; 8192];

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    last_activity = Instant::now();
                    match adopt(stream) {
                        Ok(stream) => match workers::spawn_worker(stream, handoff) {
                            Ok(pid) => {
                                live.insert(pid);
                                info!(pid, live = live.len(), "worker spawned");
                            }
                            Err(err) => warn!(%err, "cannot spawn worker"),
                        },
                        Err(err) => warn!(%err, "cannot adopt connection"),
                    }
                }
                Err(err) => warn!(%err, "accept failed"),
            },
            received = mailbox.recv(&mut buf) => match received {
                Ok(n) => {
                    last_activity = Instant::now();
                    if let Some(notice) = repocache::parse_notice(&buf[..n])
                        && notice.notice == "repo-closed"
                    {
                        cache.refresh(&notice.root);
                    }
                }
                Err(err) => warn!(%err, "mailbox receive failed"),
            },
            _ = sigchld.recv() => {
                let reaped = live.reap();
                if reaped > 0 {
                    debug!(reaped, live = live.len(), "reaped workers");
                }
            }
            _ = sigterm.recv() => {
                info!("terminating on SIGTERM");
                return Ok(());
            }
            _ = sigint.recv() => {
                info!("terminating on SIGINT");
                return Ok(());
            }
            _ = tick.tick() => {
                live.reap();
                if !owns_base(&handoff.base_address, &handoff.address) {
                    info!("base address taken over, retiring");
                    return Ok(());
                }
                if live.is_empty() && last_activity.elapsed() >= idle_timeout {
                    info!(idle = ?idle_timeout, "idle timeout reached");
                    return Ok(());
                }
            }
        }
    }
}

/// Move an accepted connection back to a blocking descriptor fit for a
/// worker's stdin.
fn adopt(stream: tokio::net::UnixStream) -> io::Result<std::os::unix::net::UnixStream> {
    let stream = stream.into_std()?;
    stream.set_nonblocking(false)?;
    Ok(stream)
}

/// Bind under a temporary name, then rename onto the qualified address.
/// The rename is atomic, so the published name either resolves to a dead
/// socket or to a fully bound one, never to a half-created file.
fn bind_listener(qualified: &Path) -> io::Result<std::os::unix::net::UnixListener> {
    let staging = qualified.with_extension(format!("tmp{}", std::process::id()));
    let _ = fs::remove_file(&staging);
    let listener = std::os::unix::net::UnixListener::bind(&staging)?;
    fs::rename(&staging, qualified)?;
    Ok(listener)
}

/// Point the plain base address at the hash-qualified socket, atomically.
/// The target is just the file name: both live in the same directory and a
/// relative link survives the directory moving.
fn publish_symlink(base: &Path, qualified: &Path) -> io::Result<()> {
    let Some(name) = qualified.file_name() else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "socket address has no file name",
        ));
    };
    let staging = base.with_extension(format!("lnk{}", std::process::id()));
    let _ = fs::remove_file(&staging);
    std::os::unix::fs::symlink(name, &staging)?;
    fs::rename(&staging, base)?;
    Ok(())
}

/// Whether the base symlink still names our socket. A fresh server with a
/// different config hash replaces the link; the old daemon notices on its
/// next tick and retires.
fn owns_base(base: &Path, qualified: &Path) -> bool {
    match (fs::read_link(base), qualified.file_name()) {
        (Ok(target), Some(name)) => target.as_os_str() == name || target == *qualified,
        _ => false,
    }
}

/// Sockets live in a private directory; create it with owner-only access
/// when it does not exist yet.
fn prepare_socket_dir(qualified: &Path) -> io::Result<()> {
    let Some(dir) = qualified.parent() else {
        return Ok(());
    };
    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::create_dir_all(dir)?;
    fs::set_permissions(dir, fs::Permissions::from_mode(0o700))
}

/// Serve connections that reached the backlog before the unlink; they
/// dialed a name that still existed and deserve a worker.
async fn drain_backlog(listener: &UnixListener, handoff: &ServerHandoff) {
    while let Ok(Ok((stream, _))) =
        tokio::time::timeout(Duration::from_millis(10), listener.accept()).await
    {
        match adopt(stream).and_then(|s| workers::spawn_worker(s, handoff)) {
            Ok(pid) => info!(pid, "worker spawned for backlogged connection"),
            Err(err) => warn!(%err, "cannot serve backlogged connection"),
        }
    }
}
