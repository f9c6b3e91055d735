//! Connection establishment.
//!
//! The client dials the hash-qualified address derived from its own
//! configuration, starting a daemon when nobody is listening, then attaches
//! its real stdio and lets `validate` decide whether this server may run
//! the command. Instructions can move the client to another address a
//! bounded number of times before it gives up.

use std::fs;
use std::io::{self, IoSlice, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
use rand::Rng;
use tracing::{debug, warn};

use hearth_common::address::{default_base_address, hash_address};
use hearth_common::client::{ClientConn, Event};
use hearth_common::config::Config;
use hearth_common::errors::ProtocolError;
use hearth_common::hashstate::{HashState, Instruction, parse_instructions};
use hearth_common::message::{self, Value};
use hearth_common::protocol::{channel, join_nul, read_frame};

/// How many redirect/reconnect rounds before declaring the servers confused.
const CONNECT_ATTEMPTS: usize = 10;
/// How long a freshly started daemon gets to bind its socket.
const START_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Connector {
    base: PathBuf,
    hash: HashState,
}

impl Connector {
    pub fn new(config: &Config) -> Connector {
        let base = default_base_address(config);
        let hash = HashState::compute(config);
        Connector { base, hash }
    }

    /// Produce a validated session: dial, attach stdio, and obey whatever
    /// `validate` says about the command line until a server takes it.
    pub fn establish(&self, argv: &[Vec<u8>]) -> Result<ClientConn> {
        let mut address = hash_address(&self.base, &self.hash.config_hash);
        for _ in 0..CONNECT_ATTEMPTS {
            let mut conn = self.dial(&address)?;
            attach_stdio(&mut conn)?;
            let instructions = validate(&mut conn, argv)?;
            let mut redirect = None;
            let mut reconnect = false;
            for instruction in instructions {
                match instruction {
                    Instruction::Unlink(path) => {
                        debug!(path = %path.display(), "unlinking stale socket");
                        let _ = fs::remove_file(&path);
                    }
                    Instruction::Reconnect => reconnect = true,
                    Instruction::Redirect(path) => redirect = Some(path),
                    Instruction::Exit(code) => std::process::exit(code),
                }
            }
            match redirect {
                // a redirect names the right server outright and wins over
                // a bare reconnect
                Some(path) => address = path,
                None if reconnect => {}
                None => return Ok(conn),
            }
        }
        bail!("server validation did not settle after {CONNECT_ATTEMPTS} attempts");
    }

    fn dial(&self, address: &Path) -> Result<ClientConn> {
        match ClientConn::connect(address) {
            Ok(conn) => return Ok(conn),
            Err(err) if !is_dead_address(&err) => {
                return Err(err).context("connecting to the command server");
            }
            Err(err) => debug!(%err, address = %address.display(), "no server, starting one"),
        }
        self.autostart()?;

        let deadline = Instant::now() + START_TIMEOUT;
        let mut delay = Duration::from_millis(10);
        let mut rng = rand::rng();
        loop {
            match ClientConn::connect(address) {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if Instant::now() >= deadline {
                        return Err(err).with_context(|| {
                            format!("server never bound {}", address.display())
                        });
                    }
                    // jittered backoff keeps a burst of clients from
                    // hammering the half-started daemon in lockstep
                    let jitter = rng.random_range(0..=delay.as_millis() as u64 / 2);
                    std::thread::sleep(delay + Duration::from_millis(jitter));
                    delay = (delay * 2).min(Duration::from_millis(500));
                }
            }
        }
    }

    /// Start a daemon for our base address, fully detached: no shared
    /// stdio, its own process group, never waited on.
    fn autostart(&self) -> Result<()> {
        let child = Command::new(daemon_binary())
            .arg("--socket")
            .arg(&self.base)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .context("starting hearthd")?;
        debug!(pid = child.id(), "hearthd spawned");
        Ok(())
    }
}

/// A connect failure that means "no live server", as opposed to one worth
/// reporting (permissions, protocol garbage).
fn is_dead_address(err: &ProtocolError) -> bool {
    match err {
        ProtocolError::Io(io) => matches!(
            io.kind(),
            io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
        ),
        _ => false,
    }
}

fn daemon_binary() -> PathBuf {
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        let sibling = dir.join("hearthd");
        if sibling.is_file() {
            return sibling;
        }
    }
    PathBuf::from("hearthd")
}

/// Hand the server our real stdin/stdout/stderr. After this the command's
/// output bypasses the framed channels entirely.
fn attach_stdio(conn: &mut ClientConn) -> Result<()> {
    if !conn.hello.has_capability("attachio") {
        return Ok(());
    }
    conn.send_command("attachio")?;
    match conn.read_event()? {
        Event::InputRequest { max: 1 } => {}
        other => bail!("unexpected attach acknowledgement: {other:?}"),
    }
    send_fds(conn.stream(), &[0, 1, 2])?;
    match conn.read_event()? {
        Event::Result(3) => Ok(()),
        Event::Result(n) => bail!("server attached {n} of 3 descriptors"),
        other => bail!("unexpected attach reply: {other:?}"),
    }
}

fn send_fds(stream: &UnixStream, fds: &[RawFd]) -> io::Result<()> {
    let iov = [IoSlice::new(b"\0")];
    let rights = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(stream.as_raw_fd(), &iov, &rights, MsgFlags::empty(), None)?;
    Ok(())
}

fn validate(conn: &mut ClientConn, argv: &[Vec<u8>]) -> Result<Vec<Instruction>> {
    if !conn.hello.has_capability("validate") {
        return Ok(Vec::new());
    }
    let payload = join_nul(argv.iter().map(|a| a.as_slice()));
    conn.send_command_with_data("validate", &payload)?;
    // the reply is instruction text on `r`, not a result code, so it
    // bypasses the event decoder. A server that cannot take the command
    // explains itself on the byte channels first; relay that before the
    // instructions land.
    loop {
        let frame = read_frame(&mut conn.stream())?;
        match frame.channel {
            channel::RESULT => return Ok(parse_instructions(&frame.payload)?),
            channel::OUTPUT => io::stdout().write_all(&frame.payload)?,
            channel::ERROR | channel::DEBUG => io::stderr().write_all(&frame.payload)?,
            channel::MESSAGE => {
                if let Ok(map) = message::decode(&frame.payload)
                    && let Some(Value::Str(text)) = map.get("data")
                {
                    io::stderr().write_all(text.as_bytes())?;
                }
            }
            other => bail!("validate reply arrived on channel {:?}", other as char),
        }
    }
}

/// Mirror this process's environment, working directory and umask into the
/// worker so the command behaves exactly like a direct invocation.
pub fn send_process_state(conn: &mut ClientConn) -> Result<()> {
    if conn.hello.has_capability("setenv") {
        let block = join_nul(std::env::vars_os().map(|(key, value)| {
            let mut item = key.as_bytes().to_vec();
            item.push(b'=');
            item.extend_from_slice(value.as_bytes());
            item
        }));
        conn.send_command_with_data("setenv", &block)?;
    }
    if conn.hello.has_capability("chdir")
        && let Ok(cwd) = std::env::current_dir()
    {
        conn.send_command(&format!("chdir {}", cwd.display()))?;
    }
    if conn.hello.has_capability("setumask2") {
        conn.send_command_with_data("setumask2", &current_umask().to_be_bytes())?;
    } else {
        warn!("server cannot mirror our umask");
    }
    Ok(())
}

/// The umask is write-only; read it by setting and restoring.
fn current_umask() -> u32 {
    let previous = nix::sys::stat::umask(nix::sys::stat::Mode::empty());
    nix::sys::stat::umask(previous);
    previous.bits() as u32
}
