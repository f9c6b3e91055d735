//! Thin client for the hearth command server.
//!
//! Argument parsing, config reading and command execution all happen in a
//! session worker. This binary finds (or starts) the daemon whose config
//! hash matches its own, hands over stdio and process state, forwards the
//! command line verbatim, and pumps the few frames that still travel the
//! socket afterwards.

mod connect;

use std::ffi::OsString;
use std::io::{self, BufRead, Read, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::{Command, ExitStatus};
use std::thread;

use anyhow::{Result, bail};
use clap::Parser;
use nix::sys::signal::{SigHandler, Signal, killpg, raise, signal};
use nix::unistd::Pid;
use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use tracing::{debug, warn};

use hearth_common::client::{ClientConn, Event};
use hearth_common::config::{Config, LoadOptions};
use hearth_common::logging::{LogConfig, init_logging};
use hearth_common::message::{self, Value};
use hearth_common::protocol::{join_nul, split_nul_strings};

use connect::Connector;

/// Ceiling on a single input pull. The worker asks for modest chunks; a
/// larger request is a confused peer, not an allocation order.
const MAX_INPUT_PULL: u32 = 1024 * 1024;

/// Command line shuttle. Every argument, flags included, belongs to the
/// server-side parser; nothing is interpreted here.
#[derive(Parser)]
#[command(
    name = "hearth",
    about = "Versioned archive tool (fast client)",
    disable_help_flag = true,
    disable_version_flag = true
)]
struct Cli {
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

fn main() {
    match run() {
        Ok(code) => finish(code),
        Err(err) => {
            eprintln!("abort: {err:#}");
            std::process::exit(255);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let _log = init_logging(&LogConfig::from_env("warn").with_stderr());
    let config = Config::load(&LoadOptions::standard())?;
    let argv: Vec<Vec<u8>> = cli.args.iter().map(|a| a.as_bytes().to_vec()).collect();

    let mut conn = Connector::new(&config).establish(&argv)?;
    debug!(pid = conn.hello.pid, "session worker ready");
    if let Some(pgid) = conn.hello.pgid {
        forward_signals(pgid);
    }
    connect::send_process_state(&mut conn)?;
    run_command(&mut conn, &argv)
}

/// Exit mirroring the worker's verdict: a negative result code names the
/// signal that killed the command, and the shell should see the same one.
fn finish(code: i32) -> ! {
    if code < 0 {
        if let Ok(sig) = Signal::try_from(-code) {
            // SAFETY: resetting the disposition right before the raise;
            // nothing runs past this point.
            #[allow(unsafe_code)]
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
            let _ = raise(sig);
        }
        std::process::exit(128 - code);
    }
    std::process::exit(code);
}

/// Send `runcommand` and pump events until the result code arrives.
///
/// With stdio attached most command output bypasses this loop entirely;
/// what remains are input pulls, system requests and any frames sent
/// before the attach landed.
fn run_command(conn: &mut ClientConn, argv: &[Vec<u8>]) -> Result<i32> {
    let payload = join_nul(argv.iter().map(|a| a.as_slice()));
    conn.send_command_with_data("runcommand", &payload)?;

    let mut stdout = io::stdout().lock();
    let mut stderr = io::stderr().lock();
    loop {
        match conn.read_event()? {
            Event::Output(bytes) => {
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            }
            Event::Error(bytes) | Event::Debug(bytes) => {
                stderr.write_all(&bytes)?;
                stderr.flush()?;
            }
            Event::Message(payload) => render_message(&payload, &mut stderr)?,
            Event::Result(code) => return Ok(code),
            Event::InputRequest { max } => {
                let mut buf = vec![0u8; max.min(MAX_INPUT_PULL) as usize];
                let n = read_stdin_chunk(&mut buf)?;
                conn.write_block(&buf[..n])?;
            }
            Event::LineRequest { max } => {
                let mut line = Vec::new();
                let mut limited = io::stdin().lock().take(u64::from(max));
                limited.read_until(b'\n', &mut line)?;
                conn.write_block(&line)?;
            }
            Event::SystemRequest(payload) => {
                stdout.flush()?;
                stderr.flush()?;
                let rc = run_system(&payload);
                conn.write_block(&rc.to_be_bytes())?;
            }
            Event::Unknown { channel, .. } if channel.is_ascii_uppercase() => {
                bail!("server demanded unknown channel {:?}", channel as char);
            }
            Event::Unknown { channel, payload } => {
                debug!(
                    channel = %(channel as char),
                    bytes = payload.len(),
                    "ignoring optional channel"
                );
            }
        }
    }
}

/// One read from real stdin, retried through signal interruptions.
fn read_stdin_chunk(buf: &mut [u8]) -> io::Result<usize> {
    let mut stdin = io::stdin().lock();
    loop {
        match stdin.read(buf) {
            Ok(n) => return Ok(n),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

/// Show the text of an `m` frame. Metadata beyond `data` is advisory and
/// an undecodable frame is dropped rather than killing the session.
fn render_message(payload: &[u8], sink: &mut impl Write) -> io::Result<()> {
    match message::decode(payload) {
        Ok(map) => {
            if let Some(Value::Str(text)) = map.get("data") {
                sink.write_all(text.as_bytes())?;
                sink.flush()?;
            }
        }
        Err(err) => debug!(%err, "undecodable message frame"),
    }
    Ok(())
}

/// Execute a system-channel request: `[type, cmd, cwd, k=v...]`, shell out,
/// report the exit code. Unsupported types refuse without running anything.
fn run_system(payload: &[u8]) -> i32 {
    let fields = split_nul_strings(payload);
    if fields.len() < 3 || fields[0] != "system" {
        warn!(fields = fields.len(), "malformed system request");
        return 255;
    }
    let mut command = Command::new("/bin/sh");
    command.arg("-c").arg(&fields[1]);
    if !fields[2].is_empty() {
        command.current_dir(&fields[2]);
    }
    for item in &fields[3..] {
        if let Some((key, value)) = item.split_once('=') {
            command.env(key, value);
        }
    }
    match command.status() {
        Ok(status) => status_code(status),
        Err(err) => {
            warn!(%err, "system command failed to start");
            255
        }
    }
}

fn status_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        code
    } else if let Some(sig) = status.signal() {
        128 + sig
    } else {
        255
    }
}

/// Relay terminal signals to the worker's process group. The worker owns
/// the running command; dying here first would orphan it mid-write.
fn forward_signals(pgid: i32) {
    thread::spawn(move || {
        let mut signals = match Signals::new([SIGINT, SIGTERM, SIGHUP]) {
            Ok(signals) => signals,
            Err(err) => {
                debug!(%err, "signal forwarding unavailable");
                return;
            }
        };
        for raw in signals.forever() {
            if let Ok(sig) = Signal::try_from(raw) {
                let _ = killpg(Pid::from_raw(pgid), sig);
            }
        }
    });
}
