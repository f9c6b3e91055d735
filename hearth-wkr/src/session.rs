//! One client session over the framed channel protocol.
//!
//! The session announces itself with a hello frame, then alternates between
//! idle (waiting for a command line) and dispatching. An empty command line
//! or peer EOF closes it. Process-wide requests (`chdir`, `setenv`,
//! `setumask`) mutate this worker only; the next connection gets a fresh
//! process with pristine state.

use std::io;
use std::os::unix::net::{UnixDatagram, UnixStream};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;

use tracing::{debug, error, info, warn};

use hearth_common::config::{Config, ConfigError, LoadOptions};
use hearth_common::errors::ProtocolError;
use hearth_common::hashstate::{self, HashState, Instruction, ServerHandoff};
use hearth_common::protocol::{self, RequestReader, ResultChannel, channel};

use crate::attach;
use crate::commands;
use crate::procstate;
use crate::signals::InterruptPolicy;
use crate::ui::Ui;

/// Advertised in the hello banner, sorted.
const CAPABILITIES: &[&str] = &[
    "attachio",
    "chdir",
    "getencoding",
    "runcommand",
    "setenv",
    "setumask",
    "setumask2",
    "validate",
];

enum Flow {
    Continue,
    /// Stop serving without a result frame; the client must treat the
    /// command as lost.
    Abandon,
}

pub struct Session {
    reader: RequestReader<UnixStream>,
    results: ResultChannel<UnixStream>,
    stream: UnixStream,
    ui: Ui,
    config: Config,
    handoff: ServerHandoff,
    interrupts: InterruptPolicy,
}

impl Session {
    pub fn new(stream: UnixStream, config: Config, handoff: ServerHandoff) -> io::Result<Session> {
        let ui = Ui::new(&stream, config.message_output_channel())?;
        let reader = RequestReader::new(stream.try_clone()?);
        let results = ResultChannel::new(stream.try_clone()?);
        let interrupts =
            InterruptPolicy::install(config.shutdown_on_interrupt()).map_err(io::Error::from)?;
        Ok(Session {
            reader,
            results,
            stream,
            ui,
            config,
            handoff,
            interrupts,
        })
    }

    pub fn run(&mut self) -> Result<(), ProtocolError> {
        self.send_hello()?;
        loop {
            let Some(line) = self.reader.read_line()? else {
                return Ok(());
            };
            if line.is_empty() {
                return Ok(());
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            let (name, arg) = match line.split_once(' ') {
                Some((name, arg)) => (name, arg),
                None => (line.as_str(), ""),
            };
            match name {
                "runcommand" => match self.runcommand()? {
                    Flow::Continue => {}
                    Flow::Abandon => return Ok(()),
                },
                "getencoding" => {
                    let encoding = self.config.encoding();
                    self.results.write_raw(encoding.as_bytes())?;
                }
                "validate" => self.validate()?,
                "attachio" => self.attachio()?,
                "chdir" => {
                    if arg.is_empty() {
                        return Err(ProtocolError::Malformed(
                            "chdir without a path".to_owned(),
                        ));
                    }
                    procstate::chdir(Path::new(arg))?;
                }
                "setenv" => {
                    let vars = procstate::parse_env_block(&self.reader.read_block()?);
                    procstate::set_environment(&vars);
                }
                "setumask" => {
                    // legacy form: four bare bytes, no length prefix
                    let mut raw = [0u8; 4];
                    self.reader.read_exact(&mut raw)?;
                    procstate::set_umask(u32::from_be_bytes(raw));
                }
                "setumask2" => {
                    let mask = parse_umask(&self.reader.read_block()?)?;
                    procstate::set_umask(mask);
                }
                other => return Err(ProtocolError::UnknownCommand(other.to_owned())),
            }
        }
    }

    fn send_hello(&mut self) -> Result<(), ProtocolError> {
        let banner = format!(
            "capabilities: {}\nencoding: {}\nmessage-encoding: msgpack\npid: {}\npgid: {}\n",
            CAPABILITIES.join(" "),
            self.config.encoding(),
            std::process::id(),
            nix::unistd::getpgrp().as_raw(),
        );
        protocol::write_frame(&mut self.stream, channel::OUTPUT, banner.as_bytes())
    }

    fn runcommand(&mut self) -> Result<Flow, ProtocolError> {
        let argv = protocol::split_nul_strings(&self.reader.read_block()?);
        debug!(?argv, "runcommand");
        let _dispatching = self.interrupts.dispatching().map_err(io::Error::from)?;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            commands::dispatch(&argv, &self.config, &mut self.ui)
        }));
        match outcome {
            Ok(Ok(dispatched)) => {
                self.ui.flush()?;
                self.results.write_code(dispatched.code)?;
                if let Some(root) = &dispatched.repo_root {
                    self.notify_repo_closed(root);
                }
                Ok(Flow::Continue)
            }
            Ok(Err(err)) => Err(err),
            Err(payload) => {
                let text = panic_text(payload.as_ref());
                error!(%text, "command dispatch panicked");
                let _ = self.ui.flush();
                let msg = format!("fatal error - {text}\n");
                let _ = protocol::write_frame(&mut self.stream, channel::DEBUG, msg.as_bytes());
                Ok(Flow::Abandon)
            }
        }
    }

    /// Decide whether this server is still the right one for the client's
    /// command line. The reply is instruction text on `r`, never a code.
    fn validate(&mut self) -> Result<(), ProtocolError> {
        let argv = protocol::split_nul_strings(&self.reader.read_block()?);
        let instructions = match self.fresh_state(&argv) {
            Ok(fresh) => hashstate::validate_decision(
                &self.handoff.base_address,
                &self.handoff.hash,
                &fresh,
            ),
            Err(err) => {
                warn!(%err, "validate could not reload configuration");
                // the client sees the reason before the exit instruction
                self.ui.warn(&format!("abort: {err}\n"))?;
                self.ui.flush()?;
                vec![Instruction::Exit(255)]
            }
        };
        debug!(?instructions, "validate");
        self.results
            .write_raw(&hashstate::render_instructions(&instructions))?;
        Ok(())
    }

    /// Reload configuration the way process startup would, plus the
    /// `--config` overrides carried in the client's argv, and hash it over
    /// the baseline's watched paths.
    fn fresh_state(&self, argv: &[String]) -> Result<HashState, ConfigError> {
        let mut config = Config::load(&LoadOptions::standard())?;
        let mut args = argv.iter();
        while let Some(arg) = args.next() {
            if arg == "--config" {
                if let Some(spec) = args.next() {
                    config.apply_override(spec)?;
                }
            } else if let Some(spec) = arg.strip_prefix("--config=") {
                config.apply_override(spec)?;
            }
        }
        Ok(HashState::with_paths(
            &config,
            self.handoff.hash.mtime_paths.clone(),
        ))
    }

    fn attachio(&mut self) -> Result<(), ProtocolError> {
        protocol::write_pull_request(&mut self.stream, channel::INPUT, 1)?;
        let fds = attach::receive_fds(&self.stream)?;
        if fds.is_empty() {
            self.results.write_code(0)?;
            return Ok(());
        }
        attach::install(&fds)?;
        let count = fds.len();
        drop(fds);
        // a partial set leaves the remaining channels framed
        if count == 3 {
            let (stdin, stdout, stderr) = attach::stdio_files()?;
            self.ui.attach_direct(stdin, stdout, stderr)?;
        }
        info!(count, "client stdio attached");
        self.results.write_code(count as i32)?;
        Ok(())
    }

    /// Tell the daemon which repository this command had open so it can
    /// refresh its handle cache. Fire and forget; the daemon may be gone.
    fn notify_repo_closed(&self, root: &Path) {
        let Some(mailbox) = &self.handoff.mailbox else {
            return;
        };
        let note = serde_json::json!({ "notice": "repo-closed", "root": root });
        if let Ok(sock) = UnixDatagram::unbound() {
            match sock.send_to(note.to_string().as_bytes(), mailbox) {
                Ok(_) => debug!(root = %root.display(), "repo-closed notice sent"),
                Err(err) => debug!(%err, "mailbox unreachable"),
            }
        }
    }
}

fn parse_umask(block: &[u8]) -> Result<u32, ProtocolError> {
    let bytes: [u8; 4] = block
        .try_into()
        .map_err(|_| ProtocolError::Malformed(format!("umask payload of {} bytes", block.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_owned()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown error".to_owned()
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use hearth_common::address::{default_base_address, hash_address};
    use hearth_common::client::{ClientConn, Event};
    use hearth_common::protocol::read_frame;
    use hearth_store::Repository;
    use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};
    use serial_test::serial;
    use std::io::IoSlice;
    use std::os::fd::{AsRawFd, RawFd};
    use std::thread;

    fn handoff_for(config: &Config) -> ServerHandoff {
        let base_address = default_base_address(config);
        let hash = HashState::compute(config);
        let address = hash_address(&base_address, &hash.config_hash);
        ServerHandoff {
            base_address,
            address,
            hash,
            mailbox: None,
        }
    }

    fn spawn_session(
        config: Config,
        handoff: ServerHandoff,
    ) -> (ClientConn, thread::JoinHandle<Result<(), ProtocolError>>) {
        let (server, client) = UnixStream::pair().unwrap();
        let handle = thread::spawn(move || Session::new(server, config, handoff)?.run());
        let conn = ClientConn::from_stream(client).unwrap();
        (conn, handle)
    }

    fn isolated() -> (Config, ServerHandoff) {
        let config = Config::load(&LoadOptions::isolated()).unwrap();
        let handoff = handoff_for(&config);
        (config, handoff)
    }

    fn send_fds(stream: &UnixStream, fds: &[RawFd]) {
        let iov = [IoSlice::new(b"\0")];
        let rights = [ControlMessage::ScmRights(fds)];
        let cmsgs: &[ControlMessage] = if fds.is_empty() { &[] } else { &rights };
        sendmsg::<()>(stream.as_raw_fd(), &iov, cmsgs, MsgFlags::empty(), None).unwrap();
    }

    #[test]
    #[serial]
    fn hello_announces_the_session() {
        let (config, handoff) = isolated();
        let (conn, handle) = spawn_session(config, handoff);
        let mut sorted = conn.hello.capabilities.clone();
        sorted.sort();
        assert_eq!(conn.hello.capabilities, sorted);
        assert!(conn.hello.has_capability("runcommand"));
        assert!(conn.hello.has_capability("validate"));
        assert!(conn.hello.has_capability("attachio"));
        assert_eq!(conn.hello.message_encoding.as_deref(), Some("msgpack"));
        assert!(conn.hello.pid > 0);
        assert!(conn.hello.pgid.is_some());
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn getencoding_replies_with_text_on_the_result_channel() {
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);
        conn.send_command("getencoding").unwrap();
        let frame = read_frame(&mut conn.stream()).unwrap();
        assert_eq!(frame.channel, channel::RESULT);
        assert!(!frame.payload.is_empty());
        assert!(String::from_utf8(frame.payload).is_ok());
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn unknown_command_ends_the_session() {
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);
        conn.send_command("selfdestruct").unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownCommand(name) if name == "selfdestruct"));
    }

    #[test]
    #[serial]
    fn validate_with_unchanged_state_replies_a_single_nul() {
        // the baseline hash must come from the same load path validate
        // itself uses, or host-level config would skew the comparison
        let baseline = Config::load(&LoadOptions::standard()).unwrap();
        let handoff = handoff_for(&baseline);
        let session_config = Config::load(&LoadOptions::isolated()).unwrap();
        let (mut conn, handle) = spawn_session(session_config, handoff);
        conn.send_command_with_data("validate", b"").unwrap();
        let frame = read_frame(&mut conn.stream()).unwrap();
        assert_eq!(frame.channel, channel::RESULT);
        assert_eq!(frame.payload, vec![0]);
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn validate_redirects_when_overrides_change_the_config_hash() {
        let baseline = Config::load(&LoadOptions::standard()).unwrap();
        let handoff = handoff_for(&baseline);
        let expected_base = handoff.base_address.clone();
        let current = handoff.address.clone();
        let session_config = Config::load(&LoadOptions::isolated()).unwrap();
        let (mut conn, handle) = spawn_session(session_config, handoff);
        let argv = protocol::join_nul(
            ["--config", "ui.username=someone-else", "log"]
                .iter()
                .map(|a| a.as_bytes()),
        );
        conn.send_command_with_data("validate", &argv).unwrap();
        let frame = read_frame(&mut conn.stream()).unwrap();
        let instructions = hashstate::parse_instructions(&frame.payload).unwrap();
        assert_eq!(instructions.len(), 1);
        match &instructions[0] {
            Instruction::Redirect(path) => {
                assert_ne!(*path, current);
                assert_eq!(path.parent(), expected_base.parent());
            }
            other => panic!("expected a redirect, got {other:?}"),
        }
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn validate_reports_the_config_failure_before_exiting() {
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);
        // an override with no `=` cannot be applied, so the reload fails
        let argv = protocol::join_nul(
            ["--config", "nonsense", "log"].iter().map(|a| a.as_bytes()),
        );
        conn.send_command_with_data("validate", &argv).unwrap();
        let first = read_frame(&mut conn.stream()).unwrap();
        assert_eq!(first.channel, channel::ERROR);
        let text = String::from_utf8_lossy(&first.payload).into_owned();
        assert!(text.starts_with("abort:"), "{text}");
        let second = read_frame(&mut conn.stream()).unwrap();
        assert_eq!(second.channel, channel::RESULT);
        let instructions = hashstate::parse_instructions(&second.payload).unwrap();
        assert_eq!(instructions.len(), 1);
        assert!(matches!(instructions[0], Instruction::Exit(255)));
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn runcommand_streams_output_before_the_result() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("repo");
        let mut repo = Repository::init(&root).unwrap();
        {
            let _working = repo.lock_working(None, |_| {}).unwrap();
            let _store = repo.lock_store(None, |_| {}).unwrap();
            repo.snapshot("first", "test", None, &[("a.txt".to_owned(), b"hi\n".to_vec())])
                .unwrap();
        }
        drop(repo);

        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);
        let root_str = root.to_string_lossy().into_owned();
        let output = conn.run_collect(&["-R", root_str.as_str(), "log"]).unwrap();
        assert_eq!(output.result, 0);
        assert!(output.output_frames >= 1);
        let stdout = String::from_utf8_lossy(&output.stdout);
        assert!(stdout.contains("changeset:   0:"), "{stdout}");
        assert!(stdout.contains("summary:     first"), "{stdout}");
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn setumask2_and_setenv_mutate_the_worker_process() {
        let original = procstate::set_umask(0o022);
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);

        conn.send_command_with_data("setumask2", &0o077u32.to_be_bytes())
            .unwrap();
        let mut env = std::env::vars().collect::<Vec<_>>();
        env.push(("HEARTH_SESSION_EXTRA".to_owned(), "lit".to_owned()));
        let block = protocol::join_nul(
            env.iter().map(|(k, v)| format!("{k}={v}").into_bytes()),
        );
        conn.send_command_with_data("setenv", &block).unwrap();

        // both requests are reply-free; a getencoding round trip proves
        // they were processed before we assert
        conn.send_command("getencoding").unwrap();
        read_frame(&mut conn.stream()).unwrap();

        assert_eq!(procstate::set_umask(original), 0o077);
        assert_eq!(std::env::var("HEARTH_SESSION_EXTRA").as_deref(), Ok("lit"));
        // SAFETY: serial test, no other thread reads the environment
        unsafe { std::env::remove_var("HEARTH_SESSION_EXTRA") };
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn chdir_takes_its_argument_from_the_command_line() {
        let original = std::env::current_dir().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);
        conn.send_command(&format!("chdir {}", dir.path().display()))
            .unwrap();
        conn.send_command("getencoding").unwrap();
        read_frame(&mut conn.stream()).unwrap();
        assert_eq!(
            std::env::current_dir().unwrap(),
            dir.path().canonicalize().unwrap()
        );
        std::env::set_current_dir(&original).unwrap();
        drop(conn);
        handle.join().unwrap().unwrap();
    }

    #[test]
    #[serial]
    fn attachio_counts_descriptors_and_tolerates_none() {
        let (config, handoff) = isolated();
        let (mut conn, handle) = spawn_session(config, handoff);

        conn.send_command("attachio").unwrap();
        assert!(matches!(
            conn.read_event().unwrap(),
            Event::InputRequest { max: 1 }
        ));
        // send copies of our own stdio so the dup2 back onto 0/1/2 is a
        // no-op for the test harness
        let (stdin, stdout, stderr) = attach::stdio_files().unwrap();
        send_fds(
            conn.stream(),
            &[stdin.as_raw_fd(), stdout.as_raw_fd(), stderr.as_raw_fd()],
        );
        assert_eq!(conn.read_event().unwrap(), Event::Result(3));

        conn.send_command("attachio").unwrap();
        assert!(matches!(
            conn.read_event().unwrap(),
            Event::InputRequest { max: 1 }
        ));
        send_fds(conn.stream(), &[]);
        assert_eq!(conn.read_event().unwrap(), Event::Result(0));

        drop(conn);
        handle.join().unwrap().unwrap();
    }
}
