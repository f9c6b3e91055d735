//! Session-facing input and output.
//!
//! Until the client attaches real descriptors, everything travels over the
//! protocol: command stdout and stderr as `o`/`e` frames, user input as
//! pull requests on `I`/`L`. After `attachio` the byte sinks point at the
//! attached descriptors instead and frames stop, which is what makes
//! pagers and progress bars behave. Notices optionally ride the structured
//! `m` channel in either mode.

use std::fs::File;
use std::io::{self, BufWriter, IsTerminal, LineWriter, Read, Write};
use std::os::unix::net::UnixStream;

use hearth_common::errors::ProtocolError;
use hearth_common::message::{MessageWriter, Value, kind};
use hearth_common::protocol::{
    ChannelInput, ChannelWriter, INPUT_CHUNK, SystemChannel, channel,
};

enum Sink {
    Channel(ChannelWriter<UnixStream>),
    /// Attached stdout, line buffered (tty) or block buffered (pipe/file).
    Line(LineWriter<File>),
    Block(BufWriter<File>),
    /// Attached stderr, never buffered.
    Raw(File),
}

impl Sink {
    fn writer(&mut self) -> &mut dyn Write {
        match self {
            Sink::Channel(w) => w,
            Sink::Line(w) => w,
            Sink::Block(w) => w,
            Sink::Raw(w) => w,
        }
    }
}

enum InputSource {
    Channel(ChannelInput<UnixStream>),
    Direct(File),
}

/// All user-facing I/O of one session.
pub struct Ui {
    out: Sink,
    err: Sink,
    input: InputSource,
    messages: MessageWriter<UnixStream>,
    system: SystemChannel<UnixStream>,
    /// Route notices over the `m` channel instead of the byte sinks.
    message_output: bool,
    /// Buffering decision for attached stdout, latched on the first attach
    /// so a re-attach cannot flip the mode mid-stream.
    line_buffered: Option<bool>,
}

impl Ui {
    pub fn new(stream: &UnixStream, message_output: bool) -> io::Result<Ui> {
        Ok(Ui {
            out: Sink::Channel(ChannelWriter::new(stream.try_clone()?, channel::OUTPUT)),
            err: Sink::Channel(ChannelWriter::new(stream.try_clone()?, channel::ERROR)),
            input: InputSource::Channel(ChannelInput::new(stream.try_clone()?)),
            messages: MessageWriter::new(stream.try_clone()?),
            system: SystemChannel::new(stream.try_clone()?),
            message_output,
            line_buffered: None,
        })
    }

    /// Per-command override; the merged command config decides the routing.
    pub fn set_message_output(&mut self, on: bool) {
        self.message_output = on;
    }

    /// Swap the byte sinks over to freshly attached descriptors. Called
    /// after every `attachio`, with new duplicates each time: the client
    /// may attach twice and the old duplicates would keep pointing at the
    /// files the first attach installed.
    pub fn attach_direct(&mut self, stdin: File, stdout: File, stderr: File) -> io::Result<()> {
        self.flush()?;
        let line = match self.line_buffered {
            Some(line) => line,
            None => {
                let line = stdout.is_terminal();
                self.line_buffered = Some(line);
                line
            }
        };
        self.out = if line {
            Sink::Line(LineWriter::new(stdout))
        } else {
            Sink::Block(BufWriter::new(stdout))
        };
        self.err = Sink::Raw(stderr);
        self.input = InputSource::Direct(stdin);
        Ok(())
    }

    /// Command output bytes; always the stdout sink, never the `m` channel.
    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.out.writer().write_all(bytes)
    }

    /// A user-facing notice. Plain stdout bytes, or one `m` frame when
    /// message output is routed there.
    pub fn status(&mut self, text: &str) -> io::Result<()> {
        if self.message_output {
            return self.messages.write(text, &[("type", kind::MESSAGE.into())]);
        }
        self.out.writer().write_all(text.as_bytes())
    }

    /// A warning or error notice, on stderr or the `m` channel.
    pub fn warn(&mut self, text: &str) -> io::Result<()> {
        if self.message_output {
            return self
                .messages
                .write(text, &[("type", kind::MESSAGE.into()), ("severity", "warning".into())]);
        }
        self.err.writer().write_all(text.as_bytes())
    }

    /// Show `text` and read one line of input, without its trailing
    /// newline. An empty answer means the peer hit EOF.
    pub fn prompt_line(&mut self, text: &str) -> Result<String, ProtocolError> {
        if self.message_output {
            self.messages.write(text, &[("type", kind::PROMPT.into())])?;
        } else {
            self.out.writer().write_all(text.as_bytes())?;
        }
        self.flush()?;
        let raw = match &mut self.input {
            InputSource::Channel(input) => input.read_line()?,
            InputSource::Direct(file) => read_line_direct(file)?,
        };
        let mut line = String::from_utf8_lossy(&raw).into_owned();
        if line.ends_with('\n') {
            line.pop();
        }
        Ok(line)
    }

    /// Drain the peer's input to EOF (`unbundle -` reads a bundle from
    /// stdin).
    pub fn read_to_end(&mut self) -> Result<Vec<u8>, ProtocolError> {
        match &mut self.input {
            InputSource::Channel(input) => {
                let mut data = Vec::new();
                loop {
                    let chunk = input.read(INPUT_CHUNK)?;
                    if chunk.is_empty() {
                        return Ok(data);
                    }
                    data.extend_from_slice(&chunk);
                }
            }
            InputSource::Direct(file) => {
                let mut data = Vec::new();
                file.read_to_end(&mut data)?;
                Ok(data)
            }
        }
    }

    /// Ask the client to run a shell command on its side and report the
    /// exit code.
    pub fn system(
        &mut self,
        cmd: &str,
        cwd: &str,
        env: &[(String, String)],
    ) -> Result<i32, ProtocolError> {
        self.flush()?;
        self.system.system(cmd, cwd, env)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.out.writer().flush()?;
        self.err.writer().flush()
    }
}

/// Unbuffered line read. The descriptor is shared with whatever the client
/// process does next, so reading ahead past the newline would steal bytes.
fn read_line_direct(file: &mut File) -> Result<Vec<u8>, ProtocolError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match file.read(&mut byte) {
            Ok(0) => break,
            Ok(_) => {
                line.push(byte[0]);
                if byte[0] == b'\n' {
                    break;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProtocolError::Io(err)),
        }
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_common::message;
    use hearth_common::protocol::{read_frame, write_block};

    fn pair_ui(message_output: bool) -> (Ui, UnixStream) {
        let (server, client) = UnixStream::pair().unwrap();
        let ui = Ui::new(&server, message_output).unwrap();
        (ui, client)
    }

    #[test]
    fn status_and_warn_frame_on_byte_channels() {
        let (mut ui, mut client) = pair_ui(false);
        ui.status("checking files\n").unwrap();
        ui.warn("careful\n").unwrap();
        let f = read_frame(&mut client).unwrap();
        assert_eq!((f.channel, f.payload.as_slice()), (channel::OUTPUT, &b"checking files\n"[..]));
        let f = read_frame(&mut client).unwrap();
        assert_eq!((f.channel, f.payload.as_slice()), (channel::ERROR, &b"careful\n"[..]));
    }

    #[test]
    fn message_output_moves_notices_to_the_m_channel() {
        let (mut ui, mut client) = pair_ui(true);
        ui.status("checking files\n").unwrap();
        ui.write(b"raw bytes").unwrap();
        let f = read_frame(&mut client).unwrap();
        assert_eq!(f.channel, channel::MESSAGE);
        let map = message::decode(&f.payload).unwrap();
        assert_eq!(map["data"], Value::Str("checking files\n".into()));
        assert_eq!(map["type"], Value::Str("message".into()));
        // command output stays on o even in channel mode
        let f = read_frame(&mut client).unwrap();
        assert_eq!(f.channel, channel::OUTPUT);
    }

    #[test]
    fn prompt_pulls_one_line_from_the_peer() {
        let (mut ui, mut client) = pair_ui(false);
        let peer = std::thread::spawn(move || {
            // prompt text frame
            let f = read_frame(&mut client).unwrap();
            assert_eq!(f.payload, b"snapshot message: ");
            // line pull request header
            let mut header = [0u8; 5];
            client.read_exact(&mut header).unwrap();
            assert_eq!(header[0], channel::LINE);
            write_block(&mut client, b"first snapshot\n").unwrap();
        });
        let line = ui.prompt_line("snapshot message: ").unwrap();
        assert_eq!(line, "first snapshot");
        peer.join().unwrap();
    }

    #[test]
    fn read_to_end_concatenates_pulls_until_eof() {
        let (mut ui, mut client) = pair_ui(false);
        let peer = std::thread::spawn(move || {
            for reply in [&b"abc"[..], &b"def"[..], &b""[..]] {
                let mut header = [0u8; 5];
                client.read_exact(&mut header).unwrap();
                assert_eq!(header[0], channel::INPUT);
                write_block(&mut client, reply).unwrap();
            }
        });
        assert_eq!(ui.read_to_end().unwrap(), b"abcdef");
        peer.join().unwrap();
    }

    #[test]
    fn attached_sinks_write_files_not_frames() {
        let (mut ui, client) = pair_ui(false);
        let dir = tempfile::tempdir().unwrap();
        let make = |name: &str| -> File {
            File::options()
                .create(true)
                .read(true)
                .write(true)
                .open(dir.path().join(name))
                .unwrap()
        };
        ui.attach_direct(make("in"), make("out"), make("err")).unwrap();
        ui.write(b"listing\n").unwrap();
        ui.warn("warned\n").unwrap();
        ui.flush().unwrap();
        assert_eq!(std::fs::read(dir.path().join("out")).unwrap(), b"listing\n");
        assert_eq!(std::fs::read(dir.path().join("err")).unwrap(), b"warned\n");
        // nothing went over the wire
        drop(ui);
        let mut leftovers = Vec::new();
        let mut client = client;
        client.read_to_end(&mut leftovers).unwrap();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn attached_stdin_serves_prompts_and_drains() {
        let (mut ui, _client) = pair_ui(false);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in");
        std::fs::write(&path, b"an answer\nrest of the bundle").unwrap();
        let open = |n: &str| File::options().create(true).read(true).write(true)
            .open(dir.path().join(n)).unwrap();
        let stdin = File::open(&path).unwrap();
        ui.attach_direct(stdin, open("out"), open("err")).unwrap();
        assert_eq!(ui.prompt_line("? ").unwrap(), "an answer");
        assert_eq!(ui.read_to_end().unwrap(), b"rest of the bundle");
    }

    #[test]
    fn buffering_decision_is_latched_across_attaches() {
        let (mut ui, _client) = pair_ui(false);
        let dir = tempfile::tempdir().unwrap();
        let open = |n: &str| File::options().create(true).read(true).write(true)
            .open(dir.path().join(n)).unwrap();
        ui.attach_direct(open("in"), open("out"), open("err")).unwrap();
        assert_eq!(ui.line_buffered, Some(false));
        // a second attach keeps the first decision
        ui.attach_direct(open("in2"), open("out2"), open("err2")).unwrap();
        assert_eq!(ui.line_buffered, Some(false));
        // block buffered: short writes stay in the buffer until flush
        ui.write(b"x").unwrap();
        assert_eq!(std::fs::metadata(dir.path().join("out2")).unwrap().len(), 0);
        ui.flush().unwrap();
        assert_eq!(std::fs::read(dir.path().join("out2")).unwrap(), b"x");
    }

    #[test]
    fn system_requests_roundtrip() {
        let (mut ui, mut client) = pair_ui(false);
        let peer = std::thread::spawn(move || {
            let f = read_frame(&mut client).unwrap();
            assert_eq!(f.channel, channel::SYSTEM);
            let parts = hearth_common::protocol::split_nul_strings(&f.payload);
            assert_eq!(parts[0], "system");
            assert_eq!(parts[1], "make check");
            write_block(&mut client, &7i32.to_be_bytes()).unwrap();
        });
        let code = ui.system("make check", "/tmp", &[]).unwrap();
        assert_eq!(code, 7);
        peer.join().unwrap();
    }
}
