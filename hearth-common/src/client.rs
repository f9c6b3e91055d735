//! Client half of the framed protocol.
//!
//! [`ClientConn`] owns the connected socket, parses the hello banner, sends
//! command lines with their data blocks, and decodes server frames into
//! [`Event`]s. The full interactive pump (stdin forwarding, fd passing,
//! system execution) lives in the `hearth` binary; the collector here is
//! enough for tests and non-interactive callers.

use std::io::{self, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use crate::errors::ProtocolError;
use crate::protocol::{
    self, HEADER_LEN, MAX_FRAME_LEN, channel, read_exact_or_closed,
};

/// Parsed hello banner.
#[derive(Debug, Clone)]
pub struct Hello {
    pub capabilities: Vec<String>,
    pub encoding: String,
    pub message_encoding: Option<String>,
    pub pid: i32,
    /// Absent on servers that do not run in their own process group.
    pub pgid: Option<i32>,
}

impl Hello {
    pub fn parse(payload: &[u8]) -> Result<Hello, ProtocolError> {
        let text = String::from_utf8_lossy(payload);
        let mut capabilities = Vec::new();
        let mut encoding = String::new();
        let mut message_encoding = None;
        let mut pid = None;
        let mut pgid = None;
        for line in text.lines() {
            let Some((key, value)) = line.split_once(": ") else {
                continue;
            };
            match key {
                "capabilities" => {
                    capabilities = value.split_whitespace().map(str::to_owned).collect();
                }
                "encoding" => encoding = value.to_owned(),
                "message-encoding" => message_encoding = Some(value.to_owned()),
                "pid" => {
                    pid = Some(value.parse().map_err(|_| {
                        ProtocolError::Malformed(format!("bad pid in hello: {value:?}"))
                    })?);
                }
                "pgid" => {
                    pgid = Some(value.parse().map_err(|_| {
                        ProtocolError::Malformed(format!("bad pgid in hello: {value:?}"))
                    })?);
                }
                _ => {}
            }
        }
        if capabilities.is_empty() {
            return Err(ProtocolError::Malformed(
                "hello announced no capabilities".to_owned(),
            ));
        }
        let pid = pid.ok_or_else(|| {
            ProtocolError::Malformed("hello announced no pid".to_owned())
        })?;
        Ok(Hello {
            capabilities,
            encoding,
            message_encoding,
            pid,
            pgid,
        })
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.iter().any(|c| c == name)
    }
}

/// One decoded server-to-client wire event. Input and line requests carry a
/// size, not a payload: their length field is the pull limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Output(Vec<u8>),
    Error(Vec<u8>),
    Debug(Vec<u8>),
    Message(Vec<u8>),
    Result(i32),
    InputRequest { max: u32 },
    LineRequest { max: u32 },
    SystemRequest(Vec<u8>),
    Unknown { channel: u8, payload: Vec<u8> },
}

pub struct ClientConn {
    stream: UnixStream,
    pub hello: Hello,
}

impl ClientConn {
    pub fn connect(path: &Path) -> Result<ClientConn, ProtocolError> {
        let stream = UnixStream::connect(path)?;
        Self::from_stream(stream)
    }

    /// Wrap an already-connected socket; reads the hello banner.
    pub fn from_stream(mut stream: UnixStream) -> Result<ClientConn, ProtocolError> {
        let frame = protocol::read_frame(&mut stream)?;
        if frame.channel != channel::OUTPUT {
            return Err(ProtocolError::Malformed(format!(
                "hello arrived on channel {:?}",
                frame.channel as char
            )));
        }
        let hello = Hello::parse(&frame.payload)?;
        Ok(ClientConn { stream, hello })
    }

    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    pub fn send_command(&mut self, name: &str) -> io::Result<()> {
        self.stream.write_all(name.as_bytes())?;
        self.stream.write_all(b"\n")?;
        self.stream.flush()
    }

    pub fn send_command_with_data(&mut self, name: &str, data: &[u8]) -> Result<(), ProtocolError> {
        let len = protocol::checked_len(data.len())?;
        let mut buf = Vec::with_capacity(name.len() + 1 + 4 + data.len());
        buf.extend_from_slice(name.as_bytes());
        buf.push(b'\n');
        buf.extend_from_slice(&len.to_be_bytes());
        buf.extend_from_slice(data);
        self.stream.write_all(&buf)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Answer an input pull (empty answers mean EOF) or a system request.
    pub fn write_block(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        protocol::write_block(&mut self.stream, data)
    }

    pub fn read_event(&mut self) -> Result<Event, ProtocolError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_closed(&mut self.stream, &mut header)?;
        let ch = header[0];
        let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
        match ch {
            channel::INPUT => return Ok(Event::InputRequest { max: len }),
            channel::LINE => return Ok(Event::LineRequest { max: len }),
            _ => {}
        }
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized {
                got: len,
                limit: MAX_FRAME_LEN,
            });
        }
        let mut payload = vec![0u8; len as usize];
        read_exact_or_closed(&mut self.stream, &mut payload)?;
        Ok(match ch {
            channel::OUTPUT => Event::Output(payload),
            channel::ERROR => Event::Error(payload),
            channel::DEBUG => Event::Debug(payload),
            channel::MESSAGE => Event::Message(payload),
            channel::SYSTEM => Event::SystemRequest(payload),
            channel::RESULT => {
                if payload.len() != 4 {
                    return Err(ProtocolError::Malformed(format!(
                        "result frame of {} bytes",
                        payload.len()
                    )));
                }
                Event::Result(i32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ]))
            }
            other => Event::Unknown {
                channel: other,
                payload,
            },
        })
    }

    /// Run one command and collect its byte channels. Input pulls are
    /// answered with EOF and system requests with a failure code, so this
    /// is only for non-interactive use.
    pub fn run_collect<S: AsRef<str>>(
        &mut self,
        args: &[S],
    ) -> Result<CommandOutput, ProtocolError> {
        let data = protocol::join_nul(args.iter().map(|a| a.as_ref().as_bytes()));
        self.send_command_with_data("runcommand", &data)?;
        self.collect_until_result()
    }

    pub fn collect_until_result(&mut self) -> Result<CommandOutput, ProtocolError> {
        let mut out = CommandOutput::default();
        loop {
            match self.read_event()? {
                Event::Output(payload) => {
                    out.output_frames += 1;
                    out.stdout.extend_from_slice(&payload);
                }
                Event::Error(payload) => out.stderr.extend_from_slice(&payload),
                Event::Debug(payload) => out.debug.extend_from_slice(&payload),
                Event::Message(payload) => out.messages.push(payload),
                Event::Result(code) => {
                    out.result = code;
                    return Ok(out);
                }
                Event::InputRequest { .. } | Event::LineRequest { .. } => {
                    self.write_block(b"")?;
                }
                Event::SystemRequest(_) => {
                    self.write_block(&(-1i32).to_be_bytes())?;
                }
                Event::Unknown { channel, .. } => {
                    // Uppercase channels are mandatory to understand.
                    if channel.is_ascii_uppercase() {
                        return Err(ProtocolError::Malformed(format!(
                            "unsupported required channel {:?}",
                            channel as char
                        )));
                    }
                }
            }
        }
    }
}

/// Everything one collected command produced.
#[derive(Debug, Default, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub debug: Vec<u8>,
    pub messages: Vec<Vec<u8>>,
    pub output_frames: usize,
    pub result: i32,
}
