//! Framed channel I/O.
//!
//! One duplex byte stream is partitioned into logical sub-streams by a
//! single-byte channel tag. Every server-to-client frame is
//! `[channel u8][length u32 BE][payload]`; the payload of the result channel
//! is always a 4-byte big-endian signed integer. Input channels are
//! pull-based: the server emits a header-only request frame carrying the
//! maximum size it wants, and the client answers with a bare
//! `[length u32 BE][data]` block (no channel byte), where a zero length
//! signals EOF for that pull.
//!
//! The client-to-server direction is not channel-framed: it is a sequence of
//! `\n`-terminated command lines, each optionally followed by one
//! length-prefixed data block (NUL-separated lists by convention).
//!
//! Frames are assembled in full and handed to the kernel in a single
//! `write_all` so that two endpoints cloned from the same socket can never
//! interleave bytes inside one frame.

use std::io::{self, Read, Write};

use crate::errors::ProtocolError;

/// Reserved channel tags.
pub mod channel {
    /// Command stdout.
    pub const OUTPUT: u8 = b'o';
    /// Command stderr.
    pub const ERROR: u8 = b'e';
    /// Server-side diagnostics (tracebacks land here).
    pub const DEBUG: u8 = b'd';
    /// Result codes; payload is always 4 bytes, big-endian signed.
    pub const RESULT: u8 = b'r';
    /// Pull-based byte input.
    pub const INPUT: u8 = b'I';
    /// Pull-based line input.
    pub const LINE: u8 = b'L';
    /// Structured message side-channel (MessagePack maps).
    pub const MESSAGE: u8 = b'm';
    /// System/pager request-reply sub-protocol.
    pub const SYSTEM: u8 = b'S';
}

/// Frame header size: channel byte plus length word.
pub const HEADER_LEN: usize = 5;

/// Upper bound for a single payload in either direction. Readers treat
/// anything larger as stream corruption rather than an allocation request;
/// writers refuse to emit it, so every frame this side sends is one the
/// peer's decoder accepts.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Default chunk size for input pulls.
pub const INPUT_CHUNK: u32 = 4096;

/// A decoded server-to-client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel: u8,
    pub payload: Vec<u8>,
}

/// Validate a payload length against [`MAX_FRAME_LEN`] before it is cast
/// into a 32-bit length field.
pub(crate) fn checked_len(len: usize) -> Result<u32, ProtocolError> {
    match u32::try_from(len) {
        Ok(n) if n <= MAX_FRAME_LEN => Ok(n),
        _ => Err(ProtocolError::Oversized {
            got: u32::try_from(len).unwrap_or(u32::MAX),
            limit: MAX_FRAME_LEN,
        }),
    }
}

/// Pack one frame into a contiguous buffer.
pub fn encode_frame(channel: u8, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let len = checked_len(payload.len())?;
    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());
    buf.push(channel);
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decode one frame from a contiguous buffer. Returns the frame and the
/// number of bytes consumed.
pub fn decode_frame(buf: &[u8]) -> Result<(Frame, usize), ProtocolError> {
    if buf.len() < HEADER_LEN {
        return Err(ProtocolError::Malformed(format!(
            "truncated header: {} bytes",
            buf.len()
        )));
    }
    let channel = buf[0];
    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized {
            got: len,
            limit: MAX_FRAME_LEN,
        });
    }
    let end = HEADER_LEN + len as usize;
    if buf.len() < end {
        return Err(ProtocolError::Malformed(format!(
            "truncated payload: want {} bytes, have {}",
            len,
            buf.len() - HEADER_LEN
        )));
    }
    Ok((
        Frame {
            channel,
            payload: buf[HEADER_LEN..end].to_vec(),
        },
        end,
    ))
}

/// Write one complete frame. Payloads over [`MAX_FRAME_LEN`] are rejected
/// before anything reaches the wire.
pub fn write_frame<W: Write>(w: &mut W, channel: u8, payload: &[u8]) -> Result<(), ProtocolError> {
    w.write_all(&encode_frame(channel, payload)?)?;
    w.flush()?;
    Ok(())
}

/// Write a header-only request frame for a pull-based input channel; the
/// length field carries the maximum number of bytes wanted.
pub fn write_pull_request<W: Write>(w: &mut W, channel: u8, max: u32) -> io::Result<()> {
    let mut buf = [0u8; HEADER_LEN];
    buf[0] = channel;
    buf[1..].copy_from_slice(&max.to_be_bytes());
    w.write_all(&buf)?;
    w.flush()
}

/// Read exactly `buf.len()` bytes, mapping EOF (before or mid-way) to
/// [`ProtocolError::ConnectionClosed`]. A short read on a fixed-size prefix
/// means the peer went away, not that the stream is corrupt.
pub fn read_exact_or_closed<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<(), ProtocolError> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..]) {
            Ok(0) => return Err(ProtocolError::ConnectionClosed),
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(ProtocolError::Io(err)),
        }
    }
    Ok(())
}

/// Read one channel frame (client side of the server-to-client stream).
pub fn read_frame<R: Read>(r: &mut R) -> Result<Frame, ProtocolError> {
    let mut header = [0u8; HEADER_LEN];
    read_exact_or_closed(r, &mut header)?;
    let channel = header[0];
    let len = u32::from_be_bytes([header[1], header[2], header[3], header[4]]);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized {
            got: len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut payload = vec![0u8; len as usize];
    read_exact_or_closed(r, &mut payload)?;
    Ok(Frame { channel, payload })
}

/// Read one bare `[length u32 BE][data]` block (the client-to-server data
/// format, also used for input-pull replies).
pub fn read_block<R: Read>(r: &mut R) -> Result<Vec<u8>, ProtocolError> {
    let mut lenbuf = [0u8; 4];
    read_exact_or_closed(r, &mut lenbuf)?;
    let len = u32::from_be_bytes(lenbuf);
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::Oversized {
            got: len,
            limit: MAX_FRAME_LEN,
        });
    }
    let mut data = vec![0u8; len as usize];
    read_exact_or_closed(r, &mut data)?;
    Ok(data)
}

/// Write one bare length-prefixed block, enforcing the same length cap as
/// the framed direction.
pub fn write_block<W: Write>(w: &mut W, data: &[u8]) -> Result<(), ProtocolError> {
    let len = checked_len(data.len())?;
    let mut buf = Vec::with_capacity(4 + data.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(data);
    w.write_all(&buf)?;
    w.flush()?;
    Ok(())
}

/// Join items with NUL separators (argv and instruction lists on the wire).
pub fn join_nul<I, T>(items: I) -> Vec<u8>
where
    I: IntoIterator<Item = T>,
    T: AsRef<[u8]>,
{
    let mut out = Vec::new();
    for (i, item) in items.into_iter().enumerate() {
        if i > 0 {
            out.push(0);
        }
        out.extend_from_slice(item.as_ref());
    }
    out
}

/// Split a NUL-separated list. An empty input yields no items.
pub fn split_nul(data: &[u8]) -> Vec<Vec<u8>> {
    if data.is_empty() {
        return Vec::new();
    }
    data.split(|&b| b == 0).map(|s| s.to_vec()).collect()
}

/// Split a NUL-separated list into strings, replacing invalid UTF-8.
pub fn split_nul_strings(data: &[u8]) -> Vec<String> {
    split_nul(data)
        .into_iter()
        .map(|item| String::from_utf8_lossy(&item).into_owned())
        .collect()
}

/// Buffered reader for the client-to-server request stream: newline
/// terminated command lines, each optionally followed by one
/// length-prefixed block.
///
/// Buffering lives here and nowhere else. The protocol is strictly
/// request/reply, so once a command line and its block have been consumed
/// the buffer is empty and unbuffered readers (input pulls, system replies)
/// can safely use clones of the same socket.
pub struct RequestReader<S: Read> {
    stream: S,
    buf: Vec<u8>,
    start: usize,
}

impl<S: Read> RequestReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: Vec::new(),
            start: 0,
        }
    }

    /// Read the next command line, without its trailing newline. `None`
    /// means the peer closed the stream cleanly at a line boundary; EOF in
    /// the middle of a line is a protocol error.
    pub fn read_line(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        loop {
            if let Some(pos) = memchr::memchr(b'\n', &self.buf[self.start..]) {
                let line = self.buf[self.start..self.start + pos].to_vec();
                self.start += pos + 1;
                self.compact();
                return Ok(Some(line));
            }
            let mut chunk = [0u8; 4096];
            let n = match self.stream.read(&mut chunk) {
                Ok(n) => n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProtocolError::Io(err)),
            };
            if n == 0 {
                if self.start == self.buf.len() {
                    return Ok(None);
                }
                return Err(ProtocolError::ConnectionClosed);
            }
            if self.buf.len() - self.start + n > MAX_FRAME_LEN as usize {
                return Err(ProtocolError::Oversized {
                    got: (self.buf.len() - self.start + n) as u32,
                    limit: MAX_FRAME_LEN,
                });
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Read one length-prefixed data block, draining buffered bytes first.
    pub fn read_block(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut lenbuf = [0u8; 4];
        self.fill(&mut lenbuf)?;
        let len = u32::from_be_bytes(lenbuf);
        if len > MAX_FRAME_LEN {
            return Err(ProtocolError::Oversized {
                got: len,
                limit: MAX_FRAME_LEN,
            });
        }
        let mut data = vec![0u8; len as usize];
        self.fill(&mut data)?;
        Ok(data)
    }

    /// Read exactly `out.len()` raw bytes (the legacy `setumask` payload
    /// arrives bare, without a length prefix).
    pub fn read_exact(&mut self, out: &mut [u8]) -> Result<(), ProtocolError> {
        self.fill(out)
    }

    /// True when no read-ahead bytes are pending.
    pub fn buffer_is_empty(&self) -> bool {
        self.start == self.buf.len()
    }

    fn fill(&mut self, out: &mut [u8]) -> Result<(), ProtocolError> {
        let avail = self.buf.len() - self.start;
        let take = avail.min(out.len());
        if take > 0 {
            out[..take].copy_from_slice(&self.buf[self.start..self.start + take]);
            self.start += take;
            self.compact();
        }
        if take < out.len() {
            read_exact_or_closed(&mut self.stream, &mut out[take..])?;
        }
        Ok(())
    }

    fn compact(&mut self) {
        if self.start == self.buf.len() {
            self.buf.clear();
            self.start = 0;
        } else if self.start > 8 * 1024 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }
}

// ── Server-side channel endpoints ────────────────────────────────────────

/// Writer for one output-style channel (`o`, `e`, `d`). A `write` call
/// emits one frame, or several back-to-back same-channel frames when the
/// payload exceeds [`MAX_FRAME_LEN`]; empty writes are suppressed because a
/// zero length means EOF to pull-channel readers and carries nothing on
/// push channels.
pub struct ChannelWriter<S: Write> {
    channel: u8,
    stream: S,
}

impl<S: Write> ChannelWriter<S> {
    pub fn new(stream: S, channel: u8) -> Self {
        Self { channel, stream }
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }
}

impl<S: Write> Write for ChannelWriter<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        for chunk in buf.chunks(MAX_FRAME_LEN as usize) {
            write_frame(&mut self.stream, self.channel, chunk)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Writer for the result channel: always exactly one 4-byte big-endian
/// signed integer per frame.
pub struct ResultChannel<S: Write> {
    stream: S,
}

impl<S: Write> ResultChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Write a command result code.
    pub fn write_code(&mut self, code: i32) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, channel::RESULT, &code.to_be_bytes())
    }

    /// Write a raw result payload (instruction lists for `validate`).
    pub fn write_raw(&mut self, payload: &[u8]) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, channel::RESULT, payload)
    }
}

/// Pull-based input endpoint over a duplex stream. The request goes out on
/// the same socket the reply comes back on; the protocol is strictly
/// request/reply within a session, so no other reader races this one.
pub struct ChannelInput<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> ChannelInput<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Pull up to `max` bytes from the peer on the byte-input channel.
    /// An empty vector means EOF.
    pub fn read(&mut self, max: u32) -> Result<Vec<u8>, ProtocolError> {
        self.pull(channel::INPUT, max)
    }

    /// Pull one line from the peer. Repeats line-channel pulls into a
    /// rolling buffer until the payload ends in `\n` or the peer signals
    /// EOF with an empty reply.
    pub fn read_line(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let mut buf = self.pull(channel::LINE, INPUT_CHUNK)?;
        while !buf.is_empty() && !buf.ends_with(b"\n") {
            let more = self.pull(channel::LINE, INPUT_CHUNK)?;
            if more.is_empty() {
                break;
            }
            buf.extend_from_slice(&more);
        }
        Ok(buf)
    }

    fn pull(&mut self, ch: u8, max: u32) -> Result<Vec<u8>, ProtocolError> {
        if max == 0 {
            return Ok(Vec::new());
        }
        write_pull_request(&mut self.stream, ch, max)?;
        read_block(&mut self.stream)
    }
}

/// The `S` channel: ask the client to run something on its side of the
/// connection and report the exit code back.
pub struct SystemChannel<S: Read + Write> {
    stream: S,
}

impl<S: Read + Write> SystemChannel<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    /// Request client-side execution of `cmd` in `cwd` with `env`, and wait
    /// for the 4-byte exit code reply.
    pub fn system(
        &mut self,
        cmd: &str,
        cwd: &str,
        env: &[(String, String)],
    ) -> Result<i32, ProtocolError> {
        let mut parts: Vec<Vec<u8>> = vec![
            b"system".to_vec(),
            cmd.as_bytes().to_vec(),
            cwd.as_bytes().to_vec(),
        ];
        parts.extend(env.iter().map(|(k, v)| format!("{k}={v}").into_bytes()));
        write_frame(&mut self.stream, channel::SYSTEM, &join_nul(parts))?;
        let reply = read_block(&mut self.stream)?;
        if reply.len() != 4 {
            return Err(ProtocolError::Malformed(format!(
                "system reply: want 4 bytes, got {}",
                reply.len()
            )));
        }
        Ok(i32::from_be_bytes([reply[0], reply[1], reply[2], reply[3]]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    #[test]
    fn frame_roundtrip_simple() {
        let encoded = encode_frame(channel::OUTPUT, b"hello").unwrap();
        let (frame, used) = decode_frame(&encoded).unwrap();
        assert_eq!(used, encoded.len());
        assert_eq!(frame.channel, channel::OUTPUT);
        assert_eq!(frame.payload, b"hello");
    }

    #[test]
    fn frame_roundtrip_empty_payload() {
        let encoded = encode_frame(channel::RESULT, b"").unwrap();
        let (frame, used) = decode_frame(&encoded).unwrap();
        assert_eq!(used, HEADER_LEN);
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn encode_enforces_the_cap_exactly() {
        let payload = vec![0u8; MAX_FRAME_LEN as usize + 1];
        match encode_frame(channel::OUTPUT, &payload).unwrap_err() {
            ProtocolError::Oversized { got, limit } => {
                assert_eq!(got, MAX_FRAME_LEN + 1);
                assert_eq!(limit, MAX_FRAME_LEN);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(encode_frame(channel::OUTPUT, &payload[1..]).is_ok());
    }

    #[test]
    fn write_side_refuses_before_the_wire_sees_anything() {
        let payload = vec![0u8; MAX_FRAME_LEN as usize + 1];
        let mut sink = Vec::new();
        let err = write_frame(&mut sink, channel::OUTPUT, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
        assert!(sink.is_empty());
        let err = write_block(&mut sink, &payload).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
        assert!(sink.is_empty());
    }

    #[test]
    fn decode_rejects_truncated_header() {
        let err = decode_frame(&[b'o', 0, 0]).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn decode_rejects_oversized_length() {
        let mut buf = vec![b'o'];
        buf.extend_from_slice(&u32::MAX.to_be_bytes());
        let err = decode_frame(&buf).unwrap_err();
        assert!(matches!(err, ProtocolError::Oversized { .. }));
    }

    #[test]
    fn read_frame_maps_eof_to_connection_closed() {
        let mut cur = Cursor::new(vec![b'o', 0, 0]);
        let err = read_frame(&mut cur).unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
        assert!(err.is_disconnect());
    }

    #[test]
    fn read_frame_from_stream() {
        let mut bytes = encode_frame(channel::ERROR, b"oops").unwrap();
        bytes.extend_from_slice(&encode_frame(channel::RESULT, &0i32.to_be_bytes()).unwrap());
        let mut cur = Cursor::new(bytes);
        let first = read_frame(&mut cur).unwrap();
        assert_eq!(first.channel, channel::ERROR);
        let second = read_frame(&mut cur).unwrap();
        assert_eq!(second.channel, channel::RESULT);
        assert_eq!(second.payload, 0i32.to_be_bytes());
    }

    #[test]
    fn block_roundtrip() {
        let mut buf = Vec::new();
        write_block(&mut buf, b"a\0b\0c").unwrap();
        let mut cur = Cursor::new(buf);
        assert_eq!(read_block(&mut cur).unwrap(), b"a\0b\0c");
    }

    #[test]
    fn nul_join_split_roundtrip() {
        let items = vec!["log", "-l", "1", ""];
        let joined = join_nul(&items);
        assert_eq!(joined, b"log\0-l\x001\0");
        assert_eq!(split_nul_strings(&joined), items);
        assert!(split_nul(b"").is_empty());
    }

    #[test]
    fn channel_writer_emits_one_frame_per_write() {
        let mut buf = Vec::new();
        {
            let mut w = ChannelWriter::new(&mut buf, channel::OUTPUT);
            use std::io::Write as _;
            w.write_all(b"first").unwrap();
            w.write_all(b"").unwrap();
            w.write_all(b"second").unwrap();
        }
        let (f1, used) = decode_frame(&buf).unwrap();
        let (f2, rest) = decode_frame(&buf[used..]).unwrap();
        assert_eq!(f1.payload, b"first");
        assert_eq!(f2.payload, b"second");
        assert_eq!(used + rest, buf.len());
    }

    #[test]
    fn channel_writer_splits_payloads_at_the_cap() {
        // Sink that checks each underlying write is one complete frame and
        // records its header.
        struct FrameLog {
            frames: Vec<(u8, u32)>,
        }
        impl Write for FrameLog {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                assert!(buf.len() >= HEADER_LEN);
                let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
                assert_eq!(buf.len(), HEADER_LEN + len as usize);
                self.frames.push((buf[0], len));
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let payload = vec![0u8; MAX_FRAME_LEN as usize + 1];
        let mut log = FrameLog { frames: Vec::new() };
        {
            let mut w = ChannelWriter::new(&mut log, channel::OUTPUT);
            use std::io::Write as _;
            w.write_all(&payload).unwrap();
        }
        assert_eq!(
            log.frames,
            vec![(channel::OUTPUT, MAX_FRAME_LEN), (channel::OUTPUT, 1)]
        );
    }

    #[test]
    fn request_reader_splits_lines_and_blocks() {
        let mut wire = Vec::new();
        wire.extend_from_slice(b"runcommand\n");
        write_block(&mut wire, b"log\0-l\x001").unwrap();
        wire.extend_from_slice(b"getencoding\n");
        let mut reader = RequestReader::new(Cursor::new(wire));
        assert_eq!(reader.read_line().unwrap().unwrap(), b"runcommand");
        assert_eq!(reader.read_block().unwrap(), b"log\0-l\x001");
        assert_eq!(reader.read_line().unwrap().unwrap(), b"getencoding");
        assert!(reader.read_line().unwrap().is_none());
    }

    #[test]
    fn request_reader_rejects_partial_trailing_line() {
        let mut reader = RequestReader::new(Cursor::new(b"runcomm".to_vec()));
        let err = reader.read_line().unwrap_err();
        assert!(matches!(err, ProtocolError::ConnectionClosed));
    }

    #[test]
    fn request_reader_block_spanning_buffer_and_stream() {
        // The block length prefix lands in the read-ahead buffer together
        // with part of the payload; the rest must come from the stream.
        let mut wire = Vec::new();
        wire.extend_from_slice(b"setenv\n");
        write_block(&mut wire, &vec![7u8; 9000]).unwrap();
        let mut reader = RequestReader::new(Cursor::new(wire));
        assert_eq!(reader.read_line().unwrap().unwrap(), b"setenv");
        assert_eq!(reader.read_block().unwrap(), vec![7u8; 9000]);
    }

    #[test]
    fn channel_input_line_pull_reassembles() {
        // Duplex fake: requests are appended to `sent`, replies come from a
        // scripted queue.
        struct Script {
            sent: Vec<u8>,
            replies: Cursor<Vec<u8>>,
        }
        impl Read for Script {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                self.replies.read(buf)
            }
        }
        impl Write for Script {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.sent.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut replies = Vec::new();
        write_block(&mut replies, b"partial ").unwrap();
        write_block(&mut replies, b"line\n").unwrap();
        let mut input = ChannelInput::new(Script {
            sent: Vec::new(),
            replies: Cursor::new(replies),
        });
        assert_eq!(input.read_line().unwrap(), b"partial line\n");
    }

    proptest! {
        #[test]
        fn frame_roundtrip_any_payload(
            channel in proptest::num::u8::ANY,
            payload in proptest::collection::vec(proptest::num::u8::ANY, 0..4096),
        ) {
            let encoded = encode_frame(channel, &payload).unwrap();
            let (frame, used) = decode_frame(&encoded).unwrap();
            prop_assert_eq!(used, encoded.len());
            prop_assert_eq!(frame.channel, channel);
            prop_assert_eq!(frame.payload, payload);
        }

        // Length words above the cap are rejected from the header alone,
        // before any payload allocation.
        #[test]
        fn oversized_headers_are_rejected_on_read(
            len in (MAX_FRAME_LEN + 1)..=u32::MAX,
        ) {
            let mut header = vec![b'o'];
            header.extend_from_slice(&len.to_be_bytes());
            let err = decode_frame(&header).unwrap_err();
            prop_assert!(
                matches!(err, ProtocolError::Oversized { got, .. } if got == len),
                "expected ProtocolError::Oversized with got == len"
            );
            let err = read_frame(&mut Cursor::new(header)).unwrap_err();
            prop_assert!(
                matches!(err, ProtocolError::Oversized { got, .. } if got == len),
                "expected ProtocolError::Oversized with got == len"
            );
        }
    }
}
