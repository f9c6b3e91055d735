//! Protocol-level error taxonomy.
//!
//! The one distinction that matters to every caller is "the peer went away"
//! versus "the stream is corrupt": a graceful disconnect is routine and is
//! logged at most, while a malformed frame is fatal to the connection and
//! worth a diagnostic. [`ProtocolError::ConnectionClosed`] is therefore a
//! dedicated variant rather than a flavor of I/O error.

use std::io;
use thiserror::Error;

/// Errors raised by the framed channel protocol.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The peer closed the connection (EOF on a length prefix or mid-frame).
    /// Expected during normal shutdown; never escalated past the session.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// The byte stream does not parse as the protocol requires.
    #[error("malformed frame: {0}")]
    Malformed(String),

    /// A frame announced a payload larger than the protocol allows.
    #[error("oversized frame: {got} bytes exceeds limit of {limit}")]
    Oversized { got: u32, limit: u32 },

    /// The client named a command the server never advertised.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// Underlying transport failure other than a clean close.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether this error represents a routine peer disconnect.
    pub fn is_disconnect(&self) -> bool {
        match self {
            ProtocolError::ConnectionClosed => true,
            ProtocolError::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Protocol failures crossing an `io::Write` boundary (the channel writers
/// implement it). The `Io` variant unwraps to its original error rather
/// than gaining a second layer.
impl From<ProtocolError> for io::Error {
    fn from(err: ProtocolError) -> io::Error {
        match err {
            ProtocolError::Io(inner) => inner,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
