//! Store error taxonomy.
//!
//! `Programming` marks violations of caller contracts (a second transaction
//! while one is open, strip without the locks held). Those are bugs in the
//! caller, not conditions to retry, but they must surface as errors rather
//! than panics because a resident server outlives any one command.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no repository found at {0}")]
    NotARepository(PathBuf),

    #[error("repository {0} already exists")]
    AlreadyExists(PathBuf),

    #[error("repository requires unsupported feature {0:?}")]
    UnknownRequirement(String),

    #[error("{desc} locked by {holder}")]
    LockHeld { desc: String, holder: String },

    #[error("abandoned transaction found - run 'hearth recover'")]
    AbandonedTransaction,

    #[error("no rollback information available")]
    NothingToUndo,

    #[error("unknown revision {0:?}")]
    UnknownRevision(String),

    #[error("no such file in repository: {0:?}")]
    UnknownFile(String),

    #[error("ambiguous revision prefix {0:?}")]
    AmbiguousPrefix(String),

    #[error("invalid path {0:?}")]
    InvalidPath(String),

    #[error("invalid bookmark name {0:?}")]
    InvalidName(String),

    #[error("bookmark {0:?} does not exist")]
    UnknownBookmark(String),

    #[error("nothing changed")]
    NothingChanged,

    #[error("corrupt store: {0}")]
    Corrupt(String),

    #[error("integrity check failed: {path} has wrong node for rev {rev}")]
    NodeMismatch { path: String, rev: u32 },

    #[error("programming error: {0}")]
    Programming(&'static str),

    /// Strip could not complete; the named bundles hold everything needed
    /// to repair by hand.
    #[error("strip failed: {source}")]
    StripFailed {
        backup: Option<PathBuf>,
        temp: Option<PathBuf>,
        #[source]
        source: Box<StoreError>,
    },

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("cannot decode changeset metadata: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("cannot encode changeset metadata: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
}

impl StoreError {
    /// Exit code a command reporting this error should produce.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Programming(_) => 254,
            _ => 255,
        }
    }
}
