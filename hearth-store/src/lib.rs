//! Append-only revision store.
//!
//! A repository is a `.hearth/` directory holding a changelog and per-file
//! logs, each an index of fixed-size entries over a data log. All mutation
//! is append-or-truncate and runs inside a journaled transaction: the
//! journal records the length every touched file must be cut back to, so a
//! crash at any point rolls forward to a state that was valid before the
//! transaction started. Strip is the one operation that rewrites history,
//! and it leans on the same journal machinery plus bundles for repair.

pub mod bookmarks;
pub mod bundle;
pub mod errors;
pub mod lock;
pub mod log;
pub mod repo;
pub mod revlog;
pub mod strip;
pub mod transaction;

pub use bundle::{BundleRecord, Compression, FileRecord, read_bundle, write_bundle};
pub use errors::StoreError;
pub use lock::LockGuard;
pub use log::{FileLog, MemLog, TruncatableLog};
pub use repo::{ChangesetMeta, Repository};
pub use revlog::{ENTRY_SIZE, IndexEntry, NULL_REV, NodeId, Revlog};
pub use strip::{StripOptions, StripOutcome, strip};
pub use transaction::Transaction;
