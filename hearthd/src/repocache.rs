//! Warm repository handles.
//!
//! Workers tell the daemon which repository a command had open; the daemon
//! keeps a small LRU of freshly opened handles so the store's index files
//! stay in the page cache between commands. Strictly best-effort: a stale or
//! missing entry costs the next command a cold open, nothing more.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::debug;

use hearth_store::Repository;

/// One datagram from a worker's mailbox.
#[derive(Debug, Deserialize)]
pub struct Notice {
    pub notice: String,
    pub root: PathBuf,
}

/// Decode a mailbox datagram; anything unparseable is dropped.
pub fn parse_notice(buf: &[u8]) -> Option<Notice> {
    match serde_json::from_slice(buf) {
        Ok(notice) => Some(notice),
        Err(err) => {
            debug!(%err, "discarding malformed mailbox datagram");
            None
        }
    }
}

pub struct RepoCache {
    capacity: usize,
    /// Least recently used first.
    entries: Vec<(PathBuf, Repository)>,
}

impl RepoCache {
    pub fn new(capacity: usize) -> RepoCache {
        RepoCache {
            capacity,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, root: &Path) -> bool {
        match root.canonicalize() {
            Ok(key) => self.entries.iter().any(|(k, _)| *k == key),
            Err(_) => false,
        }
    }

    /// Reopen the repository at `root` and warm its changelog. A root that
    /// no longer opens falls out of the cache.
    pub fn refresh(&mut self, root: &Path) {
        let Ok(key) = root.canonicalize() else {
            // the path itself is gone; prune it under either spelling
            self.entries.retain(|(k, _)| k != root && k.exists());
            return;
        };
        self.entries.retain(|(k, _)| *k != key);
        match Repository::open(&key) {
            Ok(mut repo) => {
                if let Err(err) = repo.tip() {
                    debug!(root = %key.display(), %err, "cache warm failed");
                    return;
                }
                self.entries.push((key, repo));
                if self.entries.len() > self.capacity {
                    let (evicted, _) = self.entries.remove(0);
                    debug!(root = %evicted.display(), "evicted repository handle");
                }
            }
            Err(err) => {
                debug!(root = %key.display(), %err, "dropping repository handle");
            }
        }
    }

}
