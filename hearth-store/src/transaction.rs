//! Write-ahead journalled transactions.
//!
//! Every mutation of the store happens under a transaction. Before a file
//! is touched, its pre-change size is appended to the journal and fsynced;
//! aborting replays the journal in reverse, truncating each file back (a
//! recorded size of zero removes the file). Committing renames the journal
//! to `undo`, which is what `rollback` later replays. A journal found on
//! disk outside any transaction is the leftover of a crash and must be
//! replayed by `recover` before the store can be locked for writing.

use std::cell::Cell;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::{debug, warn};

use crate::errors::StoreError;

pub const JOURNAL: &str = "store/journal";
pub const UNDO: &str = "store/undo";
pub const JOURNAL_BOOKMARKS: &str = "journal.bookmarks";
pub const UNDO_BOOKMARKS: &str = "undo.bookmarks";

type Validator = Box<dyn FnMut() -> Result<(), StoreError>>;

pub struct Transaction {
    root: PathBuf,
    file: Option<File>,
    entries: Vec<(String, u64)>,
    seen: HashSet<String>,
    active: Rc<Cell<bool>>,
    closed: bool,
    backed_up_bookmarks: bool,
    validators: Vec<Validator>,
    postclose: Vec<Box<dyn FnOnce()>>,
}

impl Transaction {
    /// Open a transaction rooted at the `.hearth` directory. The caller
    /// must hold the store lock. `active` is the repository's open-
    /// transaction flag; nesting is a bug, not a user error.
    pub fn begin(root: &Path, active: Rc<Cell<bool>>) -> Result<Transaction, StoreError> {
        if active.get() {
            return Err(StoreError::Programming("transaction already active"));
        }
        let journal = root.join(JOURNAL);
        let file = match OpenOptions::new().write(true).create_new(true).open(&journal) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                return Err(StoreError::AbandonedTransaction);
            }
            Err(err) => return Err(err.into()),
        };
        active.set(true);
        debug!(journal = %journal.display(), "transaction opened");
        Ok(Transaction {
            root: root.to_owned(),
            file: Some(file),
            entries: Vec::new(),
            seen: HashSet::new(),
            active,
            closed: false,
            backed_up_bookmarks: false,
            validators: Vec::new(),
            postclose: Vec::new(),
        })
    }

    /// Record the size to truncate `name` back to on abort. Must be called
    /// before the file is first mutated in this transaction; later calls
    /// for the same file are ignored, the first recorded size wins. A size
    /// of zero means the file is new and is removed on abort.
    pub fn add(&mut self, name: &str, offset: u64) -> Result<(), StoreError> {
        if self.seen.contains(name) {
            return Ok(());
        }
        let file = self
            .file
            .as_mut()
            .ok_or(StoreError::Programming("add on closed transaction"))?;
        write!(file, "{name}\0{offset}\n")?;
        file.flush()?;
        file.sync_data()?;
        self.seen.insert(name.to_owned());
        self.entries.push((name.to_owned(), offset));
        Ok(())
    }

    pub fn add_new(&mut self, name: &str) -> Result<(), StoreError> {
        self.add(name, 0)
    }

    /// Copy the bookmarks file aside so abort can put it back and commit
    /// can leave it as `undo.bookmarks` for rollback. When no bookmarks
    /// file exists yet, one created during the transaction is removed on
    /// abort like any other new file.
    pub fn backup_bookmarks(&mut self) -> Result<(), StoreError> {
        let bookmarks = self.root.join("bookmarks");
        if bookmarks.exists() {
            fs::copy(&bookmarks, self.root.join(JOURNAL_BOOKMARKS))?;
            self.backed_up_bookmarks = true;
        } else {
            self.add_new("bookmarks")?;
        }
        Ok(())
    }

    /// Run before commit, in registration order. A failure aborts the
    /// transaction and surfaces the validator's error.
    pub fn add_validator(&mut self, validator: impl FnMut() -> Result<(), StoreError> + 'static) {
        self.validators.push(Box::new(validator));
    }

    /// Run after a successful commit, in registration order. For
    /// visibility work only; failures cannot be rolled back here.
    pub fn add_postclose(&mut self, hook: impl FnOnce() + 'static) {
        self.postclose.push(Box::new(hook));
    }

    pub fn commit(mut self) -> Result<(), StoreError> {
        let mut validators = std::mem::take(&mut self.validators);
        for validator in &mut validators {
            if let Err(err) = validator() {
                self.playback_and_discard();
                return Err(err);
            }
        }

        drop(self.file.take());
        fs::rename(self.root.join(JOURNAL), self.root.join(UNDO))?;
        if self.backed_up_bookmarks {
            fs::rename(
                self.root.join(JOURNAL_BOOKMARKS),
                self.root.join(UNDO_BOOKMARKS),
            )?;
        } else {
            // a stale copy from an older transaction must not outlive it
            remove_if_present(&self.root.join(UNDO_BOOKMARKS))?;
        }
        self.closed = true;
        self.active.set(false);
        debug!("transaction committed");
        for hook in std::mem::take(&mut self.postclose) {
            hook();
        }
        Ok(())
    }

    pub fn abort(mut self) -> Result<(), StoreError> {
        self.playback()?;
        Ok(())
    }

    fn playback(&mut self) -> Result<(), StoreError> {
        drop(self.file.take());
        playback_entries(&self.root, &self.entries)?;
        restore_backup(&self.root, JOURNAL_BOOKMARKS)?;
        remove_if_present(&self.root.join(JOURNAL))?;
        self.closed = true;
        self.active.set(false);
        debug!("transaction aborted");
        Ok(())
    }

    fn playback_and_discard(&mut self) {
        if let Err(err) = self.playback() {
            warn!(%err, "transaction rollback failed");
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.closed {
            warn!("unreleased transaction, rolling back");
            self.playback_and_discard();
        }
    }
}

/// Replay an on-disk journal and remove it. Returns false when no journal
/// exists. `recover` uses this on `journal`, `rollback` on `undo`.
pub(crate) fn replay(root: &Path, journal_name: &str, bookmarks_name: &str) -> Result<bool, StoreError> {
    let journal = root.join(journal_name);
    let bytes = match fs::read(&journal) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    let entries = parse_journal(&bytes);
    playback_entries(root, &entries)?;
    restore_backup(root, bookmarks_name)?;
    fs::remove_file(&journal)?;
    debug!(journal = %journal.display(), entries = entries.len(), "journal replayed");
    Ok(true)
}

fn playback_entries(root: &Path, entries: &[(String, u64)]) -> Result<(), StoreError> {
    for (name, offset) in entries.iter().rev() {
        let path = root.join(name);
        if *offset == 0 {
            remove_if_present(&path)?;
            continue;
        }
        match OpenOptions::new().write(true).open(&path) {
            Ok(file) => {
                file.set_len(*offset)?;
                file.sync_data()?;
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                warn!(file = %path.display(), "journalled file missing during rollback");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn restore_backup(root: &Path, backup_name: &str) -> Result<(), StoreError> {
    let backup = root.join(backup_name);
    if backup.exists() {
        fs::rename(&backup, root.join("bookmarks"))?;
    }
    Ok(())
}

fn remove_if_present(path: &Path) -> Result<(), StoreError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// A torn trailing line means the crash happened while journalling, before
/// the guarded mutation started, so it is safe to skip.
fn parse_journal(bytes: &[u8]) -> Vec<(String, u64)> {
    let text = String::from_utf8_lossy(bytes);
    let mut entries = Vec::new();
    for line in text.split_inclusive('\n') {
        let Some(line) = line.strip_suffix('\n') else {
            warn!("skipping torn journal entry");
            continue;
        };
        match line.split_once('\0') {
            Some((name, offset)) if !name.is_empty() => match offset.parse::<u64>() {
                Ok(offset) => entries.push((name.to_owned(), offset)),
                Err(_) => warn!(?line, "skipping malformed journal entry"),
            },
            _ => warn!(?line, "skipping malformed journal entry"),
        }
    }
    entries
}
