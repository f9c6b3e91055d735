//! Repository handles.
//!
//! A repository is a working directory with a `.hearth/` metadata directory
//! beside it: `requires`, repo config, `bookmarks`, `strip-backup/` and the
//! `store/` holding the changelog, one log per tracked file, the lock and
//! the transaction journal. Revlogs are opened lazily and dropped wholesale
//! by `invalidate` after anything truncates files behind their backs.
//!
//! There is no manifest and no working-copy state: a snapshot records the
//! named files as they are handed in, and `cat` resolves a file at a
//! revision as the newest file entry linked at or before it. History is
//! expected to be effectively linear; branching exists for strip's sake.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bookmarks::{self, Bookmarks};
use crate::errors::StoreError;
use crate::lock::LockGuard;
use crate::log::FileLog;
use crate::revlog::{changeset_node, file_node, NodeId, Revlog, NULL_REV};
use crate::transaction::{
    self, Transaction, JOURNAL, JOURNAL_BOOKMARKS, UNDO, UNDO_BOOKMARKS,
};

pub const HEARTH_DIR: &str = ".hearth";

const REQUIREMENTS: &[&str] = &["blake3-nodes", "store-v1"];
pub(crate) const CHANGELOG_IDX: &str = "store/changelog.idx";
pub(crate) const CHANGELOG_DAT: &str = "store/changelog.dat";
const HEADS_CACHE: &str = "store/cache/heads";

/// Changeset metadata, msgpack-encoded as the changelog payload. `files`
/// lists only the paths that actually changed in this revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangesetMeta {
    pub message: String,
    pub user: String,
    pub date: DateTime<Utc>,
    pub files: Vec<String>,
}

impl ChangesetMeta {
    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<ChangesetMeta, StoreError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

pub struct Repository {
    root: PathBuf,
    hearth: PathBuf,
    changelog: Option<Revlog<FileLog>>,
    filelogs: HashMap<String, Revlog<FileLog>>,
    working_held: Rc<Cell<u32>>,
    store_held: Rc<Cell<u32>>,
    tx_active: Rc<Cell<bool>>,
}

impl Repository {
    /// Create a fresh repository at `root` (created if missing).
    pub fn init(root: &Path) -> Result<Repository, StoreError> {
        let hearth = root.join(HEARTH_DIR);
        if hearth.exists() {
            return Err(StoreError::AlreadyExists(root.to_owned()));
        }
        fs::create_dir_all(hearth.join("store/data"))?;
        fs::create_dir_all(hearth.join("store/cache"))?;
        fs::create_dir_all(hearth.join("strip-backup"))?;

        let requires = hearth.join("requires");
        let tmp = hearth.join("requires.new");
        fs::write(&tmp, format!("{}\n", REQUIREMENTS.join("\n")))?;
        fs::rename(&tmp, &requires)?;
        fs::write(hearth.join("config.toml"), "# per-repository configuration\n")?;
        debug!(root = %root.display(), "repository created");
        Repository::open(root)
    }

    /// Open an existing repository. Refuses when `requires` names a
    /// feature this build does not know.
    pub fn open(root: &Path) -> Result<Repository, StoreError> {
        let root = root
            .canonicalize()
            .map_err(|_| StoreError::NotARepository(root.to_owned()))?;
        let hearth = root.join(HEARTH_DIR);
        if !hearth.is_dir() {
            return Err(StoreError::NotARepository(root));
        }
        let requires = fs::read_to_string(hearth.join("requires"))
            .map_err(|_| StoreError::Corrupt("missing requires file".to_owned()))?;
        for line in requires.lines() {
            if !line.is_empty() && !REQUIREMENTS.contains(&line) {
                return Err(StoreError::UnknownRequirement(line.to_owned()));
            }
        }
        Ok(Repository {
            root,
            hearth,
            changelog: None,
            filelogs: HashMap::new(),
            working_held: Rc::new(Cell::new(0)),
            store_held: Rc::new(Cell::new(0)),
            tx_active: Rc::new(Cell::new(false)),
        })
    }

    /// Walk up from `start` to the enclosing repository.
    pub fn discover(start: &Path) -> Result<Repository, StoreError> {
        let start = if start.is_absolute() {
            start.to_owned()
        } else {
            std::env::current_dir()?.join(start)
        };
        let mut dir = start.as_path();
        loop {
            if dir.join(HEARTH_DIR).is_dir() {
                return Repository::open(dir);
            }
            match dir.parent() {
                Some(parent) => dir = parent,
                None => return Err(StoreError::NotARepository(start)),
            }
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hearth_dir(&self) -> &Path {
        &self.hearth
    }

    pub fn lock_working(
        &self,
        wait: Option<Duration>,
        notice: impl FnMut(&str),
    ) -> Result<LockGuard, StoreError> {
        LockGuard::acquire(
            &self.hearth.join("wlock"),
            &format!("working directory of {}", self.root.display()),
            wait,
            self.working_held.clone(),
            notice,
        )
    }

    /// Take the store lock. A journal on disk at this point is the debris
    /// of a crashed transaction and makes the store unusable until
    /// `recover` replays it.
    pub fn lock_store(
        &self,
        wait: Option<Duration>,
        notice: impl FnMut(&str),
    ) -> Result<LockGuard, StoreError> {
        let guard = self.lock_store_raw(wait, notice)?;
        if self.hearth.join(JOURNAL).exists() {
            return Err(StoreError::AbandonedTransaction);
        }
        Ok(guard)
    }

    fn lock_store_raw(
        &self,
        wait: Option<Duration>,
        notice: impl FnMut(&str),
    ) -> Result<LockGuard, StoreError> {
        LockGuard::acquire(
            &self.hearth.join("store/lock"),
            &format!("repository {}", self.root.display()),
            wait,
            self.store_held.clone(),
            notice,
        )
    }

    pub(crate) fn assert_mutable(&self) -> Result<(), StoreError> {
        if self.working_held.get() == 0 || self.store_held.get() == 0 {
            return Err(StoreError::Programming("mutation requires both locks"));
        }
        if self.tx_active.get() {
            return Err(StoreError::Programming("transaction already active"));
        }
        Ok(())
    }

    /// Open a transaction. Bookmarks are backed up first and derived
    /// caches dropped, so nothing stale survives whatever happens next.
    pub fn transaction(&mut self) -> Result<Transaction, StoreError> {
        if self.store_held.get() == 0 {
            return Err(StoreError::Programming("transaction requires the store lock"));
        }
        let mut tx = Transaction::begin(&self.hearth, self.tx_active.clone())?;
        tx.backup_bookmarks()?;
        self.clear_derived_caches()?;
        Ok(tx)
    }

    /// Drop all cached revlog handles. Required after any rollback, which
    /// truncates files underneath the open handles.
    pub fn invalidate(&mut self) {
        self.changelog = None;
        self.filelogs.clear();
    }

    pub(crate) fn clear_derived_caches(&self) -> Result<(), StoreError> {
        let entries = match fs::read_dir(self.hearth.join("store/cache")) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let _ = fs::remove_file(entry?.path());
        }
        Ok(())
    }

    pub(crate) fn changelog(&mut self) -> Result<&mut Revlog<FileLog>, StoreError> {
        if self.changelog.is_none() {
            let idx = FileLog::open(&self.hearth.join(CHANGELOG_IDX))?;
            let dat = FileLog::open(&self.hearth.join(CHANGELOG_DAT))?;
            self.changelog = Some(Revlog::open(idx, dat)?);
        }
        self.changelog
            .as_mut()
            .ok_or(StoreError::Programming("changelog not initialized"))
    }

    /// Open or create the log for a tracked file.
    pub(crate) fn filelog_mut(&mut self, path: &str) -> Result<&mut Revlog<FileLog>, StoreError> {
        if !self.filelogs.contains_key(path) {
            let rel = data_log_rel(path);
            let idx_path = self.hearth.join(format!("{rel}.idx"));
            if let Some(parent) = idx_path.parent() {
                fs::create_dir_all(parent)?;
            }
            let idx = FileLog::open(&idx_path)?;
            let dat = FileLog::open(&self.hearth.join(format!("{rel}.dat")))?;
            let log = Revlog::open(idx, dat)?;
            self.filelogs.insert(path.to_owned(), log);
        }
        self.filelogs
            .get_mut(path)
            .ok_or(StoreError::Programming("filelog not initialized"))
    }

    /// Like `filelog_mut` but never creates log files on disk.
    pub(crate) fn filelog_if_exists(
        &mut self,
        path: &str,
    ) -> Result<Option<&mut Revlog<FileLog>>, StoreError> {
        if !self.filelogs.contains_key(path)
            && !self.hearth.join(format!("{}.idx", data_log_rel(path))).exists()
        {
            return Ok(None);
        }
        self.filelog_mut(path).map(Some)
    }

    pub(crate) fn sync_logs(&mut self) -> Result<(), StoreError> {
        if let Some(log) = &mut self.changelog {
            log.sync()?;
        }
        for log in self.filelogs.values_mut() {
            log.sync()?;
        }
        Ok(())
    }

    pub fn tip(&mut self) -> Result<Option<(u32, NodeId)>, StoreError> {
        let log = self.changelog()?;
        let tip = log.tip();
        if tip < 0 {
            return Ok(None);
        }
        Ok(log.node(tip as u32).map(|node| (tip as u32, node)))
    }

    /// Record the given file contents as a new changeset on `parent`
    /// (default tip). Unchanged files are skipped; if nothing changed at
    /// all the snapshot is refused.
    pub fn snapshot(
        &mut self,
        message: &str,
        user: &str,
        parent: Option<u32>,
        files: &[(String, Vec<u8>)],
    ) -> Result<(u32, NodeId), StoreError> {
        self.assert_mutable()?;
        let mut tx = self.transaction()?;
        match self.snapshot_locked(&mut tx, message, user, parent, files) {
            Ok(out) => match tx.commit() {
                Ok(()) => Ok(out),
                Err(err) => {
                    self.invalidate();
                    Err(err)
                }
            },
            Err(err) => {
                abort_quietly(tx);
                self.invalidate();
                Err(err)
            }
        }
    }

    fn snapshot_locked(
        &mut self,
        tx: &mut Transaction,
        message: &str,
        user: &str,
        parent: Option<u32>,
        files: &[(String, Vec<u8>)],
    ) -> Result<(u32, NodeId), StoreError> {
        let count = self.changelog()?.count();
        let parent_rev: i32 = match parent {
            Some(rev) if rev >= count => {
                return Err(StoreError::UnknownRevision(rev.to_string()));
            }
            Some(rev) => rev as i32,
            None => count as i32 - 1,
        };
        let new_rev = count;

        let mut named: BTreeMap<String, &[u8]> = BTreeMap::new();
        for (path, content) in files {
            named.insert(normalize_store_path(path)?, content.as_slice());
        }

        let mut changed = Vec::new();
        for (path, content) in &named {
            let rel = data_log_rel(path);
            let log = self.filelog_mut(path)?;
            let parent_entry = latest_at(log, parent_rev);
            if let Some(idx) = parent_entry
                && log.read(idx)?.as_slice() == *content
            {
                continue;
            }
            let parent_node = parent_entry
                .and_then(|idx| log.node(idx))
                .unwrap_or(NodeId::NULL);
            let node = file_node(&parent_node, content);
            let (idx_len, dat_len) = log.sizes();
            tx.add(&format!("{rel}.idx"), idx_len)?;
            tx.add(&format!("{rel}.dat"), dat_len)?;
            if !log.has_node(&node) {
                log.append(node, new_rev as i32, NULL_REV, content)?;
            }
            changed.push(path.clone());
        }
        if changed.is_empty() {
            return Err(StoreError::NothingChanged);
        }

        let meta = ChangesetMeta {
            message: message.to_owned(),
            user: user.to_owned(),
            date: Utc::now(),
            files: changed,
        };
        let payload = meta.encode()?;
        let log = self.changelog()?;
        let p1node = node_or_null(log, parent_rev);
        let node = changeset_node(&p1node, &NodeId::NULL, &payload);
        let (idx_len, dat_len) = log.sizes();
        tx.add(CHANGELOG_IDX, idx_len)?;
        tx.add(CHANGELOG_DAT, dat_len)?;
        let rev = log.append(node, parent_rev, NULL_REV, &payload)?;
        self.sync_logs()?;
        self.queue_heads_cache(tx)?;
        debug!(rev, node = %node.short(), "snapshot recorded");
        Ok((rev, node))
    }

    /// Cache the post-commit heads, written only once the transaction is
    /// actually visible.
    pub(crate) fn queue_heads_cache(&mut self, tx: &mut Transaction) -> Result<(), StoreError> {
        let log = self.changelog()?;
        let mut text = String::new();
        for rev in log.heads() {
            if let Some(node) = log.node(rev) {
                text.push_str(&node.to_hex());
                text.push('\n');
            }
        }
        let path = self.hearth.join(HEADS_CACHE);
        tx.add_postclose(move || {
            let ok = path
                .parent()
                .map(|dir| fs::create_dir_all(dir).is_ok())
                .unwrap_or(false);
            if !ok || fs::write(&path, &text).is_err() {
                warn!("heads cache not updated");
            }
        });
        Ok(())
    }

    pub(crate) fn write_heads_cache(&mut self) -> Result<(), StoreError> {
        let log = self.changelog()?;
        let mut text = String::new();
        for rev in log.heads() {
            if let Some(node) = log.node(rev) {
                text.push_str(&node.to_hex());
                text.push('\n');
            }
        }
        let path = self.hearth.join(HEADS_CACHE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, text)?;
        Ok(())
    }

    /// Childless revisions, through the derived cache when it is present
    /// and still resolvable.
    pub fn heads(&mut self) -> Result<Vec<(u32, NodeId)>, StoreError> {
        let cached = fs::read_to_string(self.hearth.join(HEADS_CACHE)).ok();
        if let Some(text) = cached {
            let log = self.changelog()?;
            let mut out = Vec::new();
            let mut usable = true;
            for line in text.lines() {
                match NodeId::from_hex(line).and_then(|node| log.rev(&node).map(|rev| (rev, node)))
                {
                    Some(pair) => out.push(pair),
                    None => {
                        usable = false;
                        break;
                    }
                }
            }
            if usable {
                out.sort_unstable_by_key(|(rev, _)| *rev);
                return Ok(out);
            }
        }
        let log = self.changelog()?;
        Ok(log
            .heads()
            .into_iter()
            .filter_map(|rev| log.node(rev).map(|node| (rev, node)))
            .collect())
    }

    pub fn changeset(&mut self, rev: u32) -> Result<(NodeId, ChangesetMeta), StoreError> {
        let log = self.changelog()?;
        let node = log
            .node(rev)
            .ok_or_else(|| StoreError::UnknownRevision(rev.to_string()))?;
        let meta = ChangesetMeta::decode(&log.read(rev)?)?;
        Ok((node, meta))
    }

    /// Newest-first changesets, at most `limit` when given.
    pub fn recent(
        &mut self,
        limit: Option<usize>,
    ) -> Result<Vec<(u32, NodeId, ChangesetMeta)>, StoreError> {
        let count = self.changelog()?.count();
        let mut out = Vec::new();
        for rev in (0..count).rev().take(limit.unwrap_or(usize::MAX)) {
            let (node, meta) = self.changeset(rev)?;
            out.push((rev, node, meta));
        }
        Ok(out)
    }

    /// File content as of a revision: the newest file entry linked at or
    /// before it.
    pub fn cat(&mut self, rev: u32, path: &str) -> Result<Vec<u8>, StoreError> {
        let path = normalize_store_path(path)?;
        if rev >= self.changelog()?.count() {
            return Err(StoreError::UnknownRevision(rev.to_string()));
        }
        let Some(log) = self.filelog_if_exists(&path)? else {
            return Err(StoreError::UnknownFile(path));
        };
        match latest_at(log, rev as i32) {
            Some(idx) => log.read(idx),
            None => Err(StoreError::UnknownFile(path)),
        }
    }

    /// Resolve a revision argument: `tip`, a bookmark, a decimal revision
    /// or a hex node prefix, in that order.
    pub fn resolve(&mut self, spec: &str) -> Result<u32, StoreError> {
        let spec = spec.trim();
        let count = self.changelog()?.count();
        if spec == "tip" {
            return if count > 0 {
                Ok(count - 1)
            } else {
                Err(StoreError::UnknownRevision(spec.to_owned()))
            };
        }
        if let Some(node) = self.bookmarks()?.get(spec) {
            let log = self.changelog()?;
            return log.rev(node).ok_or_else(|| {
                StoreError::Corrupt(format!("bookmark {spec:?} points outside the changelog"))
            });
        }
        if let Ok(rev) = spec.parse::<u32>() {
            return if rev < count {
                Ok(rev)
            } else {
                Err(StoreError::UnknownRevision(spec.to_owned()))
            };
        }
        match self.changelog()?.lookup_prefix(spec)? {
            Some(rev) => Ok(rev),
            None => Err(StoreError::UnknownRevision(spec.to_owned())),
        }
    }

    pub fn bookmarks(&self) -> Result<Bookmarks, StoreError> {
        bookmarks::read_file(&self.hearth.join("bookmarks"))
    }

    pub fn set_bookmark(&mut self, name: &str, rev: u32) -> Result<NodeId, StoreError> {
        bookmarks::check_name(name)?;
        self.assert_mutable()?;
        let node = self
            .changelog()?
            .node(rev)
            .ok_or_else(|| StoreError::UnknownRevision(rev.to_string()))?;
        let mut marks = self.bookmarks()?;
        marks.insert(name.to_owned(), node);
        self.write_bookmarks_tx(&marks)?;
        Ok(node)
    }

    pub fn delete_bookmark(&mut self, name: &str) -> Result<(), StoreError> {
        self.assert_mutable()?;
        let mut marks = self.bookmarks()?;
        if marks.remove(name).is_none() {
            return Err(StoreError::UnknownBookmark(name.to_owned()));
        }
        self.write_bookmarks_tx(&marks)
    }

    fn write_bookmarks_tx(&mut self, marks: &Bookmarks) -> Result<(), StoreError> {
        let tx = self.transaction()?;
        match bookmarks::write_file(&self.hearth.join("bookmarks"), marks) {
            Ok(()) => tx.commit(),
            Err(err) => {
                abort_quietly(tx);
                Err(err)
            }
        }
    }

    /// Replay an abandoned journal. Returns false when there was nothing
    /// to recover.
    pub fn recover(
        &mut self,
        wait: Option<Duration>,
        mut notice: impl FnMut(&str),
    ) -> Result<bool, StoreError> {
        if self.tx_active.get() {
            return Err(StoreError::Programming("recover inside a transaction"));
        }
        let _working = self.lock_working(wait, &mut notice)?;
        let _store = self.lock_store_raw(wait, &mut notice)?;
        let replayed = transaction::replay(&self.hearth, JOURNAL, JOURNAL_BOOKMARKS)?;
        if replayed {
            self.clear_derived_caches()?;
            self.invalidate();
        }
        Ok(replayed)
    }

    /// Undo the most recent transaction. A second rollback finds no undo
    /// journal and reports that instead of touching anything.
    pub fn rollback(
        &mut self,
        wait: Option<Duration>,
        mut notice: impl FnMut(&str),
    ) -> Result<(), StoreError> {
        if self.tx_active.get() {
            return Err(StoreError::Programming("rollback inside a transaction"));
        }
        let _working = self.lock_working(wait, &mut notice)?;
        let _store = self.lock_store(wait, &mut notice)?;
        if !transaction::replay(&self.hearth, UNDO, UNDO_BOOKMARKS)? {
            return Err(StoreError::NothingToUndo);
        }
        self.clear_derived_caches()?;
        self.invalidate();
        Ok(())
    }

    /// Apply a bundle file. Returns the number of changesets added;
    /// already-known changesets are skipped.
    pub fn unbundle(&mut self, bundle_path: &Path) -> Result<u32, StoreError> {
        self.assert_mutable()?;
        let records = crate::bundle::read_bundle(bundle_path)?;
        let mut tx = self.transaction()?;
        let applied = crate::bundle::apply_records(self, &mut tx, &records);
        match applied {
            Ok(added) => {
                self.sync_logs()?;
                self.queue_heads_cache(&mut tx)?;
                match tx.commit() {
                    Ok(()) => Ok(added),
                    Err(err) => {
                        self.invalidate();
                        Err(err)
                    }
                }
            }
            Err(err) => {
                abort_quietly(tx);
                self.invalidate();
                Err(err)
            }
        }
    }
}

pub(crate) fn abort_quietly(tx: Transaction) {
    if let Err(err) = tx.abort() {
        warn!(%err, "transaction rollback failed");
    }
}

/// Newest entry of a filelog linked at or before `rev`.
pub(crate) fn latest_at<L: crate::log::TruncatableLog>(
    log: &Revlog<L>,
    rev: i32,
) -> Option<u32> {
    if rev < 0 {
        return None;
    }
    let boundary = log.entries().partition_point(|e| e.p1 <= rev);
    (boundary > 0).then(|| boundary as u32 - 1)
}

pub(crate) fn node_or_null<L: crate::log::TruncatableLog>(log: &Revlog<L>, rev: i32) -> NodeId {
    if rev < 0 {
        NodeId::NULL
    } else {
        log.node(rev as u32).unwrap_or(NodeId::NULL)
    }
}

/// Store-relative path of a file's log pair, without the `.idx`/`.dat`
/// suffix. Directory separators survive so the data area mirrors the
/// tracked tree; uppercase and `_` are escaped to stay safe on
/// case-folding filesystems, everything else unusual as `~xx`.
pub(crate) fn data_log_rel(path: &str) -> String {
    let mut escaped = String::with_capacity(path.len());
    for byte in path.bytes() {
        match byte {
            b'_' => escaped.push_str("__"),
            b'A'..=b'Z' => {
                escaped.push('_');
                escaped.push(byte.to_ascii_lowercase() as char);
            }
            b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'/' => escaped.push(byte as char),
            other => {
                escaped.push('~');
                escaped.push_str(&format!("{other:02x}"));
            }
        }
    }
    format!("store/data/{escaped}")
}

/// Clean a user-supplied path into its repository-relative form.
pub(crate) fn normalize_store_path(path: &str) -> Result<String, StoreError> {
    if path.starts_with('/') {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => return Err(StoreError::InvalidPath(path.to_owned())),
            part if part == HEARTH_DIR => {
                return Err(StoreError::InvalidPath(path.to_owned()));
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(StoreError::InvalidPath(path.to_owned()));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (tempfile::TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init(&dir.path().join("repo")).unwrap();
        (dir, repo)
    }

    fn snap(repo: &mut Repository, message: &str, parent: Option<u32>, files: &[(&str, &[u8])]) -> (u32, NodeId) {
        let _working = repo.lock_working(None, |_| {}).unwrap();
        let _store = repo.lock_store(None, |_| {}).unwrap();
        let files: Vec<(String, Vec<u8>)> = files
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_vec()))
            .collect();
        repo.snapshot(message, "test", parent, &files).unwrap()
    }

    #[test]
    fn init_open_discover() {
        let (dir, repo) = fixture();
        let root = repo.root().to_owned();
        assert!(root.join(".hearth/store/data").is_dir());
        let requires = fs::read_to_string(root.join(".hearth/requires")).unwrap();
        assert_eq!(requires, "blake3-nodes\nstore-v1\n");

        assert!(matches!(
            Repository::init(&dir.path().join("repo")),
            Err(StoreError::AlreadyExists(_))
        ));

        let nested = root.join("src/deep");
        fs::create_dir_all(&nested).unwrap();
        let found = Repository::discover(&nested).unwrap();
        assert_eq!(found.root(), root);

        assert!(matches!(
            Repository::open(dir.path()),
            Err(StoreError::NotARepository(_))
        ));
    }

    #[test]
    fn unknown_requirement_refuses_open() {
        let (dir, repo) = fixture();
        let requires = repo.root().join(".hearth/requires");
        drop(repo);
        fs::write(&requires, "blake3-nodes\nstore-v1\nzlib-deltas\n").unwrap();
        assert!(matches!(
            Repository::open(&dir.path().join("repo")),
            Err(StoreError::UnknownRequirement(r)) if r == "zlib-deltas"
        ));
    }

    #[test]
    fn snapshot_and_cat() {
        let (_dir, mut repo) = fixture();
        let (r0, n0) = snap(&mut repo, "add", None, &[("a.txt", b"one"), ("b.txt", b"x")]);
        assert_eq!(r0, 0);
        let (r1, n1) = snap(&mut repo, "change a", None, &[("a.txt", b"two"), ("b.txt", b"x")]);
        assert_eq!(r1, 1);
        assert_ne!(n0, n1);

        assert_eq!(repo.cat(0, "a.txt").unwrap(), b"one");
        assert_eq!(repo.cat(1, "a.txt").unwrap(), b"two");
        assert_eq!(repo.cat(1, "b.txt").unwrap(), b"x");

        // b.txt was unchanged in r1, so its log has a single entry and
        // the second changeset does not list it
        let (_, meta) = repo.changeset(1).unwrap();
        assert_eq!(meta.files, vec!["a.txt"]);
        assert_eq!(repo.filelog_mut("b.txt").unwrap().count(), 1);

        assert!(matches!(
            repo.cat(0, "missing.txt"),
            Err(StoreError::UnknownFile(_))
        ));
        assert!(matches!(repo.cat(7, "a.txt"), Err(StoreError::UnknownRevision(_))));
    }

    #[test]
    fn revert_gets_a_fresh_file_node() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "v1", None, &[("f", b"aa")]);
        snap(&mut repo, "v2", None, &[("f", b"bb")]);
        snap(&mut repo, "revert", None, &[("f", b"aa")]);
        assert_eq!(repo.cat(1, "f").unwrap(), b"bb");
        assert_eq!(repo.cat(2, "f").unwrap(), b"aa");
        assert_eq!(repo.filelog_mut("f").unwrap().count(), 3);
    }

    #[test]
    fn snapshot_of_nothing_is_refused() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "base", None, &[("f", b"same")]);
        let _working = repo.lock_working(None, |_| {}).unwrap();
        let _store = repo.lock_store(None, |_| {}).unwrap();
        let unchanged = vec![("f".to_owned(), b"same".to_vec())];
        assert!(matches!(
            repo.snapshot("again", "test", None, &unchanged),
            Err(StoreError::NothingChanged)
        ));
        assert!(matches!(
            repo.snapshot("empty", "test", None, &[]),
            Err(StoreError::NothingChanged)
        ));
        // the failed attempts left no transaction debris behind
        assert!(!repo.hearth_dir().join(JOURNAL).exists());
        assert_eq!(repo.changelog().unwrap().count(), 1);
    }

    #[test]
    fn snapshot_requires_locks() {
        let (_dir, mut repo) = fixture();
        let files = vec![("f".to_owned(), b"x".to_vec())];
        assert!(matches!(
            repo.snapshot("no locks", "test", None, &files),
            Err(StoreError::Programming(_))
        ));
    }

    #[test]
    fn resolve_specs() {
        let (_dir, mut repo) = fixture();
        let (_, n0) = snap(&mut repo, "first", None, &[("f", b"1")]);
        snap(&mut repo, "second", None, &[("f", b"2")]);

        assert_eq!(repo.resolve("tip").unwrap(), 1);
        assert_eq!(repo.resolve("0").unwrap(), 0);
        assert_eq!(repo.resolve(&n0.to_hex()).unwrap(), 0);
        assert_eq!(repo.resolve(&n0.to_hex()[..8]).unwrap(), 0);
        assert!(matches!(repo.resolve("5"), Err(StoreError::UnknownRevision(_))));
        assert!(matches!(repo.resolve("feed"), Err(StoreError::UnknownRevision(_))));

        {
            let _working = repo.lock_working(None, |_| {}).unwrap();
            let _store = repo.lock_store(None, |_| {}).unwrap();
            repo.set_bookmark("main", 0).unwrap();
        }
        assert_eq!(repo.resolve("main").unwrap(), 0);
    }

    #[test]
    fn bookmarks_move_under_transactions() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "first", None, &[("f", b"1")]);
        snap(&mut repo, "second", None, &[("f", b"2")]);
        let _working = repo.lock_working(None, |_| {}).unwrap();
        let _store = repo.lock_store(None, |_| {}).unwrap();

        repo.set_bookmark("main", 0).unwrap();
        repo.set_bookmark("main", 1).unwrap();
        let marks = repo.bookmarks().unwrap();
        assert_eq!(marks.get("main"), repo.changelog().unwrap().node(1).as_ref());

        // the pre-move state went to undo.bookmarks at commit
        let undo = bookmarks::read_file(&repo.hearth_dir().join(UNDO_BOOKMARKS)).unwrap();
        assert_eq!(undo.get("main"), repo.changelog().unwrap().node(0).as_ref());

        assert!(matches!(
            repo.delete_bookmark("absent"),
            Err(StoreError::UnknownBookmark(_))
        ));
        repo.delete_bookmark("main").unwrap();
        assert!(repo.bookmarks().unwrap().is_empty());

        assert!(matches!(
            repo.set_bookmark("tip", 1),
            Err(StoreError::InvalidName(_))
        ));
    }

    #[test]
    fn rollback_undoes_the_last_snapshot() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "keep", None, &[("f", b"1")]);
        snap(&mut repo, "drop", None, &[("f", b"2")]);
        assert_eq!(repo.changelog().unwrap().count(), 2);

        repo.rollback(None, |_| {}).unwrap();
        assert_eq!(repo.changelog().unwrap().count(), 1);
        assert_eq!(repo.cat(0, "f").unwrap(), b"1");
        assert_eq!(repo.filelog_mut("f").unwrap().count(), 1);

        let before = repo.changelog().unwrap().sizes();
        assert!(matches!(
            repo.rollback(None, |_| {}),
            Err(StoreError::NothingToUndo)
        ));
        assert_eq!(repo.changelog().unwrap().sizes(), before);
    }

    #[test]
    fn recover_replays_an_abandoned_journal() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "base", None, &[("f", b"1")]);
        let hearth = repo.hearth_dir().to_owned();

        // fake a crashed append: grown changelog data, journal left behind
        let dat = hearth.join(CHANGELOG_DAT);
        let clean_len = fs::metadata(&dat).unwrap().len();
        let mut grown = fs::read(&dat).unwrap();
        grown.extend_from_slice(b"torn half-write");
        fs::write(&dat, grown).unwrap();
        fs::write(
            hearth.join(JOURNAL),
            format!("{CHANGELOG_DAT}\x00{clean_len}\n"),
        )
        .unwrap();

        // the journal blocks normal store locking until recovered
        assert!(matches!(
            repo.lock_store(None, |_| {}),
            Err(StoreError::AbandonedTransaction)
        ));

        assert!(repo.recover(None, |_| {}).unwrap());
        assert_eq!(fs::metadata(&dat).unwrap().len(), clean_len);
        assert!(!repo.recover(None, |_| {}).unwrap());
        assert_eq!(repo.changelog().unwrap().count(), 1);
    }

    #[test]
    fn heads_cache_refreshes_on_commit() {
        let (_dir, mut repo) = fixture();
        let cache = repo.hearth_dir().join(HEADS_CACHE);
        let (_, n0) = snap(&mut repo, "first", None, &[("f", b"1")]);
        assert_eq!(fs::read_to_string(&cache).unwrap(), format!("{}\n", n0.to_hex()));

        let (_, n1) = snap(&mut repo, "second", None, &[("f", b"2")]);
        assert_eq!(fs::read_to_string(&cache).unwrap(), format!("{}\n", n1.to_hex()));
        assert_eq!(repo.heads().unwrap(), vec![(1, n1)]);

        // a poisoned cache is ignored, not trusted
        fs::write(&cache, "ffff\n").unwrap();
        assert_eq!(repo.heads().unwrap(), vec![(1, n1)]);
    }

    #[test]
    fn branch_snapshot_makes_two_heads() {
        let (_dir, mut repo) = fixture();
        snap(&mut repo, "a", None, &[("f", b"a")]);
        snap(&mut repo, "b", None, &[("f", b"b")]);
        let (r2, _) = snap(&mut repo, "side", Some(0), &[("g", b"side")]);
        assert_eq!(r2, 2);
        assert_eq!(repo.changelog().unwrap().parents(2), (0, NULL_REV));
        let heads: Vec<u32> = repo.heads().unwrap().into_iter().map(|(r, _)| r).collect();
        assert_eq!(heads, vec![1, 2]);
    }

    #[test]
    fn path_normalization() {
        assert_eq!(normalize_store_path("./src//lib.rs").unwrap(), "src/lib.rs");
        for bad in ["", ".", "/etc/passwd", "../up", "src/../../out", ".hearth/requires"] {
            assert!(normalize_store_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn data_log_escaping() {
        assert_eq!(data_log_rel("src/Main_v2.rs"), "store/data/src/_main__v2.rs");
        assert_eq!(data_log_rel("héllo"), "store/data/h~c3~a9llo");
        assert_ne!(data_log_rel("a_b"), data_log_rel("a__b"));
    }

    #[test]
    fn meta_roundtrip() {
        let meta = ChangesetMeta {
            message: "fix the frobnicator".to_owned(),
            user: "dev@example.com".to_owned(),
            date: Utc::now(),
            files: vec!["a".to_owned(), "b".to_owned()],
        };
        let decoded = ChangesetMeta::decode(&meta.encode().unwrap()).unwrap();
        assert_eq!(decoded, meta);
    }
}
