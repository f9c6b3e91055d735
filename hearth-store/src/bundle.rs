//! Bundle files.
//!
//! A bundle is a self-contained set of changesets for moving history in
//! and out of a repository: strip writes one before it truncates anything,
//! `unbundle` applies one. The format is a small fixed header (magic,
//! version, compression byte) over a raw or zstd body of records. Each
//! record carries the changeset node, both parent nodes, the raw metadata
//! payload and the file revisions the changeset introduced, so a bundle
//! can be applied to any repository that has the parents.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use crate::errors::StoreError;
use crate::log::TruncatableLog;
use crate::repo::{
    self, data_log_rel, latest_at, node_or_null, normalize_store_path, Repository,
};
use crate::revlog::{changeset_node, file_node, NodeId, Revlog, NULL_REV};
use crate::transaction::Transaction;

const MAGIC: &[u8; 8] = b"HRTHBNDL";
const VERSION: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Raw,
    Zstd,
}

impl Compression {
    fn byte(self) -> u8 {
        match self {
            Compression::Raw => 0,
            Compression::Zstd => 1,
        }
    }

    fn from_byte(byte: u8) -> Result<Compression, StoreError> {
        match byte {
            0 => Ok(Compression::Raw),
            1 => Ok(Compression::Zstd),
            other => Err(StoreError::Corrupt(format!(
                "unknown bundle compression {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    pub path: String,
    pub node: NodeId,
    pub content: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BundleRecord {
    pub node: NodeId,
    pub p1: NodeId,
    pub p2: NodeId,
    pub payload: Vec<u8>,
    pub files: Vec<FileRecord>,
}

/// Serialize records to `path`, fsynced before returning: strip depends
/// on the bundle being durable before it mutates the store.
pub fn write_bundle(
    path: &Path,
    records: &[BundleRecord],
    compression: Compression,
) -> Result<(), StoreError> {
    let mut body = Vec::new();
    body.extend_from_slice(&(records.len() as u32).to_be_bytes());
    for record in records {
        body.extend_from_slice(record.node.as_bytes());
        body.extend_from_slice(record.p1.as_bytes());
        body.extend_from_slice(record.p2.as_bytes());
        body.extend_from_slice(&(record.payload.len() as u32).to_be_bytes());
        body.extend_from_slice(&record.payload);
        body.extend_from_slice(&(record.files.len() as u32).to_be_bytes());
        for file in &record.files {
            body.extend_from_slice(&(file.path.len() as u32).to_be_bytes());
            body.extend_from_slice(file.path.as_bytes());
            body.extend_from_slice(file.node.as_bytes());
            body.extend_from_slice(&(file.content.len() as u32).to_be_bytes());
            body.extend_from_slice(&file.content);
        }
    }
    let body = match compression {
        Compression::Raw => body,
        Compression::Zstd => zstd::stream::encode_all(body.as_slice(), 3)
            .map_err(|err| StoreError::Corrupt(format!("bundle compression failed: {err}")))?,
    };

    let mut out = File::create(path)?;
    out.write_all(MAGIC)?;
    out.write_all(&[VERSION, compression.byte()])?;
    out.write_all(&body)?;
    out.sync_all()?;
    debug!(path = %path.display(), records = records.len(), "bundle written");
    Ok(())
}

pub fn read_bundle(path: &Path) -> Result<Vec<BundleRecord>, StoreError> {
    let bytes = std::fs::read(path)?;
    if bytes.len() < MAGIC.len() + 2 || &bytes[..MAGIC.len()] != MAGIC {
        return Err(StoreError::Corrupt(format!(
            "{} is not a bundle file",
            path.display()
        )));
    }
    let version = bytes[MAGIC.len()];
    if version != VERSION {
        return Err(StoreError::Corrupt(format!(
            "unsupported bundle version {version}"
        )));
    }
    let compression = Compression::from_byte(bytes[MAGIC.len() + 1])?;
    let body = match compression {
        Compression::Raw => bytes[MAGIC.len() + 2..].to_vec(),
        Compression::Zstd => zstd::stream::decode_all(&bytes[MAGIC.len() + 2..])
            .map_err(|err| StoreError::Corrupt(format!("bundle decompression failed: {err}")))?,
    };

    let mut cursor = body.as_slice();
    let count = read_u32(&mut cursor)?;
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let node = read_node(&mut cursor)?;
        let p1 = read_node(&mut cursor)?;
        let p2 = read_node(&mut cursor)?;
        let payload_len = read_u32(&mut cursor)? as usize;
        let payload = take(&mut cursor, payload_len)?.to_vec();
        let nfiles = read_u32(&mut cursor)?;
        let mut files = Vec::with_capacity(nfiles as usize);
        for _ in 0..nfiles {
            let path_len = read_u32(&mut cursor)? as usize;
            let path = String::from_utf8(take(&mut cursor, path_len)?.to_vec())
                .map_err(|_| StoreError::Corrupt("bundle path is not UTF-8".to_owned()))?;
            let fnode = read_node(&mut cursor)?;
            let content_len = read_u32(&mut cursor)? as usize;
            let content = take(&mut cursor, content_len)?.to_vec();
            files.push(FileRecord {
                path,
                node: fnode,
                content,
            });
        }
        records.push(BundleRecord {
            node,
            p1,
            p2,
            payload,
            files,
        });
    }
    if !cursor.is_empty() {
        return Err(StoreError::Corrupt("trailing bytes in bundle".to_owned()));
    }
    Ok(records)
}

fn take<'a>(cursor: &mut &'a [u8], len: usize) -> Result<&'a [u8], StoreError> {
    if cursor.len() < len {
        return Err(StoreError::Corrupt("truncated bundle".to_owned()));
    }
    let (head, tail) = cursor.split_at(len);
    *cursor = tail;
    Ok(head)
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32, StoreError> {
    let bytes = take(cursor, 4)?;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    Ok(u32::from_be_bytes(buf))
}

fn read_node(cursor: &mut &[u8]) -> Result<NodeId, StoreError> {
    let bytes = take(cursor, 32)?;
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    Ok(NodeId::from_bytes(buf))
}

/// Build records for `revs` (ascending changelog revisions) out of the
/// repository. A file named by a changeset but carrying no entry at that
/// link revision was an unchanged-content reuse and produces no record.
pub(crate) fn build_records(
    repo: &mut Repository,
    revs: impl IntoIterator<Item = u32>,
) -> Result<Vec<BundleRecord>, StoreError> {
    let mut records = Vec::new();
    for rev in revs {
        let (node, meta) = repo.changeset(rev)?;
        let (payload, p1, p2) = {
            let log = repo.changelog()?;
            let (p1rev, p2rev) = log.parents(rev);
            (
                log.read(rev)?,
                node_or_null(log, p1rev),
                node_or_null(log, p2rev),
            )
        };
        let mut files = Vec::new();
        for path in &meta.files {
            let Some(log) = repo.filelog_if_exists(path)? else {
                continue;
            };
            if let Some(idx) = entry_at_link(log, rev) {
                files.push(FileRecord {
                    path: path.clone(),
                    node: log.node(idx).unwrap_or(NodeId::NULL),
                    content: log.read(idx)?,
                });
            }
        }
        records.push(BundleRecord {
            node,
            p1,
            p2,
            payload,
            files,
        });
    }
    Ok(records)
}

/// Append records inside the caller's transaction. Known changesets are
/// skipped; every appended node is recomputed from the record and must
/// match, so a tampered bundle cannot plant mislabelled history.
pub(crate) fn apply_records(
    repo: &mut Repository,
    tx: &mut Transaction,
    records: &[BundleRecord],
) -> Result<u32, StoreError> {
    let mut added = 0;
    for record in records {
        if repo.changelog()?.has_node(&record.node) {
            continue;
        }
        let (new_rev, p1rev, p2rev) = {
            let log = repo.changelog()?;
            (
                log.count(),
                rev_of(log, &record.p1)?,
                rev_of(log, &record.p2)?,
            )
        };
        if changeset_node(&record.p1, &record.p2, &record.payload) != record.node {
            return Err(StoreError::NodeMismatch {
                path: "changelog".to_owned(),
                rev: new_rev,
            });
        }

        for file in &record.files {
            let path = normalize_store_path(&file.path)?;
            let rel = data_log_rel(&path);
            let log = repo.filelog_mut(&path)?;
            if log.has_node(&file.node) {
                continue;
            }
            let parent_node = latest_at(log, p1rev)
                .and_then(|idx| log.node(idx))
                .unwrap_or(NodeId::NULL);
            if file_node(&parent_node, &file.content) != file.node {
                return Err(StoreError::NodeMismatch {
                    path,
                    rev: new_rev,
                });
            }
            let (idx_len, dat_len) = log.sizes();
            tx.add(&format!("{rel}.idx"), idx_len)?;
            tx.add(&format!("{rel}.dat"), dat_len)?;
            log.append(file.node, new_rev as i32, NULL_REV, &file.content)?;
        }

        let log = repo.changelog()?;
        let (idx_len, dat_len) = log.sizes();
        tx.add(repo::CHANGELOG_IDX, idx_len)?;
        tx.add(repo::CHANGELOG_DAT, dat_len)?;
        log.append(record.node, p1rev, p2rev, &record.payload)?;
        added += 1;
    }
    Ok(added)
}

fn rev_of<L: TruncatableLog>(log: &Revlog<L>, node: &NodeId) -> Result<i32, StoreError> {
    if *node == NodeId::NULL {
        return Ok(NULL_REV);
    }
    log.rev(node).map(|rev| rev as i32).ok_or_else(|| {
        StoreError::Corrupt(format!(
            "bundle references unknown parent {}",
            node.short()
        ))
    })
}

/// Entry index whose link revision is exactly `rev`, if any.
fn entry_at_link<L: TruncatableLog>(log: &Revlog<L>, rev: u32) -> Option<u32> {
    let boundary = log.entries().partition_point(|e| e.p1 < rev as i32);
    let entry = log.entries().get(boundary)?;
    (entry.p1 == rev as i32).then_some(boundary as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::Repository;

    fn seeded_repo(dir: &Path) -> Repository {
        let mut repo = Repository::init(dir).unwrap();
        let _working = repo.lock_working(None, |_| {}).unwrap();
        let _store = repo.lock_store(None, |_| {}).unwrap();
        let first = vec![
            ("src/lib.rs".to_owned(), b"fn main() {}".to_vec()),
            ("README".to_owned(), b"hello".to_vec()),
        ];
        repo.snapshot("initial", "test", None, &first).unwrap();
        let second = vec![("src/lib.rs".to_owned(), b"fn main() { run() }".to_vec())];
        repo.snapshot("tweak", "test", None, &second).unwrap();
        repo
    }

    #[test]
    fn roundtrip_both_compressions() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = seeded_repo(&dir.path().join("repo"));
        let records = build_records(&mut repo, 0..2).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].files.len(), 2);
        assert_eq!(records[1].files.len(), 1);

        for compression in [Compression::Raw, Compression::Zstd] {
            let path = dir.path().join("test.bundle");
            write_bundle(&path, &records, compression).unwrap();
            assert_eq!(read_bundle(&path).unwrap(), records);
        }
    }

    #[test]
    fn rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.bundle");

        std::fs::write(&path, b"not a bundle at all").unwrap();
        assert!(matches!(read_bundle(&path), Err(StoreError::Corrupt(_))));

        let mut repo = seeded_repo(&dir.path().join("repo"));
        let records = build_records(&mut repo, 0..2).unwrap();
        write_bundle(&path, &records, Compression::Raw).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 5);
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(read_bundle(&path), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn apply_transplants_history() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = seeded_repo(&dir.path().join("source"));
        let records = build_records(&mut source, 0..2).unwrap();
        let path = dir.path().join("move.bundle");
        write_bundle(&path, &records, Compression::Zstd).unwrap();

        let mut target = Repository::init(&dir.path().join("target")).unwrap();
        let _working = target.lock_working(None, |_| {}).unwrap();
        let _store = target.lock_store(None, |_| {}).unwrap();
        assert_eq!(target.unbundle(&path).unwrap(), 2);
        assert_eq!(target.cat(1, "src/lib.rs").unwrap(), b"fn main() { run() }");
        assert_eq!(target.cat(1, "README").unwrap(), b"hello");
        assert_eq!(
            target.changelog().unwrap().node(0),
            source.changelog().unwrap().node(0)
        );

        // a second application finds everything already present
        assert_eq!(target.unbundle(&path).unwrap(), 0);
        assert_eq!(target.changelog().unwrap().count(), 2);
    }

    #[test]
    fn tampered_content_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = seeded_repo(&dir.path().join("source"));
        let mut records = build_records(&mut source, 0..2).unwrap();
        records[1].files[0].content = b"evil".to_vec();
        let path = dir.path().join("tampered.bundle");
        write_bundle(&path, &records, Compression::Raw).unwrap();

        let mut target = Repository::init(&dir.path().join("target")).unwrap();
        let _working = target.lock_working(None, |_| {}).unwrap();
        let _store = target.lock_store(None, |_| {}).unwrap();
        let err = target.unbundle(&path).unwrap_err();
        assert!(matches!(err, StoreError::NodeMismatch { .. }));
        // the partial application was rolled back
        assert_eq!(target.changelog().unwrap().count(), 0);
        assert!(!target.hearth_dir().join("store/journal").exists());
    }

    #[test]
    fn traversal_paths_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = seeded_repo(&dir.path().join("source"));
        let mut records = build_records(&mut source, 0..1).unwrap();
        records[0].files[0].path = "../escape".to_owned();
        let path = dir.path().join("hostile.bundle");
        write_bundle(&path, &records, Compression::Raw).unwrap();

        let mut target = Repository::init(&dir.path().join("target")).unwrap();
        let _working = target.lock_working(None, |_| {}).unwrap();
        let _store = target.lock_store(None, |_| {}).unwrap();
        assert!(matches!(
            target.unbundle(&path),
            Err(StoreError::InvalidPath(_))
        ));
    }
}
