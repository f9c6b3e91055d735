//! History truncation with repair bundles.
//!
//! Stripping removes the target revisions and all their descendants by
//! truncating every log at the right boundary. Revisions above the cut
//! that are not descendants of a target are spared: they are written to a
//! temporary bundle before anything is touched and re-applied afterwards.
//! Nothing is truncated until the spare bundle (and, unless disabled, a
//! zstd backup bundle of the stripped revisions) is safely on disk, so any
//! failure leaves the user a bundle file and an exact recovery command.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::bookmarks;
use crate::bundle::{apply_records, build_records, read_bundle, write_bundle, Compression};
use crate::errors::StoreError;
use crate::log::FileLog;
use crate::repo::{abort_quietly, Repository, CHANGELOG_DAT, CHANGELOG_IDX};
use crate::revlog::{NodeId, Revlog};
use crate::transaction::{Transaction, UNDO, UNDO_BOOKMARKS};

#[derive(Debug, Clone, Default)]
pub struct StripOptions {
    /// Skip the zstd backup bundle of the stripped revisions. The
    /// temporary spare bundle is always written when needed.
    pub no_backup: bool,
}

#[derive(Debug)]
pub struct StripOutcome {
    /// Backup bundle holding the stripped revisions, unless disabled.
    pub backup: Option<PathBuf>,
    /// Number of changesets removed.
    pub stripped: usize,
}

/// Remove `targets` and their descendants from the repository. The caller
/// holds both locks and no transaction is open; violating either is a bug
/// in the caller, not a user error.
pub fn strip(
    repo: &mut Repository,
    targets: &[u32],
    options: &StripOptions,
) -> Result<StripOutcome, StoreError> {
    repo.assert_mutable()?;
    if targets.is_empty() {
        return Err(StoreError::Programming("strip needs at least one target revision"));
    }
    let count = repo.changelog()?.count();
    for &rev in targets {
        if rev >= count {
            return Err(StoreError::UnknownRevision(rev.to_string()));
        }
    }

    let striprev = targets.iter().copied().min().unwrap_or(0);
    let tostrip = repo.changelog()?.descendants(targets);
    let saverevs: BTreeSet<u32> = (striprev..count).filter(|rev| !tostrip.contains(rev)).collect();
    debug!(striprev, stripping = tostrip.len(), sparing = saverevs.len(), "strip plan");

    let stripped_nodes: Vec<NodeId> = {
        let log = repo.changelog()?;
        tostrip.iter().filter_map(|&rev| log.node(rev)).collect()
    };

    // every file linked at or above the cut needs its log truncated
    let mut affected: BTreeSet<String> = BTreeSet::new();
    for rev in striprev..count {
        let (_, meta) = repo.changeset(rev)?;
        affected.extend(meta.files);
    }

    // plan bookmark repair against the old graph; node values stay
    // meaningful because spared revisions keep their nodes
    let mut repairs: Vec<(String, Option<NodeId>)> = Vec::new();
    {
        let marks = repo.bookmarks()?;
        let log = repo.changelog()?;
        for (name, node) in &marks {
            if let Some(rev) = log.rev(node)
                && tostrip.contains(&rev)
            {
                let target = log.nearest_ancestor_outside(rev, &tostrip);
                let target_node = (target >= 0).then(|| log.node(target as u32)).flatten();
                repairs.push((name.clone(), target_node));
            }
        }
    }

    let backup_dir = repo.hearth_dir().join("strip-backup");
    fs::create_dir_all(&backup_dir)?;
    let temp = if saverevs.is_empty() {
        None
    } else {
        let records = build_records(repo, saverevs.iter().copied())?;
        let path = backup_dir.join(bundle_name(&stripped_nodes, "temp"));
        write_bundle(&path, &records, Compression::Raw)?;
        Some(path)
    };
    let backup = if options.no_backup {
        None
    } else {
        let records = build_records(repo, tostrip.iter().copied())?;
        let path = backup_dir.join(bundle_name(&stripped_nodes, "backup"));
        write_bundle(&path, &records, Compression::Zstd)?;
        info!(path = %path.display(), "backup bundle written");
        Some(path)
    };

    match mutate(repo, striprev, &affected, repairs, temp.as_deref()) {
        Ok(()) => {
            // a later rollback must not resurrect what was just stripped
            let _ = fs::remove_file(repo.hearth_dir().join(UNDO));
            let _ = fs::remove_file(repo.hearth_dir().join(UNDO_BOOKMARKS));
            if let Some(path) = &temp {
                let _ = fs::remove_file(path);
            }
            repo.invalidate();
            if let Err(err) = repo.write_heads_cache() {
                warn!(%err, "heads cache not rebuilt");
            }
            info!(stripped = tostrip.len(), "strip complete");
            Ok(StripOutcome {
                backup,
                stripped: tostrip.len(),
            })
        }
        Err(source) => Err(StoreError::StripFailed {
            backup,
            temp,
            source: Box::new(source),
        }),
    }
}

/// The three strip transactions: truncate, re-apply spares, repair
/// bookmarks. Journal entries record the sizes being truncated *to*, so a
/// crash mid-cut replays into the fully-truncated state instead of a torn
/// one.
fn mutate(
    repo: &mut Repository,
    striprev: u32,
    affected: &BTreeSet<String>,
    repairs: Vec<(String, Option<NodeId>)>,
    temp: Option<&Path>,
) -> Result<(), StoreError> {
    let mut tx = repo.transaction()?;
    if let Err(err) = truncate_store(repo, &mut tx, striprev, affected).and_then(|_| repo.sync_logs())
    {
        abort_quietly(tx);
        repo.invalidate();
        return Err(err);
    }
    if let Err(err) = tx.commit() {
        repo.invalidate();
        return Err(err);
    }

    if let Some(path) = temp {
        let records = read_bundle(path)?;
        let mut tx = repo.transaction()?;
        if let Err(err) =
            apply_records(repo, &mut tx, &records).and_then(|_| repo.sync_logs())
        {
            abort_quietly(tx);
            repo.invalidate();
            return Err(err);
        }
        if let Err(err) = tx.commit() {
            repo.invalidate();
            return Err(err);
        }
    }

    if !repairs.is_empty() {
        let mut marks = repo.bookmarks()?;
        let mut required = Vec::new();
        for (name, target) in repairs {
            match target {
                Some(node) => {
                    info!(bookmark = %name, node = %node.short(), "bookmark moved");
                    marks.insert(name, node);
                    required.push(node);
                }
                None => {
                    info!(bookmark = %name, "bookmark deleted, no surviving ancestor");
                    marks.remove(&name);
                }
            }
        }
        let bookmarks_path = repo.hearth_dir().join("bookmarks");
        let hearth = repo.hearth_dir().to_owned();
        let mut tx = repo.transaction()?;
        // re-check from disk that every repaired target really survived
        // before the move becomes visible
        tx.add_validator(move || {
            let idx = FileLog::open(&hearth.join(CHANGELOG_IDX))?;
            let dat = FileLog::open(&hearth.join(CHANGELOG_DAT))?;
            let log = Revlog::open(idx, dat)?;
            for node in &required {
                if !log.has_node(node) {
                    return Err(StoreError::Corrupt(format!(
                        "bookmark target {} missing after strip",
                        node.short()
                    )));
                }
            }
            Ok(())
        });
        if let Err(err) = bookmarks::write_file(&bookmarks_path, &marks) {
            abort_quietly(tx);
            return Err(err);
        }
        tx.commit()?;
    }
    Ok(())
}

fn truncate_store(
    repo: &mut Repository,
    tx: &mut Transaction,
    striprev: u32,
    affected: &BTreeSet<String>,
) -> Result<(), StoreError> {
    {
        let log = repo.changelog()?;
        let (idx_len, dat_len) = log.truncation_targets(striprev);
        tx.add(CHANGELOG_IDX, idx_len)?;
        tx.add(CHANGELOG_DAT, dat_len)?;
        log.truncate(striprev)?;
    }
    for path in affected {
        let rel = crate::repo::data_log_rel(path);
        let Some(log) = repo.filelog_if_exists(path)? else {
            continue;
        };
        let boundary = log.entries().partition_point(|e| e.p1 < striprev as i32) as u32;
        if (boundary as usize) == log.entries().len() {
            continue;
        }
        let (idx_len, dat_len) = log.truncation_targets(boundary);
        tx.add(&format!("{rel}.idx"), idx_len)?;
        tx.add(&format!("{rel}.dat"), dat_len)?;
        log.truncate(boundary)?;
    }
    Ok(())
}

/// `<first stripped node, short>-<digest over all stripped nodes>-<topic>`.
fn bundle_name(nodes: &[NodeId], topic: &str) -> String {
    let first = nodes
        .first()
        .map(NodeId::short)
        .unwrap_or_else(|| "empty".to_owned());
    let mut hasher = blake3::Hasher::new();
    for node in nodes {
        hasher.update(node.as_bytes());
    }
    let digest = hasher.finalize();
    let mut prefix = String::new();
    for byte in &digest.as_bytes()[..4] {
        prefix.push_str(&format!("{byte:02x}"));
    }
    format!("{first}-{prefix}-{topic}.bundle")
}
