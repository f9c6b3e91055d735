//! Append-only revision logs.
//!
//! A revlog is a pair of logs: a fixed-width index and a data log holding
//! the payloads the index points into. Revisions are numbered from zero in
//! append order and a parent always precedes its children, so a single
//! ascending pass can answer descendant queries. The changelog stores
//! changeset metadata; per-file logs store file contents and borrow the
//! `p1` slot for the linking changelog revision.

use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;

use crate::errors::StoreError;
use crate::log::TruncatableLog;

/// Revision number of the missing parent.
pub const NULL_REV: i32 = -1;

/// Bytes per index entry: offset, length, two parents, node.
pub const ENTRY_SIZE: usize = 52;

/// 32-byte content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; 32]);

impl NodeId {
    /// Node of the missing parent, all zeroes.
    pub const NULL: NodeId = NodeId([0; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> NodeId {
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in self.0 {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }

    /// First twelve hex digits, the form shown to users.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_owned()
    }

    pub fn from_hex(s: &str) -> Option<NodeId> {
        if s.len() != 64 {
            return None;
        }
        let mut bytes = [0u8; 32];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = (hi * 16 + lo) as u8;
        }
        Some(NodeId(bytes))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Identifier of a changeset: parents bound into the hashed payload, so
/// the same message on different parents yields different nodes.
pub fn changeset_node(p1: &NodeId, p2: &NodeId, payload: &[u8]) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(p1.as_bytes());
    hasher.update(p2.as_bytes());
    hasher.update(payload);
    NodeId(*hasher.finalize().as_bytes())
}

/// Identifier of a file revision, chained on the previous revision of the
/// same file so a revert to older content still gets a fresh node. An
/// unchanged file keeps its entry instead of growing a new one, so equal
/// (parent, content) pairs never reach the log twice.
pub fn file_node(parent: &NodeId, content: &[u8]) -> NodeId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(parent.as_bytes());
    hasher.update(content);
    NodeId(*hasher.finalize().as_bytes())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub data_off: u64,
    pub data_len: u32,
    pub p1: i32,
    pub p2: i32,
    pub node: NodeId,
}

impl IndexEntry {
    pub fn encode(&self) -> [u8; ENTRY_SIZE] {
        let mut out = [0u8; ENTRY_SIZE];
        out[0..8].copy_from_slice(&self.data_off.to_be_bytes());
        out[8..12].copy_from_slice(&self.data_len.to_be_bytes());
        out[12..16].copy_from_slice(&self.p1.to_be_bytes());
        out[16..20].copy_from_slice(&self.p2.to_be_bytes());
        out[20..52].copy_from_slice(self.node.as_bytes());
        out
    }

    pub fn decode(buf: &[u8; ENTRY_SIZE]) -> IndexEntry {
        let mut data_off = [0u8; 8];
        data_off.copy_from_slice(&buf[0..8]);
        let mut data_len = [0u8; 4];
        data_len.copy_from_slice(&buf[8..12]);
        let mut p1 = [0u8; 4];
        p1.copy_from_slice(&buf[12..16]);
        let mut p2 = [0u8; 4];
        p2.copy_from_slice(&buf[16..20]);
        let mut node = [0u8; 32];
        node.copy_from_slice(&buf[20..52]);
        IndexEntry {
            data_off: u64::from_be_bytes(data_off),
            data_len: u32::from_be_bytes(data_len),
            p1: i32::from_be_bytes(p1),
            p2: i32::from_be_bytes(p2),
            node: NodeId(node),
        }
    }
}

pub struct Revlog<L: TruncatableLog> {
    index: L,
    data: L,
    entries: Vec<IndexEntry>,
    nodemap: HashMap<NodeId, u32>,
}

impl<L: TruncatableLog> Revlog<L> {
    /// Parse the whole index and build the node map. The index must be a
    /// whole number of entries; a short tail means a crashed writer whose
    /// journal was not replayed.
    pub fn open(index: L, data: L) -> Result<Revlog<L>, StoreError> {
        let len = index.len();
        if len % ENTRY_SIZE as u64 != 0 {
            return Err(StoreError::Corrupt(format!(
                "index size {len} is not a multiple of {ENTRY_SIZE}"
            )));
        }
        let buf = index.read_at(0, len as usize)?;
        let mut entries = Vec::with_capacity(buf.len() / ENTRY_SIZE);
        let mut nodemap = HashMap::with_capacity(entries.capacity());
        for chunk in buf.chunks_exact(ENTRY_SIZE) {
            let arr: &[u8; ENTRY_SIZE] = chunk
                .try_into()
                .map_err(|_| StoreError::Corrupt("short index entry".to_owned()))?;
            let entry = IndexEntry::decode(arr);
            if nodemap.insert(entry.node, entries.len() as u32).is_some() {
                return Err(StoreError::Corrupt(format!(
                    "duplicate node {} in index",
                    entry.node.short()
                )));
            }
            entries.push(entry);
        }
        Ok(Revlog {
            index,
            data,
            entries,
            nodemap,
        })
    }

    pub fn count(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The most recent revision, `NULL_REV` when the log is empty.
    pub fn tip(&self) -> i32 {
        self.entries.len() as i32 - 1
    }

    pub fn entry(&self, rev: u32) -> Option<&IndexEntry> {
        self.entries.get(rev as usize)
    }

    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Current byte sizes of the index and data logs, the values a
    /// transaction journals before this revlog is appended to.
    pub fn sizes(&self) -> (u64, u64) {
        (self.index.len(), self.data.len())
    }

    pub fn node(&self, rev: u32) -> Option<NodeId> {
        self.entries.get(rev as usize).map(|e| e.node)
    }

    pub fn rev(&self, node: &NodeId) -> Option<u32> {
        self.nodemap.get(node).copied()
    }

    pub fn has_node(&self, node: &NodeId) -> bool {
        self.nodemap.contains_key(node)
    }

    /// Resolve a hex prefix to a revision. `Ok(None)` when nothing
    /// matches; ambiguity is an error so callers never act on a guess.
    pub fn lookup_prefix(&self, prefix: &str) -> Result<Option<u32>, StoreError> {
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Ok(None);
        }
        let prefix = prefix.to_ascii_lowercase();
        let mut found = None;
        for (node, &rev) in &self.nodemap {
            if node.to_hex().starts_with(&prefix) {
                if found.is_some() {
                    return Err(StoreError::AmbiguousPrefix(prefix));
                }
                found = Some(rev);
            }
        }
        Ok(found)
    }

    pub fn read(&self, rev: u32) -> Result<Vec<u8>, StoreError> {
        let entry = self
            .entries
            .get(rev as usize)
            .ok_or(StoreError::Programming("read of nonexistent revision"))?;
        Ok(self.data.read_at(entry.data_off, entry.data_len as usize)?)
    }

    /// Append a revision. The caller is responsible for journalling the
    /// current log sizes first and for checking `has_node` when reuse is
    /// intended; appending a node that is already present is a bug.
    pub fn append(
        &mut self,
        node: NodeId,
        p1: i32,
        p2: i32,
        payload: &[u8],
    ) -> Result<u32, StoreError> {
        if self.nodemap.contains_key(&node) {
            return Err(StoreError::Programming("node already present in log"));
        }
        let entry = IndexEntry {
            data_off: self.data.len(),
            data_len: payload.len() as u32,
            p1,
            p2,
            node,
        };
        self.data.append(payload)?;
        self.index.append(&entry.encode())?;
        let rev = self.entries.len() as u32;
        self.nodemap.insert(node, rev);
        self.entries.push(entry);
        Ok(rev)
    }

    /// Sizes the logs would have after truncating away `boundary` and
    /// everything following it. Recorded in the journal before the cut so
    /// an interrupted truncation replays to the same state.
    pub fn truncation_targets(&self, boundary: u32) -> (u64, u64) {
        let index_len = boundary as u64 * ENTRY_SIZE as u64;
        let data_len = match self.entries.get(boundary as usize) {
            Some(entry) => entry.data_off,
            None => self.data.len(),
        };
        (index_len, data_len)
    }

    /// Drop revision `boundary` and everything after it.
    pub fn truncate(&mut self, boundary: u32) -> Result<(), StoreError> {
        if boundary as usize >= self.entries.len() {
            return Ok(());
        }
        let (index_len, data_len) = self.truncation_targets(boundary);
        self.index.truncate_to(index_len)?;
        self.data.truncate_to(data_len)?;
        for entry in self.entries.drain(boundary as usize..) {
            self.nodemap.remove(&entry.node);
        }
        Ok(())
    }

    pub fn sync(&mut self) -> Result<(), StoreError> {
        self.data.sync()?;
        self.index.sync()?;
        Ok(())
    }

    pub fn parents(&self, rev: u32) -> (i32, i32) {
        match self.entries.get(rev as usize) {
            Some(entry) => (entry.p1, entry.p2),
            None => (NULL_REV, NULL_REV),
        }
    }

    /// All revisions reachable from `revs` by following child edges,
    /// including `revs` themselves. One ascending pass suffices because
    /// parents always precede children.
    pub fn descendants(&self, revs: &[u32]) -> BTreeSet<u32> {
        let mut out: BTreeSet<u32> = revs.iter().copied().collect();
        let Some(&start) = out.iter().next() else {
            return out;
        };
        for rev in start..self.count() {
            let (p1, p2) = self.parents(rev);
            if (p1 >= 0 && out.contains(&(p1 as u32))) || (p2 >= 0 && out.contains(&(p2 as u32)))
            {
                out.insert(rev);
            }
        }
        out
    }

    /// Revisions with no children.
    pub fn heads(&self) -> Vec<u32> {
        let mut is_parent = vec![false; self.entries.len()];
        for entry in &self.entries {
            if entry.p1 >= 0 {
                is_parent[entry.p1 as usize] = true;
            }
            if entry.p2 >= 0 {
                is_parent[entry.p2 as usize] = true;
            }
        }
        (0..self.entries.len() as u32)
            .filter(|&rev| !is_parent[rev as usize])
            .collect()
    }

    /// The highest-numbered ancestor of `rev` (itself included) that is
    /// not in `excluded`, or `NULL_REV` when every ancestor is excluded.
    pub fn nearest_ancestor_outside(&self, rev: u32, excluded: &BTreeSet<u32>) -> i32 {
        let mut heap = BinaryHeap::new();
        let mut seen = HashSet::new();
        heap.push(rev as i32);
        seen.insert(rev as i32);
        while let Some(candidate) = heap.pop() {
            if candidate < 0 {
                continue;
            }
            if !excluded.contains(&(candidate as u32)) {
                return candidate;
            }
            let (p1, p2) = self.parents(candidate as u32);
            for parent in [p1, p2] {
                if parent >= 0 && seen.insert(parent) {
                    heap.push(parent);
                }
            }
        }
        NULL_REV
    }
}
