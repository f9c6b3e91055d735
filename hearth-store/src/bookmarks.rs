//! Bookmark pointers.
//!
//! One text file, one `<hex node> <name>` line per bookmark. Lines that do
//! not parse are skipped with a warning rather than failing the whole
//! repository; the file is rewritten wholesale on every change, under the
//! transaction's bookmarks backup.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use tracing::warn;

use crate::errors::StoreError;
use crate::revlog::NodeId;

pub type Bookmarks = BTreeMap<String, NodeId>;

pub fn read_file(path: &Path) -> Result<Bookmarks, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Bookmarks::new()),
        Err(err) => return Err(err.into()),
    };
    let mut marks = Bookmarks::new();
    for line in text.lines() {
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ') {
            Some((hex, name)) if !name.is_empty() => match NodeId::from_hex(hex) {
                Some(node) => {
                    marks.insert(name.to_owned(), node);
                }
                None => warn!(?line, "skipping malformed bookmark line"),
            },
            _ => warn!(?line, "skipping malformed bookmark line"),
        }
    }
    Ok(marks)
}

/// Rewrite the bookmarks file through a temp file and rename. The caller
/// holds the working lock, so the fixed temp name cannot collide.
pub fn write_file(path: &Path, marks: &Bookmarks) -> Result<(), StoreError> {
    let tmp = path.with_extension("new");
    let mut out = Vec::new();
    for (name, node) in marks {
        writeln!(out, "{} {}", node.to_hex(), name)?;
    }
    fs::write(&tmp, &out)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Bookmark names share the revision-spec namespace, so anything a
/// revision parser could mistake for a number or node is refused.
pub fn check_name(name: &str) -> Result<(), StoreError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed != name
        || name.contains([':', '\0', '\n', '\r'])
        || name.chars().all(|c| c.is_ascii_digit())
        || (name.len() >= 4 && name.chars().all(|c| c.is_ascii_hexdigit()))
        || name == "tip"
    {
        return Err(StoreError::InvalidName(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::revlog::file_node;

    #[test]
    fn roundtrip_and_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks");
        assert!(read_file(&path).unwrap().is_empty());

        let mut marks = Bookmarks::new();
        marks.insert("main".to_owned(), file_node(&NodeId::NULL, b"a"));
        marks.insert("work in progress".to_owned(), file_node(&NodeId::NULL, b"b"));
        write_file(&path, &marks).unwrap();
        assert_eq!(read_file(&path).unwrap(), marks);
        assert!(!path.with_extension("new").exists());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bookmarks");
        let node = file_node(&NodeId::NULL, b"a");
        let text = format!("not-a-node main\n{} good\n\n{}\n", node.to_hex(), node.to_hex());
        fs::write(&path, text).unwrap();
        let marks = read_file(&path).unwrap();
        assert_eq!(marks.len(), 1);
        assert_eq!(marks.get("good"), Some(&node));
    }

    #[test]
    fn name_rules() {
        assert!(check_name("feature/login").is_ok());
        assert!(check_name("v1.2-rc").is_ok());
        assert!(check_name("release notes").is_ok());
        for bad in ["", " lead", "trail ", "a:b", "12", "tip", "abcd12", "line\nbreak"] {
            assert!(check_name(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
