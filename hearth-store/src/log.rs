//! Truncatable append-only logs.
//!
//! Everything the store writes is one of these: bytes go on the end, reads
//! are positional, and rollback cuts the file back to a recorded length.
//! The trait exists so transaction and revlog logic can be exercised
//! against an in-memory log without touching a filesystem.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

pub trait TruncatableLog {
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append at the end of the log.
    fn append(&mut self, data: &[u8]) -> io::Result<()>;

    /// Cut the log back to exactly `len` bytes. Growing is a contract
    /// violation and reports `InvalidInput`.
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;

    /// Positional read of exactly `len` bytes.
    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;

    /// Make appended data durable.
    fn sync(&mut self) -> io::Result<()>;
}

/// File-backed log. Opened in append mode so writes always land at the real
/// end of file, including right after a truncation.
pub struct FileLog {
    file: File,
    len: u64,
    path: PathBuf,
}

impl FileLog {
    pub fn open(path: &Path) -> io::Result<FileLog> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let len = file.metadata()?.len();
        Ok(FileLog {
            file,
            len,
            path: path.to_owned(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TruncatableLog for FileLog {
    fn len(&self) -> u64 {
        self.len
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.file.write_all(data)?;
        self.len += data.len() as u64;
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        if len > self.len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("cannot truncate {} to {} (len {})", self.path.display(), len, self.len),
            ));
        }
        self.file.set_len(len)?;
        self.file.sync_data()?;
        self.len = len;
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(buf)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

/// In-memory log for tests.
#[derive(Default)]
pub struct MemLog {
    data: Vec<u8>,
}

impl MemLog {
    pub fn new() -> MemLog {
        MemLog::default()
    }

    pub fn with_contents(data: &[u8]) -> MemLog {
        MemLog {
            data: data.to_vec(),
        }
    }
}

impl TruncatableLog for MemLog {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn append(&mut self, data: &[u8]) -> io::Result<()> {
        self.data.extend_from_slice(data);
        Ok(())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        if len > self.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot truncate a log to a larger size",
            ));
        }
        self.data.truncate(len as usize);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(self.data[start..end].to_vec()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past the end of the log",
            )),
        }
    }

    fn sync(&mut self) -> io::Result<()> {
        Ok(())
    }
}
