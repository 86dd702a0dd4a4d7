//! In-memory file system.
//!
//! Useful for tests and for serving assets that were already loaded into
//! memory. Counts opens and reads so callers can observe how much traffic
//! reached the file system.

use crate::file::{FileSystem, OpenMode, RawFile};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

type FileData = Arc<RwLock<Vec<u8>>>;

/// [`FileSystem`] storing file contents in memory.
#[derive(Default)]
pub struct MemoryFileSystem {
    files: RwLock<HashMap<PathBuf, FileData>>,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    opens: AtomicU64,
    reads: AtomicU64,
    bytes_read: AtomicU64,
}

impl MemoryFileSystem {
    /// Empty file system.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a file.
    pub fn insert(&self, path: impl Into<PathBuf>, data: Vec<u8>) {
        self.files
            .write()
            .insert(path.into(), Arc::new(RwLock::new(data)));
    }

    /// Delete `path`. Returns whether it existed.
    pub fn remove(&self, path: &Path) -> bool {
        self.files.write().remove(path).is_some()
    }

    /// Snapshot of a file's contents.
    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().get(path).map(|data| data.read().clone())
    }

    /// Number of successful `open` calls.
    pub fn open_count(&self) -> u64 {
        self.counters.opens.load(Ordering::Relaxed)
    }

    /// Number of `read` calls on any handle.
    pub fn read_count(&self) -> u64 {
        self.counters.reads.load(Ordering::Relaxed)
    }

    /// Bytes returned by `read` calls on any handle.
    pub fn bytes_read(&self) -> u64 {
        self.counters.bytes_read.load(Ordering::Relaxed)
    }
}

impl FileSystem for MemoryFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn RawFile>> {
        let data = match mode {
            OpenMode::Read => self.files.read().get(path).cloned().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, path.display().to_string())
            })?,
            OpenMode::Write => {
                let data: FileData = Arc::new(RwLock::new(Vec::new()));
                self.files.write().insert(path.to_path_buf(), data.clone());
                data
            }
            OpenMode::ReadWrite => self
                .files
                .write()
                .entry(path.to_path_buf())
                .or_default()
                .clone(),
        };
        self.counters.opens.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryFile {
            data,
            position: 0,
            counters: Arc::clone(&self.counters),
        }))
    }

    fn exists(&self, path: &Path) -> bool {
        self.files.read().contains_key(path)
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        self.files
            .read()
            .get(path)
            .map(|data| data.read().len() as u64)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.display().to_string()))
    }
}

struct MemoryFile {
    data: FileData,
    position: u64,
    counters: Arc<Counters>,
}

impl Read for MemoryFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.data.read();
        let start = (self.position as usize).min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.position += count as u64;
        self.counters.reads.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_read
            .fetch_add(count as u64, Ordering::Relaxed);
        Ok(count)
    }
}

impl Write for MemoryFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut data = self.data.write();
        let start = self.position as usize;
        let end = start + buf.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        self.position = end as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.data.read().len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(delta) => len + delta,
            SeekFrom::Current(delta) => self.position as i64 + delta,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }
        self.position = target as u64;
        Ok(self.position)
    }
}
