//! Synchronous file primitive.
//!
//! Handles are plain `Read + Write + Seek` objects; closing a handle is
//! dropping it.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};

/// Open file handle.
pub trait RawFile: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> RawFile for T {}

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Read only. The file must exist.
    Read,
    /// Write, creating or truncating the file.
    Write,
    /// Read and write, creating the file if it does not exist.
    ReadWrite,
}

/// Synchronous file system used by the terminal stage of the stack.
pub trait FileSystem: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn RawFile>>;

    fn exists(&self, path: &Path) -> bool;

    /// File length in bytes.
    fn size(&self, path: &Path) -> io::Result<u64>;
}

/// [`FileSystem`] backed by `std::fs`.
///
/// Relative request paths are resolved against `root` when one is set.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystem {
    root: Option<PathBuf>,
}

impl LocalFileSystem {
    /// File system resolving paths as given.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve relative paths against `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl FileSystem for LocalFileSystem {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<Box<dyn RawFile>> {
        let resolved = self.resolve(path);
        let file: File = match mode {
            OpenMode::Read => File::open(&resolved)?,
            OpenMode::Write => File::create(&resolved)?,
            OpenMode::ReadWrite => OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&resolved)?,
        };
        Ok(Box::new(file))
    }

    fn exists(&self, path: &Path) -> bool {
        self.resolve(path).is_file()
    }

    fn size(&self, path: &Path) -> io::Result<u64> {
        Ok(std::fs::metadata(self.resolve(path))?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::SeekFrom;

    #[test]
    fn test_local_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::with_root(dir.path());
        let path = Path::new("blob.bin");

        assert!(!fs.exists(path));
        {
            let mut file = fs.open(path, OpenMode::Write).unwrap();
            file.write_all(b"hello streaming world").unwrap();
        }
        assert!(fs.exists(path));
        assert_eq!(fs.size(path).unwrap(), 21);

        let mut file = fs.open(path, OpenMode::Read).unwrap();
        file.seek(SeekFrom::Start(6)).unwrap();
        let mut out = [0u8; 9];
        file.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"streaming");
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let fs = LocalFileSystem::with_root(dir.path());
        assert!(fs.open(Path::new("nope"), OpenMode::Read).is_err());
        assert!(fs.size(Path::new("nope")).is_err());
    }
}
