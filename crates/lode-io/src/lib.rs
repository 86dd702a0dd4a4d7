//! I/O primitives consumed by the lode streaming stack.
//!
//! The streaming stack never talks to the operating system or a global
//! allocator directly. Everything it needs goes through the narrow
//! interfaces in this crate:
//!
//! - [`FileSystem`] / [`RawFile`]: synchronous open/read/write/seek/close
//!   plus `exists` and `size`
//! - [`ReadBuffer`] / [`SharedBuffer`]: owned output memory with a known
//!   start address, so alignment can be checked without `unsafe`
//! - [`RequestMemoryAllocator`]: buffer provider for reads whose size is only
//!   known once the file has been inspected
//! - [`Statistic`]: named numeric samples pulled by observers
//!
//! # Example
//!
//! ```ignore
//! use lode_io::{FileSystem, MemoryFileSystem, OpenMode};
//!
//! let fs = MemoryFileSystem::new();
//! fs.insert("data/level.pak", vec![0u8; 4096]);
//! assert_eq!(fs.size("data/level.pak".as_ref())?, 4096);
//! ```

pub mod error;
pub use error::{Error, Result};

mod allocator;
pub use allocator::{DefaultRequestAllocator, RequestMemoryAllocation, RequestMemoryAllocator};

mod buffer;
pub use buffer::{shared_buffer, ReadBuffer, SharedBuffer};

mod file;
pub use file::{FileSystem, LocalFileSystem, OpenMode, RawFile};

mod memory;
pub use memory::MemoryFileSystem;

mod statistics;
pub use statistics::{AverageWindow, Statistic, StatisticValue};
