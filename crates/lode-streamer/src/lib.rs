//! Asynchronous file streaming stack.
//!
//! Callers queue file requests on a [`Scheduler`]. A dedicated thread orders
//! them by priority, deadline and locality, and pushes them through a chain of
//! stages:
//!
//! - [`Decompressor`]: decodes compressed reads
//! - [`ReadSplitter`]: cuts large or misaligned reads into device-sized chunks
//! - [`DedicatedCache`]: per-file caches created on request
//! - [`BlockCache`]: shared block cache with LRU eviction
//! - [`StorageDrive`]: handle cache and the actual reads
//!
//! Requests form a graph of parents, children and dependencies held in an
//! arena. A parent completes once all of its children have.

pub mod config;
pub mod context;
pub mod error;
pub mod request;
pub mod scheduler;
pub mod stack;

#[cfg(test)]
mod testing;

pub use config::{
    BlockCacheConfig, BlockSize, DecompressorConfig, DedicatedCacheConfig, ReadSplitterConfig,
    SchedulerConfig, StageConfig, StorageDriveConfig, StreamerConfig,
};
pub use context::{ContextShared, StreamerContext};
pub use error::{Error, Result};
pub use request::{
    request_path, BufferTarget, Command, CompressedReadData, FileRange, FileRequest,
    FileRequestPtr, Priority, ReadResult, ReportType, RequestId, RequestPath, RequestStatus,
};
pub use scheduler::{ReadOptions, Scheduler};
pub use stack::block_cache::BlockCache;
pub use stack::decompressor::{CompressionCodec, Decompressor};
pub use stack::dedicated_cache::DedicatedCache;
pub use stack::read_splitter::ReadSplitter;
pub use stack::storage_drive::StorageDrive;
pub use stack::{BoxedStage, StackBuilder, StackEntryBase, Status, StreamStackEntry};
