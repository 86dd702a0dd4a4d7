//! # Lode - Asynchronous File Streaming
//!
//! Prioritized, deadline-aware file reads served through a stack of caches.
//!
//! ## Architecture
//!
//! Lode is an umbrella crate that coordinates:
//! - **lode-io** - File system, buffer, allocator and statistics primitives
//! - **lode-streamer** - Scheduler thread, request graph and the stage chain
//!   (decompressor, read splitter, dedicated cache, block cache, storage drive)
//!
//! ## Quick Start
//!
//! ```ignore
//! use lode::prelude::*;
//!
//! let scheduler = lode::builder().root("assets").build()?;
//!
//! let request = scheduler.create_request();
//! let buffer = shared_buffer(ReadBuffer::zeroed(64 * 1024));
//! scheduler.read(&request, "level.pak", buffer, ReadOptions::range(0, 64 * 1024));
//! scheduler.set_completion_callback(&request, |done| {
//!     println!("read finished: {:?}", done.status());
//! });
//! scheduler.queue_request(&request);
//! ```

/// Re-export of lode-io for direct access
pub use lode_io as io;

/// Re-export of lode-streamer for direct access
pub use lode_streamer as streamer;

pub use lode_io::{
    shared_buffer, DefaultRequestAllocator, FileSystem, LocalFileSystem, MemoryFileSystem,
    ReadBuffer, RequestMemoryAllocator, SharedBuffer, Statistic, StatisticValue,
};
pub use lode_streamer::{
    BlockCacheConfig, BlockSize, CompressedReadData, CompressionCodec, DecompressorConfig,
    DedicatedCacheConfig, FileRange, FileRequestPtr, Priority, ReadOptions, ReadResult,
    ReadSplitterConfig, ReportType, RequestStatus, Scheduler, SchedulerConfig, StageConfig,
    StorageDriveConfig, StreamerConfig,
};

mod builder;
mod error;

pub use builder::StreamerBuilder;
pub use error::{Error, Result};

/// Start configuring a [`Scheduler`].
pub fn builder() -> StreamerBuilder {
    StreamerBuilder::new()
}

/// Convenience prelude for common imports
pub mod prelude {
    pub use crate::{builder, Error, Result, StreamerBuilder};

    pub use lode_io::{shared_buffer, FileSystem, MemoryFileSystem, ReadBuffer, SharedBuffer};
    pub use lode_streamer::{
        FileRange, FileRequestPtr, Priority, ReadOptions, ReadResult, RequestStatus, Scheduler,
        StageConfig, StreamerConfig,
    };
}
