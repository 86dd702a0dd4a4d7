//! Stage and scheduler configuration.
//!
//! Every config derives `serde` so a whole stack description can be loaded
//! from data, and validates itself before a stage is built from it.

use crate::error::{Error, Result};
use crate::stack::block_cache::BlockCache;
use crate::stack::decompressor::Decompressor;
use crate::stack::dedicated_cache::DedicatedCache;
use crate::stack::read_splitter::ReadSplitter;
use crate::stack::storage_drive::StorageDrive;
use crate::stack::{BoxedStage, StackBuilder};
use lode_io::FileSystem;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidConfig(message.into())
}

/// Size of one cache block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockSize {
    Fixed(u64),
    /// Use the device's alignment, taken from [`StreamerConfig::hardware_alignment`].
    HardwareAlignment,
}

impl BlockSize {
    /// Size in bytes for a device with the given alignment.
    pub fn resolve(self, hardware_alignment: u64) -> u64 {
        match self {
            BlockSize::Fixed(size) => size,
            BlockSize::HardwareAlignment => hardware_alignment,
        }
    }
}

/// Shared block cache.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlockCacheConfig {
    /// Total bytes of cached data (default: 8MB)
    pub cache_size: u64,
    /// Block size (default: 64KB)
    pub block_size: BlockSize,
    /// Cache only the last partial block of a read (default: true)
    pub only_epilog_writes: bool,
}

impl Default for BlockCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: 8 * MIB,
            block_size: BlockSize::Fixed(64 * KIB),
            only_epilog_writes: true,
        }
    }
}

impl BlockCacheConfig {
    /// Cache of `num_blocks` blocks of `block_size` bytes.
    pub fn with_blocks(block_size: u64, num_blocks: u64) -> Self {
        Self {
            cache_size: block_size * num_blocks,
            block_size: BlockSize::Fixed(block_size),
            ..Default::default()
        }
    }

    /// Cache only the last block of each read, or every touched block.
    pub fn with_only_epilog_writes(mut self, only_epilog_writes: bool) -> Self {
        self.only_epilog_writes = only_epilog_writes;
        self
    }

    /// Capacity in blocks at the resolved block size.
    pub fn num_blocks(&self, hardware_alignment: u64) -> u64 {
        match self.block_size.resolve(hardware_alignment) {
            0 => 0,
            block_size => self.cache_size / block_size,
        }
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self, hardware_alignment: u64) -> Result<()> {
        let block_size = self.block_size.resolve(hardware_alignment);
        if block_size == 0 {
            return Err(invalid("block cache block size must be non-zero"));
        }
        if self.cache_size < block_size {
            return Err(invalid(format!(
                "block cache of {} bytes can not hold one {} byte block",
                self.cache_size, block_size
            )));
        }
        Ok(())
    }
}

/// Per-file caches opened with `create_dedicated_cache`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedicatedCacheConfig {
    /// Bytes cached per dedicated entry (default: 1MB)
    pub cache_size: u64,
    /// Block size (default: hardware alignment)
    pub block_size: BlockSize,
    /// Cache only the last partial block of a read (default: false)
    pub only_epilog_writes: bool,
}

impl Default for DedicatedCacheConfig {
    fn default() -> Self {
        Self {
            cache_size: MIB,
            block_size: BlockSize::HardwareAlignment,
            only_epilog_writes: false,
        }
    }
}

impl DedicatedCacheConfig {
    /// The block cache every entry is built from.
    pub fn block_cache(&self) -> BlockCacheConfig {
        BlockCacheConfig {
            cache_size: self.cache_size,
            block_size: self.block_size,
            only_epilog_writes: self.only_epilog_writes,
        }
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self, hardware_alignment: u64) -> Result<()> {
        self.block_cache().validate(hardware_alignment)
    }
}

/// Read splitting and alignment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReadSplitterConfig {
    /// Largest single read sent down (default: 256KB)
    pub max_read_size: u64,
    /// Required address alignment of read targets (default: 1)
    pub memory_alignment: usize,
    /// Required alignment of read sizes and, with `adjust_offset`, offsets (default: 1)
    pub size_alignment: u64,
    /// Bytes of staging memory for misaligned reads (default: 1MB)
    pub buffer_size: u64,
    /// Align offsets down and read through staging (default: true)
    pub adjust_offset: bool,
    /// Split aligned reads even when under `max_read_size` (default: false)
    pub split_aligned_requests: bool,
}

impl Default for ReadSplitterConfig {
    fn default() -> Self {
        Self {
            max_read_size: 256 * KIB,
            memory_alignment: 1,
            size_alignment: 1,
            buffer_size: MIB,
            adjust_offset: true,
            split_aligned_requests: false,
        }
    }
}

impl ReadSplitterConfig {
    /// Split reads larger than `max_read_size` bytes.
    pub fn with_max_read_size(max_read_size: u64) -> Self {
        Self {
            max_read_size,
            ..Default::default()
        }
    }

    /// Align chunk memory and sizes.
    pub fn with_alignment(mut self, memory_alignment: usize, size_alignment: u64) -> Self {
        self.memory_alignment = memory_alignment;
        self.size_alignment = size_alignment;
        self
    }

    /// Number of staging slots of `max_read_size` bytes.
    pub fn num_buffer_slots(&self) -> usize {
        match self.max_read_size {
            0 => 0,
            size => (self.buffer_size / size) as usize,
        }
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_read_size == 0 {
            return Err(invalid("max_read_size must be non-zero"));
        }
        if !self.memory_alignment.is_power_of_two() || !self.size_alignment.is_power_of_two() {
            return Err(invalid("alignments must be powers of two"));
        }
        if self.max_read_size % self.size_alignment != 0 {
            return Err(invalid("max_read_size must be a multiple of size_alignment"));
        }
        let needs_staging = self.memory_alignment > 1 || self.size_alignment > 1;
        if needs_staging && self.num_buffer_slots() == 0 {
            return Err(invalid("buffer_size must hold at least one max_read_size slot"));
        }
        Ok(())
    }
}

/// Terminal stage doing the actual file I/O.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StorageDriveConfig {
    /// Open file handles kept around (default: 32)
    pub max_file_handles: usize,
    /// File sizes kept around (default: 64)
    pub max_meta_data_entries: usize,
    /// Reads issued per scheduler tick (default: 4)
    pub reads_per_tick: usize,
    /// Reads the drive accepts ahead of execution (default: 8)
    pub max_queued_reads: usize,
    /// Estimated cost of switching file or offset (default: 100us)
    pub seek_penalty: Duration,
    /// Estimated open cost before any open was measured (default: 200us)
    pub initial_open_time: Duration,
    /// Estimated bytes per second before any read was measured (default: 200MB/s)
    pub initial_throughput: f64,
    /// Samples in each running average (default: 64)
    pub statistics_window: usize,
}

impl Default for StorageDriveConfig {
    fn default() -> Self {
        Self {
            max_file_handles: 32,
            max_meta_data_entries: 64,
            reads_per_tick: 4,
            max_queued_reads: 8,
            seek_penalty: Duration::from_micros(100),
            initial_open_time: Duration::from_micros(200),
            initial_throughput: 200.0 * MIB as f64,
            statistics_window: 64,
        }
    }
}

impl StorageDriveConfig {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_file_handles == 0 {
            return Err(invalid("max_file_handles must be non-zero"));
        }
        if self.reads_per_tick == 0 || self.max_queued_reads == 0 {
            return Err(invalid("drive must accept and issue at least one read"));
        }
        if self.initial_throughput.is_nan() || self.initial_throughput <= 0.0 {
            return Err(invalid("initial_throughput must be positive"));
        }
        Ok(())
    }
}

/// Compressed read stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecompressorConfig {
    /// Compressed reads waiting on their data at once (default: 4)
    pub max_in_flight: usize,
}

impl Default for DecompressorConfig {
    fn default() -> Self {
        Self { max_in_flight: 4 }
    }
}

impl DecompressorConfig {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(invalid("max_in_flight must be non-zero"));
        }
        Ok(())
    }
}

/// Scheduling thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Thread name (default: "lode-scheduler")
    pub thread_name: String,
    /// Request elevated OS thread priority (default: false)
    pub elevated_priority: bool,
    /// Longest sleep when idle, before re-checking (default: 50ms)
    pub idle_timeout: Duration,
    /// Minimum time between statistics snapshots (default: 250ms)
    pub statistics_interval: Duration,
    /// Samples in the time-in-queue average (default: 64)
    pub statistics_window: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "lode-scheduler".to_string(),
            elevated_priority: false,
            idle_timeout: Duration::from_millis(50),
            statistics_interval: Duration::from_millis(250),
            statistics_window: 64,
        }
    }
}

impl SchedulerConfig {
    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.thread_name.is_empty() {
            return Err(invalid("thread_name must not be empty"));
        }
        if self.idle_timeout.is_zero() {
            return Err(invalid("idle_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// One stage of a stack description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StageConfig {
    Decompressor(DecompressorConfig),
    ReadSplitter(ReadSplitterConfig),
    DedicatedCache(DedicatedCacheConfig),
    BlockCache(BlockCacheConfig),
    StorageDrive(StorageDriveConfig),
}

/// Whole stack, root to leaf, plus the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamerConfig {
    /// Device alignment used by [`BlockSize::HardwareAlignment`] (default: 4096)
    pub hardware_alignment: u64,
    pub stages: Vec<StageConfig>,
    pub scheduler: SchedulerConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            hardware_alignment: 4 * KIB,
            stages: vec![
                StageConfig::Decompressor(DecompressorConfig::default()),
                StageConfig::ReadSplitter(ReadSplitterConfig::default()),
                StageConfig::DedicatedCache(DedicatedCacheConfig::default()),
                StageConfig::BlockCache(BlockCacheConfig::default()),
                StageConfig::StorageDrive(StorageDriveConfig::default()),
            ],
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Stack of the given stages with default scheduler settings.
    pub fn with_stages(stages: Vec<StageConfig>) -> Self {
        Self {
            stages,
            ..Default::default()
        }
    }

    /// Check the settings.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.hardware_alignment == 0 {
            return Err(invalid("hardware_alignment must be non-zero"));
        }
        match self.stages.last() {
            Some(StageConfig::StorageDrive(_)) => {}
            _ => return Err(invalid("the last stage must be a storage drive")),
        }
        let drives = self
            .stages
            .iter()
            .filter(|stage| matches!(stage, StageConfig::StorageDrive(_)))
            .count();
        if drives != 1 {
            return Err(invalid("a stack has exactly one storage drive"));
        }
        for stage in &self.stages {
            match stage {
                StageConfig::Decompressor(config) => config.validate()?,
                StageConfig::ReadSplitter(config) => config.validate()?,
                StageConfig::DedicatedCache(config) => config.validate(self.hardware_alignment)?,
                StageConfig::BlockCache(config) => config.validate(self.hardware_alignment)?,
                StageConfig::StorageDrive(config) => config.validate()?,
            }
        }
        self.scheduler.validate()
    }

    /// Build the described stack over `fs`.
    pub fn build_stack(&self, fs: Arc<dyn FileSystem>) -> Result<BoxedStage> {
        self.validate()?;
        let mut builder = StackBuilder::new();
        for stage in &self.stages {
            let stage: BoxedStage = match stage {
                StageConfig::Decompressor(config) => Box::new(Decompressor::new(*config)),
                StageConfig::ReadSplitter(config) => Box::new(ReadSplitter::new(*config)?),
                StageConfig::DedicatedCache(config) => {
                    Box::new(DedicatedCache::new(*config, self.hardware_alignment))
                }
                StageConfig::BlockCache(config) => {
                    Box::new(BlockCache::new(*config, self.hardware_alignment)?)
                }
                StageConfig::StorageDrive(config) => {
                    Box::new(StorageDrive::new(*config, Arc::clone(&fs)))
                }
            };
            builder = builder.push(stage);
        }
        builder
            .build()
            .ok_or_else(|| invalid("stack has no stages"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::for_each_stage;
    use lode_io::MemoryFileSystem;

    #[test]
    fn test_default_config() {
        let config = StreamerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.stages.len(), 5);
        assert_eq!(config.hardware_alignment, 4096);

        let cache = BlockCacheConfig::default();
        assert_eq!(cache.num_blocks(4096), 128);
        assert!(cache.only_epilog_writes);
    }

    #[test]
    fn test_hardware_block_size() {
        let config = DedicatedCacheConfig::default();
        assert_eq!(config.block_cache().num_blocks(4096), 256);
        assert_eq!(BlockSize::HardwareAlignment.resolve(512), 512);
    }

    #[test]
    fn test_invalid_configs() {
        assert!(BlockCacheConfig::with_blocks(0, 4).validate(4096).is_err());
        assert!(ReadSplitterConfig::with_max_read_size(0).validate().is_err());
        assert!(ReadSplitterConfig::default()
            .with_alignment(3, 1)
            .validate()
            .is_err());

        let mut config = StreamerConfig::default();
        config.stages.pop();
        assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_build_stack_order() {
        let fs = Arc::new(MemoryFileSystem::new());
        let root = StreamerConfig::default().build_stack(fs).unwrap();

        let mut names = Vec::new();
        for_each_stage(root.as_ref(), |stage| {
            names.push((stage.stage_id(), stage.name().to_string()))
        });
        let expected = [
            "Decompressor",
            "ReadSplitter",
            "DedicatedCache",
            "BlockCache",
            "StorageDrive",
        ];
        assert_eq!(names.len(), expected.len());
        for (depth, (id, name)) in names.iter().enumerate() {
            assert_eq!(*id, depth);
            assert_eq!(name, expected[depth]);
        }
    }

    #[test]
    fn test_minimal_stack_is_valid() {
        let config = StreamerConfig::with_stages(vec![
            StageConfig::BlockCache(BlockCacheConfig::with_blocks(1024, 8)),
            StageConfig::StorageDrive(StorageDriveConfig::default()),
        ]);
        assert_eq!(config.clone(), config);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_loads_from_json() {
        let config = StreamerConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let loaded: StreamerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded, config);

        let json = r#"{
            "hardware_alignment": 512,
            "stages": [
                { "BlockCache": {
                    "cache_size": 4096,
                    "block_size": "HardwareAlignment",
                    "only_epilog_writes": false
                } },
                { "StorageDrive": {
                    "max_file_handles": 2,
                    "max_meta_data_entries": 2,
                    "reads_per_tick": 1,
                    "max_queued_reads": 1,
                    "seek_penalty": { "secs": 0, "nanos": 0 },
                    "initial_open_time": { "secs": 0, "nanos": 1000 },
                    "initial_throughput": 1000000.0,
                    "statistics_window": 8
                } }
            ],
            "scheduler": {
                "thread_name": "streamer",
                "elevated_priority": false,
                "idle_timeout": { "secs": 0, "nanos": 10000000 },
                "statistics_interval": { "secs": 1, "nanos": 0 },
                "statistics_window": 16
            }
        }"#;
        let config: StreamerConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_ok());
        match &config.stages[0] {
            StageConfig::BlockCache(cache) => assert_eq!(cache.num_blocks(512), 8),
            _ => panic!("expected a block cache first"),
        }
    }
}
