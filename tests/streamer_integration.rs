//! Streaming stack integration tests
//!
//! Drives the full default stack (decompressor, read splitter, dedicated
//! cache, block cache, storage drive) on its own scheduler thread.
//!
//! Run with:
//! ```bash
//! cargo test -p lode --test streamer_integration
//! ```

#[path = "helpers/mod.rs"]
mod helpers;

use helpers::{
    eventually, memory_fs, pattern_data, queue_and_wait, read_bytes, test_scheduler,
    test_scheduler_with, watch, REQUEST_TIMEOUT,
};
use lode::prelude::*;
use lode::streamer::BufferTarget;
use lode::{
    BlockCacheConfig, CompressionCodec, CompressedReadData, DefaultRequestAllocator,
    LocalFileSystem, ReadSplitterConfig, ReportType, StorageDriveConfig,
};
use std::sync::Arc;

const KIB: usize = 1024;

// =============================================================================
// Round trips
// =============================================================================

#[test]
fn test_round_trip_through_default_stack() {
    let len = 300 * KIB + 17;
    let fs = memory_fs(&[("level.pak", len)]);
    let scheduler = test_scheduler(fs);
    let expected = pattern_data(len);

    // Sub-block, exact block, multi-block and unaligned reads.
    let cases = [
        (0, 100),
        (64 * KIB, 64 * KIB),
        (10, 200 * KIB),
        (len - 5000, 5000),
    ];
    for (offset, size) in cases {
        let (status, data) = read_bytes(&scheduler, "level.pak", offset as u64, size as u64);
        assert_eq!(status, RequestStatus::Completed, "read at {offset}");
        assert_eq!(data, expected[offset..offset + size], "read at {offset}");
    }
}

#[test]
fn test_split_read_reassembles_in_order() {
    let len = 200 * KIB;
    let fs = memory_fs(&[("big.pak", len)]);
    let stages = vec![
        StageConfig::ReadSplitter(ReadSplitterConfig::with_max_read_size(64 * KIB as u64)),
        StageConfig::StorageDrive(StorageDriveConfig::default()),
    ];
    let scheduler = test_scheduler_with(Arc::clone(&fs), stages);

    let (status, data) = read_bytes(&scheduler, "big.pak", 0, len as u64);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(data, pattern_data(len));
    assert_eq!(fs.read_count(), 4);
}

#[test]
fn test_repeated_reads_hit_the_block_cache() {
    let fs = memory_fs(&[("level.pak", 16 * KIB)]);
    let stages = vec![
        StageConfig::BlockCache(
            BlockCacheConfig::with_blocks(4 * KIB as u64, 8).with_only_epilog_writes(false),
        ),
        StageConfig::StorageDrive(StorageDriveConfig::default()),
    ];
    let scheduler = test_scheduler_with(Arc::clone(&fs), stages);

    let (_, first) = read_bytes(&scheduler, "level.pak", 0, 16 * KIB as u64);
    let reads_after_fill = fs.read_count();
    let (status, second) = read_bytes(&scheduler, "level.pak", 0, 16 * KIB as u64);

    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(first, second);
    assert_eq!(fs.read_count(), reads_after_fill);
}

#[test]
fn test_read_queued_after_flush_sees_new_contents() {
    let fs = memory_fs(&[]);
    fs.insert("a.bin", vec![0xAA; 4 * KIB]);
    let stages = vec![
        StageConfig::BlockCache(
            BlockCacheConfig::with_blocks(4 * KIB as u64, 8).with_only_epilog_writes(false),
        ),
        StageConfig::StorageDrive(StorageDriveConfig::default()),
    ];
    let scheduler = test_scheduler_with(Arc::clone(&fs), stages);
    let (_, stale) = read_bytes(&scheduler, "a.bin", 0, KIB as u64);
    assert_eq!(stale[0], 0xAA);

    fs.insert("a.bin", vec![0xBB; 4 * KIB]);
    let flush = scheduler.create_request();
    let read = scheduler.create_request();
    scheduler.flush_cache(&flush, "a.bin");
    let buffer = shared_buffer(ReadBuffer::zeroed(KIB));
    scheduler.read(&read, "a.bin", buffer, ReadOptions::range(0, KIB as u64));

    // Both land in one batch.
    scheduler.suspend_processing();
    let done = watch(&scheduler, &read);
    scheduler.queue_request_batch(&[flush.clone(), read.clone()]);
    scheduler.resume_processing();

    assert_eq!(done.recv_timeout(REQUEST_TIMEOUT).unwrap(), RequestStatus::Completed);
    let data = scheduler.get_read_request_result(&read).unwrap().to_vec();
    assert_eq!(data, vec![0xBB; KIB]);
}

// =============================================================================
// End of file and unknown sizes
// =============================================================================

#[test]
fn test_read_straddling_end_of_file_is_clamped() {
    let fs = memory_fs(&[("short.pak", 1000)]);
    let scheduler = test_scheduler(fs);

    let (status, data) = read_bytes(&scheduler, "short.pak", 990, 100);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(data, pattern_data(1000)[990..]);
}

#[test]
fn test_read_to_end_of_file() {
    let fs = memory_fs(&[("level.pak", 5000)]);
    let scheduler = test_scheduler(fs);

    let request = scheduler.create_request();
    let buffer = shared_buffer(ReadBuffer::zeroed(5000));
    scheduler.read(&request, "level.pak", buffer, ReadOptions::from_offset(1000));
    assert_eq!(queue_and_wait(&scheduler, &request), RequestStatus::Completed);

    let result = scheduler.get_read_request_result(&request).unwrap();
    assert_eq!(result.bytes_read, 4000);
    assert_eq!(result.to_vec(), pattern_data(5000)[1000..]);
}

#[test]
fn test_read_past_end_of_file_is_empty() {
    let fs = memory_fs(&[("level.pak", 5000)]);
    let scheduler = test_scheduler(fs);

    let request = scheduler.create_request();
    let buffer = shared_buffer(ReadBuffer::zeroed(16));
    scheduler.read(&request, "level.pak", buffer, ReadOptions::from_offset(6000));
    assert_eq!(queue_and_wait(&scheduler, &request), RequestStatus::Completed);
    assert_eq!(scheduler.get_read_request_result(&request).unwrap().bytes_read, 0);
}

#[test]
fn test_allocator_read() {
    let fs = memory_fs(&[("level.pak", 3000)]);
    let scheduler = test_scheduler(fs);
    let allocator = Arc::new(DefaultRequestAllocator::new());

    let request = scheduler.create_request();
    scheduler.read_with_allocator(
        &request,
        "level.pak",
        allocator.clone(),
        ReadOptions::from_offset(500),
    );
    assert_eq!(queue_and_wait(&scheduler, &request), RequestStatus::Completed);

    let result = scheduler.get_read_request_result(&request).unwrap();
    assert_eq!(result.to_vec(), pattern_data(3000)[500..]);
    assert_eq!(allocator.lock_count(), 0);
}

#[test]
fn test_missing_file_fails() {
    let fs = memory_fs(&[]);
    let scheduler = test_scheduler(fs);

    let (status, data) = read_bytes(&scheduler, "missing.pak", 0, 10);
    assert_eq!(status, RequestStatus::Failed);
    assert!(data.is_empty());
}

// =============================================================================
// Cancel
// =============================================================================

#[test]
fn test_cancel_in_pending_queue_never_reaches_the_drive() {
    let fs = memory_fs(&[("level.pak", 10 * KIB)]);
    let mut scheduler = lode::builder()
        .file_system(fs.clone())
        .paused()
        .build()
        .unwrap();
    scheduler.suspend_processing();
    scheduler.start().unwrap();

    let read = scheduler.create_request();
    let buffer = shared_buffer(ReadBuffer::zeroed(KIB));
    scheduler.read(&read, "level.pak", buffer, ReadOptions::range(0, KIB as u64));
    let cancel = scheduler.create_request();
    scheduler.cancel(&cancel, &read);
    let read_done = watch(&scheduler, &read);
    let cancel_done = watch(&scheduler, &cancel);
    scheduler.queue_request_batch(&[read.clone(), cancel.clone()]);
    scheduler.resume_processing();

    assert_eq!(read_done.recv_timeout(REQUEST_TIMEOUT).unwrap(), RequestStatus::Canceled);
    assert_eq!(cancel_done.recv_timeout(REQUEST_TIMEOUT).unwrap(), RequestStatus::Completed);
    assert_eq!(fs.read_count(), 0);
}

// =============================================================================
// Caches
// =============================================================================

#[test]
fn test_dedicated_cache_lifecycle() {
    let fs = memory_fs(&[("stream.pak", 64 * KIB)]);
    let scheduler = test_scheduler(Arc::clone(&fs));

    let create = scheduler.create_request();
    scheduler.create_dedicated_cache(&create, "stream.pak", None);
    assert_eq!(queue_and_wait(&scheduler, &create), RequestStatus::Completed);

    let (_, first) = read_bytes(&scheduler, "stream.pak", 0, 8 * KIB as u64);
    let reads_after_fill = fs.read_count();
    let (status, second) = read_bytes(&scheduler, "stream.pak", 0, 8 * KIB as u64);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(first, second);
    assert_eq!(fs.read_count(), reads_after_fill);

    let destroy = scheduler.create_request();
    scheduler.destroy_dedicated_cache(&destroy, "stream.pak", None);
    assert_eq!(queue_and_wait(&scheduler, &destroy), RequestStatus::Completed);
}

#[test]
fn test_flush_is_idempotent() {
    let fs = memory_fs(&[("level.pak", 8 * KIB)]);
    let scheduler = test_scheduler(fs);
    let expected = pattern_data(8 * KIB);

    let (_, before) = read_bytes(&scheduler, "level.pak", 0, 8 * KIB as u64);
    for _ in 0..2 {
        let flush = scheduler.create_request();
        scheduler.flush_cache(&flush, "level.pak");
        assert_eq!(queue_and_wait(&scheduler, &flush), RequestStatus::Completed);
    }
    let flush_all = scheduler.create_request();
    scheduler.flush_caches(&flush_all);
    assert_eq!(queue_and_wait(&scheduler, &flush_all), RequestStatus::Completed);

    let (status, after) = read_bytes(&scheduler, "level.pak", 0, 8 * KIB as u64);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(before, expected);
    assert_eq!(after, expected);
}

// =============================================================================
// Queries, reports and statistics
// =============================================================================

#[test]
fn test_exists_and_meta_data_on_local_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("level.pak"), pattern_data(777)).unwrap();
    let scheduler = lode::builder()
        .file_system(Arc::new(LocalFileSystem::with_root(dir.path())))
        .build()
        .unwrap();

    let exists = scheduler.create_request();
    scheduler.file_exists(&exists, "level.pak");
    queue_and_wait(&scheduler, &exists);
    assert_eq!(scheduler.get_file_exists_result(&exists), Some(true));

    let missing = scheduler.create_request();
    scheduler.file_exists(&missing, "missing.pak");
    queue_and_wait(&scheduler, &missing);
    assert_eq!(scheduler.get_file_exists_result(&missing), Some(false));

    let meta_data = scheduler.create_request();
    scheduler.file_meta_data(&meta_data, "level.pak");
    assert_eq!(queue_and_wait(&scheduler, &meta_data), RequestStatus::Completed);
    assert_eq!(scheduler.get_file_meta_data_result(&meta_data), Some(777));

    let (status, data) = read_bytes(&scheduler, "level.pak", 7, 70);
    assert_eq!(status, RequestStatus::Completed);
    assert_eq!(data, pattern_data(777)[7..77]);
}

#[test]
fn test_report_completes() {
    let fs = memory_fs(&[("level.pak", KIB)]);
    let scheduler = test_scheduler(fs);
    for report in [ReportType::Statistics, ReportType::FileLocks] {
        let request = scheduler.create_request();
        scheduler.report(&request, report);
        assert_eq!(queue_and_wait(&scheduler, &request), RequestStatus::Completed);
    }
}

#[test]
fn test_statistics_cover_every_stage() {
    let fs = memory_fs(&[("level.pak", KIB)]);
    let scheduler = test_scheduler(fs);
    read_bytes(&scheduler, "level.pak", 0, 100);

    let owners = ["Scheduler", "ReadSplitter", "BlockCache", "StorageDrive"];
    assert!(eventually(|| {
        let statistics = scheduler.collect_statistics();
        let reads = statistics
            .iter()
            .find(|s| s.owner == "StorageDrive" && s.name == "Reads")
            .map(|s| s.value.as_f64());
        reads == Some(1.0)
            && owners
                .iter()
                .all(|owner| statistics.iter().any(|s| s.owner == *owner))
    }));
}

// =============================================================================
// Compressed reads
// =============================================================================

/// Stores bytes as they are.
struct StoredCodec;

impl CompressionCodec for StoredCodec {
    fn name(&self) -> &str {
        "stored"
    }

    fn decompress(&self, input: &[u8], output: &mut [u8]) -> lode::streamer::Result<usize> {
        output[..input.len()].copy_from_slice(input);
        Ok(input.len())
    }
}

#[test]
fn test_compressed_read_through_default_stack() {
    let fs = memory_fs(&[("archive.pak", 4 * KIB)]);
    let scheduler = test_scheduler(fs);

    let request = scheduler.create_request();
    let buffer = shared_buffer(ReadBuffer::zeroed(KIB));
    let data = CompressedReadData {
        path: lode::streamer::request_path("archive.pak"),
        offset: 512,
        compressed_size: KIB as u64,
        uncompressed_size: KIB as u64,
        codec: Arc::new(StoredCodec),
        target: BufferTarget::new(buffer, 0),
    };
    scheduler.compressed_read(&request, data, None, Priority::HIGH);
    assert_eq!(queue_and_wait(&scheduler, &request), RequestStatus::Completed);

    let result = scheduler.get_read_request_result(&request).unwrap();
    assert_eq!(result.to_vec(), pattern_data(4 * KIB)[512..512 + KIB]);
}

// =============================================================================
// Builder
// =============================================================================

#[test]
fn test_builder_rejects_root_with_file_system() {
    let result = lode::builder()
        .file_system(memory_fs(&[]))
        .root("assets")
        .build();
    assert!(matches!(result, Err(Error::InvalidSetup(_))));
}

#[test]
fn test_builder_rejects_invalid_stack() {
    let result = lode::builder()
        .file_system(memory_fs(&[]))
        .stages(vec![StageConfig::ReadSplitter(ReadSplitterConfig::default())])
        .build();
    assert!(matches!(result, Err(Error::Streamer(_))));
}

#[test]
fn test_paused_builder_does_not_start() {
    let mut scheduler = lode::builder()
        .file_system(memory_fs(&[]))
        .paused()
        .build()
        .unwrap();
    assert!(!scheduler.is_running());
    scheduler.start().unwrap();
    assert!(scheduler.is_running());
}
