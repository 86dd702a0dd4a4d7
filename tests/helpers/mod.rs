//! Test helpers and fixtures for lode integration tests
//!
//! Every scheduler here runs its real thread. Completion is observed through
//! callbacks feeding a channel, never by sleeping.

use crossbeam_channel::{bounded, Receiver};
use lode::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Longest wait for a single request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Deterministic contents that differ between neighboring blocks.
pub fn pattern_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Route `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// In-memory file system holding `files`.
pub fn memory_fs(files: &[(&str, usize)]) -> Arc<MemoryFileSystem> {
    init_tracing();
    let fs = Arc::new(MemoryFileSystem::new());
    for (path, len) in files {
        fs.insert(*path, pattern_data(*len));
    }
    fs
}

/// Started scheduler over the default stack.
pub fn test_scheduler(fs: Arc<MemoryFileSystem>) -> Scheduler {
    lode::builder()
        .file_system(fs)
        .build()
        .expect("Failed to create test scheduler")
}

/// Started scheduler over the given stages.
pub fn test_scheduler_with(fs: Arc<MemoryFileSystem>, stages: Vec<StageConfig>) -> Scheduler {
    lode::builder()
        .file_system(fs)
        .stages(stages)
        .build()
        .expect("Failed to create test scheduler")
}

/// Channel receiving the final status of `request`.
pub fn watch(scheduler: &Scheduler, request: &FileRequestPtr) -> Receiver<RequestStatus> {
    let (tx, rx) = bounded(1);
    scheduler.set_completion_callback(request, move |done| {
        let _ = tx.send(done.status());
    });
    rx
}

/// Queue `request` and block until it completes.
pub fn queue_and_wait(scheduler: &Scheduler, request: &FileRequestPtr) -> RequestStatus {
    let rx = watch(scheduler, request);
    scheduler.queue_request(request);
    rx.recv_timeout(REQUEST_TIMEOUT)
        .expect("request did not complete in time")
}

/// Read `size` bytes at `offset` and return the status and the bytes read.
pub fn read_bytes(
    scheduler: &Scheduler,
    path: &str,
    offset: u64,
    size: u64,
) -> (RequestStatus, Vec<u8>) {
    let request = scheduler.create_request();
    let buffer = shared_buffer(ReadBuffer::zeroed(size as usize));
    scheduler.read(&request, path, buffer, ReadOptions::range(offset, size));
    let status = queue_and_wait(scheduler, &request);
    let data = scheduler
        .get_read_request_result(&request)
        .map(|result| result.to_vec())
        .unwrap_or_default();
    (status, data)
}

/// Poll `condition` until it holds or the timeout passes.
pub fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < REQUEST_TIMEOUT {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    false
}
