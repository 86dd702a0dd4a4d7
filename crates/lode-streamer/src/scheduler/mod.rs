//! Caller-facing scheduler.
//!
//! [`Scheduler`] owns the stack and runs it on a dedicated thread. Callers
//! create request handles, fill them with a command, queue them, and then
//! poll the handle or wait for its completion callback. Every method here is
//! safe to call from any thread.
//!
//! ```ignore
//! use lode_streamer::{ReadOptions, Scheduler, StreamerConfig};
//! use lode_io::{shared_buffer, LocalFileSystem, ReadBuffer};
//! use std::sync::Arc;
//!
//! let fs = Arc::new(LocalFileSystem::with_root("assets"));
//! let mut scheduler = Scheduler::new(&StreamerConfig::default(), fs)?;
//! scheduler.start()?;
//!
//! let request = scheduler.create_request();
//! let buffer = shared_buffer(ReadBuffer::zeroed(4096));
//! scheduler.read(&request, "level.pak", buffer, ReadOptions::range(0, 4096));
//! scheduler.queue_request(&request);
//! ```

mod thread;

use crate::config::{SchedulerConfig, StreamerConfig};
use crate::context::ContextShared;
use crate::error::{Error, Result};
use crate::request::{
    request_path, CompletionCallback, CompressedReadData, ExternalRequest, FileRange,
    FileRequestPtr, Priority, ReadOutput, ReadRequestData, ReadResult, ReportType,
    RequestCommand, RequestResult, RequestStatus,
};
use crate::stack::BoxedStage;
use arc_swap::ArcSwap;
use lode_io::{FileSystem, RequestMemoryAllocator, SharedBuffer, Statistic};
use parking_lot::Mutex;
use std::any::Any;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thread::SchedulerCore;
use thread_priority::ThreadPriority;

/// State shared between callers and the scheduling thread.
pub(crate) struct SchedulerShared {
    pub(crate) context: Arc<ContextShared>,
    /// Requests queued by callers since the last tick.
    pub(crate) queued: Mutex<Vec<Arc<ExternalRequest>>>,
    running: AtomicBool,
    suspended: AtomicBool,
    pub(crate) statistics: ArcSwap<Vec<Statistic>>,
}

impl SchedulerShared {
    fn new() -> Self {
        Self {
            context: Arc::new(ContextShared::new()),
            queued: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            suspended: AtomicBool::new(false),
            statistics: ArcSwap::from_pointee(Vec::new()),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

/// Placement and urgency of a read.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ReadOptions {
    pub offset: u64,
    /// `None` reads to the end of the file.
    pub size: Option<u64>,
    /// Relative to the moment the scheduler receives the request.
    pub deadline: Option<Duration>,
    pub priority: Priority,
}

impl ReadOptions {
    /// `size` bytes from `offset`.
    pub fn range(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size: Some(size),
            ..Default::default()
        }
    }

    /// From `offset` to the end of the file.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            ..Default::default()
        }
    }

    /// Set a deadline relative to admission.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Asynchronous file streaming front end.
///
/// Stopping is final: the stack lives on the scheduling thread and is
/// dropped with it.
pub struct Scheduler {
    shared: Arc<SchedulerShared>,
    config: SchedulerConfig,
    core: Option<SchedulerCore>,
    thread: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Build the configured stack over `fs`. The thread is not started.
    pub fn new(config: &StreamerConfig, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let stack = config.build_stack(fs)?;
        Ok(Self::with_stack(config.scheduler.clone(), stack))
    }

    /// Run a hand-assembled stack.
    pub fn with_stack(config: SchedulerConfig, stack: BoxedStage) -> Self {
        let shared = Arc::new(SchedulerShared::new());
        let core = SchedulerCore::new(Arc::clone(&shared), stack, config.clone());
        Self {
            shared,
            config,
            core: Some(core),
            thread: None,
        }
    }

    /// Spawn the scheduling thread.
    pub fn start(&mut self) -> Result<()> {
        let Some(core) = self.core.take() else {
            return Err(Error::AlreadyRunning);
        };
        self.shared.running.store(true, Ordering::Release);

        let elevated = self.config.elevated_priority;
        let spawned = std::thread::Builder::new()
            .name(self.config.thread_name.clone())
            .spawn(move || {
                if elevated {
                    if let Err(e) =
                        thread_priority::set_current_thread_priority(ThreadPriority::Max)
                    {
                        tracing::warn!(error = ?e, "could not raise scheduler thread priority");
                    }
                }
                core.run();
            });

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to spawn scheduler thread");
                self.shared.running.store(false, Ordering::Release);
                Err(Error::ThreadSpawn(e))
            }
        }
    }

    /// Stop and join the scheduling thread. Requests still in flight are
    /// dropped without completing.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        self.shared.context.wake_up_scheduling_thread();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                tracing::error!("scheduler thread panicked");
            }
        }
    }

    /// Whether the scheduling thread is up.
    pub fn is_running(&self) -> bool {
        self.thread.is_some() && self.shared.is_running()
    }

    // Request handles

    /// Fresh handle in the `Pending` state.
    pub fn create_request(&self) -> FileRequestPtr {
        self.shared.context.get_new_external_request()
    }

    /// `count` fresh handles.
    pub fn create_request_batch(&self, count: usize) -> Vec<FileRequestPtr> {
        self.shared.context.get_new_external_request_batch(count)
    }

    /// Read into caller memory. The buffer must hold the whole read.
    pub fn read(
        &self,
        request: &FileRequestPtr,
        path: impl AsRef<Path>,
        buffer: SharedBuffer,
        options: ReadOptions,
    ) {
        self.fill_read(request, path, ReadOutput::Buffer(buffer), options);
    }

    /// Read into memory obtained from `allocator` once the size is known.
    pub fn read_with_allocator(
        &self,
        request: &FileRequestPtr,
        path: impl AsRef<Path>,
        allocator: Arc<dyn RequestMemoryAllocator>,
        options: ReadOptions,
    ) {
        self.fill_read(request, path, ReadOutput::Allocator(allocator), options);
    }

    fn fill_read(
        &self,
        request: &FileRequestPtr,
        path: impl AsRef<Path>,
        output: ReadOutput,
        options: ReadOptions,
    ) {
        request.inner().set_command(RequestCommand::Read {
            data: ReadRequestData {
                path: request_path(path),
                output,
                offset: options.offset,
                size: options.size,
            },
            deadline: options.deadline,
            priority: options.priority,
        });
    }

    /// Read a compressed block and decode it into the target buffer.
    pub fn compressed_read(
        &self,
        request: &FileRequestPtr,
        data: CompressedReadData,
        deadline: Option<Duration>,
        priority: Priority,
    ) {
        request.inner().set_command(RequestCommand::CompressedRead {
            data,
            deadline,
            priority,
        });
    }

    /// Check whether `path` exists. See [`Scheduler::get_file_exists_result`].
    pub fn file_exists(&self, request: &FileRequestPtr, path: impl AsRef<Path>) {
        request.inner().set_command(RequestCommand::FileExists {
            path: request_path(path),
        });
    }

    /// Look up the size of `path`. See [`Scheduler::get_file_meta_data_result`].
    pub fn file_meta_data(&self, request: &FileRequestPtr, path: impl AsRef<Path>) {
        request.inner().set_command(RequestCommand::FileMetaData {
            path: request_path(path),
        });
    }

    /// Cancel `target`. Completes once the cancellation has been delivered;
    /// `target` itself completes as canceled unless it finished first.
    pub fn cancel(&self, request: &FileRequestPtr, target: &FileRequestPtr) {
        request.inner().set_command(RequestCommand::Cancel {
            target: target.clone(),
        });
    }

    /// Change the deadline and priority of `target` and its pending work.
    pub fn reschedule_request(
        &self,
        request: &FileRequestPtr,
        target: &FileRequestPtr,
        deadline: Option<Duration>,
        priority: Priority,
    ) {
        request.inner().set_command(RequestCommand::Reschedule {
            target: target.clone(),
            deadline,
            priority,
        });
    }

    /// Give `path`, or one range of it, a cache of its own.
    ///
    /// Repeated creation of the same entry counts references.
    pub fn create_dedicated_cache(
        &self,
        request: &FileRequestPtr,
        path: impl AsRef<Path>,
        range: Option<FileRange>,
    ) {
        request
            .inner()
            .set_command(RequestCommand::CreateDedicatedCache {
                path: request_path(path),
                range,
            });
    }

    /// Drop one reference to a dedicated cache. The last one flushes it.
    pub fn destroy_dedicated_cache(
        &self,
        request: &FileRequestPtr,
        path: impl AsRef<Path>,
        range: Option<FileRange>,
    ) {
        request
            .inner()
            .set_command(RequestCommand::DestroyDedicatedCache {
                path: request_path(path),
                range,
            });
    }

    /// Drop cached data and handles of one file.
    pub fn flush_cache(&self, request: &FileRequestPtr, path: impl AsRef<Path>) {
        request.inner().set_command(RequestCommand::FlushCache {
            path: request_path(path),
        });
    }

    /// Drop every cached block and open handle.
    pub fn flush_caches(&self, request: &FileRequestPtr) {
        request.inner().set_command(RequestCommand::FlushCaches);
    }

    /// Log the requested report from every stage.
    pub fn report(&self, request: &FileRequestPtr, report: ReportType) {
        request.inner().set_command(RequestCommand::Report(report));
    }

    /// Opaque payload for custom stages.
    pub fn custom(&self, request: &FileRequestPtr, payload: Arc<dyn Any + Send + Sync>) {
        request.inner().set_command(RequestCommand::Custom(payload));
    }

    /// Run `callback` on the scheduling thread when `request` completes.
    pub fn set_completion_callback(
        &self,
        request: &FileRequestPtr,
        callback: impl FnOnce(&FileRequestPtr) + Send + 'static,
    ) {
        let callback: CompletionCallback = Box::new(callback);
        request.inner().set_callback(callback);
    }

    // Queueing

    /// Hand a filled request to the scheduling thread.
    ///
    /// Queueing a request that is already queued or running is ignored.
    pub fn queue_request(&self, request: &FileRequestPtr) {
        if self.enqueue(request) {
            self.shared.context.wake_up_scheduling_thread();
        }
    }

    /// Queue several requests with a single wake-up.
    pub fn queue_request_batch(&self, requests: &[FileRequestPtr]) {
        let mut any = false;
        for request in requests {
            any |= self.enqueue(request);
        }
        if any {
            self.shared.context.wake_up_scheduling_thread();
        }
    }

    fn enqueue(&self, request: &FileRequestPtr) -> bool {
        let inner = request.inner();
        if inner.internal_id().is_some() || !inner.try_mark_queued() {
            tracing::warn!("request queued twice");
            return false;
        }
        self.shared.queued.lock().push(Arc::clone(inner));
        true
    }

    // Queries

    /// Whether `request` reached a terminal state.
    pub fn has_request_completed(&self, request: &FileRequestPtr) -> bool {
        request.has_completed()
    }

    /// Current status of `request`.
    pub fn get_request_status(&self, request: &FileRequestPtr) -> RequestStatus {
        request.status()
    }

    /// Latest completion estimate of `request`.
    pub fn get_estimated_request_completion_time(
        &self,
        request: &FileRequestPtr,
    ) -> Option<Instant> {
        request.estimated_completion()
    }

    /// Output of a completed read.
    pub fn get_read_request_result(&self, request: &FileRequestPtr) -> Option<ReadResult> {
        if request.status() != RequestStatus::Completed {
            return None;
        }
        match request.inner().result() {
            RequestResult::Read { buffer, bytes_read } => Some(ReadResult { buffer, bytes_read }),
            _ => None,
        }
    }

    /// Answer of a completed existence check.
    pub fn get_file_exists_result(&self, request: &FileRequestPtr) -> Option<bool> {
        match request.inner().result() {
            RequestResult::Exists(exists) if request.has_completed() => Some(exists),
            _ => None,
        }
    }

    /// File size from a completed meta data request.
    pub fn get_file_meta_data_result(&self, request: &FileRequestPtr) -> Option<u64> {
        if request.status() != RequestStatus::Completed {
            return None;
        }
        match request.inner().result() {
            RequestResult::MetaData(size) => size,
            _ => None,
        }
    }

    // Control

    /// Stop issuing work until [`Scheduler::resume_processing`]. Queued
    /// requests are kept.
    pub fn suspend_processing(&self) {
        self.shared.suspended.store(true, Ordering::Release);
    }

    /// Undo [`Scheduler::suspend_processing`].
    pub fn resume_processing(&self) {
        self.shared.suspended.store(false, Ordering::Release);
        self.shared.context.wake_up_scheduling_thread();
    }

    /// Whether processing is suspended.
    pub fn is_processing_suspended(&self) -> bool {
        self.shared.is_suspended()
    }

    /// Latest statistics snapshot of the scheduler and every stage.
    pub fn collect_statistics(&self) -> Arc<Vec<Statistic>> {
        self.shared.statistics.load_full()
    }

    /// Shared half of the context, for waking the thread from outside.
    pub fn context(&self) -> &Arc<ContextShared> {
        &self.shared.context
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
