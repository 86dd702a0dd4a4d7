//! Terminal stage doing the actual file I/O.
//!
//! Reads are queued and executed a few per tick. Open handles and file sizes
//! are kept in small LRU tables, and running averages of open time, read
//! time and throughput drive the completion estimates.

use crate::config::StorageDriveConfig;
use crate::context::StreamerContext;
use crate::request::{
    Command, Priority, ReadData, ReportType, RequestId, RequestPath, RequestStatus,
};
use crate::stack::{log_statistics, StackEntryBase, Status, StreamStackEntry};
use lode_io::{AverageWindow, FileSystem, OpenMode, RawFile, Statistic};
use std::cmp::Reverse;
use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct OpenFile {
    path: RequestPath,
    handle: Box<dyn RawFile>,
    last_used: u64,
}

struct MetaData {
    path: RequestPath,
    size: u64,
    last_used: u64,
}

pub struct StorageDrive {
    base: StackEntryBase,
    config: StorageDriveConfig,
    fs: Arc<dyn FileSystem>,
    queue: VecDeque<RequestId>,
    handles: Vec<OpenFile>,
    meta_data: Vec<MetaData>,
    /// Stamp source for the LRU tables.
    clock: u64,
    /// File and offset right after the last executed read.
    position: Option<(RequestPath, u64)>,
    open_time: AverageWindow,
    read_time: AverageWindow,
    throughput: AverageWindow,
    num_reads: u64,
    num_failed_reads: u64,
    num_opens: u64,
    bytes_read: u64,
}

impl StorageDrive {
    /// Create the terminal stage over a file system.
    ///
    /// # Arguments
    ///
    /// * `config` - Queue depth and handle limits
    /// * `fs` - File system serving the reads
    pub fn new(config: StorageDriveConfig, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            base: StackEntryBase::new("StorageDrive"),
            fs,
            queue: VecDeque::new(),
            handles: Vec::with_capacity(config.max_file_handles),
            meta_data: Vec::new(),
            clock: 0,
            position: None,
            open_time: AverageWindow::new(config.statistics_window),
            read_time: AverageWindow::new(config.statistics_window),
            throughput: AverageWindow::new(config.statistics_window),
            num_reads: 0,
            num_failed_reads: 0,
            num_opens: 0,
            bytes_read: 0,
            config,
        }
    }

    /// Reads accepted and not yet serviced.
    pub fn num_queued_reads(&self) -> usize {
        self.queue.len()
    }

    /// Files currently held open.
    pub fn num_open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Whether a handle for `path` is cached.
    pub fn is_handle_open(&self, path: &RequestPath) -> bool {
        self.handles.iter().any(|file| &file.path == path)
    }

    fn tick_clock(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Index of an open handle for `path`, opening one if needed.
    fn acquire_handle(&mut self, path: &RequestPath) -> io::Result<usize> {
        let stamp = self.tick_clock();
        if let Some(index) = self.handles.iter().position(|file| &file.path == path) {
            self.handles[index].last_used = stamp;
            return Ok(index);
        }

        let started = Instant::now();
        let handle = self.fs.open(path, OpenMode::Read)?;
        self.open_time.push(started.elapsed().as_secs_f64());
        self.num_opens += 1;

        if self.handles.len() >= self.config.max_file_handles {
            if let Some(oldest) = self
                .handles
                .iter()
                .enumerate()
                .min_by_key(|(_, file)| file.last_used)
                .map(|(index, _)| index)
            {
                let evicted = self.handles.swap_remove(oldest);
                tracing::debug!(path = %evicted.path.display(), "file handle evicted");
            }
        }
        tracing::debug!(path = %path.display(), "file opened");
        self.handles.push(OpenFile {
            path: Arc::clone(path),
            handle,
            last_used: stamp,
        });
        Ok(self.handles.len() - 1)
    }

    /// File size from the meta-data table or the file system.
    fn file_size(&mut self, path: &RequestPath) -> io::Result<u64> {
        let stamp = self.tick_clock();
        if let Some(entry) = self.meta_data.iter_mut().find(|entry| &entry.path == path) {
            entry.last_used = stamp;
            return Ok(entry.size);
        }
        let size = self.fs.size(path)?;
        if self.config.max_meta_data_entries > 0 {
            if self.meta_data.len() >= self.config.max_meta_data_entries {
                if let Some(oldest) = self
                    .meta_data
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, entry)| entry.last_used)
                    .map(|(index, _)| index)
                {
                    self.meta_data.swap_remove(oldest);
                }
            }
            self.meta_data.push(MetaData {
                path: Arc::clone(path),
                size,
                last_used: stamp,
            });
        }
        Ok(size)
    }

    fn file_exists(&self, path: &RequestPath) -> bool {
        self.meta_data.iter().any(|entry| &entry.path == path) || self.fs.exists(path)
    }

    fn flush(&mut self, path: Option<&RequestPath>) {
        match path {
            Some(path) => {
                self.handles.retain(|file| &file.path != path);
                self.meta_data.retain(|entry| &entry.path != path);
            }
            None => {
                self.handles.clear();
                self.meta_data.clear();
            }
        }
        self.position = None;
    }

    /// Seek and read into the target. Returns the bytes read, fewer than
    /// requested at end of file.
    fn read_into_target(&mut self, data: &ReadData) -> io::Result<u64> {
        let index = self.acquire_handle(&data.path)?;
        let handle = &mut self.handles[index].handle;

        let mut buffer = data.target.buffer.lock();
        let start = data.target.offset;
        let end = start + data.size as usize;
        if end > buffer.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read of {} bytes does not fit its target", data.size),
            ));
        }
        let slice = &mut buffer.as_mut_slice()[start..end];

        handle.seek(SeekFrom::Start(data.offset))?;
        let mut filled = 0;
        while filled < slice.len() {
            match handle.read(&mut slice[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled as u64)
    }

    fn execute_read(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        if ctx.is_cancel_requested(id) {
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }
        let Some(data) = ctx.request(id).read_data().cloned() else {
            ctx.mark_request_as_completed(id, RequestStatus::Failed);
            return;
        };
        ctx.request_mut(id).set_status(RequestStatus::Processing);

        let started = Instant::now();
        let status = match self.read_into_target(&data) {
            Ok(bytes) => {
                let elapsed = started.elapsed().as_secs_f64();
                self.read_time.push(elapsed);
                if elapsed > 0.0 && bytes > 0 {
                    self.throughput.push(bytes as f64 / elapsed);
                }
                self.num_reads += 1;
                self.bytes_read += bytes;
                self.position = Some((Arc::clone(&data.path), data.offset + bytes));
                ctx.request_mut(id).set_bytes_read(bytes);
                RequestStatus::Completed
            }
            Err(e) => {
                tracing::warn!(
                    path = %data.path.display(),
                    offset = data.offset,
                    size = data.size,
                    error = %e,
                    "read failed"
                );
                self.num_failed_reads += 1;
                self.position = None;
                RequestStatus::Failed
            }
        };
        ctx.mark_request_as_completed(id, status);
    }

    fn queue_read(&mut self, ctx: &mut StreamerContext, id: RequestId, size: u64) {
        if size == 0 {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }
        if ctx.is_cancel_requested(id) {
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }
        ctx.request_mut(id).set_status(RequestStatus::Queued);
        self.queue.push_back(id);
    }

    fn serve_meta_data(&mut self, ctx: &mut StreamerContext, id: RequestId, path: &RequestPath) {
        let status = match self.file_size(path) {
            Ok(size) => {
                let request = ctx.request_mut(id);
                request.set_file_size(Some(size));
                request.set_file_exists(true);
                RequestStatus::Completed
            }
            Err(e) => {
                tracing::debug!(path = %path.display(), error = %e, "no meta data");
                ctx.request_mut(id).set_file_exists(false);
                RequestStatus::Failed
            }
        };
        ctx.mark_request_as_completed(id, status);
    }

    fn cancel(&mut self, ctx: &mut StreamerContext, target: RequestId) {
        self.queue.retain(|id| {
            let canceled = ctx.is_descendant_of(*id, target);
            if canceled {
                ctx.mark_request_as_completed(*id, RequestStatus::Canceled);
            }
            !canceled
        });
    }

    fn reschedule(
        &mut self,
        ctx: &mut StreamerContext,
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    ) {
        for id in &self.queue {
            if ctx.is_descendant_of(*id, target) {
                let request = ctx.request_mut(*id);
                request.set_priority(priority);
                request.set_deadline(deadline);
            }
        }
        self.queue
            .make_contiguous()
            .sort_by_key(|id| Reverse(ctx.request(*id).priority()));
    }

    fn average_open_time(&self) -> Duration {
        self.open_time
            .average()
            .map_or(self.config.initial_open_time, Duration::from_secs_f64)
    }

    fn average_throughput(&self) -> f64 {
        self.throughput
            .average()
            .unwrap_or(self.config.initial_throughput)
    }

    /// Time to serve `size` bytes at `offset` of `path` after a read that
    /// ended at `position`.
    fn estimate_read(
        &self,
        position: Option<&(RequestPath, u64)>,
        opened: &[RequestPath],
        path: &RequestPath,
        offset: u64,
        size: u64,
    ) -> Duration {
        let mut estimate = Duration::from_secs_f64(size as f64 / self.average_throughput());
        let contiguous = position.is_some_and(|(last, end)| last == path && *end == offset);
        if !contiguous {
            estimate += self.config.seek_penalty;
        }
        if !self.is_handle_open(path) && !opened.contains(path) {
            estimate += self.average_open_time();
        }
        estimate
    }
}

impl StreamStackEntry for StorageDrive {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match ctx.request(id).command().clone() {
            Command::Read(data) => self.queue_read(ctx, id, data.size),
            Command::FileExists { path } => {
                let exists = self.file_exists(&path);
                ctx.request_mut(id).set_file_exists(exists);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            Command::FileMetaData { path } => self.serve_meta_data(ctx, id, &path),
            Command::FlushCache { path } => {
                self.flush(Some(&path));
                self.forward_request(ctx, id);
            }
            Command::FlushCaches => {
                self.flush(None);
                self.forward_request(ctx, id);
            }
            Command::Cancel { target } => {
                self.cancel(ctx, target);
                self.forward_request(ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                self.reschedule(ctx, target, deadline, priority);
                self.forward_request(ctx, id);
            }
            _ => self.forward_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut executed = false;
        for _ in 0..self.config.reads_per_tick {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.execute_read(ctx, id);
            executed = true;
        }
        executed
    }

    fn update_status(&self, status: &mut Status) {
        let available = self.config.max_queued_reads as i32 - self.queue.len() as i32;
        status.merge(available, self.queue.is_empty());
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        pending: &[RequestId],
    ) {
        let mut time = now;
        let mut position = self.position.clone();
        let mut opened: Vec<RequestPath> = Vec::new();

        let chain = self
            .queue
            .iter()
            .chain(internal_pending.iter())
            .chain(pending.iter());
        for id in chain {
            let Some(request) = ctx.try_request(*id) else {
                continue;
            };
            let command = request.command();
            let (Some(path), Some((offset, size))) = (command.path().cloned(), command.range())
            else {
                continue;
            };
            time += self.estimate_read(position.as_ref(), &opened, &path, offset, size);
            if !opened.contains(&path) {
                opened.push(Arc::clone(&path));
            }
            position = Some((path, offset + size));
            ctx.request_mut(*id).set_estimated_completion(time);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer("StorageDrive", "Reads", self.num_reads as i64));
        statistics.push(Statistic::integer(
            "StorageDrive",
            "FailedReads",
            self.num_failed_reads as i64,
        ));
        statistics.push(Statistic::integer("StorageDrive", "BytesRead", self.bytes_read as i64));
        statistics.push(Statistic::integer("StorageDrive", "Opens", self.num_opens as i64));
        statistics.push(Statistic::integer(
            "StorageDrive",
            "OpenHandles",
            self.handles.len() as i64,
        ));
        statistics.push(Statistic::integer(
            "StorageDrive",
            "QueuedReads",
            self.queue.len() as i64,
        ));
        statistics.push(Statistic::float(
            "StorageDrive",
            "AverageOpenTimeMs",
            self.average_open_time().as_secs_f64() * 1000.0,
        ));
        if let Some(read_time) = self.read_time.average() {
            statistics.push(Statistic::float(
                "StorageDrive",
                "AverageReadTimeMs",
                read_time * 1000.0,
            ));
        }
        statistics.push(Statistic::float(
            "StorageDrive",
            "ThroughputMBps",
            self.average_throughput() / (1024.0 * 1024.0),
        ));
    }

    fn report(&self, report: ReportType) {
        match report {
            ReportType::Statistics => {
                let mut statistics = Vec::new();
                self.collect_statistics(&mut statistics);
                log_statistics(self.name(), &statistics);
            }
            ReportType::FileLocks => {
                tracing::info!(count = self.handles.len(), "open file handles");
                for file in &self.handles {
                    tracing::info!(
                        path = %file.path.display(),
                        last_used = file.last_used,
                        "file handle"
                    );
                }
            }
        }
    }
}
