//! Test doubles for driving stages on the test thread.

use crate::context::StreamerContext;
use crate::request::{
    request_path, BufferTarget, Command, FileRequestPtr, ReadData, RequestId, RequestPath,
    RequestResult, RequestStatus,
};
use crate::stack::{BoxedStage, StackEntryBase, Status, StreamStackEntry};
use lode_io::{shared_buffer, ReadBuffer, SharedBuffer};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Route `tracing` output to the test harness. Safe to call repeatedly.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Deterministic, non-repeating-per-block file contents.
pub(crate) fn pattern_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RecordedCall {
    pub command: &'static str,
    pub path: Option<RequestPath>,
    pub offset: u64,
    pub size: u64,
}

#[derive(Default)]
struct LogState {
    calls: Vec<RecordedCall>,
    held: bool,
    failing: Vec<RequestPath>,
}

/// Shared view of what reached a [`RecordingStage`].
#[derive(Clone, Default)]
pub(crate) struct RecordingLog {
    state: Arc<Mutex<LogState>>,
}

impl RecordingLog {
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn reads(&self) -> Vec<RecordedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.command == "Read")
            .collect()
    }

    pub fn num_reads(&self) -> usize {
        self.reads().len()
    }

    pub fn clear(&self) {
        self.state.lock().calls.clear();
    }

    /// While held, queued requests are not serviced.
    pub fn set_held(&self, held: bool) {
        self.state.lock().held = held;
    }

    /// Reads of `path` fail from now on.
    pub fn fail_path(&self, path: &str) {
        self.state.lock().failing.push(request_path(path));
    }
}

/// Terminal stage serving reads from in-memory files and recording every
/// request it receives.
pub(crate) struct RecordingStage {
    base: StackEntryBase,
    files: HashMap<RequestPath, Vec<u8>>,
    queued: Vec<RequestId>,
    log: RecordingLog,
}

impl RecordingStage {
    pub fn new() -> (Self, RecordingLog) {
        let log = RecordingLog::default();
        let stage = Self {
            base: StackEntryBase::new("RecordingStage"),
            files: HashMap::new(),
            queued: Vec::new(),
            log: log.clone(),
        };
        (stage, log)
    }

    pub fn with_file(mut self, path: &str, contents: Vec<u8>) -> Self {
        self.files.insert(request_path(path), contents);
        self
    }

    fn service(&self, ctx: &mut StreamerContext, id: RequestId) {
        let failing = self.log.state.lock().failing.clone();
        let request = ctx.request_mut(id);
        request.set_status(RequestStatus::Processing);
        let status = match request.command().clone() {
            Command::Read(data) => {
                let contents = self
                    .files
                    .get(&data.path)
                    .filter(|_| !failing.contains(&data.path));
                match contents {
                    Some(contents) => {
                        let start = (data.offset as usize).min(contents.len());
                        let end = (data.offset + data.size).min(contents.len() as u64) as usize;
                        let written = data
                            .target
                            .buffer
                            .lock()
                            .write_at(data.target.offset, &contents[start..end]);
                        match written {
                            Ok(()) => {
                                request.set_bytes_read((end - start) as u64);
                                RequestStatus::Completed
                            }
                            Err(_) => RequestStatus::Failed,
                        }
                    }
                    None => RequestStatus::Failed,
                }
            }
            Command::FileMetaData { path } => match self.files.get(&path) {
                Some(contents) => {
                    request.set_file_size(Some(contents.len() as u64));
                    RequestStatus::Completed
                }
                None => RequestStatus::Failed,
            },
            Command::FileExists { path } => {
                request.set_file_exists(self.files.contains_key(&path));
                RequestStatus::Completed
            }
            _ => RequestStatus::Completed,
        };
        ctx.mark_request_as_completed(id, status);
    }
}

impl StreamStackEntry for RecordingStage {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let command = ctx.request(id).command();
        let (offset, size) = command.range().unwrap_or((0, 0));
        let path = command.path().cloned().or_else(|| match command {
            Command::FileMetaData { path } | Command::FileExists { path } => Some(path.clone()),
            _ => None,
        });
        let deferred = matches!(
            command,
            Command::Read(_) | Command::FileMetaData { .. } | Command::FileExists { .. }
        );
        self.log.state.lock().calls.push(RecordedCall {
            command: command.name(),
            path,
            offset,
            size,
        });
        if deferred {
            ctx.request_mut(id).set_status(RequestStatus::Queued);
            self.queued.push(id);
        } else {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        if self.log.state.lock().held || self.queued.is_empty() {
            return false;
        }
        for id in std::mem::take(&mut self.queued) {
            self.service(ctx, id);
        }
        true
    }

    fn update_status(&self, status: &mut Status) {
        status.merge(64 - self.queued.len() as i32, self.queued.is_empty());
    }
}

/// A caller read issued through [`TestStack::read`].
pub(crate) struct TestRead {
    pub request: FileRequestPtr,
    pub buffer: SharedBuffer,
}

impl TestRead {
    pub fn status(&self) -> RequestStatus {
        self.request.status()
    }

    pub fn bytes_read(&self) -> u64 {
        match self.request.inner().result() {
            RequestResult::Read { bytes_read, .. } => bytes_read,
            _ => 0,
        }
    }

    /// The bytes the read produced.
    pub fn data(&self) -> Vec<u8> {
        let len = self.bytes_read() as usize;
        self.buffer.lock().as_slice()[..len].to_vec()
    }
}

/// Drives a stage chain synchronously, the way the scheduling thread does.
pub(crate) struct TestStack {
    pub ctx: StreamerContext,
    pub root: BoxedStage,
}

impl TestStack {
    pub fn new(root: BoxedStage) -> Self {
        Self {
            ctx: StreamerContext::new(),
            root,
        }
    }

    /// Queue a physical read of `size` bytes into a fresh buffer.
    pub fn read(&mut self, path: &str, offset: u64, size: u64) -> TestRead {
        let buffer = shared_buffer(ReadBuffer::zeroed(size as usize));
        let target = BufferTarget::new(Arc::clone(&buffer), 0);
        let request = self.read_into(path, offset, size, target);
        TestRead { request, buffer }
    }

    pub fn read_into(
        &mut self,
        path: &str,
        offset: u64,
        size: u64,
        target: BufferTarget,
    ) -> FileRequestPtr {
        self.queue(Command::Read(ReadData {
            path: request_path(path),
            target,
            offset,
            size,
        }))
    }

    /// Queue any command with a caller handle attached.
    pub fn queue(&mut self, command: Command) -> FileRequestPtr {
        let (_, handle) = self.queue_with_id(command);
        handle
    }

    pub fn queue_with_id(&mut self, command: Command) -> (RequestId, FileRequestPtr) {
        let handle = self.ctx.shared().get_new_external_request();
        let id = self.ctx.get_new_internal_request(command);
        self.ctx.attach_external(id, Arc::clone(handle.inner()));
        self.root.queue_request(&mut self.ctx, id);
        (id, handle)
    }

    /// One scheduler tick without the ordering step.
    pub fn tick(&mut self) -> bool {
        let executed = self.root.execute_requests(&mut self.ctx);
        let finalized = self
            .ctx
            .finalize_completed_requests(Some(self.root.as_mut()));
        executed || finalized
    }

    /// Tick until nothing progresses.
    pub fn run(&mut self) {
        for _ in 0..10_000 {
            if !self.tick() {
                return;
            }
        }
        panic!("stack did not settle");
    }

    pub fn status(&self) -> Status {
        let mut status = Status::default();
        self.root.update_status(&mut status);
        status
    }
}
