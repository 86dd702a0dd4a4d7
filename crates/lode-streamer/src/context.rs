//! Request pools, queues and the wake primitive of the scheduling thread.
//!
//! [`ContextShared`] is the only part touched by caller threads: the external
//! recycle bin, the completion queue and the wake signal, each behind its own
//! short lock. [`StreamerContext`] adds the arena and the prepared queue,
//! which belong to the scheduling thread and are not guarded.

use crate::request::{
    Command, ExternalRequest, FileRequest, FileRequestPtr, ReadOutput, RequestArena, RequestId,
    RequestResult, RequestStatus,
};
use crate::stack::{stage_at_mut, StreamStackEntry};
use lode_io::{shared_buffer, ReadBuffer};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cap on idle external requests kept for reuse.
const MAX_RECYCLED_EXTERNAL: usize = 256;

/// Sleep/wake primitive for the scheduling thread.
#[derive(Default)]
pub(crate) struct WakeSignal {
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl WakeSignal {
    fn wake(&self) {
        let mut woken = self.woken.lock();
        if !*woken {
            *woken = true;
            self.condvar.notify_one();
        }
    }

    fn wait(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            let _ = self.condvar.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }
}

/// Thread-safe half of the context.
pub struct ContextShared {
    epoch: Instant,
    external_bin: Mutex<Vec<Arc<ExternalRequest>>>,
    completed: Mutex<Vec<(RequestId, RequestStatus)>>,
    wake: WakeSignal,
}

impl ContextShared {
    /// Shared state with a fresh epoch and no completions.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            external_bin: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            wake: WakeSignal::default(),
        }
    }

    /// Reference point for the estimates stored in external requests.
    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    /// New or recycled caller request.
    pub fn get_new_external_request(&self) -> FileRequestPtr {
        let mut bin = self.external_bin.lock();
        self.take_external(&mut bin)
    }

    /// `count` caller requests for a single lock acquisition.
    pub fn get_new_external_request_batch(&self, count: usize) -> Vec<FileRequestPtr> {
        let mut bin = self.external_bin.lock();
        (0..count).map(|_| self.take_external(&mut bin)).collect()
    }

    fn take_external(&self, bin: &mut Vec<Arc<ExternalRequest>>) -> FileRequestPtr {
        // A count of one means only the bin still references the request.
        match bin.iter().position(|request| Arc::strong_count(request) == 1) {
            Some(position) => {
                let request = bin.swap_remove(position);
                request.reset();
                FileRequestPtr::from_arc(request)
            }
            None => FileRequestPtr::from_arc(Arc::new(ExternalRequest::new(self.epoch))),
        }
    }

    fn recycle_external(&self, request: Arc<ExternalRequest>) {
        let mut bin = self.external_bin.lock();
        if bin.len() < MAX_RECYCLED_EXTERNAL && !bin.iter().any(|r| Arc::ptr_eq(r, &request)) {
            bin.push(request);
        }
    }

    /// Publish the outcome of a caller request, run its callback and put it
    /// in the recycle bin.
    pub(crate) fn finish_external(
        &self,
        external: &Arc<ExternalRequest>,
        result: RequestResult,
        status: RequestStatus,
    ) {
        external.set_internal_id(None);
        external.set_result(result);
        external.set_status(status);
        if let Some(callback) = external.take_callback() {
            callback(&FileRequestPtr::from_arc(Arc::clone(external)));
        }
        self.recycle_external(Arc::clone(external));
    }

    /// Number of external requests waiting in the recycle bin.
    pub fn num_recycled_external_requests(&self) -> usize {
        self.external_bin.lock().len()
    }

    /// Queue a completion from any thread.
    ///
    /// Used by asynchronous completion sources; stages on the scheduling
    /// thread call [`StreamerContext::mark_request_as_completed`].
    pub fn mark_request_as_completed(&self, id: RequestId, status: RequestStatus) {
        self.completed.lock().push((id, status));
        self.wake.wake();
    }

    /// Whether completions wait to be finalized.
    pub fn has_completed_requests(&self) -> bool {
        !self.completed.lock().is_empty()
    }

    /// Wake the scheduling thread. No-op when it is already signalled.
    pub fn wake_up_scheduling_thread(&self) {
        self.wake.wake();
    }

    /// Block the scheduling thread until woken or `timeout` passes.
    pub fn suspend_scheduling_thread(&self, timeout: Duration) {
        self.wake.wait(timeout);
    }
}

impl Default for ContextShared {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduling-thread context shared by every stage of the stack.
pub struct StreamerContext {
    shared: Arc<ContextShared>,
    requests: RequestArena,
    prepared: VecDeque<RequestId>,
    ready: Vec<RequestId>,
}

impl StreamerContext {
    /// Context with a shared half of its own, for driving stages directly.
    pub fn new() -> Self {
        Self::with_shared(Arc::new(ContextShared::new()))
    }

    /// Context driven by the scheduling thread over `shared`.
    pub fn with_shared(shared: Arc<ContextShared>) -> Self {
        Self {
            shared,
            requests: RequestArena::with_capacity(64),
            prepared: VecDeque::new(),
            ready: Vec::new(),
        }
    }

    /// Half of the context shared with callers.
    pub fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }

    // Requests

    /// New internal request. Scheduling thread only.
    pub fn get_new_internal_request(&mut self, command: Command) -> RequestId {
        self.requests.insert(FileRequest::new(command))
    }

    /// New internal request linked as a child of `parent`.
    ///
    /// The child inherits the parent's priority and deadline, and the parent
    /// will not complete before the child does.
    pub fn create_child_request(&mut self, parent: RequestId, command: Command) -> RequestId {
        let (priority, deadline) = {
            let parent_request = &mut self.requests[parent];
            parent_request.pending_children += 1;
            (parent_request.priority(), parent_request.deadline())
        };
        let mut child = FileRequest::new(command);
        child.parent = Some(parent);
        child.set_priority(priority);
        child.set_deadline(deadline);
        self.requests.insert(child)
    }

    /// Keep `dependent` from being released to the scheduler until `blocker`
    /// completes.
    pub fn add_dependency(&mut self, dependent: RequestId, blocker: RequestId) {
        self.requests[dependent].blockers += 1;
        self.requests[blocker].dependents.push(dependent);
    }

    /// Live request behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is stale.
    pub fn request(&self, id: RequestId) -> &FileRequest {
        &self.requests[id]
    }

    /// Live request behind `id`, mutably.
    ///
    /// # Panics
    ///
    /// Panics if `id` is stale.
    pub fn request_mut(&mut self, id: RequestId) -> &mut FileRequest {
        &mut self.requests[id]
    }

    /// Live request behind `id`, or `None` once it was finalized.
    pub fn try_request(&self, id: RequestId) -> Option<&FileRequest> {
        self.requests.get(id)
    }

    pub(crate) fn attach_external(&mut self, id: RequestId, external: Arc<ExternalRequest>) {
        external.set_internal_id(Some(id));
        self.requests[id].external = Some(external);
    }

    /// Number of internal requests alive in the arena.
    pub fn num_active_requests(&self) -> usize {
        self.requests.len()
    }

    /// Whether cancellation was requested for `id` or any of its ancestors.
    pub fn is_cancel_requested(&self, id: RequestId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            let Some(request) = self.requests.get(current_id) else {
                return false;
            };
            if request.is_cancel_requested() {
                return true;
            }
            current = request.parent();
        }
        false
    }

    /// Flag `id` for cancellation. Its descendants see the flag too.
    pub fn request_cancel(&mut self, id: RequestId) {
        if let Some(request) = self.requests.get_mut(id) {
            request.request_cancel();
        }
    }

    /// Whether `id` is `ancestor` or descends from it.
    pub fn is_descendant_of(&self, id: RequestId, ancestor: RequestId) -> bool {
        let mut current = Some(id);
        while let Some(current_id) = current {
            if current_id == ancestor {
                return true;
            }
            current = self.requests.get(current_id).and_then(FileRequest::parent);
        }
        false
    }

    // Prepared queue

    /// Hand a request that passed every prepare step to the scheduler.
    pub fn push_prepared_request(&mut self, id: RequestId) {
        self.requests[id].set_status(RequestStatus::Queued);
        self.prepared.push_back(id);
    }

    /// Oldest prepared request.
    pub fn pop_prepared_request(&mut self) -> Option<RequestId> {
        self.prepared.pop_front()
    }

    /// Requests prepared and not yet taken.
    pub fn num_prepared_requests(&self) -> usize {
        self.prepared.len()
    }

    /// Requests whose dependencies all resolved during finalization.
    pub fn take_ready_requests(&mut self) -> Vec<RequestId> {
        std::mem::take(&mut self.ready)
    }

    // Completion

    /// Record that `id` reached a terminal state.
    ///
    /// A request that finished while a cancel was pending reports `Canceled`.
    pub fn mark_request_as_completed(&mut self, id: RequestId, status: RequestStatus) {
        let cancel_requested = self.is_cancel_requested(id);
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        let status = if status == RequestStatus::Completed && cancel_requested {
            RequestStatus::Canceled
        } else {
            status
        };
        request.set_status(status);
        let status = request.status();
        self.shared.completed.lock().push((id, status));
    }

    /// Remove a request that never ran from its parent and recycle it.
    ///
    /// Returns the parent so the caller can decide whether it is now ready
    /// to complete.
    ///
    /// # Panics
    ///
    /// If the request still has children.
    pub fn reject_request(&mut self, id: RequestId) -> Option<RequestId> {
        let request = self.requests.remove(id)?;
        assert_eq!(
            request.pending_children, 0,
            "rejected request {:?} still has children",
            id
        );
        let parent = request.parent();
        if let Some(parent_id) = parent {
            if let Some(parent_request) = self.requests.get_mut(parent_id) {
                parent_request.pending_children -= 1;
            }
        }
        parent
    }

    /// Drain the completion queue, running callbacks and completing parents.
    ///
    /// Returns whether any request was finalized.
    pub fn finalize_completed_requests(
        &mut self,
        mut stack: Option<&mut (dyn StreamStackEntry + 'static)>,
    ) -> bool {
        let mut did_work = false;
        loop {
            let batch = {
                let mut completed = self.shared.completed.lock();
                if completed.is_empty() {
                    break;
                }
                std::mem::take(&mut *completed)
            };
            did_work = true;
            for (id, status) in batch {
                self.finalize_request(id, status, stack.as_deref_mut());
            }
        }
        did_work
    }

    fn finalize_request(
        &mut self,
        id: RequestId,
        status: RequestStatus,
        stack: Option<&mut (dyn StreamStackEntry + 'static)>,
    ) {
        // Stale ids come from duplicate completions of a recycled request.
        let Some(request) = self.requests.get_mut(id) else {
            return;
        };
        request.set_status(status);

        if let (Some(owner), Some(stack)) = (request.owner(), stack) {
            if let Some(stage) = stage_at_mut(stack, owner) {
                stage.on_request_completed(self, id);
            }
        }

        let Some(request) = self.requests.remove(id) else {
            return;
        };
        let status = request.status();

        if let Some(external) = &request.external {
            self.complete_external(&request, external, status);
        }

        for dependent in &request.dependents {
            if let Some(waiting) = self.requests.get_mut(*dependent) {
                waiting.blockers = waiting.blockers.saturating_sub(1);
                if waiting.blockers == 0 && !waiting.status().is_terminal() {
                    self.ready.push(*dependent);
                }
            }
        }

        if let Some(parent_id) = request.parent() {
            self.complete_child(parent_id, &request, status);
        }
    }

    fn complete_child(&mut self, parent_id: RequestId, child: &FileRequest, status: RequestStatus) {
        let Some(parent) = self.requests.get_mut(parent_id) else {
            return;
        };
        parent.pending_children = parent.pending_children.saturating_sub(1);
        parent.children_status = parent.children_status.worst(status);
        parent.add_bytes_read(child.bytes_read());
        if parent.file_size().is_none() && child.file_size().is_some() {
            parent.set_file_size(child.file_size());
        }
        if let Some(exists) = child.file_exists() {
            parent.set_file_exists(exists);
        }

        // Only a parent that handed its work to children completes with them.
        if parent.pending_children == 0 && parent.status() == RequestStatus::Processing {
            let children_status = parent.children_status;
            self.mark_request_as_completed(parent_id, children_status);
        }
    }

    fn complete_external(
        &self,
        request: &FileRequest,
        external: &Arc<ExternalRequest>,
        status: RequestStatus,
    ) {
        let result = match request.command() {
            Command::Read(data) => RequestResult::Read {
                buffer: Arc::clone(&data.target.buffer),
                bytes_read: request.bytes_read(),
            },
            Command::CompressedRead(data) => RequestResult::Read {
                buffer: Arc::clone(&data.target.buffer),
                bytes_read: request.bytes_read(),
            },
            Command::ReadRequest(data) => match &data.output {
                ReadOutput::Buffer(buffer) => RequestResult::Read {
                    buffer: Arc::clone(buffer),
                    bytes_read: 0,
                },
                // Nothing was allocated for a read that never touched the file.
                ReadOutput::Allocator(_) => RequestResult::Read {
                    buffer: shared_buffer(ReadBuffer::zeroed(0)),
                    bytes_read: 0,
                },
            },
            Command::FileExists { .. } => {
                RequestResult::Exists(request.file_exists().unwrap_or(false))
            }
            Command::FileMetaData { .. } => RequestResult::MetaData(request.file_size()),
            _ => RequestResult::None,
        };

        if let Some(allocator) = &request.allocator {
            if status != RequestStatus::Completed {
                if let Command::Read(data) = request.command() {
                    let buffer = std::mem::take(&mut *data.target.buffer.lock());
                    allocator.release(buffer);
                }
            }
            allocator.unlock_allocator();
        }

        self.shared.finish_external(external, result, status);
    }

    // Thread control

    /// Wake the scheduling thread if it waits.
    pub fn wake_up_scheduling_thread(&self) {
        self.shared.wake_up_scheduling_thread();
    }

    /// Wait for a wake-up or until `timeout` passes.
    pub fn suspend_scheduling_thread(&self, timeout: Duration) {
        self.shared.suspend_scheduling_thread(timeout);
    }
}

impl Default for StreamerContext {
    fn default() -> Self {
        Self::new()
    }
}
