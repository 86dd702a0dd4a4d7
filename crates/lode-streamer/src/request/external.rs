//! Caller-visible request handles.
//!
//! A [`FileRequestPtr`] is filled on the caller's thread, queued, and later
//! polled or observed through a completion callback. The scheduling thread
//! mirrors status, estimates and results into it; every field is atomic or
//! behind a short `parking_lot` lock.

use super::{
    CompressedReadData, FileRange, Priority, ReadRequestData, ReportType, RequestId,
    RequestPath, RequestStatus,
};
use lode_io::SharedBuffer;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Invoked on the scheduling thread once a request reached a terminal state.
pub type CompletionCallback = Box<dyn FnOnce(&FileRequestPtr) + Send>;

const NO_INTERNAL: u64 = u64::MAX;
const NO_ESTIMATE: u64 = 0;

/// Command as filled in by the caller, before the scheduler takes it.
pub(crate) enum RequestCommand {
    Read {
        data: ReadRequestData,
        deadline: Option<Duration>,
        priority: Priority,
    },
    CompressedRead {
        data: CompressedReadData,
        deadline: Option<Duration>,
        priority: Priority,
    },
    FileExists {
        path: RequestPath,
    },
    FileMetaData {
        path: RequestPath,
    },
    Cancel {
        target: FileRequestPtr,
    },
    Reschedule {
        target: FileRequestPtr,
        deadline: Option<Duration>,
        priority: Priority,
    },
    FlushCache {
        path: RequestPath,
    },
    FlushCaches,
    CreateDedicatedCache {
        path: RequestPath,
        range: Option<FileRange>,
    },
    DestroyDedicatedCache {
        path: RequestPath,
        range: Option<FileRange>,
    },
    Report(ReportType),
    Custom(Arc<dyn Any + Send + Sync>),
}

/// Outcome data mirrored from the internal request.
#[derive(Clone, Default)]
pub(crate) enum RequestResult {
    #[default]
    None,
    Read {
        buffer: SharedBuffer,
        bytes_read: u64,
    },
    Exists(bool),
    MetaData(Option<u64>),
}

/// Bytes produced by a completed read.
#[derive(Clone)]
pub struct ReadResult {
    pub buffer: SharedBuffer,
    pub bytes_read: u64,
}

impl ReadResult {
    /// Copy of the bytes that were read.
    pub fn to_vec(&self) -> Vec<u8> {
        let buffer = self.buffer.lock();
        let len = (self.bytes_read as usize).min(buffer.len());
        buffer.as_slice()[..len].to_vec()
    }
}

impl std::fmt::Debug for ReadResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadResult")
            .field("bytes_read", &self.bytes_read)
            .finish()
    }
}

/// Shared state behind a [`FileRequestPtr`].
pub struct ExternalRequest {
    status: AtomicU8,
    internal: AtomicU64,
    /// Nanoseconds since `epoch`, plus one. Zero means no estimate.
    estimate: AtomicU64,
    epoch: Instant,
    command: Mutex<Option<RequestCommand>>,
    result: Mutex<RequestResult>,
    callback: Mutex<Option<CompletionCallback>>,
}

impl ExternalRequest {
    pub(crate) fn new(epoch: Instant) -> Self {
        Self {
            status: AtomicU8::new(RequestStatus::Pending as u8),
            internal: AtomicU64::new(NO_INTERNAL),
            estimate: AtomicU64::new(NO_ESTIMATE),
            epoch,
            command: Mutex::new(None),
            result: Mutex::new(RequestResult::None),
            callback: Mutex::new(None),
        }
    }

    /// Latest status mirrored from the scheduling thread.
    pub fn status(&self) -> RequestStatus {
        RequestStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub(crate) fn set_status(&self, status: RequestStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    /// Move to `Queued` unless the request is already queued or running.
    /// Only one of several racing callers wins.
    pub(crate) fn try_mark_queued(&self) -> bool {
        self.status
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = RequestStatus::from_u8(current);
                (!matches!(current, RequestStatus::Queued | RequestStatus::Processing))
                    .then_some(RequestStatus::Queued as u8)
            })
            .is_ok()
    }

    pub(crate) fn internal_id(&self) -> Option<RequestId> {
        match self.internal.load(Ordering::Acquire) {
            NO_INTERNAL => None,
            bits => Some(RequestId::from_bits(bits)),
        }
    }

    pub(crate) fn set_internal_id(&self, id: Option<RequestId>) {
        let bits = id.map_or(NO_INTERNAL, RequestId::to_bits);
        self.internal.store(bits, Ordering::Release);
    }

    /// Latest completion estimate, if any stage made one.
    pub fn estimated_completion(&self) -> Option<Instant> {
        match self.estimate.load(Ordering::Acquire) {
            NO_ESTIMATE => None,
            nanos => Some(self.epoch + Duration::from_nanos(nanos - 1)),
        }
    }

    pub(crate) fn set_estimated_completion(&self, estimate: Instant) {
        let nanos = estimate.saturating_duration_since(self.epoch).as_nanos();
        let encoded = u64::try_from(nanos).unwrap_or(u64::MAX - 1) + 1;
        self.estimate.store(encoded, Ordering::Release);
    }

    pub(crate) fn set_command(&self, command: RequestCommand) {
        *self.command.lock() = Some(command);
    }

    pub(crate) fn take_command(&self) -> Option<RequestCommand> {
        self.command.lock().take()
    }

    pub(crate) fn set_result(&self, result: RequestResult) {
        *self.result.lock() = result;
    }

    pub(crate) fn result(&self) -> RequestResult {
        self.result.lock().clone()
    }

    pub(crate) fn set_callback(&self, callback: CompletionCallback) {
        *self.callback.lock() = Some(callback);
    }

    pub(crate) fn take_callback(&self) -> Option<CompletionCallback> {
        self.callback.lock().take()
    }

    /// Return to the freshly created state before reuse.
    pub(crate) fn reset(&self) {
        self.set_status(RequestStatus::Pending);
        self.set_internal_id(None);
        self.estimate.store(NO_ESTIMATE, Ordering::Release);
        *self.command.lock() = None;
        *self.result.lock() = RequestResult::None;
        *self.callback.lock() = None;
    }
}

/// Reference-counted handle to a caller request.
#[derive(Clone)]
pub struct FileRequestPtr(pub(crate) Arc<ExternalRequest>);

impl FileRequestPtr {
    pub(crate) fn from_arc(inner: Arc<ExternalRequest>) -> Self {
        Self(inner)
    }

    pub(crate) fn inner(&self) -> &Arc<ExternalRequest> {
        &self.0
    }

    /// Latest status mirrored from the scheduling thread.
    pub fn status(&self) -> RequestStatus {
        self.0.status()
    }

    /// Whether the request reached a terminal state.
    pub fn has_completed(&self) -> bool {
        self.0.status().is_terminal()
    }

    /// Latest completion estimate, if any stage made one.
    pub fn estimated_completion(&self) -> Option<Instant> {
        self.0.estimated_completion()
    }

    /// Whether both handles refer to the same request.
    pub fn ptr_eq(&self, other: &FileRequestPtr) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl std::fmt::Debug for FileRequestPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequestPtr")
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_round_trip() {
        let epoch = Instant::now();
        let request = ExternalRequest::new(epoch);
        assert!(request.estimated_completion().is_none());

        let estimate = epoch + Duration::from_millis(15);
        request.set_estimated_completion(estimate);
        assert_eq!(request.estimated_completion(), Some(estimate));
    }

    #[test]
    fn test_only_one_racing_queue_wins() {
        let request = Arc::new(ExternalRequest::new(Instant::now()));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let request = Arc::clone(&request);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    request.try_mark_queued()
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(request.status(), RequestStatus::Queued);

        request.set_status(RequestStatus::Completed);
        assert!(request.try_mark_queued());
    }

    #[test]
    fn test_reset_clears_state() {
        let request = ExternalRequest::new(Instant::now());
        request.set_status(RequestStatus::Completed);
        request.set_internal_id(Some(RequestId::new(3, 1)));
        request.set_command(RequestCommand::FlushCaches);
        request.set_result(RequestResult::Exists(true));

        request.reset();
        assert_eq!(request.status(), RequestStatus::Pending);
        assert!(request.internal_id().is_none());
        assert!(request.take_command().is_none());
        assert!(matches!(request.result(), RequestResult::None));
    }
}
