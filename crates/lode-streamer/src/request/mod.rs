//! Request graph: commands, statuses and the arena-backed `FileRequest`.
//!
//! Internal requests live in a [`RequestArena`] and are addressed by
//! generation-checked [`RequestId`]s. Parent, child and dependency links are
//! ids, never references, so a recycled slot can not be reached through a
//! stale link.

mod arena;
mod external;

pub use arena::RequestArena;
pub use external::{CompletionCallback, ExternalRequest, FileRequestPtr, ReadResult};
pub(crate) use external::{RequestCommand, RequestResult};

use crate::stack::decompressor::CompressionCodec;
use crate::stack::StageId;
use lode_io::{RequestMemoryAllocator, SharedBuffer};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::any::Any;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

/// Path of a file targeted by a request. Cheap to clone.
pub type RequestPath = Arc<Path>;

/// Build a [`RequestPath`].
pub fn request_path(path: impl AsRef<Path>) -> RequestPath {
    Arc::from(path.as_ref())
}

/// Handle to an internal request slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId {
    index: u32,
    generation: u32,
}

impl RequestId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot in the arena.
    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Reuse count of the slot.
    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub(crate) fn to_bits(self) -> u64 {
        (u64::from(self.generation) << 32) | u64::from(self.index)
    }

    pub(crate) fn from_bits(bits: u64) -> Self {
        Self {
            index: bits as u32,
            generation: (bits >> 32) as u32,
        }
    }
}

/// Request lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum RequestStatus {
    #[default]
    Pending = 0,
    Queued = 1,
    Processing = 2,
    Completed = 3,
    Canceled = 4,
    Failed = 5,
}

impl RequestStatus {
    /// Completed, canceled or failed.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed
        )
    }

    fn rank(self) -> u8 {
        match self {
            RequestStatus::Pending => 0,
            RequestStatus::Queued => 1,
            RequestStatus::Processing => 2,
            RequestStatus::Completed | RequestStatus::Canceled | RequestStatus::Failed => 3,
        }
    }

    /// Combine two terminal statuses: Failed > Canceled > Completed.
    pub fn worst(self, other: RequestStatus) -> RequestStatus {
        fn severity(status: RequestStatus) -> u8 {
            match status {
                RequestStatus::Failed => 2,
                RequestStatus::Canceled => 1,
                _ => 0,
            }
        }
        if severity(other) > severity(self) {
            other
        } else {
            self
        }
    }

    pub(crate) fn from_u8(value: u8) -> RequestStatus {
        match value {
            0 => RequestStatus::Pending,
            1 => RequestStatus::Queued,
            2 => RequestStatus::Processing,
            3 => RequestStatus::Completed,
            4 => RequestStatus::Canceled,
            _ => RequestStatus::Failed,
        }
    }
}

/// Scheduling priority. Higher values are issued first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const LOWEST: Priority = Priority(0);
    pub const LOW: Priority = Priority(64);
    pub const MEDIUM: Priority = Priority(127);
    pub const HIGH: Priority = Priority(191);
    pub const HIGHEST: Priority = Priority(255);
}

impl Default for Priority {
    fn default() -> Self {
        Priority::MEDIUM
    }
}

/// A position inside a shared buffer that a read writes to.
#[derive(Clone)]
pub struct BufferTarget {
    pub buffer: SharedBuffer,
    pub offset: usize,
}

impl BufferTarget {
    /// Write target starting `offset` bytes into `buffer`.
    pub fn new(buffer: SharedBuffer, offset: usize) -> Self {
        Self { buffer, offset }
    }

    /// Same buffer, `delta` bytes further in.
    pub fn advanced(&self, delta: usize) -> Self {
        Self {
            buffer: Arc::clone(&self.buffer),
            offset: self.offset + delta,
        }
    }

    /// Memory address of the target byte.
    pub fn address(&self) -> usize {
        self.buffer.lock().address() + self.offset
    }

    /// Bytes available from the target to the end of the buffer.
    pub fn capacity(&self) -> usize {
        self.buffer.lock().len().saturating_sub(self.offset)
    }
}

impl std::fmt::Debug for BufferTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferTarget")
            .field("offset", &self.offset)
            .finish()
    }
}

/// Byte range of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRange {
    pub offset: u64,
    pub size: u64,
}

impl FileRange {
    /// `size` bytes from `offset`.
    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    /// First byte past the range.
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }

    /// Whether `[offset, offset + size)` lies entirely inside this range.
    pub fn contains(&self, offset: u64, size: u64) -> bool {
        offset >= self.offset && offset + size <= self.end()
    }
}

/// Where the bytes of a caller read end up.
#[derive(Clone)]
pub enum ReadOutput {
    /// Caller-owned memory.
    Buffer(SharedBuffer),
    /// Memory requested from an allocator once the read size is known.
    Allocator(Arc<dyn RequestMemoryAllocator>),
}

/// Physical read of `size` bytes at `offset` into `target`.
#[derive(Debug, Clone)]
pub struct ReadData {
    pub path: RequestPath,
    pub target: BufferTarget,
    pub offset: u64,
    pub size: u64,
}

/// Caller read, before the scheduler prepared it.
#[derive(Clone)]
pub struct ReadRequestData {
    pub path: RequestPath,
    pub output: ReadOutput,
    pub offset: u64,
    /// `None` reads to the end of the file.
    pub size: Option<u64>,
}

/// Read of a compressed byte range, decoded into `target`.
#[derive(Clone)]
pub struct CompressedReadData {
    pub path: RequestPath,
    pub offset: u64,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub codec: Arc<dyn CompressionCodec>,
    pub target: BufferTarget,
}

/// What a report request logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportType {
    /// Every stage logs its statistics.
    Statistics,
    /// The storage drive logs its open file handles.
    FileLocks,
}

/// Payload of a [`FileRequest`].
#[derive(Clone)]
pub enum Command {
    Read(ReadData),
    ReadRequest(ReadRequestData),
    CompressedRead(CompressedReadData),
    FileExists {
        path: RequestPath,
    },
    FileMetaData {
        path: RequestPath,
    },
    Cancel {
        target: RequestId,
    },
    Reschedule {
        target: RequestId,
        deadline: Option<Instant>,
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

impl Command {
    /// Command name for logs and recordings.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Read(_) => "Read",
            Command::ReadRequest(_) => "ReadRequest",
            Command::CompressedRead(_) => "CompressedRead",
            Command::FileExists { .. } => "FileExists",
            Command::FileMetaData { .. } => "FileMetaData",
            Command::Cancel { .. } => "Cancel",
            Command::Reschedule { .. } => "Reschedule",
            Command::FlushCache { .. } => "FlushCache",
            Command::FlushCaches => "FlushCaches",
            Command::CreateDedicatedCache { .. } => "CreateDedicatedCache",
            Command::DestroyDedicatedCache { .. } => "DestroyDedicatedCache",
            Command::Report(_) => "Report",
            Command::Custom(_) => "Custom",
        }
    }

    /// File a data request touches, used for locality ordering.
    pub fn path(&self) -> Option<&RequestPath> {
        match self {
            Command::Read(data) => Some(&data.path),
            Command::ReadRequest(data) => Some(&data.path),
            Command::CompressedRead(data) => Some(&data.path),
            _ => None,
        }
    }

    /// `(offset, size)` of a data request, if known.
    pub fn range(&self) -> Option<(u64, u64)> {
        match self {
            Command::Read(data) => Some((data.offset, data.size)),
            Command::ReadRequest(data) => data.size.map(|size| (data.offset, size)),
            Command::CompressedRead(data) => Some((data.offset, data.compressed_size)),
            _ => None,
        }
    }

    /// Whether the command moves file data.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Command::Read(_) | Command::ReadRequest(_) | Command::CompressedRead(_)
        )
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Read(data) => f
                .debug_struct("Read")
                .field("path", &data.path)
                .field("offset", &data.offset)
                .field("size", &data.size)
                .finish(),
            Command::ReadRequest(data) => f
                .debug_struct("ReadRequest")
                .field("path", &data.path)
                .field("offset", &data.offset)
                .field("size", &data.size)
                .finish(),
            Command::CompressedRead(data) => f
                .debug_struct("CompressedRead")
                .field("path", &data.path)
                .field("offset", &data.offset)
                .field("compressed_size", &data.compressed_size)
                .field("uncompressed_size", &data.uncompressed_size)
                .finish(),
            Command::FileExists { path } | Command::FileMetaData { path } => {
                f.debug_tuple(self.name()).field(path).finish()
            }
            Command::Cancel { target } => f.debug_tuple("Cancel").field(target).finish(),
            Command::Reschedule {
                target, priority, ..
            } => f
                .debug_struct("Reschedule")
                .field("target", target)
                .field("priority", priority)
                .finish(),
            Command::FlushCache { path } => f.debug_tuple("FlushCache").field(path).finish(),
            Command::CreateDedicatedCache { path, range }
            | Command::DestroyDedicatedCache { path, range } => f
                .debug_struct(self.name())
                .field("path", path)
                .field("range", range)
                .finish(),
            Command::Report(report) => f.debug_tuple("Report").field(report).finish(),
            Command::FlushCaches | Command::Custom(_) => write!(f, "{}", self.name()),
        }
    }
}

/// One unit of work inside the stack.
pub struct FileRequest {
    pub(crate) command: Command,
    status: RequestStatus,
    pub(crate) parent: Option<RequestId>,
    pub(crate) pending_children: u32,
    pub(crate) children_status: RequestStatus,
    pub(crate) dependents: SmallVec<[RequestId; 2]>,
    pub(crate) blockers: u32,
    pub(crate) owner: Option<StageId>,
    pub(crate) external: Option<Arc<ExternalRequest>>,
    pub(crate) allocator: Option<Arc<dyn RequestMemoryAllocator>>,
    priority: Priority,
    deadline: Option<Instant>,
    estimated_completion: Option<Instant>,
    cancel_requested: bool,
    bytes_read: u64,
    file_size: Option<u64>,
    file_exists: Option<bool>,
    created_at: Instant,
}

impl FileRequest {
    /// Pending request carrying `command`.
    pub fn new(command: Command) -> Self {
        Self {
            command,
            status: RequestStatus::Pending,
            parent: None,
            pending_children: 0,
            children_status: RequestStatus::Completed,
            dependents: SmallVec::new(),
            blockers: 0,
            owner: None,
            external: None,
            allocator: None,
            priority: Priority::default(),
            deadline: None,
            estimated_completion: None,
            cancel_requested: false,
            bytes_read: 0,
            file_size: None,
            file_exists: None,
            created_at: Instant::now(),
        }
    }

    /// What the request does.
    #[inline]
    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Mutable command, for stages that rewrite a request in place.
    #[inline]
    pub fn command_mut(&mut self) -> &mut Command {
        &mut self.command
    }

    /// Current status.
    #[inline]
    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Move the status forward. Backward transitions and transitions out of
    /// a terminal state are ignored. Terminal statuses reach the caller's
    /// handle only at finalization, after the result is in place.
    pub fn set_status(&mut self, status: RequestStatus) {
        if self.status.is_terminal() || status.rank() < self.status.rank() {
            return;
        }
        self.status = status;
        if let (Some(external), false) = (&self.external, status.is_terminal()) {
            external.set_status(status);
        }
    }

    /// Request this one was split from.
    #[inline]
    pub fn parent(&self) -> Option<RequestId> {
        self.parent
    }

    /// Children not yet finalized.
    #[inline]
    pub fn pending_children(&self) -> u32 {
        self.pending_children
    }

    /// Stage notified when this request completes.
    #[inline]
    pub fn owner(&self) -> Option<StageId> {
        self.owner
    }

    /// Route the completion of this request to stage `owner`.
    pub fn set_owner(&mut self, owner: StageId) {
        self.owner = Some(owner);
    }

    /// Whether a caller handle is attached.
    #[inline]
    pub fn is_external(&self) -> bool {
        self.external.is_some()
    }

    /// Issue priority.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Absolute time by which the caller wants the data.
    #[inline]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.deadline = deadline;
    }

    /// Latest estimate of when the request finishes.
    #[inline]
    pub fn estimated_completion(&self) -> Option<Instant> {
        self.estimated_completion
    }

    /// Record an estimate. Caller handles see it too.
    pub fn set_estimated_completion(&mut self, estimate: Instant) {
        self.estimated_completion = Some(estimate);
        if let Some(external) = &self.external {
            external.set_estimated_completion(estimate);
        }
    }

    /// Whether a cancel reached this request itself.
    #[inline]
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    pub(crate) fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    /// Bytes transferred so far.
    #[inline]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub fn set_bytes_read(&mut self, bytes: u64) {
        self.bytes_read = bytes;
    }

    pub fn add_bytes_read(&mut self, bytes: u64) {
        self.bytes_read += bytes;
    }

    /// File size learned by a meta data lookup.
    #[inline]
    pub fn file_size(&self) -> Option<u64> {
        self.file_size
    }

    pub fn set_file_size(&mut self, size: Option<u64>) {
        self.file_size = size;
    }

    /// Existence learned by a lookup.
    #[inline]
    pub fn file_exists(&self) -> Option<bool> {
        self.file_exists
    }

    pub fn set_file_exists(&mut self, exists: bool) {
        self.file_exists = Some(exists);
    }

    /// When the request entered the arena.
    #[inline]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Read payload, if this is a physical read.
    pub fn read_data(&self) -> Option<&ReadData> {
        match &self.command {
            Command::Read(data) => Some(data),
            _ => None,
        }
    }
}

impl std::fmt::Debug for FileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileRequest")
            .field("command", &self.command)
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("pending_children", &self.pending_children)
            .field("priority", &self.priority)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flush_request() -> FileRequest {
        FileRequest::new(Command::FlushCaches)
    }

    #[test]
    fn test_status_is_monotonic() {
        let mut request = flush_request();
        request.set_status(RequestStatus::Processing);
        request.set_status(RequestStatus::Queued);
        assert_eq!(request.status(), RequestStatus::Processing);

        request.set_status(RequestStatus::Completed);
        request.set_status(RequestStatus::Failed);
        request.set_status(RequestStatus::Pending);
        assert_eq!(request.status(), RequestStatus::Completed);
    }

    #[test]
    fn test_worst_status() {
        use RequestStatus::*;
        assert_eq!(Completed.worst(Canceled), Canceled);
        assert_eq!(Canceled.worst(Failed), Failed);
        assert_eq!(Failed.worst(Completed), Failed);
        assert_eq!(Completed.worst(Completed), Completed);
    }

    #[test]
    fn test_request_id_bits() {
        let id = RequestId::new(42, 7);
        assert_eq!(RequestId::from_bits(id.to_bits()), id);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::HIGHEST > Priority::HIGH);
        assert!(Priority::LOW > Priority::LOWEST);
        assert_eq!(Priority::default(), Priority::MEDIUM);
    }

    #[test]
    fn test_file_range_contains() {
        let range = FileRange::new(100, 50);
        assert!(range.contains(100, 50));
        assert!(range.contains(120, 10));
        assert!(!range.contains(90, 20));
        assert!(!range.contains(140, 20));
    }
}
