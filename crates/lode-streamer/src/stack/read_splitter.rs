//! Splits reads that are too large or misaligned for the device.
//!
//! Aligned reads are cut into `max_read_size` chunks that write straight into
//! the caller's buffer. Misaligned reads are widened to aligned boundaries and
//! read chunk by chunk through staging slots, with the useful bytes copied
//! out as each chunk lands.

use crate::config::ReadSplitterConfig;
use crate::context::StreamerContext;
use crate::error::Result;
use crate::request::{BufferTarget, Command, ReadData, RequestId, RequestStatus};
use crate::stack::{StackEntryBase, Status, StreamStackEntry};
use lode_io::{shared_buffer, ReadBuffer, SharedBuffer, Statistic};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

enum ChunkKind {
    Direct,
    Staged {
        slot: Option<usize>,
        /// Caller's byte range and where it starts in the caller's buffer.
        read_offset: u64,
        read_end: u64,
        target: BufferTarget,
    },
}

struct Chunk {
    parent: RequestId,
    offset: u64,
    kind: ChunkKind,
}

pub struct ReadSplitter {
    base: StackEntryBase,
    config: ReadSplitterConfig,
    slots: Vec<SharedBuffer>,
    free_slots: Vec<usize>,
    chunks: HashMap<RequestId, Chunk>,
    /// Chunks created but not sent down yet, in issue order.
    pending: VecDeque<RequestId>,
    num_split: u64,
    num_staged: u64,
}

impl ReadSplitter {
    /// Create a read splitter stage.
    ///
    /// # Arguments
    ///
    /// * `config` - Maximum chunk size, alignment and staging slots
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(config: ReadSplitterConfig) -> Result<Self> {
        config.validate()?;
        let needs_staging = config.memory_alignment > 1 || config.size_alignment > 1;
        let num_slots = if needs_staging { config.num_buffer_slots() } else { 0 };
        let slots = (0..num_slots)
            .map(|_| {
                ReadBuffer::aligned(config.max_read_size as usize, config.memory_alignment)
                    .map(shared_buffer)
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self {
            base: StackEntryBase::new("ReadSplitter"),
            config,
            free_slots: (0..slots.len()).rev().collect(),
            slots,
            chunks: HashMap::new(),
            pending: VecDeque::new(),
            num_split: 0,
            num_staged: 0,
        })
    }

    /// A free staging slot, if any.
    pub fn get_buffer_slot(&mut self) -> Option<usize> {
        self.free_slots.pop()
    }

    fn release_buffer_slot(&mut self, slot: usize) {
        self.free_slots.push(slot);
    }

    /// Chunks waiting for a staging slot or for room below.
    pub fn num_pending_chunks(&self) -> usize {
        self.pending.len()
    }

    fn is_aligned(&self, data: &ReadData) -> bool {
        let alignment = self.config.size_alignment;
        let offset_aligned = !self.config.adjust_offset || data.offset % alignment == 0;
        offset_aligned
            && data.size % alignment == 0
            && data.target.address() % self.config.memory_alignment == 0
    }

    fn split(&mut self, ctx: &mut StreamerContext, id: RequestId, data: ReadData) {
        if data.size == 0 {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }
        if ctx.is_cancel_requested(id) {
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }

        let aligned = self.is_aligned(&data);
        if aligned && data.size <= self.config.max_read_size && !self.config.split_aligned_requests
        {
            self.forward_request(ctx, id);
            return;
        }

        ctx.request_mut(id).set_status(RequestStatus::Processing);
        let max = self.config.max_read_size;
        let end = data.offset + data.size;

        if aligned {
            let mut offset = data.offset;
            while offset < end {
                let size = max.min(end - offset);
                let chunk = ctx.create_child_request(
                    id,
                    Command::Read(ReadData {
                        path: Arc::clone(&data.path),
                        target: data.target.advanced((offset - data.offset) as usize),
                        offset,
                        size,
                    }),
                );
                self.add_chunk(ctx, chunk, id, offset, ChunkKind::Direct);
                offset += size;
            }
        } else {
            let alignment = self.config.size_alignment;
            let start = if self.config.adjust_offset {
                data.offset - data.offset % alignment
            } else {
                data.offset
            };
            let aligned_end = end.div_ceil(alignment) * alignment;
            let mut offset = start;
            while offset < aligned_end {
                let size = max.min(aligned_end - offset);
                // Target is set once a staging slot is assigned.
                let chunk = ctx.create_child_request(
                    id,
                    Command::Read(ReadData {
                        path: Arc::clone(&data.path),
                        target: data.target.clone(),
                        offset,
                        size,
                    }),
                );
                let kind = ChunkKind::Staged {
                    slot: None,
                    read_offset: data.offset,
                    read_end: end,
                    target: data.target.clone(),
                };
                self.add_chunk(ctx, chunk, id, offset, kind);
                offset += size;
            }
            self.num_staged += 1;
        }
        self.num_split += 1;
        tracing::debug!(
            path = %data.path.display(),
            offset = data.offset,
            size = data.size,
            chunks = self.pending.len(),
            "read split"
        );
        self.issue_pending(ctx);
    }

    fn add_chunk(
        &mut self,
        ctx: &mut StreamerContext,
        chunk: RequestId,
        parent: RequestId,
        offset: u64,
        kind: ChunkKind,
    ) {
        ctx.request_mut(chunk).set_owner(self.stage_id());
        self.chunks.insert(
            chunk,
            Chunk {
                parent,
                offset,
                kind,
            },
        );
        self.pending.push_back(chunk);
    }

    /// Send down pending chunks in order until one needs a slot and none is
    /// free.
    fn issue_pending(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut issued = false;
        while let Some(&id) = self.pending.front() {
            let needs_slot = matches!(
                self.chunks.get(&id).map(|chunk| &chunk.kind),
                Some(ChunkKind::Staged { slot: None, .. })
            );
            if needs_slot {
                let Some(slot) = self.get_buffer_slot() else {
                    break;
                };
                let buffer = Arc::clone(&self.slots[slot]);
                if let Some(Chunk {
                    kind: ChunkKind::Staged { slot: assigned, .. },
                    ..
                }) = self.chunks.get_mut(&id)
                {
                    *assigned = Some(slot);
                }
                if let Command::Read(read) = ctx.request_mut(id).command_mut() {
                    read.target = BufferTarget::new(buffer, 0);
                }
            }
            self.pending.pop_front();
            issued = true;
            match self.next_mut() {
                Some(next) => next.queue_request(ctx, id),
                None => crate::stack::complete_unhandled(ctx, id),
            }
        }
        issued
    }

    /// Copy the useful part of a staged chunk to the caller. Returns the
    /// bytes copied, `None` when the caller's buffer can not take them.
    fn copy_staged(
        &self,
        slot: usize,
        chunk_offset: u64,
        bytes_in_slot: u64,
        read_offset: u64,
        read_end: u64,
        target: &BufferTarget,
    ) -> Option<u64> {
        let start = chunk_offset.max(read_offset);
        let end = (chunk_offset + bytes_in_slot).min(read_end);
        if end <= start {
            return Some(0);
        }
        let staging = self.slots[slot].lock();
        let from = (start - chunk_offset) as usize;
        let source = &staging.as_slice()[from..from + (end - start) as usize];
        target
            .buffer
            .lock()
            .write_at(target.offset + (start - read_offset) as usize, source)
            .ok()?;
        Some(end - start)
    }

    /// Drop chunks of `parent` that were never sent down.
    fn reject_pending(&mut self, ctx: &mut StreamerContext, parent: RequestId) {
        let chunks = &mut self.chunks;
        self.pending.retain(|id| {
            let belongs = chunks.get(id).is_some_and(|chunk| chunk.parent == parent);
            if belongs {
                chunks.remove(id);
                ctx.reject_request(*id);
            }
            !belongs
        });
    }

    fn cancel(&mut self, ctx: &mut StreamerContext, target: RequestId) {
        let chunks = &mut self.chunks;
        self.pending.retain(|id| {
            let canceled = ctx.is_descendant_of(*id, target);
            if canceled {
                chunks.remove(id);
                ctx.mark_request_as_completed(*id, RequestStatus::Canceled);
            }
            !canceled
        });
    }
}

impl StreamStackEntry for ReadSplitter {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match ctx.request(id).command().clone() {
            Command::Read(data) => self.split(ctx, id, data),
            Command::Cancel { target } => {
                self.cancel(ctx, target);
                self.forward_request(ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                for chunk in &self.pending {
                    if ctx.is_descendant_of(*chunk, target) {
                        let request = ctx.request_mut(*chunk);
                        request.set_priority(priority);
                        request.set_deadline(deadline);
                    }
                }
                self.forward_request(ctx, id);
            }
            _ => self.forward_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let issued = self.issue_pending(ctx);
        let below = match self.next_mut() {
            Some(next) => next.execute_requests(ctx),
            None => false,
        };
        issued || below
    }

    fn update_status(&self, status: &mut Status) {
        let available = if self.pending.is_empty() { i32::MAX } else { 0 };
        status.merge(available, self.chunks.is_empty());
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        pending: &[RequestId],
    ) {
        internal_pending.extend(self.pending.iter().copied());
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, pending);
        }
        // A split read finishes with its last chunk.
        for (id, chunk) in &self.chunks {
            let Some(estimate) = ctx.try_request(*id).and_then(|r| r.estimated_completion()) else {
                continue;
            };
            let parent = ctx.request_mut(chunk.parent);
            if parent.estimated_completion().map_or(true, |current| current < estimate) {
                parent.set_estimated_completion(estimate);
            }
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer("ReadSplitter", "SplitReads", self.num_split as i64));
        statistics.push(Statistic::integer("ReadSplitter", "StagedReads", self.num_staged as i64));
        statistics.push(Statistic::integer(
            "ReadSplitter",
            "FreeBufferSlots",
            self.free_slots.len() as i64,
        ));
    }

    fn on_request_completed(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(chunk) = self.chunks.remove(&id) else {
            return;
        };
        let (status, bytes) = {
            let request = ctx.request(id);
            (request.status(), request.bytes_read())
        };

        if let ChunkKind::Staged {
            slot: Some(slot),
            read_offset,
            read_end,
            target,
        } = &chunk.kind
        {
            if status == RequestStatus::Completed {
                let copied =
                    self.copy_staged(*slot, chunk.offset, bytes, *read_offset, *read_end, target);
                match copied {
                    Some(copied) => ctx.request_mut(id).set_bytes_read(copied),
                    None => {
                        ctx.request_mut(id).set_bytes_read(0);
                        let parent = ctx.request_mut(chunk.parent);
                        parent.children_status =
                            parent.children_status.worst(RequestStatus::Failed);
                    }
                }
            } else {
                ctx.request_mut(id).set_bytes_read(0);
            }
            self.release_buffer_slot(*slot);
        }

        if status != RequestStatus::Completed {
            tracing::debug!(?status, "chunk did not complete, dropping the rest of the read");
            self.reject_pending(ctx, chunk.parent);
        }
    }
}
