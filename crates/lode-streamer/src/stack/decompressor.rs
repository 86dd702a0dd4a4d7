//! Compressed reads.
//!
//! A `CompressedRead` is served by reading the compressed bytes into a
//! scratch buffer through the stages below, then decoding them into the
//! caller's target with the request's codec. Plain reads pass through.

use crate::config::DecompressorConfig;
use crate::context::StreamerContext;
use crate::error::Result;
use crate::request::{
    BufferTarget, Command, CompressedReadData, ReadData, RequestId, RequestStatus,
};
use crate::stack::{StackEntryBase, Status, StreamStackEntry};
use lode_io::{shared_buffer, ReadBuffer, SharedBuffer, Statistic};
use std::cmp::Reverse;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

/// Decoder for one compressed stream format.
pub trait CompressionCodec: Send + Sync {
    fn name(&self) -> &str;

    /// Decode all of `input` into `output`, returning the bytes written.
    fn decompress(&self, input: &[u8], output: &mut [u8]) -> Result<usize>;
}

struct InFlight {
    parent: RequestId,
    scratch: SharedBuffer,
}

pub struct Decompressor {
    base: StackEntryBase,
    config: DecompressorConfig,
    /// Compressed reads waiting for a free slot, in issue order.
    waiting: VecDeque<RequestId>,
    /// Keyed by the child read of the compressed bytes.
    in_flight: HashMap<RequestId, InFlight>,
    num_decoded: u64,
    num_failed: u64,
    bytes_decoded: u64,
}

impl Decompressor {
    /// Create a decompressor stage.
    ///
    /// # Arguments
    ///
    /// * `config` - Codec limits and the number of blocks decoded at once
    pub fn new(config: DecompressorConfig) -> Self {
        Self {
            base: StackEntryBase::new("Decompressor"),
            config,
            waiting: VecDeque::new(),
            in_flight: HashMap::new(),
            num_decoded: 0,
            num_failed: 0,
            bytes_decoded: 0,
        }
    }

    /// Compressed reads issued to the next stage.
    pub fn num_in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Compressed reads waiting for a free slot.
    pub fn num_waiting(&self) -> usize {
        self.waiting.len()
    }

    fn queue_compressed(
        &mut self,
        ctx: &mut StreamerContext,
        id: RequestId,
        data: &CompressedReadData,
    ) {
        if data.uncompressed_size == 0 {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }
        if ctx.is_cancel_requested(id) {
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }
        if (data.target.capacity() as u64) < data.uncompressed_size {
            tracing::warn!(
                path = %data.path.display(),
                uncompressed_size = data.uncompressed_size,
                "compressed read target too small"
            );
            ctx.mark_request_as_completed(id, RequestStatus::Failed);
            return;
        }
        ctx.request_mut(id).set_status(RequestStatus::Queued);
        self.waiting.push_back(id);
        self.issue_waiting(ctx);
    }

    fn issue_waiting(&mut self, ctx: &mut StreamerContext) -> bool {
        let mut issued = false;
        while self.in_flight.len() < self.config.max_in_flight {
            let Some(id) = self.waiting.pop_front() else {
                break;
            };
            let Command::CompressedRead(data) = ctx.request(id).command().clone() else {
                ctx.mark_request_as_completed(id, RequestStatus::Failed);
                continue;
            };
            let scratch = shared_buffer(ReadBuffer::zeroed(data.compressed_size as usize));
            ctx.request_mut(id).set_status(RequestStatus::Processing);
            let child = ctx.create_child_request(
                id,
                Command::Read(ReadData {
                    path: Arc::clone(&data.path),
                    target: BufferTarget::new(Arc::clone(&scratch), 0),
                    offset: data.offset,
                    size: data.compressed_size,
                }),
            );
            ctx.request_mut(child).set_owner(self.stage_id());
            self.in_flight.insert(child, InFlight { parent: id, scratch });
            issued = true;
            match self.next_mut() {
                Some(next) => next.queue_request(ctx, child),
                None => crate::stack::complete_unhandled(ctx, child),
            }
        }
        issued
    }

    /// Decode a landed scratch buffer into the parent's target.
    fn decode(
        &self,
        data: &CompressedReadData,
        scratch: &SharedBuffer,
        bytes: u64,
    ) -> Result<u64> {
        if bytes < data.compressed_size {
            return Err(crate::error::Error::Codec(format!(
                "expected {} compressed bytes, read {}",
                data.compressed_size, bytes
            )));
        }
        let input = scratch.lock();
        let mut output = data.target.buffer.lock();
        let start = data.target.offset;
        let end = start + data.uncompressed_size as usize;
        let written = data
            .codec
            .decompress(input.as_slice(), &mut output.as_mut_slice()[start..end])?;
        Ok(written as u64)
    }
}

impl StreamStackEntry for Decompressor {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match ctx.request(id).command().clone() {
            Command::CompressedRead(data) => self.queue_compressed(ctx, id, &data),
            Command::Cancel { target } => {
                self.waiting.retain(|id| {
                    let canceled = ctx.is_descendant_of(*id, target);
                    if canceled {
                        ctx.mark_request_as_completed(*id, RequestStatus::Canceled);
                    }
                    !canceled
                });
                self.forward_request(ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                for waiting in &self.waiting {
                    if ctx.is_descendant_of(*waiting, target) {
                        let request = ctx.request_mut(*waiting);
                        request.set_priority(priority);
                        request.set_deadline(deadline);
                    }
                }
                self.waiting
                    .make_contiguous()
                    .sort_by_key(|id| Reverse(ctx.request(*id).priority()));
                self.forward_request(ctx, id);
            }
            _ => self.forward_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let issued = self.issue_waiting(ctx);
        let below = match self.next_mut() {
            Some(next) => next.execute_requests(ctx),
            None => false,
        };
        issued || below
    }

    fn update_status(&self, status: &mut Status) {
        let available = if self.waiting.is_empty() { i32::MAX } else { 0 };
        status.merge(available, self.waiting.is_empty() && self.in_flight.is_empty());
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
        internal_pending.extend(self.waiting.iter().copied());
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, pending);
        }
        for (child, in_flight) in &self.in_flight {
            if let Some(estimate) = ctx.try_request(*child).and_then(|r| r.estimated_completion()) {
                ctx.request_mut(in_flight.parent).set_estimated_completion(estimate);
            }
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer("Decompressor", "Decoded", self.num_decoded as i64));
        statistics.push(Statistic::integer("Decompressor", "Failed", self.num_failed as i64));
        statistics.push(Statistic::integer(
            "Decompressor",
            "BytesDecoded",
            self.bytes_decoded as i64,
        ));
        statistics.push(Statistic::integer(
            "Decompressor",
            "InFlight",
            self.in_flight.len() as i64,
        ));
    }

    fn on_request_completed(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let Some(in_flight) = self.in_flight.remove(&id) else {
            return;
        };
        let (status, bytes) = {
            let request = ctx.request(id);
            (request.status(), request.bytes_read())
        };
        // The parent reports decoded bytes, not compressed ones.
        ctx.request_mut(id).set_bytes_read(0);
        if status != RequestStatus::Completed {
            return;
        }
        let Command::CompressedRead(data) = ctx.request(in_flight.parent).command().clone() else {
            return;
        };
        match self.decode(&data, &in_flight.scratch, bytes) {
            Ok(written) => {
                self.num_decoded += 1;
                self.bytes_decoded += written;
                ctx.request_mut(id).set_bytes_read(written);
            }
            Err(e) => {
                tracing::warn!(
                    path = %data.path.display(),
                    codec = data.codec.name(),
                    error = %e,
                    "decompression failed"
                );
                self.num_failed += 1;
                let parent = ctx.request_mut(in_flight.parent);
                parent.children_status = parent.children_status.worst(RequestStatus::Failed);
            }
        }
    }
}
