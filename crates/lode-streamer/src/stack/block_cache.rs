//! Block-granular read-through cache.
//!
//! Reads are cut at block boundaries. Each piece is copied from a resident
//! block, attached to the fill already loading its block, attached to a new
//! fill, read straight through when the block is not a caching candidate, or
//! delayed until a block can be recycled.
//!
//! Fills are owned by the cache and have no parent, so several reads can
//! wait on one fill. Pieces that wait are child requests of the read and are
//! completed by the cache when their fill lands.

use crate::config::BlockCacheConfig;
use crate::context::StreamerContext;
use crate::error::Result;
use crate::request::{
    BufferTarget, Command, Priority, ReadData, RequestId, RequestPath, RequestStatus,
};
use crate::stack::{
    send_down, NextStage, StackEntryBase, StageId, Status, StreamStackEntry,
};
use lode_io::{shared_buffer, AverageWindow, ReadBuffer, SharedBuffer, Statistic};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

const STATISTICS_WINDOW: usize = 128;

enum BlockState {
    Free,
    Filling {
        path: RequestPath,
        offset: u64,
        fill: RequestId,
    },
    Resident {
        path: RequestPath,
        offset: u64,
        valid_len: u64,
    },
    /// Flushed while its fill was in flight. Freed when the fill returns.
    Orphaned { fill: RequestId },
}

struct Block {
    state: BlockState,
    last_touched: u64,
    buffer: SharedBuffer,
}

/// Part of a read that falls inside one block.
struct Section {
    /// Child request standing for this section, created once it has to wait.
    request: Option<RequestId>,
    parent: RequestId,
    path: RequestPath,
    block_offset: u64,
    offset_in_block: usize,
    len: usize,
    target: BufferTarget,
}

/// Block table and bookkeeping, shared by [`BlockCache`] and the entries of
/// the dedicated cache.
pub(crate) struct BlockCacheCore {
    block_size: u64,
    only_epilog_writes: bool,
    blocks: Vec<Block>,
    waiting: HashMap<RequestId, Vec<Section>>,
    delayed: VecDeque<Section>,
    clock: u64,
    requested_bytes: AverageWindow,
    served_bytes: AverageWindow,
    cacheable_bytes: AverageWindow,
    last_hit_rate: f64,
}

impl BlockCacheCore {
    pub(crate) fn new(config: &BlockCacheConfig, hardware_alignment: u64) -> Result<Self> {
        config.validate(hardware_alignment)?;
        let block_size = config.block_size.resolve(hardware_alignment);
        let blocks = (0..config.num_blocks(hardware_alignment))
            .map(|_| Block {
                state: BlockState::Free,
                last_touched: 0,
                buffer: shared_buffer(ReadBuffer::zeroed(block_size as usize)),
            })
            .collect();
        Ok(Self {
            block_size,
            only_epilog_writes: config.only_epilog_writes,
            blocks,
            waiting: HashMap::new(),
            delayed: VecDeque::new(),
            clock: 0,
            requested_bytes: AverageWindow::new(STATISTICS_WINDOW),
            served_bytes: AverageWindow::new(STATISTICS_WINDOW),
            cacheable_bytes: AverageWindow::new(STATISTICS_WINDOW),
            last_hit_rate: 0.0,
        })
    }

    pub(crate) fn block_size(&self) -> u64 {
        self.block_size
    }

    pub(crate) fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    pub(crate) fn num_resident_blocks(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| matches!(block.state, BlockState::Resident { .. }))
            .count()
    }

    pub(crate) fn num_in_flight_fills(&self) -> usize {
        self.blocks
            .iter()
            .filter(|block| matches!(block.state, BlockState::Filling { .. }))
            .count()
    }

    pub(crate) fn num_delayed(&self) -> usize {
        self.delayed.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.delayed.is_empty() && self.waiting.is_empty()
    }

    fn align_down(&self, offset: u64) -> u64 {
        offset - offset % self.block_size
    }

    fn touch(&mut self, index: usize) {
        self.clock += 1;
        self.blocks[index].last_touched = self.clock;
    }

    pub(crate) fn queue_read(
        &mut self,
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        owner: StageId,
        id: RequestId,
    ) {
        let Some(data) = ctx.request(id).read_data().cloned() else {
            send_down(next, ctx, id);
            return;
        };
        if data.size == 0 {
            ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }
        if ctx.is_cancel_requested(id) {
            ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }
        ctx.request_mut(id).set_status(RequestStatus::Processing);

        let end = data.offset + data.size;
        let epilog_block = self.align_down(end - 1);
        let has_epilog = end % self.block_size != 0;
        let mut bypass: Option<(u64, u64)> = None;
        let mut served = 0;
        let mut cacheable = 0;

        let mut block_offset = self.align_down(data.offset);
        while block_offset < end {
            let start = data.offset.max(block_offset);
            let stop = end.min(block_offset + self.block_size);
            let candidate =
                !self.only_epilog_writes || (has_epilog && block_offset == epilog_block);
            if candidate {
                if let Some((bypass_start, bypass_end)) = bypass.take() {
                    Self::issue_bypass(ctx, next, id, &data, bypass_start, bypass_end);
                }
                cacheable += stop - start;
                let section = Section {
                    request: None,
                    parent: id,
                    path: Arc::clone(&data.path),
                    block_offset,
                    offset_in_block: (start - block_offset) as usize,
                    len: (stop - start) as usize,
                    target: data.target.advanced((start - data.offset) as usize),
                };
                if self.place_section(ctx, next, owner, section) {
                    served += stop - start;
                }
            } else {
                bypass = Some(match bypass {
                    Some((bypass_start, _)) => (bypass_start, stop),
                    None => (start, stop),
                });
            }
            block_offset += self.block_size;
        }
        if let Some((bypass_start, bypass_end)) = bypass {
            Self::issue_bypass(ctx, next, id, &data, bypass_start, bypass_end);
        }

        self.requested_bytes.push(data.size as f64);
        self.served_bytes.push(served as f64);
        self.cacheable_bytes.push(cacheable as f64);
        self.last_hit_rate = served as f64 / data.size as f64 * 100.0;

        let request = ctx.request(id);
        if request.pending_children() == 0 {
            let status = request.children_status;
            ctx.mark_request_as_completed(id, status);
        }
    }

    fn issue_bypass(
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        parent: RequestId,
        data: &ReadData,
        start: u64,
        stop: u64,
    ) {
        let child = ctx.create_child_request(
            parent,
            Command::Read(ReadData {
                path: Arc::clone(&data.path),
                target: data.target.advanced((start - data.offset) as usize),
                offset: start,
                size: stop - start,
            }),
        );
        send_down(next, ctx, child);
    }

    /// Serve, attach or delay a section. Returns whether it was served from
    /// a resident block right away.
    fn place_section(
        &mut self,
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        owner: StageId,
        mut section: Section,
    ) -> bool {
        match self.find_block(&section.path, section.block_offset) {
            Some(index) => match self.blocks[index].state {
                BlockState::Resident { valid_len, .. } => {
                    self.touch(index);
                    let copied = self.copy_out(index, valid_len, &section);
                    Self::finish_section(ctx, section, copied);
                    true
                }
                BlockState::Filling { fill, .. } => {
                    Self::ensure_request(ctx, &mut section);
                    self.waiting.entry(fill).or_default().push(section);
                    false
                }
                BlockState::Free | BlockState::Orphaned { .. } => false,
            },
            None => {
                Self::ensure_request(ctx, &mut section);
                match self.claim_block() {
                    Some(index) => {
                        let fill = self.issue_fill(ctx, next, owner, index, &section);
                        self.waiting.entry(fill).or_default().push(section);
                    }
                    None => self.delayed.push_back(section),
                }
                false
            }
        }
    }

    fn find_block(&self, path: &RequestPath, offset: u64) -> Option<usize> {
        self.blocks.iter().position(|block| match &block.state {
            BlockState::Filling {
                path: block_path,
                offset: block_offset,
                ..
            }
            | BlockState::Resident {
                path: block_path,
                offset: block_offset,
                ..
            } => *block_offset == offset && block_path == path,
            BlockState::Free | BlockState::Orphaned { .. } => false,
        })
    }

    /// A free block, else the least recently touched resident one.
    fn claim_block(&mut self) -> Option<usize> {
        if let Some(index) = self
            .blocks
            .iter()
            .position(|block| matches!(block.state, BlockState::Free))
        {
            return Some(index);
        }
        let index = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, block)| matches!(block.state, BlockState::Resident { .. }))
            .min_by_key(|(index, block)| (block.last_touched, *index))
            .map(|(index, _)| index)?;
        tracing::debug!(block = index, "evicting cache block");
        self.blocks[index].state = BlockState::Free;
        Some(index)
    }

    fn issue_fill(
        &mut self,
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        owner: StageId,
        index: usize,
        section: &Section,
    ) -> RequestId {
        let (priority, deadline) = {
            let parent = ctx.request(section.parent);
            (parent.priority(), parent.deadline())
        };
        let fill = ctx.get_new_internal_request(Command::Read(ReadData {
            path: Arc::clone(&section.path),
            target: BufferTarget::new(Arc::clone(&self.blocks[index].buffer), 0),
            offset: section.block_offset,
            size: self.block_size,
        }));
        let request = ctx.request_mut(fill);
        request.set_owner(owner);
        request.set_priority(priority);
        request.set_deadline(deadline);

        self.blocks[index].state = BlockState::Filling {
            path: Arc::clone(&section.path),
            offset: section.block_offset,
            fill,
        };
        self.touch(index);
        tracing::debug!(
            path = %section.path.display(),
            offset = section.block_offset,
            block = index,
            "cache miss, filling block"
        );
        send_down(next, ctx, fill);
        fill
    }

    fn ensure_request(ctx: &mut StreamerContext, section: &mut Section) {
        if section.request.is_none() {
            let offset = section.block_offset + section.offset_in_block as u64;
            section.request = Some(ctx.create_child_request(
                section.parent,
                Command::Read(ReadData {
                    path: Arc::clone(&section.path),
                    target: section.target.clone(),
                    offset,
                    size: section.len as u64,
                }),
            ));
        }
    }

    /// Copy a section out of a resident block. `None` when the target can
    /// not hold it.
    fn copy_out(&self, index: usize, valid_len: u64, section: &Section) -> Option<u64> {
        let available = (valid_len as usize)
            .saturating_sub(section.offset_in_block)
            .min(section.len);
        if available == 0 {
            return Some(0);
        }
        let block = self.blocks[index].buffer.lock();
        let start = section.offset_in_block;
        let source = &block.as_slice()[start..start + available];
        let mut target = section.target.buffer.lock();
        target.write_at(section.target.offset, source).ok()?;
        Some(available as u64)
    }

    fn finish_section(ctx: &mut StreamerContext, section: Section, copied: Option<u64>) {
        match (section.request, copied) {
            (Some(request), Some(bytes)) => {
                ctx.request_mut(request).set_bytes_read(bytes);
                ctx.mark_request_as_completed(request, RequestStatus::Completed);
            }
            (Some(request), None) => {
                ctx.mark_request_as_completed(request, RequestStatus::Failed);
            }
            (None, Some(bytes)) => ctx.request_mut(section.parent).add_bytes_read(bytes),
            (None, None) => {
                let parent = ctx.request_mut(section.parent);
                parent.children_status = parent.children_status.worst(RequestStatus::Failed);
            }
        }
    }

    /// Handle a finished request. Returns `false` when `id` is not one of
    /// this cache's fills.
    pub(crate) fn on_fill_completed(&mut self, ctx: &mut StreamerContext, id: RequestId) -> bool {
        let Some(index) = self.blocks.iter().position(|block| {
            matches!(
                block.state,
                BlockState::Filling { fill, .. } | BlockState::Orphaned { fill } if fill == id
            )
        }) else {
            return false;
        };

        let (status, bytes) = {
            let fill = ctx.request(id);
            (fill.status(), fill.bytes_read())
        };
        let sections = self.waiting.remove(&id).unwrap_or_default();
        let state = std::mem::replace(&mut self.blocks[index].state, BlockState::Free);

        match state {
            BlockState::Filling { path, offset, .. } if status == RequestStatus::Completed => {
                self.blocks[index].state = BlockState::Resident {
                    path,
                    offset,
                    valid_len: bytes,
                };
                self.touch(index);
                for section in sections {
                    let copied = self.copy_out(index, bytes, &section);
                    Self::finish_section(ctx, section, copied);
                }
            }
            _ => {
                if !matches!(state, BlockState::Orphaned { .. }) {
                    tracing::warn!(block = index, ?status, "cache fill did not complete");
                }
                for section in sections {
                    if let Some(request) = section.request {
                        ctx.mark_request_as_completed(request, status);
                    }
                }
            }
        }
        true
    }

    /// Retry delayed sections. Returns whether any of them moved on.
    pub(crate) fn execute(
        &mut self,
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        owner: StageId,
    ) -> bool {
        if self.delayed.is_empty() {
            return false;
        }
        let mut progressed = false;
        for section in std::mem::take(&mut self.delayed) {
            let before = self.delayed.len();
            self.place_section(ctx, next, owner, section);
            progressed |= self.delayed.len() == before;
        }
        progressed
    }

    /// Drop blocks of `path`, or of every file for `None`. Fills in flight
    /// are orphaned and the sections waiting on them placed again.
    pub(crate) fn flush(
        &mut self,
        ctx: &mut StreamerContext,
        next: &mut NextStage<'_>,
        owner: StageId,
        path: Option<&RequestPath>,
    ) {
        let mut replaced = Vec::new();
        let matches_path = |block_path: &RequestPath| path.map_or(true, |path| block_path == path);
        for block in &mut self.blocks {
            match &block.state {
                BlockState::Resident {
                    path: block_path, ..
                } if matches_path(block_path) => {
                    block.state = BlockState::Free;
                }
                BlockState::Filling {
                    path: block_path,
                    fill,
                    ..
                } if matches_path(block_path) => {
                    let fill = *fill;
                    block.state = BlockState::Orphaned { fill };
                    ctx.request_cancel(fill);
                    if let Some(sections) = self.waiting.remove(&fill) {
                        replaced.extend(sections);
                    }
                }
                _ => {}
            }
        }
        for section in replaced {
            self.place_section(ctx, next, owner, section);
        }
    }

    /// Cancel delayed sections that belong to `target`.
    pub(crate) fn cancel(&mut self, ctx: &mut StreamerContext, target: RequestId) {
        let mut kept = VecDeque::with_capacity(self.delayed.len());
        for section in std::mem::take(&mut self.delayed) {
            match section.request {
                Some(request) if ctx.is_descendant_of(request, target) => {
                    ctx.mark_request_as_completed(request, RequestStatus::Canceled);
                }
                _ => kept.push_back(section),
            }
        }
        self.delayed = kept;
    }

    /// Apply a new priority and deadline to held work of `target`, raising
    /// the priority of fills it waits on.
    pub(crate) fn reschedule(
        &mut self,
        ctx: &mut StreamerContext,
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    ) {
        for section in &self.delayed {
            if let Some(request) = section.request {
                if ctx.is_descendant_of(request, target) {
                    let request = ctx.request_mut(request);
                    request.set_priority(priority);
                    request.set_deadline(deadline);
                }
            }
        }
        for (fill, sections) in &self.waiting {
            let affected = sections.iter().any(|section| {
                section
                    .request
                    .is_some_and(|request| ctx.is_descendant_of(request, target))
            });
            if affected {
                let fill = ctx.request_mut(*fill);
                if priority > fill.priority() {
                    fill.set_priority(priority);
                }
            }
        }
    }

    pub(crate) fn collect_delayed(&self, pending: &mut Vec<RequestId>) {
        pending.extend(self.delayed.iter().filter_map(|section| section.request));
    }

    /// Waiting sections finish when their fill does.
    pub(crate) fn propagate_estimates(&self, ctx: &mut StreamerContext) {
        for (fill, sections) in &self.waiting {
            let Some(estimate) = ctx.try_request(*fill).and_then(|fill| fill.estimated_completion())
            else {
                continue;
            };
            for section in sections {
                if let Some(request) = section.request {
                    ctx.request_mut(request).set_estimated_completion(estimate);
                }
                let parent = ctx.request_mut(section.parent);
                if parent.estimated_completion().map_or(true, |current| current < estimate) {
                    parent.set_estimated_completion(estimate);
                }
            }
        }
    }

    /// Bytes served from resident blocks over bytes requested, in percent.
    pub(crate) fn hit_rate_percentage(&self) -> f64 {
        Self::ratio(&self.served_bytes, &self.requested_bytes)
    }

    /// Share of the latest read served from resident blocks, in percent.
    pub(crate) fn last_hit_rate_percentage(&self) -> f64 {
        self.last_hit_rate
    }

    /// Bytes that were caching candidates over bytes requested, in percent.
    pub(crate) fn cacheable_rate_percentage(&self) -> f64 {
        Self::ratio(&self.cacheable_bytes, &self.requested_bytes)
    }

    fn ratio(part: &AverageWindow, total: &AverageWindow) -> f64 {
        match (part.average(), total.average()) {
            (Some(part), Some(total)) if total > 0.0 => part / total * 100.0,
            _ => 0.0,
        }
    }

    pub(crate) fn reset_statistics(&mut self) {
        self.requested_bytes.clear();
        self.served_bytes.clear();
        self.cacheable_bytes.clear();
        self.last_hit_rate = 0.0;
    }

    pub(crate) fn collect_statistics(&self, owner: &'static str, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::percentage(owner, "HitRate", self.hit_rate_percentage()));
        statistics.push(Statistic::percentage(
            owner,
            "LastHitRate",
            self.last_hit_rate_percentage(),
        ));
        statistics.push(Statistic::percentage(
            owner,
            "CacheableRate",
            self.cacheable_rate_percentage(),
        ));
        statistics.push(Statistic::integer(
            owner,
            "ResidentBlocks",
            self.num_resident_blocks() as i64,
        ));
        statistics.push(Statistic::integer(
            owner,
            "DelayedSections",
            self.delayed.len() as i64,
        ));
    }
}

/// Shared block cache stage.
pub struct BlockCache {
    base: StackEntryBase,
    core: BlockCacheCore,
}

impl BlockCache {
    /// Create a cache stage.
    ///
    /// # Arguments
    ///
    /// * `config` - Block size and capacity
    /// * `hardware_alignment` - Alignment that block sizes resolve against
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration does not validate.
    pub fn new(config: BlockCacheConfig, hardware_alignment: u64) -> Result<Self> {
        let core = BlockCacheCore::new(&config, hardware_alignment)?;
        tracing::debug!(
            blocks = core.num_blocks(),
            block_size = core.block_size(),
            "block cache created"
        );
        Ok(Self {
            base: StackEntryBase::new("BlockCache"),
            core,
        })
    }

    /// Free the resident blocks of `path` and orphan its in-flight fills.
    ///
    /// # Arguments
    ///
    /// * `ctx` - Context of the scheduling thread
    /// * `path` - File whose blocks are dropped
    pub fn flush_cache(&mut self, ctx: &mut StreamerContext, path: &RequestPath) {
        let owner = self.stage_id();
        self.core
            .flush(ctx, &mut self.base.next_stage(), owner, Some(path));
    }

    /// Free every resident block and orphan every in-flight fill.
    pub fn flush_entire_cache(&mut self, ctx: &mut StreamerContext) {
        let owner = self.stage_id();
        self.core.flush(ctx, &mut self.base.next_stage(), owner, None);
    }

    /// Start the statistics windows over.
    pub fn reset_statistics(&mut self) {
        self.core.reset_statistics();
    }

    /// Bytes served from resident blocks over bytes requested, averaged over
    /// the recent reads, in percent.
    pub fn hit_rate_percentage(&self) -> f64 {
        self.core.hit_rate_percentage()
    }

    /// Share of the latest read served from resident blocks, in percent.
    pub fn last_hit_rate_percentage(&self) -> f64 {
        self.core.last_hit_rate_percentage()
    }

    /// Bytes that were caching candidates over bytes requested, in percent.
    pub fn cacheable_rate_percentage(&self) -> f64 {
        self.core.cacheable_rate_percentage()
    }

    /// Capacity in blocks.
    pub fn num_blocks(&self) -> usize {
        self.core.num_blocks()
    }

    /// Blocks holding file data.
    pub fn num_resident_blocks(&self) -> usize {
        self.core.num_resident_blocks()
    }

    /// Fills issued to the next stage and not yet finished.
    pub fn num_in_flight_fills(&self) -> usize {
        self.core.num_in_flight_fills()
    }
}

impl StreamStackEntry for BlockCache {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let owner = self.stage_id();
        match ctx.request(id).command().clone() {
            Command::Read(_) => {
                self.core
                    .queue_read(ctx, &mut self.base.next_stage(), owner, id);
            }
            Command::FlushCache { path } => {
                self.flush_cache(ctx, &path);
                self.forward_request(ctx, id);
            }
            Command::FlushCaches => {
                self.flush_entire_cache(ctx);
                self.forward_request(ctx, id);
            }
            Command::Cancel { target } => {
                self.core.cancel(ctx, target);
                self.forward_request(ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                self.core.reschedule(ctx, target, deadline, priority);
                self.forward_request(ctx, id);
            }
            _ => self.forward_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let owner = self.stage_id();
        let retried = self.core.execute(ctx, &mut self.base.next_stage(), owner);
        let below = match self.next_mut() {
            Some(next) => next.execute_requests(ctx),
            None => false,
        };
        retried || below
    }

    fn update_status(&self, status: &mut Status) {
        let available = if self.core.num_delayed() == 0 { i32::MAX } else { 0 };
        status.merge(available, self.core.is_idle());
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
        self.core.collect_delayed(internal_pending);
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, pending);
        }
        self.core.propagate_estimates(ctx);
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        self.core.collect_statistics("BlockCache", statistics);
    }

    fn on_request_completed(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        self.core.on_fill_completed(ctx, id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{request_path, FileRequestPtr};
    use crate::stack::{find_stage_mut, StackBuilder};
    use crate::testing::{pattern_data, RecordingLog, RecordingStage, TestStack};

    const FILE: &str = "data.bin";

    fn cache_stack(config: BlockCacheConfig, file_len: usize) -> (TestStack, RecordingLog) {
        let (drive, log) = RecordingStage::new();
        let drive = drive.with_file(FILE, pattern_data(file_len));
        let root = StackBuilder::new()
            .push(Box::new(BlockCache::new(config, 4096).unwrap()))
            .push(Box::new(drive))
            .build()
            .unwrap();
        (TestStack::new(root), log)
    }

    fn cache(stack: &mut TestStack) -> &mut BlockCache {
        find_stage_mut::<BlockCache>(stack.root.as_mut()).unwrap()
    }

    fn expected(offset: usize, len: usize, file_len: usize) -> Vec<u8> {
        let data = pattern_data(file_len);
        let end = (offset + len).min(file_len);
        data[offset.min(end)..end].to_vec()
    }

    #[test]
    fn test_four_fills_then_four_hits() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);

        let first = stack.read(FILE, 0, 4096);
        stack.run();
        assert_eq!(first.status(), RequestStatus::Completed);
        assert_eq!(first.data(), expected(0, 4096, 10_000));
        assert_eq!(log.num_reads(), 4);
        assert!(log.reads().iter().all(|call| call.size == 1024));

        cache(&mut stack).reset_statistics();
        log.clear();

        let second = stack.read(FILE, 0, 4096);
        stack.run();
        assert_eq!(second.status(), RequestStatus::Completed);
        assert_eq!(second.data(), expected(0, 4096, 10_000));
        assert_eq!(log.num_reads(), 0);
        assert_eq!(cache(&mut stack).hit_rate_percentage(), 100.0);
    }

    #[test]
    fn test_second_pass_is_all_hits_without_reset() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);

        stack.read(FILE, 0, 4096);
        stack.run();
        assert_eq!(log.num_reads(), 4);
        assert_eq!(cache(&mut stack).last_hit_rate_percentage(), 0.0);

        let second = stack.read(FILE, 0, 4096);
        stack.run();
        assert_eq!(second.data(), expected(0, 4096, 10_000));
        assert_eq!(log.num_reads(), 4);
        assert_eq!(cache(&mut stack).last_hit_rate_percentage(), 100.0);
        // The window still holds the four misses of the first pass.
        assert_eq!(cache(&mut stack).hit_rate_percentage(), 50.0);
    }

    #[test]
    fn test_overlapping_reads_share_one_fill() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        log.set_held(true);

        let first = stack.read(FILE, 100, 200);
        let second = stack.read(FILE, 250, 300);
        stack.run();
        assert_eq!(log.num_reads(), 1);
        assert_eq!(cache(&mut stack).num_in_flight_fills(), 1);
        assert!(!first.request.has_completed());

        log.set_held(false);
        stack.run();
        assert_eq!(first.status(), RequestStatus::Completed);
        assert_eq!(second.status(), RequestStatus::Completed);
        assert_eq!(first.data(), expected(100, 200, 10_000));
        assert_eq!(second.data(), expected(250, 300, 10_000));
        assert_eq!(log.num_reads(), 1);
    }

    #[test]
    fn test_cancel_of_read_waiting_on_fill() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        log.set_held(true);

        let buffer = shared_buffer(ReadBuffer::zeroed(200));
        let (id, canceled) = stack.queue_with_id(Command::Read(ReadData {
            path: request_path(FILE),
            target: BufferTarget::new(buffer, 0),
            offset: 100,
            size: 200,
        }));
        let sharing = stack.read(FILE, 250, 300);
        stack.run();
        assert_eq!(log.num_reads(), 1);

        stack.ctx.request_cancel(id);
        let cancel = stack.queue(Command::Cancel { target: id });
        stack.run();
        assert_eq!(cancel.status(), RequestStatus::Completed);
        assert!(!canceled.has_completed());

        log.set_held(false);
        stack.run();
        assert_eq!(canceled.status(), RequestStatus::Canceled);
        // The fill belongs to the cache and still serves the other reader.
        assert_eq!(sharing.status(), RequestStatus::Completed);
        assert_eq!(sharing.data(), expected(250, 300, 10_000));
        assert_eq!(cache(&mut stack).num_resident_blocks(), 1);
    }

    #[test]
    fn test_round_trip_sizes() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        for (offset, len) in [(10, 100), (1024, 1024), (500, 3000), (0, 8192)] {
            let (mut stack, _log) = cache_stack(config, 20_000);
            let read = stack.read(FILE, offset as u64, len as u64);
            stack.run();
            assert_eq!(read.status(), RequestStatus::Completed);
            assert_eq!(read.data(), expected(offset, len, 20_000), "{offset}+{len}");
        }
    }

    #[test]
    fn test_only_epilog_block_is_cached() {
        let config = BlockCacheConfig::with_blocks(1024, 8);
        let (mut stack, log) = cache_stack(config, 10_000);

        let read = stack.read(FILE, 0, 2500);
        stack.run();
        assert_eq!(read.data(), expected(0, 2500, 10_000));
        let reads = log.reads();
        assert_eq!(reads.len(), 2);
        // Head and body go straight through in one read, the epilog block
        // is filled whole.
        assert!(reads.iter().any(|call| call.offset == 0 && call.size == 2048));
        assert!(reads.iter().any(|call| call.offset == 2048 && call.size == 1024));
        assert_eq!(cache(&mut stack).num_resident_blocks(), 1);
        let cacheable = cache(&mut stack).cacheable_rate_percentage();
        assert!((cacheable - 452.0 / 2500.0 * 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_reads_at_and_past_end_of_file() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, _log) = cache_stack(config, 10_000);

        let at_end = stack.read(FILE, 10_000, 100);
        let overrun = stack.read(FILE, 9_000, 4_000);
        stack.run();
        assert_eq!(at_end.status(), RequestStatus::Completed);
        assert_eq!(at_end.bytes_read(), 0);
        assert_eq!(overrun.status(), RequestStatus::Completed);
        assert_eq!(overrun.bytes_read(), 1_000);
        assert_eq!(overrun.data(), expected(9_000, 1_000, 10_000));
    }

    #[test]
    fn test_zero_sized_read_completes_immediately() {
        let (mut stack, log) = cache_stack(BlockCacheConfig::with_blocks(1024, 4), 100);
        let read = stack.read(FILE, 0, 0);
        stack.run();
        assert_eq!(read.status(), RequestStatus::Completed);
        assert_eq!(read.bytes_read(), 0);
        assert!(log.calls().is_empty());
    }

    #[test]
    fn test_failed_fill_fails_waiting_sections() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        log.fail_path(FILE);

        let read = stack.read(FILE, 0, 2048);
        stack.run();
        assert_eq!(read.status(), RequestStatus::Failed);
        assert_eq!(cache(&mut stack).num_resident_blocks(), 0);
        assert_eq!(cache(&mut stack).num_in_flight_fills(), 0);
    }

    #[test]
    fn test_lru_eviction_and_delayed_sections() {
        let config = BlockCacheConfig::with_blocks(1024, 2).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        log.set_held(true);

        // Three blocks, two slots: the third section waits for a slot.
        let read = stack.read(FILE, 0, 3072);
        stack.tick();
        assert_eq!(log.num_reads(), 2);
        assert_eq!(stack.status().num_available_slots, 0);

        log.set_held(false);
        stack.run();
        assert_eq!(read.status(), RequestStatus::Completed);
        assert_eq!(read.data(), expected(0, 3072, 10_000));
        assert_eq!(log.num_reads(), 3);

        // Block 0 was recycled for block 2. Reading it again evicts block 1,
        // now the least recently touched.
        log.clear();
        let again = stack.read(FILE, 0, 1024);
        stack.run();
        assert_eq!(again.data(), expected(0, 1024, 10_000));
        assert_eq!(log.num_reads(), 1);

        log.clear();
        stack.read(FILE, 2048, 1024);
        stack.run();
        assert_eq!(log.num_reads(), 0);
        stack.read(FILE, 1024, 1024);
        stack.run();
        assert_eq!(log.num_reads(), 1);
    }

    #[test]
    fn test_flush_is_idempotent() {
        let config = BlockCacheConfig::with_blocks(1024, 8).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        let read = stack.read(FILE, 0, 2048);
        stack.run();
        assert_eq!(read.status(), RequestStatus::Completed);
        assert_eq!(cache(&mut stack).num_resident_blocks(), 2);

        let path = request_path(FILE);
        for _ in 0..2 {
            let flush: FileRequestPtr = stack.queue(Command::FlushCache {
                path: Arc::clone(&path),
            });
            stack.run();
            assert_eq!(flush.status(), RequestStatus::Completed);
            assert_eq!(cache(&mut stack).num_resident_blocks(), 0);
        }

        log.clear();
        stack.read(FILE, 0, 2048);
        stack.run();
        assert_eq!(log.num_reads(), 2);
    }

    #[test]
    fn test_flush_during_fill_reissues_sections() {
        let config = BlockCacheConfig::with_blocks(1024, 4).with_only_epilog_writes(false);
        let (mut stack, log) = cache_stack(config, 10_000);
        log.set_held(true);

        let read = stack.read(FILE, 0, 1000);
        stack.tick();
        assert_eq!(log.num_reads(), 1);

        find_stage_mut::<BlockCache>(stack.root.as_mut())
            .unwrap()
            .flush_entire_cache(&mut stack.ctx);
        assert_eq!(log.num_reads(), 2);

        log.set_held(false);
        stack.run();
        assert_eq!(read.status(), RequestStatus::Completed);
        assert_eq!(read.data(), expected(0, 1000, 10_000));
        // The orphaned block is freed, not made resident.
        assert_eq!(cache(&mut stack).num_resident_blocks(), 1);
    }
}
