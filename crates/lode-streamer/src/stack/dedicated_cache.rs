//! Per-file block caches.
//!
//! `CreateDedicatedCache` opens (or adds a reference to) a cache for a file or
//! a byte range of it; reads inside that range go through its own block
//! table. Everything else passes through.

use crate::config::DedicatedCacheConfig;
use crate::context::StreamerContext;
use crate::request::{Command, FileRange, RequestId, RequestPath, RequestStatus};
use crate::stack::block_cache::BlockCacheCore;
use crate::stack::{StackEntryBase, Status, StreamStackEntry};
use lode_io::Statistic;
use std::time::Instant;

struct Entry {
    path: RequestPath,
    range: Option<FileRange>,
    core: BlockCacheCore,
    ref_count: usize,
    /// Destroyed while fills were in flight. Removed once idle.
    retiring: bool,
}

impl Entry {
    fn is(&self, path: &RequestPath, range: Option<FileRange>) -> bool {
        !self.retiring && self.range == range && &self.path == path
    }

    fn serves(&self, path: &RequestPath, offset: u64, size: u64) -> bool {
        !self.retiring
            && &self.path == path
            && self.range.map_or(true, |range| range.contains(offset, size))
    }
}

pub struct DedicatedCache {
    base: StackEntryBase,
    config: DedicatedCacheConfig,
    hardware_alignment: u64,
    entries: Vec<Entry>,
}

impl DedicatedCache {
    /// Create a dedicated cache stage with no entries.
    ///
    /// # Arguments
    ///
    /// * `config` - Shape of each per-file cache
    /// * `hardware_alignment` - Alignment that block sizes resolve against
    pub fn new(config: DedicatedCacheConfig, hardware_alignment: u64) -> Self {
        Self {
            base: StackEntryBase::new("DedicatedCache"),
            config,
            hardware_alignment,
            entries: Vec::new(),
        }
    }

    /// Number of live caches, retiring ones excluded.
    pub fn num_caches(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.retiring).count()
    }

    /// References held on the entry for `path` and `range`, if it exists.
    pub fn ref_count(&self, path: &RequestPath, range: Option<FileRange>) -> Option<usize> {
        self.entries
            .iter()
            .find(|entry| entry.is(path, range))
            .map(|entry| entry.ref_count)
    }

    fn create(&mut self, path: RequestPath, range: Option<FileRange>) -> RequestStatus {
        if let Some(entry) = self.entries.iter_mut().find(|entry| entry.is(&path, range)) {
            entry.ref_count += 1;
            return RequestStatus::Completed;
        }
        match BlockCacheCore::new(&self.config.block_cache(), self.hardware_alignment) {
            Ok(core) => {
                tracing::info!(path = %path.display(), ?range, "dedicated cache created");
                self.entries.push(Entry {
                    path,
                    range,
                    core,
                    ref_count: 1,
                    retiring: false,
                });
                RequestStatus::Completed
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "dedicated cache not created");
                RequestStatus::Failed
            }
        }
    }

    fn destroy(&mut self, path: &RequestPath, range: Option<FileRange>) {
        let Some(index) = self.entries.iter().position(|entry| entry.is(path, range)) else {
            tracing::debug!(path = %path.display(), "no dedicated cache to destroy");
            return;
        };
        let entry = &mut self.entries[index];
        entry.ref_count -= 1;
        if entry.ref_count > 0 {
            return;
        }
        tracing::info!(path = %path.display(), ?range, "dedicated cache destroyed");
        if entry.core.is_idle() {
            self.entries.remove(index);
        } else {
            entry.retiring = true;
        }
    }

    fn prune_retired(&mut self) {
        self.entries
            .retain(|entry| !(entry.retiring && entry.core.is_idle()));
    }
}

impl StreamStackEntry for DedicatedCache {
    fn base(&self) -> &StackEntryBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut StackEntryBase {
        &mut self.base
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        let owner = self.stage_id();
        match ctx.request(id).command().clone() {
            Command::Read(data) => {
                let entry = self
                    .entries
                    .iter_mut()
                    .find(|entry| entry.serves(&data.path, data.offset, data.size));
                match entry {
                    Some(entry) => {
                        entry
                            .core
                            .queue_read(ctx, &mut self.base.next_stage(), owner, id)
                    }
                    None => self.forward_request(ctx, id),
                }
            }
            Command::CreateDedicatedCache { path, range } => {
                let status = self.create(path, range);
                ctx.mark_request_as_completed(id, status);
            }
            Command::DestroyDedicatedCache { path, range } => {
                self.destroy(&path, range);
                ctx.mark_request_as_completed(id, RequestStatus::Completed);
            }
            Command::FlushCache { path } => {
                let mut next = self.base.next_stage();
                for entry in self.entries.iter_mut().filter(|entry| entry.path == path) {
                    entry.core.flush(ctx, &mut next, owner, None);
                }
                self.forward_request(ctx, id);
            }
            Command::FlushCaches => {
                let mut next = self.base.next_stage();
                for entry in &mut self.entries {
                    entry.core.flush(ctx, &mut next, owner, None);
                }
                self.forward_request(ctx, id);
            }
            Command::Cancel { target } => {
                for entry in &mut self.entries {
                    entry.core.cancel(ctx, target);
                }
                self.forward_request(ctx, id);
            }
            Command::Reschedule {
                target,
                deadline,
                priority,
            } => {
                for entry in &mut self.entries {
                    entry.core.reschedule(ctx, target, deadline, priority);
                }
                self.forward_request(ctx, id);
            }
            _ => self.forward_request(ctx, id),
        }
    }

    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        let owner = self.stage_id();
        let mut progressed = false;
        {
            let mut next = self.base.next_stage();
            for entry in &mut self.entries {
                progressed |= entry.core.execute(ctx, &mut next, owner);
            }
        }
        self.prune_retired();
        let below = match self.next_mut() {
            Some(next) => next.execute_requests(ctx),
            None => false,
        };
        progressed || below
    }

    fn update_status(&self, status: &mut Status) {
        for entry in &self.entries {
            let available = if entry.core.num_delayed() == 0 { i32::MAX } else { 0 };
            status.merge(available, entry.core.is_idle());
        }
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
        for entry in &self.entries {
            entry.core.collect_delayed(internal_pending);
        }
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, pending);
        }
        for entry in &self.entries {
            entry.core.propagate_estimates(ctx);
        }
    }

    fn collect_statistics(&self, statistics: &mut Vec<Statistic>) {
        statistics.push(Statistic::integer(
            "DedicatedCache",
            "NumCaches",
            self.num_caches() as i64,
        ));
        for entry in self.entries.iter().filter(|entry| !entry.retiring) {
            statistics.push(Statistic::percentage(
                "DedicatedCache",
                format!("HitRate:{}", entry.path.display()),
                entry.core.hit_rate_percentage(),
            ));
        }
    }

    fn on_request_completed(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        for entry in &mut self.entries {
            if entry.core.on_fill_completed(ctx, id) {
                break;
            }
        }
        self.prune_retired();
    }
}
