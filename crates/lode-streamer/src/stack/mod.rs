//! Processing stages and the chain that links them.
//!
//! Each stage owns the next one. Requests travel root to leaf through
//! [`StreamStackEntry::queue_request`]; completions travel back through the
//! [`StreamerContext`] and reach the stage that created a request through
//! [`StreamStackEntry::on_request_completed`].

pub mod block_cache;
pub mod decompressor;
pub mod dedicated_cache;
pub mod read_splitter;
pub mod storage_drive;

use crate::context::StreamerContext;
use crate::request::{Command, ReportType, RequestId, RequestStatus};
use lode_io::Statistic;
use std::any::Any;
use std::time::Instant;

/// Depth of a stage in the chain, the root being 0.
pub type StageId = usize;

/// Owned stage trait object.
pub type BoxedStage = Box<dyn StreamStackEntry>;

/// Capacity summary aggregated over the whole chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Status {
    /// Requests the chain can still take this tick. May go negative when a
    /// stage is over-committed.
    pub num_available_slots: i32,
    /// No stage holds queued or in-flight work.
    pub is_idle: bool,
}

impl Default for Status {
    fn default() -> Self {
        Self {
            num_available_slots: i32::MAX,
            is_idle: true,
        }
    }
}

impl Status {
    /// Fold in one stage's numbers.
    pub fn merge(&mut self, available: i32, idle: bool) {
        self.num_available_slots = self.num_available_slots.min(available);
        self.is_idle &= idle;
    }
}

/// Wiring shared by every stage.
pub struct StackEntryBase {
    name: &'static str,
    stage_id: StageId,
    next: Option<BoxedStage>,
}

impl StackEntryBase {
    /// Unlinked base named `name`.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            stage_id: 0,
            next: None,
        }
    }

    pub(crate) fn next_stage(&mut self) -> NextStage<'_> {
        self.next.as_deref_mut()
    }
}

/// Borrow of the stage below, handed to helpers that issue requests.
pub(crate) type NextStage<'a> = Option<&'a mut (dyn StreamStackEntry + 'static)>;

/// Queue `id` on the stage below, or complete it when there is none.
pub(crate) fn send_down(next: &mut NextStage<'_>, ctx: &mut StreamerContext, id: RequestId) {
    match next.as_deref_mut() {
        Some(next) => next.queue_request(ctx, id),
        None => complete_unhandled(ctx, id),
    }
}

impl std::fmt::Debug for StackEntryBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackEntryBase")
            .field("name", &self.name)
            .field("stage_id", &self.stage_id)
            .field("next", &self.next.as_ref().map(|next| next.name()))
            .finish()
    }
}

/// Downcasting for stage trait objects.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// One processing stage.
///
/// `queue_request` must service, forward, split or hold every request it
/// receives. A request is never dropped.
pub trait StreamStackEntry: AsAny + Send {
    fn base(&self) -> &StackEntryBase;
    fn base_mut(&mut self) -> &mut StackEntryBase;

    fn name(&self) -> &str {
        self.base().name
    }

    fn stage_id(&self) -> StageId {
        self.base().stage_id
    }

    fn set_next(&mut self, next: Option<BoxedStage>) {
        self.base_mut().next = next;
    }

    fn next(&self) -> Option<&(dyn StreamStackEntry + 'static)> {
        self.base().next.as_deref()
    }

    fn next_mut(&mut self) -> Option<&mut (dyn StreamStackEntry + 'static)> {
        self.base_mut().next.as_deref_mut()
    }

    /// Pre-queue pass. The terminal stage hands the request to the
    /// prepared queue.
    fn prepare_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        match self.next_mut() {
            Some(next) => next.prepare_request(ctx, id),
            None => ctx.push_prepared_request(id),
        }
    }

    fn queue_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        self.forward_request(ctx, id);
    }

    /// Pass a request on unchanged, completing it when this is the last stage.
    fn forward_request(&mut self, ctx: &mut StreamerContext, id: RequestId) {
        if let Command::Report(report) = ctx.request(id).command() {
            let report = *report;
            self.report(report);
        }
        match self.next_mut() {
            Some(next) => next.queue_request(ctx, id),
            None => complete_unhandled(ctx, id),
        }
    }

    /// Per-tick work. Returns whether anything progressed.
    fn execute_requests(&mut self, ctx: &mut StreamerContext) -> bool {
        match self.next_mut() {
            Some(next) => next.execute_requests(ctx),
            None => false,
        }
    }

    fn update_status(&self, status: &mut Status) {
        if let Some(next) = self.next() {
            next.update_status(status);
        }
    }

    /// Annotate requests with completion estimates.
    ///
    /// `internal_pending` collects requests held by stages above, in the
    /// order they will be released; `pending` is the scheduler's queue.
    fn update_completion_estimates(
        &mut self,
        ctx: &mut StreamerContext,
        now: Instant,
        internal_pending: &mut Vec<RequestId>,
        pending: &[RequestId],
    ) {
        if let Some(next) = self.next_mut() {
            next.update_completion_estimates(ctx, now, internal_pending, pending);
        }
    }

    /// Append this stage's samples. Must not block.
    fn collect_statistics(&self, _statistics: &mut Vec<Statistic>) {}

    /// A request this stage created, or claimed with `set_owner`, finished.
    fn on_request_completed(&mut self, _ctx: &mut StreamerContext, _id: RequestId) {}

    /// Log this stage's part of a report.
    fn report(&self, report: ReportType) {
        if report == ReportType::Statistics {
            let mut statistics = Vec::new();
            self.collect_statistics(&mut statistics);
            log_statistics(self.name(), &statistics);
        }
    }
}

pub(crate) fn log_statistics(stage: &str, statistics: &[Statistic]) {
    for statistic in statistics {
        tracing::info!(
            stage,
            name = %statistic.name,
            value = statistic.value.as_f64(),
            "statistic"
        );
    }
}

/// Terminal handling for requests no stage claimed.
pub(crate) fn complete_unhandled(ctx: &mut StreamerContext, id: RequestId) {
    let command = ctx.request(id).command();
    let status = match command {
        Command::Read(_)
        | Command::ReadRequest(_)
        | Command::CompressedRead(_)
        | Command::FileExists { .. }
        | Command::FileMetaData { .. }
        | Command::Custom(_) => {
            tracing::warn!(command = command.name(), "no stage handled request");
            RequestStatus::Failed
        }
        _ => RequestStatus::Completed,
    };
    ctx.mark_request_as_completed(id, status);
}

/// Find the stage at depth `id`.
pub fn stage_at_mut<'a>(
    root: &'a mut (dyn StreamStackEntry + 'static),
    id: StageId,
) -> Option<&'a mut (dyn StreamStackEntry + 'static)> {
    let mut current = root;
    loop {
        if current.stage_id() == id {
            return Some(current);
        }
        current = current.next_mut()?;
    }
}

/// First stage of type `T`.
pub fn find_stage_mut<'a, T: StreamStackEntry + 'static>(
    root: &'a mut (dyn StreamStackEntry + 'static),
) -> Option<&'a mut T> {
    let mut current = root;
    loop {
        // Deref first so the blanket impl sees the stage, not the reference.
        if (*current).as_any().is::<T>() {
            return (*current).as_any_mut().downcast_mut::<T>();
        }
        current = current.next_mut()?;
    }
}

/// Visit every stage, root first.
pub fn for_each_stage(
    root: &(dyn StreamStackEntry + 'static),
    mut visit: impl FnMut(&(dyn StreamStackEntry + 'static)),
) {
    let mut current = Some(root);
    while let Some(stage) = current {
        visit(stage);
        current = stage.next();
    }
}

/// Samples of every stage in the chain.
pub fn collect_stack_statistics(
    root: &(dyn StreamStackEntry + 'static),
    statistics: &mut Vec<Statistic>,
) {
    for_each_stage(root, |stage| stage.collect_statistics(statistics));
}

/// Links stages root to leaf and numbers them by depth.
#[derive(Default)]
pub struct StackBuilder {
    stages: Vec<BoxedStage>,
}

impl StackBuilder {
    /// Builder with no stages.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage below the ones already added.
    pub fn push(mut self, stage: BoxedStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Stages added so far.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether no stage was added.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Root of the linked chain, or `None` for an empty builder.
    pub fn build(self) -> Option<BoxedStage> {
        let mut next: Option<BoxedStage> = None;
        for (depth, mut stage) in self.stages.into_iter().enumerate().rev() {
            stage.base_mut().stage_id = depth;
            stage.set_next(next);
            next = Some(stage);
        }
        next
    }
}
