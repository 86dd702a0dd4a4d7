//! Main loop of the scheduling thread.
//!
//! [`SchedulerCore`] owns the stack and the context. Each tick drains the
//! caller queue, prepares new requests, pushes the best candidates into the
//! stack while it has room, executes every stage and finalizes completions.

use super::SchedulerShared;
use crate::config::SchedulerConfig;
use crate::context::StreamerContext;
use crate::request::{
    BufferTarget, Command, ExternalRequest, FileRequest, FileRequestPtr, Priority, ReadData,
    ReadOutput, ReadRequestData, RequestCommand, RequestId, RequestPath, RequestResult,
    RequestStatus,
};
use crate::stack::{collect_stack_statistics, BoxedStage, Status};
use lode_io::{shared_buffer, AverageWindow, Statistic};
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Requests that act on another request instead of a file.
enum Control {
    Cancel(FileRequestPtr),
    Reschedule {
        target: FileRequestPtr,
        deadline: Option<Duration>,
        priority: Priority,
    },
}

enum Admission {
    Work {
        command: Command,
        deadline: Option<Duration>,
        priority: Priority,
    },
    Control(Control),
}

fn classify(command: RequestCommand) -> Admission {
    let work = |command| Admission::Work {
        command,
        deadline: None,
        priority: Priority::default(),
    };
    match command {
        RequestCommand::Read {
            data,
            deadline,
            priority,
        } => Admission::Work {
            command: Command::ReadRequest(data),
            deadline,
            priority,
        },
        RequestCommand::CompressedRead {
            data,
            deadline,
            priority,
        } => Admission::Work {
            command: Command::CompressedRead(data),
            deadline,
            priority,
        },
        RequestCommand::FileExists { path } => work(Command::FileExists { path }),
        RequestCommand::FileMetaData { path } => work(Command::FileMetaData { path }),
        RequestCommand::FlushCache { path } => work(Command::FlushCache { path }),
        RequestCommand::FlushCaches => work(Command::FlushCaches),
        RequestCommand::CreateDedicatedCache { path, range } => {
            work(Command::CreateDedicatedCache { path, range })
        }
        RequestCommand::DestroyDedicatedCache { path, range } => {
            work(Command::DestroyDedicatedCache { path, range })
        }
        RequestCommand::Report(report) => work(Command::Report(report)),
        RequestCommand::Custom(payload) => work(Command::Custom(payload)),
        RequestCommand::Cancel { target } => Admission::Control(Control::Cancel(target)),
        RequestCommand::Reschedule {
            target,
            deadline,
            priority,
        } => Admission::Control(Control::Reschedule {
            target,
            deadline,
            priority,
        }),
    }
}

/// Deadline of a request that is already late or expected to finish late.
fn urgent_deadline(request: &FileRequest, now: Instant) -> Option<Instant> {
    let deadline = request.deadline()?;
    let late = deadline <= now
        || request
            .estimated_completion()
            .is_some_and(|estimate| estimate > deadline);
    late.then_some(deadline)
}

/// 2 when the request continues the last read, 1 for the same file.
fn locality(request: &FileRequest, last: Option<&(RequestPath, u64)>) -> u8 {
    let (Some((path, end)), Some(request_path)) = (last, request.command().path()) else {
        return 0;
    };
    if path != request_path {
        return 0;
    }
    match request.command().range() {
        Some((offset, _)) if offset == *end => 2,
        _ => 1,
    }
}

/// Issue order of two pending requests. `Less` means `a` goes first.
///
/// Priority, then deadline urgency, then locality with the last queued
/// read. Locality only ranks reads against reads. Equal requests keep their
/// arrival order.
pub(crate) fn prioritize(
    a: &FileRequest,
    b: &FileRequest,
    now: Instant,
    last: Option<&(RequestPath, u64)>,
) -> Ordering {
    b.priority()
        .cmp(&a.priority())
        .then_with(|| match (urgent_deadline(a, now), urgent_deadline(b, now)) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| {
            if a.command().is_read() && b.command().is_read() {
                locality(b, last).cmp(&locality(a, last))
            } else {
                Ordering::Equal
            }
        })
}

pub(crate) struct SchedulerCore {
    pub(crate) ctx: StreamerContext,
    pub(crate) root: BoxedStage,
    shared: Arc<SchedulerShared>,
    config: SchedulerConfig,
    /// Prepared requests not yet in the stack, in arrival order.
    pending: Vec<RequestId>,
    /// End of the last read pushed into the stack.
    last_queued: Option<(RequestPath, u64)>,
    time_in_queue: AverageWindow,
    num_received: u64,
    num_issued: u64,
    last_published: Option<Instant>,
}

impl SchedulerCore {
    pub(crate) fn new(
        shared: Arc<SchedulerShared>,
        root: BoxedStage,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            ctx: StreamerContext::with_shared(Arc::clone(&shared.context)),
            root,
            time_in_queue: AverageWindow::new(config.statistics_window),
            shared,
            config,
            pending: Vec::new(),
            last_queued: None,
            num_received: 0,
            num_issued: 0,
            last_published: None,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::info!(thread = %self.config.thread_name, "scheduler thread started");
        while self.shared.is_running() {
            if self.shared.is_suspended() {
                self.ctx.suspend_scheduling_thread(self.config.idle_timeout);
                continue;
            }
            if !self.tick() {
                self.ctx.suspend_scheduling_thread(self.config.idle_timeout);
            }
        }
        self.publish_statistics(Instant::now(), true);
        tracing::info!(
            active = self.ctx.num_active_requests(),
            "scheduler thread stopped"
        );
    }

    /// One pass of the main loop. Returns whether anything happened.
    pub(crate) fn tick(&mut self) -> bool {
        let now = Instant::now();
        let received = self.receive_requests(now);
        let released = self.prepare_ready_requests();
        self.collect_prepared_requests();

        self.root
            .update_completion_estimates(&mut self.ctx, now, &mut Vec::new(), &self.pending);
        let issued = self.issue_requests(now);
        let executed = self.root.execute_requests(&mut self.ctx);
        let finalized = self
            .ctx
            .finalize_completed_requests(Some(self.root.as_mut()));

        self.publish_statistics(now, false);
        received || released || issued || executed || finalized
    }

    fn receive_requests(&mut self, now: Instant) -> bool {
        let batch = std::mem::take(&mut *self.shared.queued.lock());
        if batch.is_empty() {
            return false;
        }

        // Controls run after the batch is admitted.
        let mut controls = Vec::new();
        for external in batch {
            self.num_received += 1;
            let Some(command) = external.take_command() else {
                tracing::warn!("queued request carries no command");
                self.ctx
                    .shared()
                    .finish_external(&external, RequestResult::None, RequestStatus::Failed);
                continue;
            };
            match classify(command) {
                Admission::Work {
                    command,
                    deadline,
                    priority,
                } => self.admit(external, command, deadline.map(|d| now + d), priority),
                Admission::Control(control) => controls.push((external, control)),
            }
        }
        // Targets prepared in this batch must be pending before a cancel
        // looks for them.
        self.collect_prepared_requests();
        for (external, control) in controls {
            self.handle_control(external, control, now);
        }
        true
    }

    fn collect_prepared_requests(&mut self) {
        while let Some(id) = self.ctx.pop_prepared_request() {
            self.pending.push(id);
        }
    }

    fn admit(
        &mut self,
        external: Arc<ExternalRequest>,
        command: Command,
        deadline: Option<Instant>,
        priority: Priority,
    ) {
        let allocator = match &command {
            Command::ReadRequest(ReadRequestData {
                output: ReadOutput::Allocator(allocator),
                ..
            }) => Some(Arc::clone(allocator)),
            _ => None,
        };
        let id = self.ctx.get_new_internal_request(command);
        let request = self.ctx.request_mut(id);
        request.set_priority(priority);
        request.set_deadline(deadline);
        if let Some(allocator) = allocator {
            allocator.lock_allocator();
            request.allocator = Some(allocator);
        }
        self.ctx.attach_external(id, external);
        self.prepare(id);
    }

    fn handle_control(&mut self, external: Arc<ExternalRequest>, control: Control, now: Instant) {
        let target = match &control {
            Control::Cancel(target) | Control::Reschedule { target, .. } => target,
        };
        let live_target = target
            .inner()
            .internal_id()
            .filter(|id| self.ctx.try_request(*id).is_some());
        let Some(target) = live_target else {
            // Finished before the control arrived.
            self.ctx
                .shared()
                .finish_external(&external, RequestResult::None, RequestStatus::Completed);
            return;
        };

        let command = match control {
            Control::Cancel(_) => {
                self.cancel_pending(target);
                Command::Cancel { target }
            }
            Control::Reschedule {
                deadline, priority, ..
            } => {
                let deadline = deadline.map(|d| now + d);
                self.reschedule_pending(target, deadline, priority);
                Command::Reschedule {
                    target,
                    deadline,
                    priority,
                }
            }
        };
        // Controls skip ordering and slot limits so they overtake their target.
        let id = self.ctx.get_new_internal_request(command);
        self.ctx.attach_external(id, external);
        self.ctx.request_mut(id).set_status(RequestStatus::Queued);
        self.root.queue_request(&mut self.ctx, id);
    }

    fn cancel_pending(&mut self, target: RequestId) {
        tracing::debug!(?target, "cancel requested");
        self.ctx.request_cancel(target);
        let ctx = &mut self.ctx;
        self.pending.retain(|id| {
            let canceled = ctx.is_descendant_of(*id, target);
            if canceled {
                ctx.mark_request_as_completed(*id, RequestStatus::Canceled);
            }
            !canceled
        });
    }

    fn reschedule_pending(
        &mut self,
        target: RequestId,
        deadline: Option<Instant>,
        priority: Priority,
    ) {
        let request = self.ctx.request_mut(target);
        request.set_priority(priority);
        request.set_deadline(deadline);
        for id in &self.pending {
            if self.ctx.is_descendant_of(*id, target) {
                let request = self.ctx.request_mut(*id);
                request.set_priority(priority);
                request.set_deadline(deadline);
            }
        }
    }

    fn prepare_ready_requests(&mut self) -> bool {
        let ready = self.ctx.take_ready_requests();
        let released = !ready.is_empty();
        for id in ready {
            if self.ctx.try_request(id).is_some() {
                self.prepare(id);
            }
        }
        released
    }

    fn prepare(&mut self, id: RequestId) {
        if self.ctx.is_cancel_requested(id) {
            self.ctx.mark_request_as_completed(id, RequestStatus::Canceled);
            return;
        }
        match self.ctx.request(id).command().clone() {
            Command::ReadRequest(data) => self.prepare_read(id, data),
            _ => self.root.prepare_request(&mut self.ctx, id),
        }
    }

    /// Turn a caller read into a physical one once its size is known.
    fn prepare_read(&mut self, id: RequestId, data: ReadRequestData) {
        if data.size == Some(0) {
            self.ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }

        let request = self.ctx.request(id);
        let file_size = request.file_size();
        let needs_size = data.size.is_none() || matches!(data.output, ReadOutput::Allocator(_));
        if needs_size && file_size.is_none() {
            // Queued means the meta data lookup already ran.
            if request.status() == RequestStatus::Queued
                || request.children_status == RequestStatus::Failed
            {
                tracing::debug!(path = %data.path.display(), "read of a file without meta data");
                self.ctx.mark_request_as_completed(id, RequestStatus::Failed);
                return;
            }
            let meta_data = self.ctx.create_child_request(
                id,
                Command::FileMetaData {
                    path: Arc::clone(&data.path),
                },
            );
            self.ctx.add_dependency(id, meta_data);
            self.ctx.request_mut(id).set_status(RequestStatus::Queued);
            self.root.prepare_request(&mut self.ctx, meta_data);
            return;
        }

        let remaining = file_size.map(|size| size.saturating_sub(data.offset));
        let size = match (data.size, remaining) {
            (Some(size), Some(remaining)) => size.min(remaining),
            (Some(size), None) => size,
            (None, remaining) => remaining.unwrap_or(0),
        };
        if size == 0 {
            self.ctx.mark_request_as_completed(id, RequestStatus::Completed);
            return;
        }

        let target = match &data.output {
            ReadOutput::Buffer(buffer) => {
                let target = BufferTarget::new(Arc::clone(buffer), 0);
                if (target.capacity() as u64) < size {
                    tracing::warn!(
                        path = %data.path.display(),
                        size,
                        capacity = target.capacity(),
                        "read does not fit its buffer"
                    );
                    self.ctx.mark_request_as_completed(id, RequestStatus::Failed);
                    return;
                }
                target
            }
            ReadOutput::Allocator(allocator) => {
                let allocation = allocator.allocate(size, size, 1);
                if !allocation.is_valid() {
                    tracing::warn!(path = %data.path.display(), size, "allocation failed");
                    self.ctx.mark_request_as_completed(id, RequestStatus::Failed);
                    return;
                }
                BufferTarget::new(shared_buffer(allocation.buffer), 0)
            }
        };

        *self.ctx.request_mut(id).command_mut() = Command::Read(ReadData {
            path: data.path,
            target,
            offset: data.offset,
            size,
        });
        self.root.prepare_request(&mut self.ctx, id);
    }

    fn next_request_index(&self, now: Instant) -> usize {
        let mut last = self.last_queued.as_ref();
        let mut best = 0;
        for index in 1..self.pending.len() {
            // Locality never lifts a read over an earlier flush or cache
            // change, or it would see the state from before it.
            if !self.ctx.request(self.pending[index - 1]).command().is_read() {
                last = None;
            }
            let candidate = self.ctx.request(self.pending[index]);
            let current = self.ctx.request(self.pending[best]);
            if prioritize(candidate, current, now, last) == Ordering::Less {
                best = index;
            }
        }
        best
    }

    fn issue_requests(&mut self, now: Instant) -> bool {
        self.pending.retain(|id| self.ctx.try_request(*id).is_some());
        let mut issued = false;
        while !self.pending.is_empty() {
            let mut status = Status::default();
            self.root.update_status(&mut status);
            if status.num_available_slots <= 0 {
                break;
            }

            let id = self.pending.remove(self.next_request_index(now));
            if self.ctx.is_cancel_requested(id) {
                self.ctx.mark_request_as_completed(id, RequestStatus::Canceled);
                continue;
            }
            let request = self.ctx.request(id);
            if let (Some(path), Some((offset, size))) =
                (request.command().path(), request.command().range())
            {
                self.last_queued = Some((Arc::clone(path), offset + size));
            }
            let waited = now.saturating_duration_since(request.created_at());
            self.time_in_queue.push(waited.as_secs_f64());
            self.num_issued += 1;

            self.root.queue_request(&mut self.ctx, id);
            issued = true;
        }
        issued
    }

    fn publish_statistics(&mut self, now: Instant, force: bool) {
        let due = self.last_published.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.config.statistics_interval
        });
        if !force && !due {
            return;
        }
        self.last_published = Some(now);

        let mut statistics = vec![
            Statistic::integer("Scheduler", "ReceivedRequests", self.num_received as i64),
            Statistic::integer("Scheduler", "IssuedRequests", self.num_issued as i64),
            Statistic::integer("Scheduler", "PendingRequests", self.pending.len() as i64),
            Statistic::integer(
                "Scheduler",
                "ActiveRequests",
                self.ctx.num_active_requests() as i64,
            ),
        ];
        if let Some(waited) = self.time_in_queue.average() {
            statistics.push(Statistic::float(
                "Scheduler",
                "AverageTimeInQueueMs",
                waited * 1000.0,
            ));
        }
        collect_stack_statistics(self.root.as_ref(), &mut statistics);
        self.shared.statistics.store(Arc::new(statistics));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::request_path;
    use lode_io::ReadBuffer;

    fn read_request(path: &str, offset: u64, priority: Priority) -> FileRequest {
        let mut request = FileRequest::new(Command::Read(ReadData {
            path: request_path(path),
            target: BufferTarget::new(shared_buffer(ReadBuffer::zeroed(16)), 0),
            offset,
            size: 16,
        }));
        request.set_priority(priority);
        request
    }

    #[test]
    fn test_priority_dominates() {
        let now = Instant::now();
        let low = read_request("a", 0, Priority::LOW);
        let mut high = read_request("b", 0, Priority::HIGH);
        high.set_deadline(Some(now + Duration::from_secs(60)));
        assert_eq!(prioritize(&high, &low, now, None), Ordering::Less);
        assert_eq!(prioritize(&low, &high, now, None), Ordering::Greater);
    }

    #[test]
    fn test_urgent_deadline_promoted() {
        let now = Instant::now();
        let relaxed = read_request("a", 0, Priority::MEDIUM);
        let mut passed = read_request("a", 100, Priority::MEDIUM);
        passed.set_deadline(Some(now - Duration::from_millis(1)));
        assert_eq!(prioritize(&passed, &relaxed, now, None), Ordering::Less);

        // A far deadline with an estimate beyond it is urgent too.
        let mut late = read_request("a", 200, Priority::MEDIUM);
        late.set_deadline(Some(now + Duration::from_millis(5)));
        late.set_estimated_completion(now + Duration::from_millis(50));
        assert_eq!(prioritize(&late, &relaxed, now, None), Ordering::Less);

        // Earlier deadline first among urgent requests.
        assert_eq!(prioritize(&passed, &late, now, None), Ordering::Less);

        let mut on_time = read_request("a", 300, Priority::MEDIUM);
        on_time.set_deadline(Some(now + Duration::from_secs(10)));
        on_time.set_estimated_completion(now + Duration::from_millis(1));
        assert_eq!(prioritize(&on_time, &relaxed, now, None), Ordering::Equal);
    }

    #[test]
    fn test_locality_with_last_queued_read() {
        let now = Instant::now();
        let last = (request_path("level.pak"), 4096);
        let other_file = read_request("other.pak", 4096, Priority::MEDIUM);
        let same_file = read_request("level.pak", 0, Priority::MEDIUM);
        let continuing = read_request("level.pak", 4096, Priority::MEDIUM);

        assert_eq!(prioritize(&continuing, &same_file, now, Some(&last)), Ordering::Less);
        assert_eq!(prioritize(&same_file, &other_file, now, Some(&last)), Ordering::Less);
        assert_eq!(prioritize(&other_file, &continuing, now, Some(&last)), Ordering::Greater);
        assert_eq!(prioritize(&continuing, &other_file, now, None), Ordering::Equal);
    }

    #[test]
    fn test_locality_ignores_cache_commands() {
        let now = Instant::now();
        let last = (request_path("level.pak"), 4096);
        let flush = FileRequest::new(Command::FlushCache {
            path: request_path("level.pak"),
        });
        let continuing = read_request("level.pak", 4096, Priority::MEDIUM);

        assert_eq!(prioritize(&continuing, &flush, now, Some(&last)), Ordering::Equal);
        assert_eq!(prioritize(&flush, &continuing, now, Some(&last)), Ordering::Equal);
    }
}
