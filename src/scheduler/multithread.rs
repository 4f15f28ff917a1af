use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info_span, trace, trace_span, warn};

use crate::core::{ContextKey, Deadline, ExecutionContext, IMMEDIATE, Reason, TaskId};
use crate::engine::{DurationStats, Task, flatten};
use crate::error::SchedulerError;
use crate::scheduler::ready::ReadySet;
use crate::scheduler::{Diagnostics, Scheduler, SchedulerConfig, TaskExecution};

/// A primitive task known to the scheduler and not yet completed.
struct Tracked {
    task: Arc<Task>,
    /// Tracked tasks that must complete first.
    predecessors: HashSet<TaskId>,
    successors: HashSet<TaskId>,
}

#[derive(Default)]
struct State {
    clock: u64,
    tracked: HashMap<TaskId, Tracked>,
    /// Tracked tasks with an immediate deadline.
    immediate: HashSet<TaskId>,
    ready_all: ReadySet,
    /// The subset of `ready_all` that worker threads may run.
    ready_cpu: ReadySet,
    running: HashSet<TaskId>,
    /// Running tasks marked not done while they ran. Their result is stale,
    /// so they are queued again instead of completing.
    invalidated: HashMap<TaskId, Reason>,
    executions: Vec<TaskExecution>,
    stop: bool,
    poisoned: bool,
    panic: Option<Box<dyn Any + Send>>,
}

impl State {
    fn prefetch_len(&self) -> usize {
        self.tracked.len() - self.immediate.len()
    }

    fn is_ready(&self, id: TaskId) -> bool {
        self.ready_all.contains(id)
    }

    fn make_ready(&mut self, id: TaskId, stats: &DurationStats) {
        let Some(tracked) = self.tracked.get(&id) else {
            return;
        };
        let task = tracked.task.clone();
        let deadline = task.deadline();
        let context = ContextKey::of(task.context().as_ref());
        let expected = task.expected_duration(stats);

        self.ready_all.insert(id, deadline, context, expected);
        if !task.is_gpu() {
            self.ready_cpu.insert(id, deadline, context, expected);
        }
    }

    fn unready(&mut self, id: TaskId) -> bool {
        self.ready_cpu.remove(id);
        self.ready_all.remove(id)
    }

    /// Re-sorts a ready task after its deadline changed.
    fn resort(&mut self, id: TaskId, stats: &DurationStats) {
        if self.unready(id) {
            self.make_ready(id, stats);
        }
    }

    fn link(&mut self, pred: TaskId, succ: TaskId) {
        if self.running.contains(&succ) || !self.tracked.contains_key(&pred) {
            return;
        }
        if let Some(tracked) = self.tracked.get_mut(&succ) {
            tracked.predecessors.insert(pred);
        }
        if let Some(tracked) = self.tracked.get_mut(&pred) {
            tracked.successors.insert(succ);
        }
        self.unready(succ);
    }

    /// Lowers the deadline of `start` and of every tracked task they
    /// transitively depend on.
    fn lower_deadlines(&mut self, start: Vec<Arc<Task>>, deadline: Deadline, stats: &DurationStats) {
        let mut seen = HashSet::new();
        let mut stack = start;

        while let Some(task) = stack.pop() {
            let id = task.id();
            if !seen.insert(id) {
                continue;
            }
            task.lower_deadline(deadline);
            let Some(tracked) = self.tracked.get(&id) else {
                continue;
            };
            stack.extend(
                tracked
                    .predecessors
                    .iter()
                    .filter_map(|pred| self.tracked.get(pred).map(|t| t.task.clone())),
            );
            let current = task.deadline();
            if current == IMMEDIATE {
                self.immediate.insert(id);
            }
            // the deadline may also have been changed behind our back
            if self.ready_all.deadline_of(id).is_some_and(|queued| queued != current) {
                self.resort(id, stats);
            }
        }
    }

    /// Picks the best ready task with a deadline in `min..=max` and marks it
    /// running.
    fn take(&mut self, cpu_only: bool, min: Deadline, max: Deadline, last: ContextKey) -> Option<Arc<Task>> {
        let ready = if cpu_only { &self.ready_cpu } else { &self.ready_all };
        let id = ready.pick(min, max, last)?;
        self.unready(id);
        self.running.insert(id);
        self.tracked.get(&id).map(|tracked| tracked.task.clone())
    }

    /// Forgets a completed task and readies the successors it was holding
    /// back.
    fn finish(&mut self, id: TaskId, date: u64, stats: &DurationStats) -> Option<Tracked> {
        self.running.remove(&id);
        self.immediate.remove(&id);
        let tracked = self.tracked.remove(&id)?;

        for pred in &tracked.predecessors {
            if let Some(pred) = self.tracked.get_mut(pred) {
                pred.successors.remove(&id);
            }
        }

        let mut ready = Vec::new();
        for succ in &tracked.successors {
            let Some(next) = self.tracked.get_mut(succ) else {
                continue;
            };
            next.task.raise_predecessors_completion_date(date);
            next.predecessors.remove(&id);
            if next.predecessors.is_empty() {
                ready.push(*succ);
            }
        }
        for succ in ready {
            if !self.running.contains(&succ) {
                self.make_ready(succ, stats);
            }
        }
        Some(tracked)
    }
}

struct Shared {
    config: SchedulerConfig,
    state: Mutex<State>,
    /// Signalled when any task becomes ready or completes.
    all_ready: Condvar,
    /// Signalled when a task that worker threads may run becomes ready.
    cpu_ready: Condvar,
    stats: DurationStats,
}

impl Shared {
    fn wake(&self) {
        self.all_ready.notify_all();
        self.cpu_ready.notify_all();
    }

    /// Runs `task` unless it is up to date, then records its completion.
    fn execute(&self, task: &Arc<Task>, current: &mut Option<Arc<dyn ExecutionContext>>) {
        let context = task.context();
        if ContextKey::of(context.as_ref()) != ContextKey::of(current.as_ref()) {
            if let Some(old) = current.take() {
                old.close();
            }
            if let Some(new) = &context {
                trace!(task = %task.id(), "switching execution context");
                new.open();
            }
            *current = context;
        }

        let (changed, execution) = if task.is_up_to_date() {
            trace!(task = %task.id(), kind = task.type_key(), "task is up to date, skipping");
            (false, None)
        } else {
            let span = trace_span!("task", id = %task.id(), kind = task.type_key());
            let _enter = span.enter();

            let start = Instant::now();
            let changed = task.run();
            let duration = start.elapsed();
            task.set_actual_duration(&self.stats, duration);
            (changed, Some((start, duration)))
        };

        self.complete(task, changed, execution);
    }

    fn complete(&self, task: &Arc<Task>, changed: bool, execution: Option<(Instant, Duration)>) {
        let previous = task.completion_date().max(task.predecessors_completion_date());
        let date = if changed {
            let mut state = self.state.lock();
            state.clock = state.clock.max(previous) + 1;
            state.clock
        } else {
            previous
        };

        // listeners may take other locks, so this happens outside ours
        task.set_is_done(true, date, Reason::DataNeeded);

        let (finished, requeued) = {
            let mut state = self.state.lock();
            let id = task.id();
            let (finished, requeued) = match state.invalidated.remove(&id) {
                // stays running until it is marked not done again
                Some(reason) => (None, Some(reason)),
                None => (state.finish(id, date, &self.stats), None),
            };
            if self.config.record_diagnostics
                && let Some((start, duration)) = execution
            {
                state.executions.push(TaskExecution {
                    task: task.id(),
                    type_key: task.type_key(),
                    start,
                    duration,
                    thread: thread::current().name().map(str::to_owned),
                });
            }
            (finished, requeued)
        };
        if let Some(reason) = requeued {
            trace!(task = %task.id(), ?reason, "task invalidated while running, queued again");
            task.set_is_done(false, 0, reason);

            let mut state = self.state.lock();
            state.invalidated.remove(&task.id());
            state.running.remove(&task.id());
            state.make_ready(task.id(), &self.stats);
        }
        // dropping a task may call back into whoever created it
        drop(finished);
        self.wake();
    }

    fn poison(&self, task: &Arc<Task>, payload: Box<dyn Any + Send>) {
        error!(task = %task.id(), kind = task.type_key(), "task panicked, scheduler is poisoned");
        {
            let mut state = self.state.lock();
            state.poisoned = true;
            state.running.remove(&task.id());
            state.invalidated.remove(&task.id());
            state.panic.get_or_insert(payload);
        }
        self.wake();
    }
}

fn worker_loop(shared: Arc<Shared>, index: usize) {
    debug!(worker = index, "worker started");
    let min = if shared.config.strict_prefetch { IMMEDIATE + 1 } else { IMMEDIATE };
    let mut current: Option<Arc<dyn ExecutionContext>> = None;

    loop {
        let task = {
            let mut state = shared.state.lock();
            loop {
                if state.stop {
                    break None;
                }
                if !state.poisoned {
                    let last = ContextKey::of(current.as_ref());
                    if let Some(task) = state.take(true, min, Deadline::MAX, last) {
                        break Some(task);
                    }
                }
                shared.cpu_ready.wait(&mut state);
            }
        };
        let Some(task) = task else {
            break;
        };

        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| shared.execute(&task, &mut current))) {
            shared.poison(&task, payload);
        }
    }

    if let Some(context) = current {
        context.close();
    }
    debug!(worker = index, "worker stopped");
}

/// A scheduler executing tasks on the calling thread and on a fixed pool of
/// worker threads.
///
/// GPU tasks only ever run on the thread calling [`Scheduler::run`]. Worker
/// threads run CPU tasks, or only CPU prefetch tasks when
/// [`SchedulerConfig::strict_prefetch`] is set.
///
/// A panic in a task poisons the scheduler: the panic is propagated to the
/// caller of `run`, and every later call to `run` panics as well.
pub struct MultithreadScheduler {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl MultithreadScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let thread_count = config.thread_count;

        let scheduler = Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(State::default()),
                all_ready: Condvar::new(),
                cpu_ready: Condvar::new(),
                stats: DurationStats::new(),
            }),
            workers: Mutex::new(Vec::with_capacity(thread_count)),
        };

        for index in 0..thread_count {
            let shared = scheduler.shared.clone();
            let handle = thread::Builder::new()
                .name(format!("tessera-worker-{index}"))
                .spawn(move || worker_loop(shared, index))
                .map_err(|source| SchedulerError::Spawn { index, source })?;
            scheduler.workers.lock().push(handle);
        }

        debug!(threads = thread_count, "scheduler started");
        Ok(scheduler)
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.shared.config
    }

    /// Duration statistics gathered by this scheduler.
    pub fn stats(&self) -> &DurationStats {
        &self.shared.stats
    }

    /// Number of scheduled tasks that have not completed yet.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().tracked.len()
    }

    /// Drains the execution records collected so far.
    pub fn take_diagnostics(&self) -> Diagnostics {
        Diagnostics {
            executions: std::mem::take(&mut self.shared.state.lock().executions),
        }
    }

    /// Stops and joins every worker thread. Tasks still waiting are
    /// abandoned. Called automatically on drop.
    pub fn shutdown(&self) {
        self.shared.state.lock().stop = true;
        self.shared.wake();

        let workers = std::mem::take(&mut *self.workers.lock());
        if workers.is_empty() {
            return;
        }
        for handle in workers {
            if handle.join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        }
        debug!("scheduler stopped");
    }

    fn check_poisoned(&self) {
        let mut state = self.shared.state.lock();
        if !state.poisoned {
            return;
        }
        let payload = state.panic.take();
        drop(state);
        match payload {
            Some(payload) => resume_unwind(payload),
            None => panic!("scheduler poisoned by a panicking task"),
        }
    }

    /// Blocks until an immediate task is ready and returns it, or returns
    /// `None` once no immediate task is left.
    fn next_immediate(&self, last: ContextKey) -> Option<Arc<Task>> {
        let mut state = self.shared.state.lock();
        loop {
            if state.poisoned {
                drop(state);
                self.check_poisoned();
                return None;
            }
            if state.immediate.is_empty() {
                return None;
            }
            if let Some(task) = state.take(false, IMMEDIATE, IMMEDIATE, last) {
                return Some(task);
            }
            self.shared.all_ready.wait(&mut state);
        }
    }

    fn next_prefetch(&self, last: ContextKey) -> Option<Arc<Task>> {
        let mut state = self.shared.state.lock();
        if state.poisoned || state.ready_all.is_empty() {
            return None;
        }
        state.take(false, IMMEDIATE + 1, Deadline::MAX, last)
    }

    fn execute_here(&self, task: &Arc<Task>, current: &mut Option<Arc<dyn ExecutionContext>>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| self.shared.execute(task, current))) {
            self.shared.poison(task, Box::new("task panicked on the calling thread"));
            resume_unwind(payload);
        }
    }
}

impl Scheduler for MultithreadScheduler {
    fn supports_prefetch(&self, gpu: bool) -> bool {
        let config = &self.shared.config;
        let paced = config.prefetch_rate > 0 || config.frame_rate > 0.0;
        if gpu { paced } else { paced || config.thread_count > 0 }
    }

    fn schedule(&self, task: &Arc<Task>) -> bool {
        let mut visited = HashSet::new();
        task.init(&mut visited);
        let flat = flatten(task);

        // predecessors are needed no later than their successors
        let mut deadlines: HashMap<TaskId, Deadline> = flat
            .tasks
            .iter()
            .map(|(id, node)| (*id, node.deadline))
            .collect();
        for id in flat.order.iter().rev() {
            let deadline = deadlines.get(id).copied().unwrap_or(IMMEDIATE);
            for pred in flat.predecessors(*id) {
                if let Some(d) = deadlines.get_mut(&pred) {
                    *d = (*d).min(deadline);
                }
            }
        }

        let pending: Vec<&Arc<Task>> = flat
            .order
            .iter()
            .filter_map(|id| flat.tasks.get(id))
            .map(|node| &node.task)
            .filter(|task| !task.is_done())
            .collect();
        if pending.is_empty() {
            trace!(task = %task.id(), "nothing to schedule");
            return true;
        }

        let stats = &self.shared.stats;
        let mut state = self.shared.state.lock();

        let queue_size = self.shared.config.prefetch_queue_size;
        let is_prefetch = pending
            .iter()
            .all(|t| deadlines.get(&t.id()).copied().unwrap_or(IMMEDIATE) > IMMEDIATE);
        let is_new = pending.iter().any(|t| !state.tracked.contains_key(&t.id()));
        if is_prefetch && is_new && queue_size > 0 && state.prefetch_len() >= queue_size {
            debug!(task = %task.id(), queued = state.prefetch_len(), "prefetch queue is full, dropping task");
            return false;
        }

        let mut added = Vec::new();
        for node in pending {
            let id = node.id();
            let deadline = deadlines.get(&id).copied().unwrap_or(IMMEDIATE);

            if state.tracked.contains_key(&id) {
                state.lower_deadlines(vec![node.clone()], deadline, stats);
            } else {
                node.lower_deadline(deadline);
                state.tracked.insert(
                    id,
                    Tracked {
                        task: node.clone(),
                        predecessors: HashSet::new(),
                        successors: HashSet::new(),
                    },
                );
                if node.deadline() == IMMEDIATE {
                    state.immediate.insert(id);
                }
                added.push(id);
            }

            for pred in flat.predecessors(id) {
                let Some(pred_node) = flat.tasks.get(&pred) else {
                    continue;
                };
                if pred_node.task.is_done() {
                    node.raise_predecessors_completion_date(pred_node.task.completion_date());
                } else {
                    state.link(pred, id);
                }
            }
        }

        for id in &added {
            let blocked = state
                .tracked
                .get(id)
                .is_some_and(|tracked| !tracked.predecessors.is_empty());
            if !blocked && !state.running.contains(id) && !state.is_ready(*id) {
                state.make_ready(*id, stats);
            }
        }

        trace!(
            task = %task.id(),
            flat = flat.len(),
            added = added.len(),
            tracked = state.tracked.len(),
            ready = state.ready_all.len(),
            "scheduled"
        );
        drop(state);
        self.shared.wake();
        true
    }

    fn reschedule(&self, task: &Arc<Task>, reason: Reason, deadline: Deadline) {
        let mut start = vec![task.clone()];
        if task.is_graph() {
            start.extend(flatten(task).tasks.into_values().map(|node| node.task));
        }

        {
            let mut state = self.shared.state.lock();
            for node in &start {
                let id = node.id();
                // a queued task may start before its completion date is reset below
                if state.running.contains(&id) || (id == task.id() && state.tracked.contains_key(&id)) {
                    state.invalidated.insert(id, reason);
                }
            }
            state.lower_deadlines(start, deadline, &self.shared.stats);
        }
        // after marking, so a task completing meanwhile either sees the mark
        // or is done before this resets it
        task.set_is_done(false, 0, reason);
        {
            let mut state = self.shared.state.lock();
            if !state.running.contains(&task.id()) {
                state.invalidated.remove(&task.id());
            }
        }
        trace!(task = %task.id(), ?reason, deadline, "rescheduled");
        self.shared.wake();
    }

    fn run(&self, task: &Arc<Task>) {
        let span = info_span!("scheduler_run", task = %task.id());
        let _enter = span.enter();

        self.check_poisoned();
        self.schedule(task);

        let frame_end = self.shared.config.frame_period().map(|period| Instant::now() + period);
        let prefetch_rate = self.shared.config.prefetch_rate;
        let mut prefetched = 0;
        let mut current: Option<Arc<dyn ExecutionContext>> = None;

        loop {
            let last = ContextKey::of(current.as_ref());
            if let Some(next) = self.next_immediate(last) {
                self.execute_here(&next, &mut current);
                continue;
            }

            let more = prefetched < prefetch_rate || frame_end.is_some_and(|end| Instant::now() < end);
            if !more {
                break;
            }
            match self.next_prefetch(last) {
                Some(next) => {
                    self.execute_here(&next, &mut current);
                    prefetched += 1;
                }
                None => break,
            }
        }

        if let Some(context) = current {
            context.close();
        }
        self.check_poisoned();

        if let Some(end) = frame_end {
            let now = Instant::now();
            if now < end {
                thread::sleep(end - now);
            }
        }
        trace!(prefetched, "run finished");
    }
}

impl Drop for MultithreadScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}
