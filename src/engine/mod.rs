//! Tasks and task graphs.
//!
//! A [`Task`] is either a *primitive* task wrapping a piece of [`Work`]
//! supplied by a producer, or a *graph* holding sub-tasks and the ordering
//! constraints between them. Graphs nest to any depth and the same task may be
//! shared by several graphs. The scheduler never executes a graph directly: it
//! flattens it into primitive tasks first (see [`flatten`]).
//!
//! ## Done state and completion dates
//!
//! Every task is either done or not done. When the scheduler finishes a task
//! it stamps it with a *completion date* taken from its logical clock. Each
//! task also remembers the latest completion date of its predecessors, so the
//! scheduler can tell whether a task that was marked not done actually has to
//! run again: if nothing upstream produced a newer result, executing it would
//! be a no-op and is skipped.
//!
//! ## Listeners
//!
//! Graphs listen to the tasks they contain. When a sub-task must be re-run the
//! graph marks the sub-task's successors as not done and becomes not done
//! itself; once every sub-task is done again the graph is done too. External
//! code can observe state changes through [`TaskListener`].

mod flatten;
mod graph;
pub(crate) mod stats;

use std::any::Any;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;

use crate::core::{Deadline, ExecutionContext, IMMEDIATE, Reason, TaskId};

pub(crate) use crate::engine::flatten::flatten;
pub use crate::engine::stats::{DurationStats, TypeStats};

/// Completion date stamped on a task that has never completed.
const NEVER: u64 = 0;

/// The unit of work executed by a primitive [`Task`].
pub trait Work: Any + Send + Sync {
    /// Stable identifier of the kind of work, used to group duration
    /// statistics.
    fn type_key(&self) -> &'static str;

    /// Executes the work. Returns whether the result differs from the one
    /// produced by the previous execution.
    fn run(&self) -> bool;

    /// Preparation hook, called at most once per scheduling pass.
    fn init(&self) {}

    /// GPU tasks only ever run on the thread that calls
    /// [`Scheduler::run`](crate::Scheduler::run).
    fn is_gpu(&self) -> bool {
        false
    }

    fn context(&self) -> Option<Arc<dyn ExecutionContext>> {
        None
    }

    /// Relative cost of this task compared to others of the same type.
    fn complexity(&self) -> u32 {
        1
    }
}

/// Observer of task state changes.
pub trait TaskListener: Send + Sync {
    fn task_state_changed(&self, task: &Arc<Task>, done: bool, reason: Reason);

    fn completion_date_changed(&self, _task: &Arc<Task>, _date: u64) {}
}

enum Kind {
    Primitive(Box<dyn Work>),
    Graph(Mutex<graph::GraphBody>),
}

#[derive(Clone)]
enum Listener {
    Graph(Weak<Task>),
    Observer(Weak<dyn TaskListener>),
}

#[derive(Debug)]
struct TaskState {
    done: bool,
    completion_date: u64,
    predecessors_completion_date: u64,
    deadline: Deadline,
    expected_duration: Option<f64>,
}

enum Notice {
    State,
    Date(u64),
}

/// A schedulable unit of work, or a graph of them.
///
/// Tasks are always handled through `Arc<Task>` and compared by identity.
pub struct Task {
    id: TaskId,
    kind: Kind,
    state: Mutex<TaskState>,
    listeners: Mutex<Vec<Listener>>,
}

impl Task {
    fn with_kind(kind: Kind, done: bool) -> Arc<Self> {
        Arc::new(Self {
            id: TaskId::next(),
            kind,
            state: Mutex::new(TaskState {
                done,
                completion_date: NEVER,
                predecessors_completion_date: 1,
                deadline: IMMEDIATE,
                expected_duration: None,
            }),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Creates a primitive task, not done, with an immediate deadline.
    pub fn new<W: Work>(work: W) -> Arc<Self> {
        Self::with_kind(Kind::Primitive(Box::new(work)), false)
    }

    /// Creates an empty task graph. An empty graph has nothing left to do, so
    /// it starts out done.
    pub fn graph() -> Arc<Self> {
        Self::with_kind(Kind::Graph(Mutex::new(graph::GraphBody::default())), true)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn is_graph(&self) -> bool {
        matches!(self.kind, Kind::Graph(_))
    }

    /// Downcasts the work of a primitive task.
    pub fn work<W: Work>(&self) -> Option<&W> {
        match &self.kind {
            Kind::Primitive(work) => {
                let work: &dyn Any = work.as_ref();
                work.downcast_ref::<W>()
            }
            Kind::Graph(_) => None,
        }
    }

    pub fn type_key(&self) -> &'static str {
        match &self.kind {
            Kind::Primitive(work) => work.type_key(),
            Kind::Graph(_) => "graph",
        }
    }

    pub fn is_gpu(&self) -> bool {
        match &self.kind {
            Kind::Primitive(work) => work.is_gpu(),
            Kind::Graph(_) => false,
        }
    }

    pub fn context(&self) -> Option<Arc<dyn ExecutionContext>> {
        match &self.kind {
            Kind::Primitive(work) => work.context(),
            Kind::Graph(_) => None,
        }
    }

    pub fn complexity(&self) -> u32 {
        match &self.kind {
            Kind::Primitive(work) => work.complexity().max(1),
            Kind::Graph(_) => 1,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    pub fn completion_date(&self) -> u64 {
        self.state.lock().completion_date
    }

    pub fn predecessors_completion_date(&self) -> u64 {
        self.state.lock().predecessors_completion_date
    }

    pub(crate) fn raise_predecessors_completion_date(&self, date: u64) {
        let mut state = self.state.lock();
        state.predecessors_completion_date = state.predecessors_completion_date.max(date);
    }

    pub fn deadline(&self) -> Deadline {
        self.state.lock().deadline
    }

    pub fn set_deadline(&self, deadline: Deadline) {
        self.state.lock().deadline = deadline;
    }

    /// Moves the deadline earlier, never later. Returns whether it changed.
    pub fn lower_deadline(&self, deadline: Deadline) -> bool {
        let mut state = self.state.lock();
        if deadline < state.deadline {
            state.deadline = deadline;
            true
        } else {
            false
        }
    }

    /// Whether running this task now would be a no-op because nothing upstream
    /// completed after it did.
    pub fn is_up_to_date(&self) -> bool {
        let state = self.state.lock();
        state.completion_date >= state.predecessors_completion_date
    }

    /// Calls the [`Work::init`] hook of this task, or of every primitive task
    /// of a graph. Tasks already present in `visited` are skipped.
    pub fn init(self: &Arc<Self>, visited: &mut HashSet<TaskId>) {
        let mut stack = vec![self.clone()];

        while let Some(task) = stack.pop() {
            if !visited.insert(task.id) {
                continue;
            }
            match &task.kind {
                Kind::Primitive(work) => work.init(),
                Kind::Graph(body) => stack.extend(body.lock().tasks.values().cloned()),
            }
        }
    }

    /// Executes a primitive task.
    ///
    /// # Panics
    /// Graphs are never run directly; calling this on a graph panics.
    pub fn run(&self) -> bool {
        match &self.kind {
            Kind::Primitive(work) => work.run(),
            Kind::Graph(_) => panic!("task graph {} must be flattened before it runs", self.id),
        }
    }

    /// Expected duration in seconds, computed once from `stats` and cached
    /// until the task is marked not done.
    pub fn expected_duration(&self, stats: &DurationStats) -> f64 {
        if let Some(expected) = self.state.lock().expected_duration {
            return expected;
        }
        let expected = stats.expected(self.type_key()) * self.complexity() as f64;
        self.state.lock().expected_duration = Some(expected);
        expected
    }

    pub fn set_actual_duration(&self, stats: &DurationStats, duration: Duration) {
        stats.record(
            self.type_key(),
            duration.as_secs_f64() / self.complexity() as f64,
        );
    }

    /// Changes the done state of this task and notifies listeners.
    ///
    /// Marking a task done stamps it with `date`. Marking it not done forgets
    /// its completion date unless `reason` is [`Reason::DependencyChanged`],
    /// even if the task was not done already.
    /// For a graph, marking it not done also marks sub-tasks not done: all of
    /// them if a dependency changed, otherwise only the ones without
    /// successors, which will pull in whatever else they need.
    pub fn set_is_done(self: &Arc<Self>, done: bool, date: u64, reason: Reason) {
        self.set_own_state(done, date, reason);

        if !done && let Kind::Graph(body) = &self.kind {
            let children = {
                let body = body.lock();
                match reason {
                    Reason::DependencyChanged => body.tasks.values().cloned().collect(),
                    _ => body.last_tasks(),
                }
            };
            for child in children {
                child.set_is_done(false, NEVER, reason);
            }
        }
    }

    fn set_own_state(self: &Arc<Self>, done: bool, date: u64, reason: Reason) {
        let notice = {
            let mut state = self.state.lock();
            if state.done != done {
                state.done = done;
                if done {
                    state.completion_date = date;
                } else {
                    state.expected_duration = None;
                    if reason.resets_completion() {
                        state.completion_date = NEVER;
                    }
                }
                Some(Notice::State)
            } else if done && date > state.completion_date {
                state.completion_date = date;
                Some(Notice::Date(date))
            } else {
                // already pending, but its previous result may no longer be reused
                if !done && reason.resets_completion() {
                    state.completion_date = NEVER;
                }
                None
            }
        };

        match notice {
            Some(Notice::State) => self.notify(|listener| match listener {
                Resolved::Graph(graph) => graph::child_state_changed(&graph, self, done, reason),
                Resolved::Observer(observer) => observer.task_state_changed(self, done, reason),
            }),
            Some(Notice::Date(date)) => self.notify(|listener| match listener {
                Resolved::Graph(graph) => graph::child_completion_date_changed(&graph),
                Resolved::Observer(observer) => observer.completion_date_changed(self, date),
            }),
            None => {}
        }
    }

    pub fn add_listener(&self, listener: &Arc<dyn TaskListener>) {
        self.listeners
            .lock()
            .push(Listener::Observer(Arc::downgrade(listener)));
    }

    pub fn remove_listener(&self, listener: &Arc<dyn TaskListener>) {
        let target = Arc::downgrade(listener);
        self.listeners.lock().retain(|l| match l {
            Listener::Observer(observer) => !Weak::ptr_eq(observer, &target),
            Listener::Graph(_) => true,
        });
    }

    fn add_graph_listener(&self, graph: &Arc<Task>) {
        self.listeners
            .lock()
            .push(Listener::Graph(Arc::downgrade(graph)));
    }

    fn remove_graph_listener(&self, graph: &Arc<Task>) {
        let target = Arc::downgrade(graph);
        self.listeners.lock().retain(|l| match l {
            Listener::Graph(g) => !Weak::ptr_eq(g, &target),
            Listener::Observer(_) => true,
        });
    }

    /// Calls `f` for every live listener. The listener list is not locked
    /// while `f` runs, so listeners may freely change other tasks.
    fn notify(&self, f: impl Fn(Resolved)) {
        let listeners = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| match l {
                Listener::Graph(g) => g.strong_count() > 0,
                Listener::Observer(o) => o.strong_count() > 0,
            });
            listeners.clone()
        };

        for listener in listeners {
            match listener {
                Listener::Graph(graph) => {
                    if let Some(graph) = graph.upgrade() {
                        f(Resolved::Graph(graph));
                    }
                }
                Listener::Observer(observer) => {
                    if let Some(observer) = observer.upgrade() {
                        f(Resolved::Observer(observer));
                    }
                }
            }
        }
    }
}

/// A [`Listener`] that is still alive.
enum Resolved {
    Graph(Arc<Task>),
    Observer(Arc<dyn TaskListener>),
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct(if self.is_graph() { "TaskGraph" } else { "Task" })
            .field("id", &self.id)
            .field("type", &self.type_key())
            .field("done", &state.done)
            .field("completion_date", &state.completion_date)
            .field("deadline", &state.deadline)
            .finish()
    }
}
