use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// A logical frame number used as a scheduling hint. `0` means the result is
/// needed for the current frame.
pub type Deadline = u64;

/// The deadline of work that must be finished before [`Scheduler::run`]
/// returns.
///
/// [`Scheduler::run`]: crate::Scheduler::run
pub const IMMEDIATE: Deadline = 0;

/// Identity of a [`Task`](crate::Task).
///
/// Identifiers are allocated from a process-wide counter, so they also encode
/// creation order, which the scheduler uses as a FIFO tie-break.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TaskId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskId({})", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why a task is being marked as not done.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reason {
    /// A predecessor must be recomputed. The task itself will only re-run if
    /// that predecessor actually produces a different result, so its
    /// completion date is kept.
    DependencyChanged,
    /// The data produced by the task was modified from the outside and must be
    /// produced again.
    DataChanged,
    /// The data produced by the task was discarded and is needed again.
    DataNeeded,
}

impl Reason {
    /// Whether marking a task not done for this reason forgets its completion
    /// date, which forces the next execution to actually run.
    pub(crate) fn resets_completion(self) -> bool {
        self != Reason::DependencyChanged
    }
}

/// Shared state that a group of tasks needs to run, such as a GPU pipeline
/// binding. The scheduler groups ready tasks by context and only switches
/// context when it has to.
pub trait ExecutionContext: Send + Sync {
    /// Called before the first task using this context runs.
    fn open(&self);

    /// Called when the scheduler switches away from this context.
    fn close(&self);
}

/// Pointer identity of an [`ExecutionContext`], used as part of the ready set
/// ordering key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextKey(usize);

impl ContextKey {
    pub const NONE: ContextKey = ContextKey(0);

    pub fn of(context: Option<&Arc<dyn ExecutionContext>>) -> Self {
        match context {
            Some(context) => ContextKey(Arc::as_ptr(context) as *const () as usize),
            None => ContextKey::NONE,
        }
    }

    pub fn is_none(self) -> bool {
        self == ContextKey::NONE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;

    impl ExecutionContext for Nop {
        fn open(&self) {}
        fn close(&self) {}
    }

    #[test]
    fn task_ids_increase() {
        let a = TaskId::next();
        let b = TaskId::next();
        assert!(a < b);
    }

    #[test]
    fn context_key_tracks_pointer_identity() {
        let a: Arc<dyn ExecutionContext> = Arc::new(Nop);
        let b: Arc<dyn ExecutionContext> = Arc::new(Nop);

        assert_eq!(ContextKey::of(Some(&a)), ContextKey::of(Some(&a.clone())));
        assert_ne!(ContextKey::of(Some(&a)), ContextKey::of(Some(&b)));
        assert!(ContextKey::of(None).is_none());
        assert!(!ContextKey::of(Some(&a)).is_none());
    }

    #[test]
    fn only_dependency_changes_keep_completion() {
        assert!(!Reason::DependencyChanged.resets_completion());
        assert!(Reason::DataChanged.resets_completion());
        assert!(Reason::DataNeeded.resets_completion());
    }
}
