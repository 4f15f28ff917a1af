use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::{ContextKey, Deadline, TaskId};

type QueueKey = (Deadline, ContextKey);

/// Expected duration in nanoseconds, then insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    expected: u64,
    seq: u64,
    id: TaskId,
}

/// Tasks whose predecessors are all done, grouped by deadline and execution
/// context. Within a group, cheaper tasks come first, then older ones.
#[derive(Debug, Default)]
pub(crate) struct ReadySet {
    queues: BTreeMap<QueueKey, BTreeSet<Entry>>,
    index: HashMap<TaskId, (QueueKey, Entry)>,
    seq: u64,
}

impl ReadySet {
    pub(crate) fn insert(&mut self, id: TaskId, deadline: Deadline, context: ContextKey, expected: f64) {
        if self.index.contains_key(&id) {
            return;
        }
        self.seq += 1;
        let entry = Entry {
            expected: (expected.max(0.0) * 1e9) as u64,
            seq: self.seq,
            id,
        };
        let key = (deadline, context);
        self.queues.entry(key).or_default().insert(entry);
        self.index.insert(id, (key, entry));
    }

    pub(crate) fn remove(&mut self, id: TaskId) -> bool {
        let Some((key, entry)) = self.index.remove(&id) else {
            return false;
        };
        if let Some(queue) = self.queues.get_mut(&key) {
            queue.remove(&entry);
            if queue.is_empty() {
                self.queues.remove(&key);
            }
        }
        true
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Deadline the task was queued under.
    pub(crate) fn deadline_of(&self, id: TaskId) -> Option<Deadline> {
        self.index.get(&id).map(|((deadline, _), _)| *deadline)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Best task whose deadline lies in `min..=max`, without removing it.
    ///
    /// Only the earliest eligible deadline is considered. Among its tasks,
    /// those sharing the `last` context win, then tasks without a context,
    /// then any other.
    pub(crate) fn pick(&self, min: Deadline, max: Deadline, last: ContextKey) -> Option<TaskId> {
        let (&(deadline, _), first) = self.queues.range((min, ContextKey::NONE)..).next()?;
        if deadline > max {
            return None;
        }

        let queue = self
            .queues
            .get(&(deadline, last))
            .or_else(|| self.queues.get(&(deadline, ContextKey::NONE)))
            .unwrap_or(first);
        queue.first().map(|entry| entry.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::core::ExecutionContext;

    struct Ctx;

    impl ExecutionContext for Ctx {
        fn open(&self) {}
        fn close(&self) {}
    }

    fn key(context: &Arc<dyn ExecutionContext>) -> ContextKey {
        ContextKey::of(Some(context))
    }

    #[test]
    fn earliest_deadline_wins() {
        let mut ready = ReadySet::default();
        let (a, b) = (TaskId::next(), TaskId::next());
        ready.insert(a, 3, ContextKey::NONE, 0.0);
        ready.insert(b, 1, ContextKey::NONE, 10.0);
        assert_eq!(ready.pick(0, u64::MAX, ContextKey::NONE), Some(b));
        assert_eq!(ready.pick(0, 0, ContextKey::NONE), None);
        assert_eq!(ready.pick(2, u64::MAX, ContextKey::NONE), Some(a));
    }

    #[test]
    fn cheaper_then_older_first() {
        let mut ready = ReadySet::default();
        let (a, b, c) = (TaskId::next(), TaskId::next(), TaskId::next());
        ready.insert(a, 0, ContextKey::NONE, 2.0);
        ready.insert(b, 0, ContextKey::NONE, 1.0);
        ready.insert(c, 0, ContextKey::NONE, 1.0);

        assert_eq!(ready.pick(0, 0, ContextKey::NONE), Some(b));
        ready.remove(b);
        assert_eq!(ready.pick(0, 0, ContextKey::NONE), Some(c));
        ready.remove(c);
        assert_eq!(ready.pick(0, 0, ContextKey::NONE), Some(a));
        ready.remove(a);
        assert!(ready.is_empty());
    }

    #[test]
    fn same_context_preferred() {
        let red: Arc<dyn ExecutionContext> = Arc::new(Ctx);
        let blue: Arc<dyn ExecutionContext> = Arc::new(Ctx);
        let mut ready = ReadySet::default();
        let (r, b, n) = (TaskId::next(), TaskId::next(), TaskId::next());
        ready.insert(r, 0, key(&red), 0.0);
        ready.insert(b, 0, key(&blue), 0.0);
        ready.insert(n, 0, ContextKey::NONE, 0.0);

        assert_eq!(ready.pick(0, 0, key(&red)), Some(r));
        assert_eq!(ready.pick(0, 0, key(&blue)), Some(b));
        // no match for the last context: tasks without one go first
        ready.remove(r);
        assert_eq!(ready.pick(0, 0, key(&red)), Some(n));
        assert_eq!(ready.len(), 2);
    }

    #[test]
    fn duplicate_insert_is_ignored() {
        let mut ready = ReadySet::default();
        let a = TaskId::next();
        ready.insert(a, 0, ContextKey::NONE, 0.0);
        ready.insert(a, 5, ContextKey::NONE, 0.0);
        assert_eq!(ready.len(), 1);
        assert!(ready.contains(a));
        assert!(ready.remove(a));
        assert!(!ready.remove(a));
    }
}
