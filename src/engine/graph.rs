use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use petgraph::Direction;
use petgraph::graphmap::DiGraphMap;

use crate::core::{Reason, TaskId};
use crate::engine::{Kind, NEVER, Task};

/// Sub-tasks of a graph and the ordering constraints between them.
///
/// Edges point from a predecessor to its successor: an edge `a -> b` means
/// `b` must run after `a`.
#[derive(Default)]
pub(crate) struct GraphBody {
    pub(crate) tasks: BTreeMap<TaskId, Arc<Task>>,
    pub(crate) edges: DiGraphMap<TaskId, ()>,
}

impl GraphBody {
    fn resolve(&self, ids: impl Iterator<Item = TaskId>) -> Vec<Arc<Task>> {
        ids.filter_map(|id| self.tasks.get(&id).cloned()).collect()
    }

    /// Tasks without predecessors, in creation order.
    pub(crate) fn first_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|(id, _)| {
                self.edges
                    .neighbors_directed(**id, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|(_, task)| task.clone())
            .collect()
    }

    /// Tasks without successors, in creation order.
    pub(crate) fn last_tasks(&self) -> Vec<Arc<Task>> {
        self.tasks
            .iter()
            .filter(|(id, _)| {
                self.edges
                    .neighbors_directed(**id, Direction::Outgoing)
                    .next()
                    .is_none()
            })
            .map(|(_, task)| task.clone())
            .collect()
    }

    pub(crate) fn predecessors(&self, id: TaskId) -> Vec<Arc<Task>> {
        if !self.edges.contains_node(id) {
            return Vec::new();
        }
        self.resolve(self.edges.neighbors_directed(id, Direction::Incoming))
    }

    pub(crate) fn successors(&self, id: TaskId) -> Vec<Arc<Task>> {
        if !self.edges.contains_node(id) {
            return Vec::new();
        }
        self.resolve(self.edges.neighbors_directed(id, Direction::Outgoing))
    }

    fn all_done(&self) -> bool {
        self.tasks.values().all(|task| task.is_done())
    }

    fn latest_completion(&self) -> u64 {
        self.tasks
            .values()
            .map(|task| task.completion_date())
            .max()
            .unwrap_or(NEVER)
    }
}

/// Graph-only operations.
///
/// All of these panic when called on a primitive task.
impl Task {
    fn body(&self) -> &Mutex<GraphBody> {
        match &self.kind {
            Kind::Graph(body) => body,
            Kind::Primitive(_) => panic!("task {} is not a graph", self.id),
        }
    }

    /// Adds `task` to this graph. Adding a task that is not done makes the
    /// graph not done.
    pub fn add_task(self: &Arc<Self>, task: &Arc<Task>) {
        assert!(
            !Arc::ptr_eq(self, task),
            "graph {} cannot contain itself",
            self.id
        );
        {
            let mut body = self.body().lock();
            if body.tasks.contains_key(&task.id) {
                return;
            }
            body.tasks.insert(task.id, task.clone());
            body.edges.add_node(task.id);
        }
        task.add_graph_listener(self);

        if !task.is_done() {
            self.set_own_state(false, NEVER, Reason::DependencyChanged);
        }
    }

    /// Removes `task` and every dependency involving it from this graph.
    pub fn remove_task(self: &Arc<Self>, task: &Arc<Task>) {
        let (removed, all_done, latest) = {
            let mut body = self.body().lock();
            let removed = body.tasks.remove(&task.id).is_some();
            body.edges.remove_node(task.id);
            (removed, body.all_done(), body.latest_completion())
        };
        if !removed {
            return;
        }
        task.remove_graph_listener(self);

        if all_done {
            self.set_own_state(true, latest, Reason::DataNeeded);
        }
    }

    /// Declares that `src` must run after `dst`. Both tasks must already
    /// belong to this graph.
    pub fn add_dependency(&self, src: &Arc<Task>, dst: &Arc<Task>) {
        let mut body = self.body().lock();
        assert!(
            body.tasks.contains_key(&src.id) && body.tasks.contains_key(&dst.id),
            "dependency {} -> {} refers to a task outside graph {}",
            src.id,
            dst.id,
            self.id
        );
        body.edges.add_edge(dst.id, src.id, ());
    }

    pub fn remove_dependency(&self, src: &Arc<Task>, dst: &Arc<Task>) {
        self.body().lock().edges.remove_edge(dst.id, src.id);
    }

    /// Every sub-task of this graph, in creation order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        self.body().lock().tasks.values().cloned().collect()
    }

    pub fn contains(&self, task: &Arc<Task>) -> bool {
        self.body().lock().tasks.contains_key(&task.id)
    }

    pub fn len(&self) -> usize {
        self.body().lock().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body().lock().tasks.is_empty()
    }

    /// Sub-tasks that have no predecessor in this graph.
    pub fn first_tasks(&self) -> Vec<Arc<Task>> {
        self.body().lock().first_tasks()
    }

    /// Sub-tasks that have no successor in this graph.
    pub fn last_tasks(&self) -> Vec<Arc<Task>> {
        self.body().lock().last_tasks()
    }

    /// Tasks that `task` must run after.
    pub fn dependencies(&self, task: &Arc<Task>) -> Vec<Arc<Task>> {
        self.body().lock().predecessors(task.id)
    }

    /// Tasks that must run after `task`.
    pub fn inverse_dependencies(&self, task: &Arc<Task>) -> Vec<Arc<Task>> {
        self.body().lock().successors(task.id)
    }

    /// Sub-tasks and `(predecessor, successor)` pairs, taken under one lock.
    pub(crate) fn snapshot(&self) -> (Vec<Arc<Task>>, Vec<(Arc<Task>, Arc<Task>)>) {
        let body = self.body().lock();
        let children = body.tasks.values().cloned().collect();
        let edges = body
            .edges
            .all_edges()
            .filter_map(|(from, to, _)| {
                Some((body.tasks.get(&from)?.clone(), body.tasks.get(&to)?.clone()))
            })
            .collect();
        (children, edges)
    }
}

pub(crate) fn child_state_changed(graph: &Arc<Task>, child: &Arc<Task>, done: bool, reason: Reason) {
    if !done {
        if reason != Reason::DataNeeded {
            let successors = graph.body().lock().successors(child.id);
            for successor in successors {
                successor.set_is_done(false, NEVER, Reason::DependencyChanged);
            }
        }
        graph.set_own_state(false, NEVER, reason);
    } else {
        let (all_done, latest) = {
            let body = graph.body().lock();
            (body.all_done(), body.latest_completion())
        };
        if all_done {
            graph.set_own_state(true, latest, reason);
        }
    }
}

pub(crate) fn child_completion_date_changed(graph: &Arc<Task>) {
    let latest = graph.body().lock().latest_completion();
    if graph.is_done() {
        graph.set_own_state(true, latest, Reason::DataNeeded);
    }
}
